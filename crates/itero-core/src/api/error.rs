//! Errors from talking to the Itero middleware.

use reqwest::header::LOCATION;
use reqwest::{Response, StatusCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied by the server: {0}")]
    AccessDenied(String),

    #[error("Not logged in, or the session has expired")]
    Unauthorized,

    #[error("No such resource: {0}")]
    NotFound(String),

    #[error("Too many requests, gave up after retrying")]
    RateLimited,

    #[error("Server failure: {0}")]
    ServerError(String),

    #[error("Could not reach the server: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The server pointed somewhere outside the API host. The redirect was
    /// not followed, so the session never left the API host.
    #[error("Redirected away from the API host to {0}")]
    Redirected(String),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Cannot build request: {0}")]
    InvalidRequest(String),
}

/// Longest response body kept in an error, in bytes
const MAX_BODY_BYTES: usize = 500;

/// Cut `body` at a char boundary so error messages stay short
fn excerpt(body: &str) -> String {
    if body.len() <= MAX_BODY_BYTES {
        return body.to_string();
    }
    let mut end = MAX_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

impl ApiError {
    /// Turn a non-success response into an error, consuming its body.
    pub async fn from_response(response: Response) -> Self {
        let status = response.status();
        if status.is_redirection() {
            if let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
                return ApiError::Redirected(location.to_string());
            }
        }
        let body = response.text().await.unwrap_or_default();
        Self::from_status(status, &body)
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let body = excerpt(body);
        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => ApiError::AccessDenied(body),
            StatusCode::NOT_FOUND => ApiError::NotFound(body),
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            s if s.is_server_error() => ApiError::ServerError(body),
            s => ApiError::InvalidResponse(format!("Status {}: {}", s, body)),
        }
    }
}
