//! HTTP client for the Itero middleware API.
//!
//! Every request goes through the `RequestAugmentor`, and the underlying
//! reqwest client uses a `SessionCookieJar` as its cookie store, so both the
//! `X-CSRF` header and the `s` cookie follow the current session. Redirects
//! are only followed within the API host, so neither reaches another server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::redirect::Policy;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ApiError, ApiRequest, RequestAugmentor};
use crate::auth::cookie::same_site;
use crate::auth::{SessionCookieJar, SessionError, SessionManager};

// ============================================================================
// Constants
// ============================================================================

/// Login endpoint, relative to the API base URL
const LOGIN_PATH: &str = "login";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum number of redirects followed within the API host.
const MAX_REDIRECTS: usize = 10;

/// Follow redirects on the API host only. A redirect elsewhere is returned
/// to the caller as the 3xx response itself.
fn redirect_policy(api: Url) -> Policy {
    Policy::custom(move |attempt| {
        if !same_site(&api, attempt.url()) {
            warn!(to = %attempt.url(), "Not following redirect away from the API host");
            attempt.stop()
        } else if attempt.previous().len() > MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else {
            attempt.follow()
        }
    })
}

/// Body of the login exchange. Field names are the server's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginInfo {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Passwd")]
    pub password: String,
}

/// API client for the Itero middleware.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    session: Arc<SessionManager>,
    augmentor: RequestAugmentor,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a client for the API rooted at `base_url`
    pub fn new(base_url: &str, session: Arc<SessionManager>) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("Invalid server URL: {}", base_url))?;

        let jar = SessionCookieJar::new(session.cookie(), base_url.clone());
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .cookie_provider(Arc::new(jar))
            .redirect(redirect_policy(base_url.clone()))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            augmentor: RequestAugmentor::new(Arc::clone(&session)),
            session,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` against the base URL
    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid path {}: {}", path, e)))
    }

    /// URL for `path` carrying the credential as a query parameter, for
    /// links opened outside this client
    pub fn authenticated_url(&self, path: &str) -> Result<String, ApiError> {
        Ok(self.session.build_authenticated_url(self.url(path)?.as_str()))
    }

    // ===== Session =====

    /// Run the login exchange and return the credential issued by the server
    pub async fn exchange_login(&self, info: &LoginInfo) -> Result<String, ApiError> {
        let request = ApiRequest::post(self.url(LOGIN_PATH)?).with_json(info)?;
        debug!(user = %info.user, url = %request.url, "Sending login request");

        let response = request.to_builder(&self.client).send().await?;
        let response = Self::check_response(response).await?;
        let body = response.text().await?;

        Ok(Self::parse_credential(&body))
    }

    /// The server answers with the bare token or with it as a JSON string
    fn parse_credential(body: &str) -> String {
        let body = body.trim();
        serde_json::from_str::<String>(body).unwrap_or_else(|_| body.to_string())
    }

    /// Log in through the session manager
    pub async fn login(&self, info: &LoginInfo) -> Result<String, SessionError> {
        self.session.login(&info.user, self.exchange_login(info)).await
    }

    pub fn logoff(&self) {
        self.session.logoff();
    }

    // ===== Requests =====

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            Err(ApiError::from_response(response).await)
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_response(response).await)
        }
    }

    /// Send `request` with the current session attached.
    ///
    /// Rate-limited requests are retried with exponential backoff; each
    /// attempt is augmented again from the caller's unmodified request.
    pub async fn send(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self
                .augmentor
                .intercept(request, |req| req.to_builder(&self.client).send())
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        url = %request.url,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    pub async fn get_text(&self, path: &str) -> Result<String, ApiError> {
        let response = self.send(&ApiRequest::get(self.url(path)?)).await?;
        Ok(response.text().await?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(&ApiRequest::get(self.url(path)?)).await?;
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", path, e)))
    }

    pub async fn post_json<B, T>(&self, path: &str, payload: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = ApiRequest::post(self.url(path)?).with_json(payload)?;
        let response = self.send(&request).await?;
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", path, e)))
    }
}
