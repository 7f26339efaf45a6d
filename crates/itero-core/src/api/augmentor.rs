//! Attaches the session credential to outgoing requests.

use std::borrow::Cow;
use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue};
use tracing::warn;

use super::ApiRequest;
use crate::auth::SessionManager;

/// Header carrying the credential, checked by the server against the `s` cookie
pub const SESSION_HEADER: &str = "x-csrf";

/// Request hook run before every dispatch.
///
/// The credential is read at the moment of the call, so a request sent right
/// after `logoff` never carries the old one.
#[derive(Clone)]
pub struct RequestAugmentor {
    session: Arc<SessionManager>,
}

impl RequestAugmentor {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// The request to send: the caller's own when anonymous, otherwise a copy
    /// with the `X-CSRF` header added. `request` itself is never modified.
    pub fn augment<'a>(&self, request: &'a ApiRequest) -> Cow<'a, ApiRequest> {
        let credential = self.session.current_credential();
        if credential.is_empty() {
            return Cow::Borrowed(request);
        }

        match HeaderValue::from_str(&credential) {
            Ok(mut value) => {
                value.set_sensitive(true);
                let mut derived = request.clone();
                derived.headers.insert(HeaderName::from_static(SESSION_HEADER), value);
                Cow::Owned(derived)
            }
            Err(_) => {
                warn!("Session credential is not a valid header value, sending request without it");
                Cow::Borrowed(request)
            }
        }
    }

    /// Augment `request` and hand the result to `next`
    pub fn intercept<'a, N, R>(&self, request: &'a ApiRequest, next: N) -> R
    where
        N: FnOnce(Cow<'a, ApiRequest>) -> R,
    {
        next(self.augment(request))
    }
}
