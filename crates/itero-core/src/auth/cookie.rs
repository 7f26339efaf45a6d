//! The `s` session cookie, the transport-channel copy of the credential.
//!
//! `SessionCookie` holds the value. `SessionCookieJar` is what reqwest uses as
//! its cookie provider: `s` is only sent to, and only accepted from, the API
//! host and port. Every other cookie (such as the server's `u` cookie for
//! unlogged voters) lives in an ordinary `reqwest::cookie::Jar`.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use cookie::Cookie;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use reqwest::Url;
use tracing::{debug, warn};

/// Name of the session cookie, shared with the server
pub const COOKIE_NAME: &str = "s";

/// Default scope of the cookie: the whole site
const COOKIE_PATH: &str = "/";

/// Lifetime of a locally set cookie. Matches the server's session max age.
const COOKIE_MAX_AGE_MINUTES: i64 = 30;

/// Upper bound for server-provided lifetimes (400 days)
const MAX_AGE_LIMIT_SECS: i64 = 400 * 24 * 3600;

/// Same host and same port. The session cookie and header never leave this scope.
pub(crate) fn same_site(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// RFC 6265 path-match
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

#[derive(Debug, Clone)]
struct CookieSlot {
    value: String,
    path: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
enum CookieUpdate {
    Set {
        value: String,
        path: String,
        lifetime: Duration,
    },
    Clear,
}

#[derive(Debug, Default)]
pub struct SessionCookie {
    slot: Mutex<Option<CookieSlot>>,
}

impl SessionCookie {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CookieSlot>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the cookie to `value` for the whole site with the default lifetime.
    /// An empty value clears the cookie.
    pub fn set(&self, value: &str) {
        self.set_scoped(value, COOKIE_PATH, Duration::minutes(COOKIE_MAX_AGE_MINUTES));
    }

    fn set_scoped(&self, value: &str, path: &str, lifetime: Duration) {
        if value.is_empty() || lifetime <= Duration::zero() {
            self.clear();
            return;
        }
        *self.lock() = Some(CookieSlot {
            value: value.to_string(),
            path: path.to_string(),
            expires_at: Utc::now() + lifetime,
        });
    }

    /// Equivalent of `s=; Path=/; Max-Age=-1`. Clearing an empty cookie is a no-op.
    pub fn clear(&self) {
        *self.lock() = None;
    }

    /// Current value, if set and not expired
    pub fn value(&self) -> Option<String> {
        self.live_slot().map(|slot| slot.value)
    }

    /// Current value if the cookie applies to `path`
    fn value_for_path(&self, path: &str) -> Option<String> {
        self.live_slot()
            .filter(|slot| path_matches(&slot.path, path))
            .map(|slot| slot.value)
    }

    fn live_slot(&self) -> Option<CookieSlot> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(cookie) if cookie.expires_at > Utc::now() => Some(cookie.clone()),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.value().is_some()
    }

    fn apply(&self, update: CookieUpdate) {
        match update {
            CookieUpdate::Set { value, path, lifetime } => self.set_scoped(&value, &path, lifetime),
            CookieUpdate::Clear => self.clear(),
        }
    }

    /// Interpret a parsed `Set-Cookie` for `s`. `Max-Age` wins over `Expires`.
    fn update_from(cookie: &Cookie<'_>) -> CookieUpdate {
        if cookie.value().is_empty() {
            return CookieUpdate::Clear;
        }

        let lifetime_secs = match (cookie.max_age(), cookie.expires_datetime()) {
            (Some(max_age), _) => Some(max_age.whole_seconds()),
            (None, Some(expires)) => Some(expires.unix_timestamp() - Utc::now().timestamp()),
            (None, None) => None,
        };
        let lifetime = match lifetime_secs {
            Some(secs) if secs <= 0 => return CookieUpdate::Clear,
            Some(secs) => Duration::seconds(secs.min(MAX_AGE_LIMIT_SECS)),
            None => Duration::minutes(COOKIE_MAX_AGE_MINUTES),
        };

        let path = cookie
            .path()
            .filter(|p| p.starts_with('/'))
            .unwrap_or(COOKIE_PATH);

        CookieUpdate::Set {
            value: cookie.value().to_string(),
            path: path.to_string(),
            lifetime,
        }
    }
}

/// Cookie provider for the API client.
pub struct SessionCookieJar {
    session: Arc<SessionCookie>,
    api: Url,
    others: Jar,
}

impl SessionCookieJar {
    /// `api` is the API base URL; only its host and port see the session cookie.
    pub fn new(session: Arc<SessionCookie>, api: Url) -> Self {
        Self {
            session,
            api,
            others: Jar::default(),
        }
    }
}

impl CookieStore for SessionCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let mut others = Vec::new();
        for header in cookie_headers {
            let parsed = header.to_str().ok().and_then(|raw| Cookie::parse(raw).ok());
            match parsed {
                Some(cookie) if cookie.name() == COOKIE_NAME => {
                    if same_site(&self.api, url) {
                        let update = SessionCookie::update_from(&cookie);
                        let cleared = update == CookieUpdate::Clear;
                        debug!(cleared, "Session cookie updated by server");
                        self.session.apply(update);
                    } else {
                        warn!(host = ?url.host_str(), "Ignoring session cookie set by a foreign host");
                    }
                }
                _ => others.push(header.clone()),
            }
        }
        if !others.is_empty() {
            self.others.set_cookies(&mut others.iter(), url);
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let session = if same_site(&self.api, url) {
            self.session
                .value_for_path(url.path())
                .map(|value| format!("{}={}", COOKIE_NAME, value))
        } else {
            None
        };
        let others = self
            .others
            .cookies(url)
            .and_then(|header| header.to_str().ok().map(str::to_string));

        let joined = match (session, others) {
            (Some(session), Some(others)) => format!("{}; {}", session, others),
            (Some(session), None) => session,
            (None, Some(others)) => others,
            (None, None) => return None,
        };
        HeaderValue::from_str(&joined).ok()
    }
}
