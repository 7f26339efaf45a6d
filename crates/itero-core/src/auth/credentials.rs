use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use super::cookie::SessionCookie;
use super::storage::KeyValueStorage;

/// Durable key for the credential token
pub const SESSION_ID_KEY: &str = "SessionId";

/// Durable key for the user identity
pub const USER_KEY: &str = "User";

/// Mirrors the session credential into durable storage and the session cookie.
///
/// Pure storage: deciding when to save, restore or clear belongs to
/// `SessionManager`.
pub struct CredentialStore {
    storage: Box<dyn KeyValueStorage>,
    cookie: Arc<SessionCookie>,
}

impl CredentialStore {
    pub fn new(storage: Box<dyn KeyValueStorage>) -> Self {
        Self::with_cookie(storage, Arc::new(SessionCookie::new()))
    }

    pub fn with_cookie(storage: Box<dyn KeyValueStorage>, cookie: Arc<SessionCookie>) -> Self {
        Self { storage, cookie }
    }

    /// The transport-channel mirror, shared with the HTTP client's cookie jar
    pub fn cookie(&self) -> Arc<SessionCookie> {
        Arc::clone(&self.cookie)
    }

    /// Store credential and identity durably and set the session cookie.
    ///
    /// If either write fails, both keys are removed before the error is
    /// returned, so a token is never left next to another user's identity.
    pub fn save(&self, credential: &str, identity: &str) -> Result<()> {
        self.cookie.set(credential);
        let written = self
            .storage
            .set(SESSION_ID_KEY, credential)
            .and_then(|()| self.storage.set(USER_KEY, identity));

        if let Err(e) = written {
            let session_id = self.storage.remove(SESSION_ID_KEY);
            let user = self.storage.remove(USER_KEY);
            if let Err(cleanup) = session_id.and(user) {
                warn!(error = %cleanup, "Failed to remove half-written session");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Load the persisted session.
    ///
    /// Returns `None` when nothing is stored, and also when only one half is
    /// stored or the token is empty: a partial session is never trusted. The
    /// leftover half is removed so both keys are absent together again.
    pub fn load(&self) -> Result<Option<(String, String)>> {
        let credential = self.storage.get(SESSION_ID_KEY)?.filter(|c| !c.is_empty());
        let identity = self.storage.get(USER_KEY)?;

        match (credential, identity) {
            (Some(credential), Some(identity)) => Ok(Some((credential, identity))),
            (None, None) => Ok(None),
            (credential, identity) => {
                warn!(
                    has_credential = credential.is_some(),
                    has_identity = identity.is_some(),
                    "Ignoring incomplete persisted session"
                );
                if let Err(e) = self.storage.remove(SESSION_ID_KEY).and(self.storage.remove(USER_KEY)) {
                    warn!(error = %e, "Failed to remove incomplete persisted session");
                }
                Ok(None)
            }
        }
    }

    /// Remove every copy of the credential.
    ///
    /// All three removals are attempted whatever happens to the others; the
    /// first failure is returned afterwards.
    pub fn clear(&self) -> Result<()> {
        self.cookie.clear();
        let session_id = self.storage.remove(SESSION_ID_KEY);
        let user = self.storage.remove(USER_KEY);
        session_id.and(user)
    }
}
