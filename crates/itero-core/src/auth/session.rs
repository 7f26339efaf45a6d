use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, ThreadId};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::cookie::SessionCookie;
use super::credentials::CredentialStore;
use super::events::{SessionEvents, SessionInfo, SubscriptionId};
use crate::api::ApiError;

/// Query parameter carrying the credential in direct links
const SESSION_QUERY_KEY: &str = "s";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Login failed: {0}")]
    Login(#[from] ApiError),

    #[error("Login superseded by a later session change")]
    Superseded,

    #[error("Session transition started from a session change callback")]
    Reentrant,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    credential: String,
    user: String,
}

/// The single authority on who is logged in.
///
/// Create one per process, wrap it in an `Arc` and hand it to whatever needs
/// it. Transitions (`login`, `logoff`, `check_session`) are serialized and
/// each one updates memory, storage and the cookie, then notifies
/// subscribers, before the next can start. Reads never wait on I/O.
///
/// Subscriber callbacks may read the session. A transition started from a
/// callback is refused with a warning instead of waiting on the transition
/// lock its caller already holds.
pub struct SessionManager {
    store: CredentialStore,
    state: RwLock<SessionState>,
    transition: Mutex<()>,
    /// Thread inside the transition section, if any
    transition_owner: Mutex<Option<ThreadId>>,
    /// Advanced by every `login` start and every `logoff`
    generation: AtomicU64,
    events: SessionEvents,
}

impl SessionManager {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            state: RwLock::new(SessionState::default()),
            transition: Mutex::new(()),
            transition_owner: Mutex::new(None),
            generation: AtomicU64::new(0),
            events: SessionEvents::new(),
        }
    }

    /// Process start: build the manager and restore any persisted session.
    pub fn init(store: CredentialStore) -> Arc<Self> {
        let manager = Arc::new(Self::new(store));
        manager.check_session();
        manager
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.transition_owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refuse_reentry(&self, operation: &'static str) -> bool {
        let reentrant = *self.lock_owner() == Some(thread::current().id());
        if reentrant {
            warn!(operation, "Ignoring session transition requested during change notification");
        }
        reentrant
    }

    /// Enter the transition section. Returns None when the current thread is
    /// already inside it, which only happens from a subscriber callback.
    fn begin_transition(&self, operation: &'static str) -> Option<TransitionGuard<'_>> {
        if self.refuse_reentry(operation) {
            return None;
        }

        let lock = self.transition.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *self.lock_owner() = Some(thread::current().id());
        Some(TransitionGuard {
            owner: &self.transition_owner,
            _lock: lock,
        })
    }

    /// Transport-channel mirror, shared with the HTTP client's cookie jar
    pub fn cookie(&self) -> Arc<SessionCookie> {
        self.store.cookie()
    }

    // ===== Transitions =====

    /// Log in as `identity` with the credential produced by `exchange`.
    ///
    /// Nothing changes while the exchange is pending. If a `logoff` or another
    /// `login` starts before it resolves, its result is dropped and
    /// `SessionError::Superseded` is returned.
    pub async fn login<F>(&self, identity: &str, exchange: F) -> Result<String, SessionError>
    where
        F: Future<Output = Result<String, ApiError>>,
    {
        if self.refuse_reentry("login") {
            return Err(SessionError::Reentrant);
        }
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(user = identity, ticket, "Login exchange started");

        let credential = exchange.await?;
        if credential.is_empty() {
            return Err(ApiError::InvalidResponse("Empty session credential".to_string()).into());
        }

        let Some(_transition) = self.begin_transition("login") else {
            return Err(SessionError::Reentrant);
        };
        if self.generation.load(Ordering::SeqCst) != ticket {
            warn!(user = identity, ticket, "Discarding superseded login result");
            return Err(SessionError::Superseded);
        }

        if let Err(e) = self.store.save(&credential, identity) {
            warn!(error = %e, "Failed to persist session, it will not survive a restart");
        }
        {
            let mut state = self.write_state();
            state.credential = credential;
            state.user = identity.to_string();
        }

        info!(user = identity, "Logged in");
        self.events.emit(&SessionInfo::registered(identity));
        Ok(identity.to_string())
    }

    /// Drop the session everywhere. Always notifies, even when already anonymous.
    pub fn logoff(&self) {
        let Some(_transition) = self.begin_transition("logoff") else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);

        *self.write_state() = SessionState::default();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear persisted session");
        }

        info!("Logged off");
        self.events.emit(&SessionInfo::anonymous());
    }

    /// Restore the persisted session unless one is already active.
    ///
    /// An in-memory session always wins over storage. Nothing is emitted when
    /// there is nothing to restore. Returns true if a session was restored.
    pub fn check_session(&self) -> bool {
        let Some(_transition) = self.begin_transition("check_session") else {
            return false;
        };
        if !self.read_state().credential.is_empty() {
            debug!("Session already active, not restoring");
            return false;
        }

        let (credential, user) = match self.store.load() {
            Ok(Some(restored)) => restored,
            Ok(None) => {
                debug!("No persisted session");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                return false;
            }
        };

        self.store.cookie().set(&credential);
        {
            let mut state = self.write_state();
            state.credential = credential;
            state.user = user.clone();
        }

        info!(user = %user, "Restored persisted session");
        self.events.emit(&SessionInfo::registered(user));
        true
    }

    // ===== Reads =====

    /// Canonical credential, empty when anonymous
    pub fn current_credential(&self) -> String {
        self.read_state().credential.clone()
    }

    pub fn current_info(&self) -> SessionInfo {
        let state = self.read_state();
        if state.credential.is_empty() {
            SessionInfo::anonymous()
        } else {
            SessionInfo::registered(state.user.clone())
        }
    }

    pub fn is_logged_in(&self) -> bool {
        !self.read_state().credential.is_empty()
    }

    /// Append the credential to `base` as `s=<credential>`, for links that
    /// bypass the HTTP client. Returns `base` unchanged when anonymous.
    pub fn build_authenticated_url(&self, base: &str) -> String {
        let state = self.read_state();
        if state.credential.is_empty() {
            return base.to_string();
        }
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{}{}{}={}", base, separator, SESSION_QUERY_KEY, state.credential)
    }

    // ===== Notifications =====

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionInfo) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

/// Held for the duration of a transition. Forgets the owning thread before
/// releasing the lock.
struct TransitionGuard<'a> {
    owner: &'a Mutex<Option<ThreadId>>,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::{SESSION_ID_KEY, USER_KEY};
    use crate::auth::storage::{KeyValueStorage, MemoryStorage};
    use anyhow::anyhow;

    struct Harness {
        manager: Arc<SessionManager>,
        storage: Arc<MemoryStorage>,
        seen: Arc<Mutex<Vec<SessionInfo>>>,
    }

    fn harness_with(storage: Arc<MemoryStorage>) -> Harness {
        let store = CredentialStore::new(Box::new(Arc::clone(&storage)));
        let manager = Arc::new(SessionManager::new(store));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.subscribe(move |info| sink.lock().unwrap().push(info.clone()));
        Harness { manager, storage, seen }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryStorage::new()))
    }

    async fn ok(token: &str) -> Result<String, ApiError> {
        Ok(token.to_string())
    }

    async fn rejected() -> Result<String, ApiError> {
        Err(ApiError::Unauthorized)
    }

    #[tokio::test]
    async fn test_login_success() {
        let h = harness();
        let user = h.manager.login("alice", ok("abc123")).await.unwrap();

        assert_eq!(user, "alice");
        assert_eq!(h.manager.current_credential(), "abc123");
        assert_eq!(h.manager.current_info(), SessionInfo::registered("alice"));
        assert_eq!(h.storage.get(SESSION_ID_KEY).unwrap().as_deref(), Some("abc123"));
        assert_eq!(h.storage.get(USER_KEY).unwrap().as_deref(), Some("alice"));
        assert_eq!(h.manager.cookie().value().as_deref(), Some("abc123"));
        assert_eq!(*h.seen.lock().unwrap(), vec![SessionInfo::registered("alice")]);
    }

    #[tokio::test]
    async fn test_login_failure_changes_nothing() {
        let h = harness();
        let err = h.manager.login("alice", rejected()).await.unwrap_err();

        assert!(matches!(err, SessionError::Login(ApiError::Unauthorized)));
        assert!(!h.manager.is_logged_in());
        assert_eq!(h.storage.get(SESSION_ID_KEY).unwrap(), None);
        assert!(h.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_relogin_keeps_previous_session() {
        let h = harness();
        h.manager.login("alice", ok("abc123")).await.unwrap();
        assert!(h.manager.login("bob", rejected()).await.is_err());

        assert_eq!(h.manager.current_credential(), "abc123");
        assert_eq!(h.manager.current_info().user, "alice");
        assert_eq!(h.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_credential_is_a_failure() {
        let h = harness();
        let err = h.manager.login("alice", ok("")).await.unwrap_err();
        assert!(matches!(err, SessionError::Login(ApiError::InvalidResponse(_))));
        assert!(!h.manager.is_logged_in());
    }

    #[tokio::test]
    async fn test_relogin_overwrites() {
        let h = harness();
        h.manager.login("alice", ok("abc123")).await.unwrap();
        h.manager.login("bob", ok("def456")).await.unwrap();

        assert_eq!(h.manager.current_credential(), "def456");
        assert_eq!(h.storage.get(USER_KEY).unwrap().as_deref(), Some("bob"));
        assert_eq!(
            *h.seen.lock().unwrap(),
            vec![SessionInfo::registered("alice"), SessionInfo::registered("bob")]
        );
    }

    #[tokio::test]
    async fn test_logoff_clears_everything() {
        let h = harness();
        h.manager.login("alice", ok("abc123")).await.unwrap();
        h.manager.logoff();

        assert_eq!(h.manager.current_credential(), "");
        assert_eq!(h.manager.current_info(), SessionInfo::anonymous());
        assert_eq!(h.storage.get(SESSION_ID_KEY).unwrap(), None);
        assert_eq!(h.storage.get(USER_KEY).unwrap(), None);
        assert!(!h.manager.cookie().is_set());
        assert_eq!(h.seen.lock().unwrap().last(), Some(&SessionInfo::anonymous()));
    }

    #[test]
    fn test_logoff_when_anonymous_still_emits() {
        let h = harness();
        h.manager.logoff();
        h.manager.logoff();
        assert_eq!(
            *h.seen.lock().unwrap(),
            vec![SessionInfo::anonymous(), SessionInfo::anonymous()]
        );
    }

    #[test]
    fn test_check_session_restores() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(SESSION_ID_KEY, "abc123").unwrap();
        storage.set(USER_KEY, "alice").unwrap();
        let h = harness_with(storage);

        assert!(h.manager.check_session());

        assert_eq!(*h.seen.lock().unwrap(), vec![SessionInfo::registered("alice")]);
        assert_eq!(h.manager.current_credential(), "abc123");
        assert_eq!(h.manager.cookie().value().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_check_session_without_storage_is_silent() {
        let h = harness();
        assert!(!h.manager.check_session());
        assert!(h.seen.lock().unwrap().is_empty());
        assert!(!h.manager.is_logged_in());
    }

    #[test]
    fn test_check_session_ignores_partial_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(SESSION_ID_KEY, "abc123").unwrap();
        let h = harness_with(storage);

        assert!(!h.manager.check_session());
        assert!(h.seen.lock().unwrap().is_empty());
        assert_eq!(h.manager.current_credential(), "");
    }

    #[tokio::test]
    async fn test_check_session_keeps_active_session() {
        let h = harness();
        h.manager.login("alice", ok("abc123")).await.unwrap();

        // Storage changed behind our back
        h.storage.set(SESSION_ID_KEY, "stale").unwrap();
        h.storage.set(USER_KEY, "mallory").unwrap();

        assert!(!h.manager.check_session());
        assert_eq!(h.manager.current_credential(), "abc123");
        assert_eq!(h.manager.current_info().user, "alice");
        assert_eq!(h.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_init_restores() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(SESSION_ID_KEY, "abc123").unwrap();
        storage.set(USER_KEY, "alice").unwrap();
        let manager = SessionManager::init(CredentialStore::new(Box::new(storage)));
        assert_eq!(manager.current_info(), SessionInfo::registered("alice"));
    }

    #[tokio::test]
    async fn test_build_authenticated_url() {
        let h = harness();
        assert_eq!(h.manager.build_authenticated_url("x"), "x");
        assert_eq!(h.manager.build_authenticated_url("x?y=1"), "x?y=1");

        h.manager.login("alice", ok("cred")).await.unwrap();
        assert_eq!(h.manager.build_authenticated_url("x"), "x?s=cred");
        assert_eq!(h.manager.build_authenticated_url("x?y=1"), "x?y=1&s=cred");

        h.manager.logoff();
        assert_eq!(h.manager.build_authenticated_url("x"), "x");
    }

    #[tokio::test]
    async fn test_pending_login_is_not_visible() {
        let h = harness();
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let pending = h.manager.login("alice", async move {
            rx.await
                .map_err(|_| ApiError::InvalidResponse("exchange dropped".to_string()))
        });
        tokio::pin!(pending);

        assert!(futures::poll!(&mut pending).is_pending());
        assert_eq!(h.manager.current_credential(), "");
        assert!(h.seen.lock().unwrap().is_empty());

        tx.send("abc123".to_string()).unwrap();
        assert_eq!(pending.await.unwrap(), "alice");
        assert_eq!(h.manager.current_credential(), "abc123");
    }

    #[tokio::test]
    async fn test_logoff_supersedes_pending_login() {
        let h = harness();
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let pending = h.manager.login("alice", async move {
            rx.await
                .map_err(|_| ApiError::InvalidResponse("exchange dropped".to_string()))
        });
        tokio::pin!(pending);
        assert!(futures::poll!(&mut pending).is_pending());

        h.manager.logoff();
        tx.send("abc123".to_string()).unwrap();

        assert!(matches!(pending.await, Err(SessionError::Superseded)));
        assert!(!h.manager.is_logged_in());
        assert_eq!(h.storage.get(SESSION_ID_KEY).unwrap(), None);
        assert_eq!(*h.seen.lock().unwrap(), vec![SessionInfo::anonymous()]);
    }

    #[tokio::test]
    async fn test_later_login_supersedes_earlier() {
        let h = harness();
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let first = h.manager.login("alice", async move {
            rx.await
                .map_err(|_| ApiError::InvalidResponse("exchange dropped".to_string()))
        });
        tokio::pin!(first);
        assert!(futures::poll!(&mut first).is_pending());

        h.manager.login("bob", ok("def456")).await.unwrap();
        tx.send("abc123".to_string()).unwrap();

        assert!(matches!(first.await, Err(SessionError::Superseded)));
        assert_eq!(h.manager.current_credential(), "def456");
        assert_eq!(h.manager.current_info().user, "bob");
    }

    #[tokio::test]
    async fn test_subscriber_sees_complete_state() {
        let h = harness();
        let weak = Arc::downgrade(&h.manager);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        h.manager.subscribe(move |info| {
            if let Some(manager) = weak.upgrade() {
                sink.lock()
                    .unwrap()
                    .push((info.registered, manager.current_credential(), manager.cookie().is_set()));
            }
        });

        h.manager.login("alice", ok("abc123")).await.unwrap();
        h.manager.logoff();

        assert_eq!(
            *observed.lock().unwrap(),
            vec![(true, "abc123".to_string(), true), (false, String::new(), false)]
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_fatal() {
        struct Unavailable;

        impl KeyValueStorage for Unavailable {
            fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
                Err(anyhow!("storage unavailable"))
            }

            fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
                Err(anyhow!("storage unavailable"))
            }

            fn remove(&self, _key: &str) -> anyhow::Result<()> {
                Err(anyhow!("storage unavailable"))
            }
        }

        let manager = SessionManager::new(CredentialStore::new(Box::new(Unavailable)));
        assert!(!manager.check_session());

        manager.login("alice", ok("abc123")).await.unwrap();
        assert_eq!(manager.current_credential(), "abc123");

        manager.logoff();
        assert_eq!(manager.current_credential(), "");
        assert!(!manager.cookie().is_set());
    }

    #[tokio::test]
    async fn test_transition_from_subscriber_is_refused() {
        let h = harness();
        let weak = Arc::downgrade(&h.manager);
        let refused = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&refused);
        h.manager.subscribe(move |info| {
            let Some(manager) = weak.upgrade() else { return };
            if info.registered {
                manager.logoff();
                sink.lock().unwrap().push(manager.check_session());
            }
        });

        h.manager.login("alice", ok("abc123")).await.unwrap();

        assert!(h.manager.is_logged_in());
        assert_eq!(h.manager.current_info().user, "alice");
        assert_eq!(*refused.lock().unwrap(), vec![false]);
        assert_eq!(*h.seen.lock().unwrap(), vec![SessionInfo::registered("alice")]);

        // Outside of a callback the same calls work again
        h.manager.logoff();
        assert!(!h.manager.is_logged_in());
    }

    #[tokio::test]
    async fn test_login_from_subscriber_is_refused() {
        let h = harness();
        let weak = Arc::downgrade(&h.manager);
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        h.manager.subscribe(move |info| {
            let Some(manager) = weak.upgrade() else { return };
            if !info.registered {
                let result = futures::executor::block_on(manager.login("mallory", ok("evil")));
                sink.lock().unwrap().push(matches!(result, Err(SessionError::Reentrant)));
            }
        });

        h.manager.logoff();

        assert_eq!(*results.lock().unwrap(), vec![true]);
        assert!(!h.manager.is_logged_in());
        assert_eq!(h.storage.get(SESSION_ID_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_save_does_not_restore_wrong_user() {
        struct UserWritesFail {
            inner: Arc<MemoryStorage>,
            failing: std::sync::atomic::AtomicBool,
        }

        impl KeyValueStorage for UserWritesFail {
            fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
                self.inner.get(key)
            }

            fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
                if key == USER_KEY && self.failing.load(Ordering::SeqCst) {
                    return Err(anyhow!("disk full"));
                }
                self.inner.set(key, value)
            }

            fn remove(&self, key: &str) -> anyhow::Result<()> {
                self.inner.remove(key)
            }
        }

        let inner = Arc::new(MemoryStorage::new());
        let storage = Arc::new(UserWritesFail {
            inner: Arc::clone(&inner),
            failing: std::sync::atomic::AtomicBool::new(false),
        });
        let manager = SessionManager::new(CredentialStore::new(Box::new(Arc::clone(&storage))));

        manager.login("alice", ok("abc123")).await.unwrap();
        storage.failing.store(true, Ordering::SeqCst);
        manager.login("bob", ok("def456")).await.unwrap();
        assert_eq!(manager.current_info(), SessionInfo::registered("bob"));

        // Next process start
        let restarted = harness_with(inner);
        assert!(!restarted.manager.check_session());
        assert_eq!(restarted.manager.current_info(), SessionInfo::anonymous());
    }

    /// Random transition sequences, replayed against a model of the session
    #[tokio::test]
    async fn test_random_transitions_keep_copies_consistent() {
        const USERS: [&str; 3] = ["alice", "bob", "carol"];

        for seed in 0..16 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let h = harness();
            let mut model: Option<(String, String)> = None;

            for step in 0..64 {
                match rng.u8(0..4) {
                    0 => {
                        let user = USERS[rng.usize(..USERS.len())];
                        let token = format!("tok-{}-{}", seed, step);
                        h.manager.login(user, ok(&token)).await.unwrap();
                        model = Some((user.to_string(), token));
                    }
                    1 => {
                        let user = USERS[rng.usize(..USERS.len())];
                        assert!(h.manager.login(user, rejected()).await.is_err());
                    }
                    2 => {
                        h.manager.logoff();
                        model = None;
                    }
                    _ => {
                        assert!(!h.manager.check_session());
                    }
                }

                let context = format!("seed {} step {}", seed, step);
                let (expected_info, expected_token) = match &model {
                    Some((user, token)) => (SessionInfo::registered(user.clone()), Some(token.clone())),
                    None => (SessionInfo::anonymous(), None),
                };

                assert_eq!(h.manager.current_info(), expected_info, "{}", context);
                assert_eq!(
                    h.manager.current_credential(),
                    expected_token.clone().unwrap_or_default(),
                    "{}",
                    context
                );
                assert_eq!(h.manager.cookie().value(), expected_token, "{}", context);
                assert_eq!(h.storage.get(SESSION_ID_KEY).unwrap(), expected_token, "{}", context);
                assert_eq!(
                    h.storage.get(USER_KEY).unwrap(),
                    model.as_ref().map(|(user, _)| user.clone()),
                    "{}",
                    context
                );
                if let Some(last) = h.seen.lock().unwrap().last() {
                    assert_eq!(*last, expected_info, "{}", context);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let h = harness();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let id = h.manager.subscribe(move |_| *sink.lock().unwrap() += 1);

        h.manager.login("alice", ok("abc123")).await.unwrap();
        assert!(h.manager.unsubscribe(id));
        h.manager.logoff();

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
