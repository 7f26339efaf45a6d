//! Client session management.
//!
//! This module provides:
//! - `SessionManager`: the canonical session, its transitions and change notifications
//! - `CredentialStore`: durable and cookie copies of the credential
//! - `SessionCookie` and `SessionCookieJar`: the `s` cookie, sent by the HTTP client to the API host only
//! - Storage backends: in-memory, JSON file and OS keychain
//!
//! Sessions are restored from storage at start-up and cleared everywhere on logoff.

pub mod cookie;
pub mod credentials;
pub mod events;
pub mod session;
pub mod storage;

pub use cookie::{SessionCookie, SessionCookieJar};
pub use credentials::CredentialStore;
pub use events::{SessionEvents, SessionInfo, SubscriptionId};
pub use session::{SessionError, SessionManager};
pub use storage::{FileStorage, KeyValueStorage, KeyringStorage, MemoryStorage};
