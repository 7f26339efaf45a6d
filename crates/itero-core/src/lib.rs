//! Client session subsystem for Itero.
//!
//! Knows whether the user is logged in, keeps that across restarts, tells
//! interested components when it changes, and attaches the session
//! credential to outgoing requests.
//!
//! ```no_run
//! use itero_core::api::{ApiClient, LoginInfo};
//! use itero_core::auth::SessionManager;
//! use itero_core::config::Config;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let session = SessionManager::init(config.credential_store()?);
//! session.subscribe(|info| println!("registered: {}", info.registered));
//!
//! let client = ApiClient::new(&config.server_url, session.clone())?;
//! client
//!     .login(&LoginInfo { user: "alice".into(), password: "secret".into() })
//!     .await?;
//! let polls: serde_json::Value = client.get_json("list").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, LoginInfo, RequestAugmentor};
pub use auth::{CredentialStore, SessionError, SessionInfo, SessionManager};
pub use config::Config;
