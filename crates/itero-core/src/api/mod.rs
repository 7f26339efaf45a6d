//! REST API client module for the Itero middleware.
//!
//! This module provides the `ApiClient` for logging in and sending requests,
//! and the `RequestAugmentor` that attaches the session credential to every
//! outgoing request as the `X-CSRF` header.

pub mod augmentor;
pub mod client;
pub mod error;
pub mod request;

pub use augmentor::{RequestAugmentor, SESSION_HEADER};
pub use client::{ApiClient, LoginInfo};
pub use error::ApiError;
pub use request::ApiRequest;
