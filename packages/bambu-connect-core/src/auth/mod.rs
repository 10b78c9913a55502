//! Cloud session lifecycle.
//!
//! Holds the access/refresh token pair and keeps it valid through refresh
//! and, when account credentials are known, full re-login.

mod credentials;
pub mod jwt;
mod manager;

pub use credentials::{Credential, CredentialState, LoginCredentials, TokenGrant, TokenStore};
pub use manager::{CredentialManager, RefreshPolicy};
