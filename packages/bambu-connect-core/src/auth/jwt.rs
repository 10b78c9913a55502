//! Minimal JWT payload inspection.
//!
//! The cloud does not always send token lifetimes, but its access tokens are
//! JWTs carrying an `exp` claim. The signature is not verified; we only need
//! to know when to refresh.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: i64,
}

/// Read the `exp` claim of a JWT, if the token is one.
pub fn expiry_from_jwt(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    // Some issuers keep the padding; the URL-safe no-pad engine rejects it.
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: ExpiryClaims = serde_json::from_slice(&decoded).ok()?;
    DateTime::from_timestamp(claims.exp, 0)
}
