//! Cloud session state: the credential pair and the store that holds it.
//!
//! Nothing in here performs I/O. The [`TokenStore`] is owned by the
//! credential manager, which serializes every transition behind one lock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The cloud session. Both expiries are absolute UTC instants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential from a fresh grant issued at `now`.
    pub fn from_grant(grant: TokenGrant, now: DateTime<Utc>) -> Self {
        Self {
            access_token: grant.access_token,
            access_token_expires_at: grant.access_token_expires_at,
            refresh_token: grant.refresh_token,
            refresh_token_expires_at: grant.refresh_token_expires_at,
            last_refreshed_at: now,
        }
    }

    pub fn access_token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.access_token_expires_at
    }

    pub fn refresh_token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_token_expires_at
    }

    /// Time left on the access token (negative once expired).
    pub fn access_token_remaining(&self, now: DateTime<Utc>) -> Duration {
        self.access_token_expires_at - now
    }
}

/// A token pair as returned by login or refresh.
#[derive(Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token", &"<redacted>")
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .finish()
    }
}

/// Account credentials for a full login. Supplied by the host, never prompted for.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub account: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Lifecycle state of the cloud session as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    /// No credential has ever been obtained (or it was logged out).
    Unauthenticated,
    /// Access token valid and outside the refresh margin.
    Fresh,
    /// Access token valid but inside the refresh margin.
    NearExpiry,
    RefreshInProgress,
    /// Access token expired, refresh token still usable.
    ExpiredRefreshValid,
    /// Refresh token expired or rejected; only a login recovers.
    ExpiredRefreshExpired,
    LoginInProgress,
}

impl std::fmt::Display for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialState::Unauthenticated => "unauthenticated",
            CredentialState::Fresh => "fresh",
            CredentialState::NearExpiry => "near expiry",
            CredentialState::RefreshInProgress => "refresh in progress",
            CredentialState::ExpiredRefreshValid => "expired (refresh valid)",
            CredentialState::ExpiredRefreshExpired => "expired (re-login required)",
            CredentialState::LoginInProgress => "login in progress",
        };
        write!(f, "{}", s)
    }
}

/// Holds the current credential snapshot.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    credential: Option<Credential>,
    /// Set when the server rejected our refresh token, even if its recorded
    /// expiry is still in the future.
    refresh_rejected: bool,
}

impl TokenStore {
    pub fn new(credential: Option<Credential>) -> Self {
        Self {
            credential,
            refresh_rejected: false,
        }
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Classify the stored credential at `now`. Never reports the in-progress states;
    /// those belong to the manager's flight slot.
    pub fn classify(&self, now: DateTime<Utc>, refresh_margin: Duration) -> CredentialState {
        let Some(cred) = &self.credential else {
            return CredentialState::Unauthenticated;
        };

        if !cred.access_token_expired(now) {
            if cred.access_token_remaining(now) > refresh_margin {
                return CredentialState::Fresh;
            }
            if self.refresh_rejected || cred.refresh_token_expired(now) {
                // Still usable, but nothing can extend it besides a login.
                return CredentialState::ExpiredRefreshExpired;
            }
            return CredentialState::NearExpiry;
        }

        if self.refresh_rejected || cred.refresh_token_expired(now) {
            CredentialState::ExpiredRefreshExpired
        } else {
            CredentialState::ExpiredRefreshValid
        }
    }

    /// Replace the whole credential with a new grant.
    pub fn apply_grant(&mut self, grant: TokenGrant, now: DateTime<Utc>) -> &Credential {
        self.refresh_rejected = false;
        self.credential.insert(Credential::from_grant(grant, now))
    }

    pub fn mark_refresh_rejected(&mut self) {
        self.refresh_rejected = true;
    }

    pub fn refresh_rejected(&self) -> bool {
        self.refresh_rejected
    }

    pub fn clear(&mut self) {
        self.credential = None;
        self.refresh_rejected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(access_in: Duration, refresh_in: Duration) -> Credential {
        let now = Utc::now();
        Credential {
            access_token: "access".to_string(),
            access_token_expires_at: now + access_in,
            refresh_token: "refresh".to_string(),
            refresh_token_expires_at: now + refresh_in,
            last_refreshed_at: now,
        }
    }

    #[test]
    fn test_classify_states() {
        let margin = Duration::minutes(5);
        let now = Utc::now();

        assert_eq!(
            TokenStore::default().classify(now, margin),
            CredentialState::Unauthenticated
        );

        let store = TokenStore::new(Some(credential(Duration::hours(1), Duration::days(30))));
        assert_eq!(store.classify(now, margin), CredentialState::Fresh);

        let store = TokenStore::new(Some(credential(Duration::minutes(2), Duration::days(30))));
        assert_eq!(store.classify(now, margin), CredentialState::NearExpiry);

        let store = TokenStore::new(Some(credential(-Duration::minutes(1), Duration::days(30))));
        assert_eq!(store.classify(now, margin), CredentialState::ExpiredRefreshValid);

        let store = TokenStore::new(Some(credential(-Duration::minutes(1), -Duration::days(1))));
        assert_eq!(store.classify(now, margin), CredentialState::ExpiredRefreshExpired);
    }

    #[test]
    fn test_rejected_refresh_requires_login() {
        let margin = Duration::minutes(5);
        let mut store = TokenStore::new(Some(credential(-Duration::minutes(1), Duration::days(30))));
        store.mark_refresh_rejected();
        assert_eq!(
            store.classify(Utc::now(), margin),
            CredentialState::ExpiredRefreshExpired
        );

        let now = Utc::now();
        store.apply_grant(
            TokenGrant {
                access_token: "new-access".to_string(),
                access_token_expires_at: now + Duration::hours(2),
                refresh_token: "new-refresh".to_string(),
                refresh_token_expires_at: now + Duration::days(90),
            },
            now,
        );
        assert!(!store.refresh_rejected());
        assert_eq!(store.classify(now, margin), CredentialState::Fresh);
        assert_eq!(store.credential().map(|c| c.last_refreshed_at), Some(now));
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let creds = LoginCredentials::new("maker@example.com", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("maker@example.com"));
        assert!(!rendered.contains("hunter2"));
    }
}
