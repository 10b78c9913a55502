//! Credential lifecycle manager.
//!
//! Hands out access tokens that stay valid for at least the refresh margin,
//! refreshing or re-logging in behind the caller's back. Refresh and login
//! are single-flight: every caller that arrives while one is outstanding
//! awaits the same spawned task and observes the same outcome.

use super::credentials::{Credential, CredentialState, LoginCredentials, TokenGrant, TokenStore};
use crate::cloud::CloudAuth;
use crate::error::{CloudError, FleetError, FleetResult};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Timing knobs for refresh and login.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Refresh once less than this remains on the access token.
    pub refresh_margin: Duration,
    /// Upper bound on each individual login/refresh call.
    pub request_timeout: Duration,
    /// Total attempts for transient failures, including the first.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(8),
        }
    }
}

impl RefreshPolicy {
    fn margin(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_margin).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Exponential backoff with up to 25% jitter. `attempt` starts at 1.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let delay = exp.min(self.retry_max_delay);
        let jitter_ms = (delay.as_millis() / 4) as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

type FlightResult = FleetResult<Credential>;
type Flight = Shared<BoxFuture<'static, FlightResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Refresh,
    Login,
}

struct InFlight {
    id: u64,
    kind: FlightKind,
    /// Account credentials a login flight presents.
    login: Option<LoginCredentials>,
    future: Flight,
}

enum FlightPlan {
    Refresh { refresh_token: String },
    Login { credentials: LoginCredentials },
}

struct ManagerState {
    store: TokenStore,
    login: Option<LoginCredentials>,
    flight: Option<InFlight>,
    next_flight_id: u64,
    /// Replaces the policy margin while the current access token was issued
    /// with a lifetime shorter than that margin.
    margin_override: Option<chrono::Duration>,
}

struct Inner {
    auth: Arc<dyn CloudAuth>,
    policy: RefreshPolicy,
    state: Mutex<ManagerState>,
}

/// Owns the cloud session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    pub fn new(
        auth: Arc<dyn CloudAuth>,
        policy: RefreshPolicy,
        credential: Option<Credential>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                auth,
                policy,
                state: Mutex::new(ManagerState {
                    store: TokenStore::new(credential),
                    login: None,
                    flight: None,
                    next_flight_id: 0,
                    margin_override: None,
                }),
            }),
        }
    }

    /// Remember account credentials so an expired session can be recovered
    /// without involving the caller.
    pub async fn set_login_credentials(&self, credentials: Option<LoginCredentials>) {
        self.inner.state.lock().await.login = credentials;
    }

    /// Return an access token valid for at least the refresh margin,
    /// refreshing or logging in first when needed.
    pub async fn ensure_valid_token(&self) -> FleetResult<String> {
        let flight = {
            let mut state = self.inner.state.lock().await;
            if let Some(flight) = state.flight.as_ref().map(|f| f.future.clone()) {
                tracing::debug!("Joining in-flight credential renewal");
                flight
            } else {
                match state.store.classify(Utc::now(), self.inner.margin(&state)) {
                    CredentialState::Fresh => {
                        return state
                            .store
                            .credential()
                            .map(|c| c.access_token.clone())
                            .ok_or_else(|| FleetError::Internal("fresh state without credential".into()));
                    }
                    CredentialState::NearExpiry | CredentialState::ExpiredRefreshValid => {
                        self.start_refresh(&mut state)?
                    }
                    _ => self.start_login(&mut state)?,
                }
            }
        };

        flight.await.map(|c| c.access_token)
    }

    /// Refresh now regardless of the margin. Joins any flight already running.
    pub async fn force_refresh(&self) -> FleetResult<String> {
        let flight = {
            let mut state = self.inner.state.lock().await;
            if let Some(flight) = state.flight.as_ref().map(|f| f.future.clone()) {
                flight
            } else {
                match state.store.classify(Utc::now(), self.inner.margin(&state)) {
                    CredentialState::Unauthenticated | CredentialState::ExpiredRefreshExpired => {
                        self.start_login(&mut state)?
                    }
                    _ => self.start_refresh(&mut state)?,
                }
            }
        };

        tracing::info!("Forced credential refresh requested");
        flight.await.map(|c| c.access_token)
    }

    /// Log in with the given account credentials and remember them for later re-logins.
    pub async fn login(&self, credentials: LoginCredentials) -> FleetResult<Credential> {
        loop {
            let (flight, joined) = {
                let mut state = self.inner.state.lock().await;
                state.login = Some(credentials.clone());
                let running = state.flight.as_ref().map(|f| {
                    let same_login =
                        f.kind == FlightKind::Login && f.login.as_ref() == Some(&credentials);
                    (f.future.clone(), same_login)
                });
                match running {
                    // A refresh, or a login with other credentials, settles
                    // before ours replaces the session.
                    Some((future, same_login)) => (future, same_login),
                    None => {
                        let plan = FlightPlan::Login {
                            credentials: credentials.clone(),
                        };
                        (self.start_flight(&mut state, plan), true)
                    }
                }
            };

            if joined {
                return flight.await;
            }
            match flight.await {
                Ok(_) => tracing::debug!("Earlier credential flight succeeded, logging in again"),
                Err(e) => tracing::debug!("Earlier credential flight failed ({}), logging in", e),
            }
        }
    }

    /// Forget the session and any stored login credentials.
    pub async fn logout(&self) {
        let mut state = self.inner.state.lock().await;
        state.store.clear();
        state.login = None;
        state.margin_override = None;
        // An outstanding flight finishes but its result is discarded.
        state.flight = None;
        tracing::info!("Cloud session cleared");
    }

    pub async fn state(&self) -> CredentialState {
        let state = self.inner.state.lock().await;
        match &state.flight {
            Some(flight) if flight.kind == FlightKind::Refresh => CredentialState::RefreshInProgress,
            Some(_) => CredentialState::LoginInProgress,
            None => state.store.classify(Utc::now(), self.inner.margin(&state)),
        }
    }

    /// Snapshot of the stored credential, for persistence.
    pub async fn credential(&self) -> Option<Credential> {
        self.inner.state.lock().await.store.credential().cloned()
    }

    pub async fn has_login_credentials(&self) -> bool {
        self.inner.state.lock().await.login.is_some()
    }

    fn start_refresh(&self, state: &mut ManagerState) -> FleetResult<Flight> {
        let refresh_token = state
            .store
            .credential()
            .map(|c| c.refresh_token.clone())
            .ok_or(FleetError::ReauthenticationRequired)?;
        Ok(self.start_flight(state, FlightPlan::Refresh { refresh_token }))
    }

    fn start_login(&self, state: &mut ManagerState) -> FleetResult<Flight> {
        let credentials = state
            .login
            .clone()
            .ok_or(FleetError::ReauthenticationRequired)?;
        Ok(self.start_flight(state, FlightPlan::Login { credentials }))
    }

    /// Spawn the network work and park its shared future in the flight slot.
    /// Must be called with the state lock held.
    fn start_flight(&self, state: &mut ManagerState, plan: FlightPlan) -> Flight {
        let id = state.next_flight_id;
        state.next_flight_id += 1;

        let (kind, login) = match &plan {
            FlightPlan::Refresh { .. } => (FlightKind::Refresh, None),
            FlightPlan::Login { credentials } => (FlightKind::Login, Some(credentials.clone())),
        };
        tracing::info!("Starting credential {:?} (flight {})", kind, id);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_flight(inner, id, plan));
        let future: Flight = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(FleetError::Internal(format!("credential task failed: {}", e))))
        }
        .boxed()
        .shared();

        state.flight = Some(InFlight {
            id,
            kind,
            login,
            future: future.clone(),
        });
        future
    }
}

async fn run_flight(inner: Arc<Inner>, id: u64, plan: FlightPlan) -> FlightResult {
    let credentials = match plan {
        FlightPlan::Refresh { refresh_token } => {
            let auth = Arc::clone(&inner.auth);
            let result = call_with_retries(&inner.policy, "refresh", || {
                let auth = Arc::clone(&auth);
                let token = refresh_token.clone();
                async move { auth.refresh(&token).await }
            })
            .await;

            match result {
                Ok(grant) => return inner.complete(id, grant).await,
                Err(CloudError::Rejected(reason)) => {
                    tracing::warn!("Refresh token rejected by cloud: {}", reason);
                    match inner.refresh_rejected(id).await {
                        Some(credentials) => credentials,
                        None => return inner.fail(id, FleetError::ReauthenticationRequired).await,
                    }
                }
                Err(e) => return inner.fail(id, e.into()).await,
            }
        }
        FlightPlan::Login { credentials } => credentials,
    };

    let auth = Arc::clone(&inner.auth);
    let result = call_with_retries(&inner.policy, "login", || {
        let auth = Arc::clone(&auth);
        let credentials = credentials.clone();
        async move { auth.login(&credentials).await }
    })
    .await;

    match result {
        Ok(grant) => inner.complete(id, grant).await,
        Err(CloudError::Rejected(reason)) => {
            tracing::warn!("Login rejected for account {}: {}", credentials.account, reason);
            inner.login_rejected(id, &credentials).await;
            inner.fail(id, FleetError::AuthRejected(reason)).await
        }
        Err(e) => inner.fail(id, e.into()).await,
    }
}

impl Inner {
    fn margin(&self, state: &ManagerState) -> chrono::Duration {
        state.margin_override.unwrap_or_else(|| self.policy.margin())
    }

    async fn complete(&self, id: u64, grant: TokenGrant) -> FlightResult {
        let mut state = self.state.lock().await;
        if !state.flight.as_ref().is_some_and(|f| f.id == id) {
            tracing::debug!("Discarding result of superseded flight {}", id);
            return Err(FleetError::ReauthenticationRequired);
        }
        state.flight = None;
        let now = Utc::now();
        let credential = state.store.apply_grant(grant, now).clone();

        let lifetime = credential.access_token_remaining(now);
        let margin = self.policy.margin();
        state.margin_override = if lifetime <= margin {
            // Half the lifetime keeps the token usable without renewing it on every call.
            let clamped = (lifetime / 2).max(chrono::Duration::zero());
            tracing::warn!(
                "Access token lifetime {}s is within the {}s refresh margin, refreshing {}s before expiry",
                lifetime.num_seconds(),
                margin.num_seconds(),
                clamped.num_seconds()
            );
            Some(clamped)
        } else {
            None
        };

        tracing::info!(
            "Cloud session renewed, access token valid until {}",
            credential.access_token_expires_at.to_rfc3339()
        );
        Ok(credential)
    }

    async fn fail(&self, id: u64, error: FleetError) -> FlightResult {
        let mut state = self.state.lock().await;
        if state.flight.as_ref().is_some_and(|f| f.id == id) {
            state.flight = None;
        }
        tracing::warn!("Credential flight {} failed: {}", id, error);
        Err(error)
    }

    /// Record the rejection and, when account credentials are known, switch
    /// the running flight over to a login.
    async fn refresh_rejected(&self, id: u64) -> Option<LoginCredentials> {
        let mut state = self.state.lock().await;
        if !state.flight.as_ref().is_some_and(|f| f.id == id) {
            return None;
        }
        state.store.mark_refresh_rejected();
        let credentials = state.login.clone()?;
        if let Some(flight) = state.flight.as_mut() {
            flight.kind = FlightKind::Login;
            flight.login = Some(credentials.clone());
        }
        tracing::info!("Falling back to full login");
        Some(credentials)
    }

    async fn login_rejected(&self, id: u64, rejected: &LoginCredentials) {
        let mut state = self.state.lock().await;
        // Retrying the same password would only be rejected again. Credentials
        // supplied while this flight ran are kept.
        if state.flight.as_ref().is_some_and(|f| f.id == id)
            && state.login.as_ref() == Some(rejected)
        {
            state.login = None;
        }
    }
}

/// Run `call` with a timeout, retrying transient failures with backoff.
async fn call_with_retries<F, Fut>(
    policy: &RefreshPolicy,
    operation: &str,
    mut call: F,
) -> Result<TokenGrant, CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TokenGrant, CloudError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.request_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Transient(format!(
                "{} timed out after {:?}",
                operation, policy.request_timeout
            ))),
        };

        match result {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "Cloud {} failed (attempt {} of {}): {}. Retrying in {:?}",
                    operation,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
