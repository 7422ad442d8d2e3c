//! Bearer credentials and cooldown-gated token refresh.
//!
//! When the access token expires, every in-flight task tends to hit 401 at
//! once. Only the first of them refreshes; the rest block on the gate and
//! replay with whatever token the refresh produced. A second 401 inside the
//! cooldown window means the fresh token was rejected too, so the gate clears
//! the credentials and reports [`SyncError::AuthExpired`].

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::json;
use timekeep_protocol::routes;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::remote::{Credentials, RemoteError, RemoteRequest, RemoteService};

pub const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(10);

/// The token a request was sent with, tagged with the credential generation
/// it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLease {
    pub token: Option<String>,
    pub generation: u64,
}

struct AuthState {
    credentials: Option<Credentials>,
    generation: u64,
    refreshing: bool,
    last_refresh_at: Option<Instant>,
    expired_listeners: Vec<Sender<()>>,
}

impl AuthState {
    fn lease(&self) -> TokenLease {
        TokenLease {
            token: self
                .credentials
                .as_ref()
                .map(|creds| creds.access_token.clone()),
            generation: self.generation,
        }
    }

    fn expire(&mut self) {
        self.credentials = None;
        self.generation += 1;
        self.expired_listeners
            .retain(|listener| listener.send(()).is_ok());
    }
}

pub struct AuthGate {
    state: Mutex<AuthState>,
    refreshed: Condvar,
    cooldown: Duration,
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_COOLDOWN)
    }
}

impl AuthGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(AuthState {
                credentials: None,
                generation: 0,
                refreshing: false,
                last_refresh_at: None,
                expired_listeners: Vec::new(),
            }),
            refreshed: Condvar::new(),
            cooldown,
        }
    }

    pub fn with_credentials(cooldown: Duration, credentials: Credentials) -> Self {
        let gate = Self::new(cooldown);
        gate.set_credentials(credentials);
        gate
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        let mut state = self.lock();
        state.credentials = Some(credentials);
        state.generation += 1;
        self.refreshed.notify_all();
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.credentials = None;
        state.generation += 1;
        self.refreshed.notify_all();
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().credentials.is_some()
    }

    pub fn lease(&self) -> TokenLease {
        self.lock().lease()
    }

    /// Fires once each time credentials are dropped because refresh failed.
    pub fn subscribe_expired(&self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        self.lock().expired_listeners.push(tx);
        rx
    }

    /// Recovers from a 401 received while using `stale`.
    ///
    /// Returns the lease to replay the request with, or `AuthExpired` when no
    /// usable token can be obtained.
    pub fn recover(
        &self,
        stale: &TokenLease,
        remote: &dyn RemoteService,
    ) -> Result<TokenLease, SyncError> {
        let mut state = self.lock();
        loop {
            if state.generation != stale.generation {
                return match state.credentials {
                    Some(_) => Ok(state.lease()),
                    None => Err(SyncError::AuthExpired),
                };
            }
            if !state.refreshing {
                break;
            }
            state = self
                .refreshed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        if let Some(last) = state.last_refresh_at {
            if last.elapsed() < self.cooldown {
                warn!(
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Refreshed token rejected inside cooldown window; clearing credentials"
                );
                state.expire();
                self.refreshed.notify_all();
                return Err(SyncError::AuthExpired);
            }
        }

        let refresh_token = match state
            .credentials
            .as_ref()
            .and_then(|creds| creds.refresh_token.clone())
        {
            Some(token) => token,
            None => {
                warn!("Access token rejected and no refresh token available");
                state.expire();
                self.refreshed.notify_all();
                return Err(SyncError::AuthExpired);
            }
        };

        state.refreshing = true;
        state.last_refresh_at = Some(Instant::now());
        drop(state);

        let result = remote.refresh(&refresh_token);

        let mut state = self.lock();
        state.refreshing = false;
        let outcome = match result {
            Ok(mut credentials) => {
                if credentials.refresh_token.is_none() {
                    credentials.refresh_token = Some(refresh_token);
                }
                state.credentials = Some(credentials);
                state.generation += 1;
                info!(generation = state.generation, "Access token refreshed");
                Ok(state.lease())
            }
            Err(err) => {
                warn!(error = %err, "Token refresh failed; clearing credentials");
                state.expire();
                Err(SyncError::AuthExpired)
            }
        };
        self.refreshed.notify_all();
        outcome
    }

    /// A replay with `lease` was rejected again. Drops the credentials unless
    /// they were replaced in the meantime.
    pub fn reject(&self, lease: &TokenLease) {
        let mut state = self.lock();
        if state.generation == lease.generation && state.credentials.is_some() {
            warn!("Replayed request rejected; clearing credentials");
            state.expire();
            self.refreshed.notify_all();
        }
    }

    pub fn login(
        &self,
        remote: &dyn RemoteService,
        email: &str,
        password: &str,
    ) -> Result<(), SyncError> {
        let request = RemoteRequest::post(
            routes::AUTH_LOGIN,
            Some(json!({ "email": email, "password": password })),
        );
        let value = remote.send(&request, None).map_err(SyncError::from)?;
        let credentials: Credentials = serde_json::from_value(value)
            .map_err(|err| SyncError::from(RemoteError::InvalidResponse(err.to_string())))?;
        self.set_credentials(credentials);
        info!("Signed in");
        Ok(())
    }

    /// Best-effort server logout; local credentials are cleared regardless.
    pub fn logout(&self, remote: &dyn RemoteService) {
        let lease = self.lease();
        if let Some(token) = lease.token.as_deref() {
            if let Err(err) = remote.send(&RemoteRequest::post(routes::AUTH_LOGOUT, None), Some(token))
            {
                warn!(error = %err, "Server logout failed");
            }
        }
        self.clear();
    }
}
