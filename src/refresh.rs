//! Refresh coordinator: serializes credential renewal across concurrent callers.
//!
//! DESIGN
//! ======
//! State is `Idle | Refreshing { waiters }`, so a non-empty waiter queue can
//! only exist while a renewal is in flight. Every caller, including the one
//! that starts the renewal, waits on its own `oneshot` receiver; the renewal
//! itself runs on a spawned task and releases all waiters in enqueue order
//! with one cloned result.
//!
//! A caller hands over the access token it was using. When that token has
//! already been replaced in the store, the current credential is returned
//! without another network call, which keeps renewal exactly-once per expiry
//! even when 401s for the old token trickle in after the renewal finished.
//!
//! ERROR HANDLING
//! ==============
//! Renewal failure is terminal for the session: the store is cleared once,
//! every waiter receives the same `RefreshError`, and subscribers get
//! `AuthEvent::Unauthorized`.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::credentials::{Credential, CredentialStore};

const AUTH_EVENT_CAPACITY: usize = 16;

// =============================================================================
// ERRORS AND EVENTS
// =============================================================================

/// Terminal outcome of a failed renewal, shared by every waiter.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("no stored credential to refresh")]
    MissingCredential,
    #[error("refresh rejected with status {status}")]
    Rejected { status: u16 },
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh response invalid: {0}")]
    InvalidResponse(String),
    #[error("refresh task ended without a result")]
    Abandoned,
}

/// Session-level notifications emitted by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    /// A renewal succeeded and the store holds the new credential.
    Refreshed,
    /// Renewal failed or no credential exists; the user must sign in again.
    Unauthorized,
}

// =============================================================================
// REFRESHER
// =============================================================================

/// Performs the actual renewal call.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, current: &Credential) -> Result<Credential, RefreshError>;
}

/// Token payload returned by the login and refresh endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<Value>,
}

impl TokenResponse {
    /// Build a credential, keeping the previous refresh token and user when
    /// the response omits them.
    pub(crate) fn into_credential(self, previous: Option<&Credential>) -> Result<Credential, RefreshError> {
        let access = self
            .access_token
            .or(self.token)
            .ok_or_else(|| RefreshError::InvalidResponse("missing access_token".into()))?;
        let refresh = self
            .refresh_token
            .or_else(|| previous.map(|p| p.refresh_token.clone()))
            .ok_or_else(|| RefreshError::InvalidResponse("missing refresh_token".into()))?;
        let user = self.user.or_else(|| previous.and_then(|p| p.user.clone()));
        Ok(Credential::from_tokens(access, refresh).with_user(user))
    }
}

/// Renews credentials with `POST {endpoint}` and body `{ "refresh_token": .. }`.
pub struct HttpTokenRefresher {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTokenRefresher {
    #[must_use]
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, current: &Credential) -> Result<Credential, RefreshError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "refresh_token": current.refresh_token }))
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        body.into_credential(Some(current))
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

type Waiter = oneshot::Sender<Result<Credential, RefreshError>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

enum Entry {
    Queued,
    Started,
    AlreadyRenewed(Credential),
    Missing,
}

/// Cheaply cloneable handle; clones share one renewal state machine.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    state: Mutex<RefreshState>,
    events: broadcast::Sender<AuthEvent>,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                refresher,
                state: Mutex::new(RefreshState::Idle),
                events,
            }),
        }
    }

    /// Receive [`AuthEvent`]s emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Callers currently queued behind the in-flight renewal.
    #[must_use]
    pub fn pending_waiters(&self) -> usize {
        match &*self.lock_state() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { waiters } => waiters.len(),
        }
    }

    /// Force a renewal, or join the one already in flight.
    ///
    /// # Errors
    ///
    /// Returns the shared [`RefreshError`] when renewal fails.
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        self.renew(None).await
    }

    /// Renew the credential that produced `rejected_token`.
    ///
    /// Joins an in-flight renewal if there is one. Otherwise, if the store no
    /// longer holds `rejected_token`, returns the stored credential directly.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::MissingCredential`] when nothing is stored, or
    /// the shared renewal error.
    pub async fn renew(&self, rejected_token: Option<&str>) -> Result<Credential, RefreshError> {
        let (tx, rx) = oneshot::channel();
        let entry = {
            let mut state = self.lock_state();
            if let RefreshState::Refreshing { waiters } = &mut *state {
                waiters.push(tx);
                tracing::debug!(queued = waiters.len(), "joined in-flight credential refresh");
                Entry::Queued
            } else {
                match self.inner.store.get() {
                    None => Entry::Missing,
                    Some(current) if rejected_token.is_some_and(|token| token != current.access_token) => {
                        Entry::AlreadyRenewed(current)
                    }
                    Some(_) => {
                        *state = RefreshState::Refreshing { waiters: vec![tx] };
                        Entry::Started
                    }
                }
            }
        };

        match entry {
            Entry::Queued => {}
            Entry::Started => {
                let coordinator = self.clone();
                tokio::spawn(async move { coordinator.run_refresh().await });
            }
            Entry::AlreadyRenewed(current) => return Ok(current),
            Entry::Missing => {
                tracing::warn!("credential refresh requested without a stored credential");
                self.emit(AuthEvent::Unauthorized);
                return Err(RefreshError::MissingCredential);
            }
        }

        rx.await.unwrap_or(Err(RefreshError::Abandoned))
    }

    async fn run_refresh(&self) {
        let result = match self.inner.store.get() {
            Some(current) => {
                tracing::info!("refreshing access token");
                AssertUnwindSafe(self.inner.refresher.refresh(&current))
                    .catch_unwind()
                    .await
                    .unwrap_or(Err(RefreshError::Abandoned))
            }
            None => Err(RefreshError::MissingCredential),
        };
        self.finish(result);
    }

    fn finish(&self, result: Result<Credential, RefreshError>) {
        match &result {
            Ok(credential) => {
                self.inner.store.set(credential.clone());
                tracing::info!(expires_at = ?credential.expires_at, "access token refreshed");
            }
            Err(e) => {
                self.inner.store.clear();
                tracing::warn!(error = %e, "token refresh failed; credentials cleared");
            }
        }

        let waiters = match std::mem::replace(&mut *self.lock_state(), RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        };
        for waiter in waiters {
            if waiter.send(result.clone()).is_err() {
                tracing::debug!("refresh waiter dropped before completion");
            }
        }

        self.emit(if result.is_ok() {
            AuthEvent::Refreshed
        } else {
            AuthEvent::Unauthorized
        });
    }

    fn emit(&self, event: AuthEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::trace!(?event, "no auth event subscribers");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "refresh_test.rs"]
mod tests;
