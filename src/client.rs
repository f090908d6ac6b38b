//! `Courier`: the explicitly constructed service object owning every
//! component of one client session.
//!
//! ARCHITECTURE
//! ============
//! ```text
//!   Courier ─┬─ Gateway ──────────┐
//!            ├─ RefreshCoordinator ┼── CredentialStore
//!            └─ ConnectionManager ─┴── TopicDispatcher
//! ```
//!
//! `start()` opens the realtime connection with the current credential and
//! spawns an auth watcher that disconnects on `AuthEvent::Unauthorized`.
//! Rooms joined through the service are remembered and re-joined after every
//! reconnect. Instances share nothing, so several can run side by side.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, ConfigError};
use crate::connection::{ConnectionError, ConnectionManager, ConnectionState, WeakConnectionManager};
use crate::credentials::{Credential, CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore};
use crate::dispatch::TopicDispatcher;
use crate::gateway::{Gateway, GatewayError, build_http_client};
use crate::join::{JoinOutcome, join_room_with};
use crate::refresh::{AuthEvent, HttpTokenRefresher, RefreshCoordinator, RefreshError, TokenRefresher};
use crate::transport::{Connector, WebSocketConnector};

#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("http client setup failed: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub struct Courier {
    config: ClientConfig,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
    gateway: Gateway,
    connection: ConnectionManager,
    rooms: Arc<Rooms>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Courier {
    /// Build a session with the HTTP token refresher from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::HttpClient`] when the HTTP client cannot be
    /// built.
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, CourierError> {
        let http = build_http_client(config.request_timeout, config.connect_timeout)?;
        let refresher = Arc::new(HttpTokenRefresher::new(http.clone(), config.refresh_url()));
        Ok(Self::assemble(config, store, connector, refresher, http))
    }

    /// Build a session with a custom [`TokenRefresher`].
    ///
    /// # Errors
    ///
    /// See [`Courier::new`].
    pub fn with_refresher(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self, CourierError> {
        let http = build_http_client(config.request_timeout, config.connect_timeout)?;
        Ok(Self::assemble(config, store, connector, refresher, http))
    }

    /// Production wiring: WebSocket transport, and a file-backed store when
    /// `credentials_path` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::Credentials`] when the credential file exists
    /// but cannot be loaded.
    pub fn from_config(config: ClientConfig) -> Result<Self, CourierError> {
        let store: Arc<dyn CredentialStore> = match &config.credentials_path {
            Some(path) => Arc::new(FileCredentialStore::open(path)?),
            None => Arc::new(MemoryCredentialStore::new()),
        };
        let connector = Arc::new(WebSocketConnector::new(config.connect_timeout));
        Self::new(config, store, connector)
    }

    fn assemble(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        refresher: Arc<dyn TokenRefresher>,
        http: reqwest::Client,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(Arc::clone(&store), refresher);
        let gateway = Gateway::new(
            http,
            config.api_base_url.clone(),
            Arc::clone(&store),
            coordinator.clone(),
            config.expiry_skew_secs,
        );
        let connection = ConnectionManager::new(connector, TopicDispatcher::new(), config.reconnect);

        if config.reresolve_token_on_reconnect {
            let store = Arc::clone(&store);
            let config = config.clone();
            connection.set_url_resolver(Some(Arc::new(move |_remembered: &str| {
                let credential = store.get()?;
                match config.realtime_url(&credential.access_token) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot rebuild realtime url; reusing previous");
                        None
                    }
                }
            })));
        }

        let rooms = Arc::new(Rooms::default());
        let weak = connection.downgrade();
        connection.on_state_change({
            let rooms = Arc::clone(&rooms);
            Arc::new(move |state: ConnectionState| {
                if state == ConnectionState::Open {
                    rooms.rejoin(&weak);
                }
            })
        });

        Self {
            config,
            store,
            coordinator,
            gateway,
            connection,
            rooms,
            watcher: Mutex::new(None),
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    #[must_use]
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn dispatcher(&self) -> &TopicDispatcher {
        self.connection.dispatcher()
    }

    #[must_use]
    pub fn subscribe_auth(&self) -> broadcast::Receiver<AuthEvent> {
        self.coordinator.subscribe()
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.names()
    }

    // =========================================================================
    // SESSION
    // =========================================================================

    /// Sign in and store the returned credential.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::Gateway`] when the login call fails.
    pub async fn login(&self, body: Value) -> Result<Credential, CourierError> {
        Ok(self.gateway.login(&self.config.login_url(), body).await?)
    }

    /// Stop the session and forget the stored credential and rooms.
    pub fn logout(&self) {
        self.stop();
        self.rooms.clear();
        self.store.clear();
        tracing::info!("logged out");
    }

    /// Open the realtime connection with the current credential, renewing
    /// it first when expired.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::NotAuthenticated`] without a stored credential
    /// and [`CourierError::Refresh`] when renewal fails.
    pub async fn start(&self) -> Result<ConnectionState, CourierError> {
        let credential = self.current_credential().await?;
        let url = self.config.realtime_url(&credential.access_token)?;
        self.spawn_watcher();
        Ok(self.connection.connect(url).await)
    }

    /// Disconnect and stop the auth watcher.
    pub fn stop(&self) {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.abort();
        }
        self.connection.disconnect();
    }

    /// Join `room_id` now or on the next open, and re-join it after every
    /// reconnect until [`Courier::forget_room`] or logout.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::Connection`] when the open transport dies
    /// during the send. The room stays remembered and is joined on the
    /// reconnect's open.
    pub fn join_room(&self, room_id: &str) -> Result<JoinOutcome, CourierError> {
        self.rooms.remember(room_id);
        let rooms = Arc::downgrade(&self.rooms);
        let name = room_id.to_owned();
        let joined = join_room_with(&self.connection, room_id, move || {
            if let Some(rooms) = rooms.upgrade() {
                rooms.mark_joined(&name);
            }
        });
        match joined {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // No deferred join was registered; re-joins take over.
                self.rooms.mark_joined(room_id);
                Err(e.into())
            }
        }
    }

    /// Stop re-joining `room_id` after reconnects.
    pub fn forget_room(&self, room_id: &str) -> bool {
        self.rooms.forget(room_id)
    }

    async fn current_credential(&self) -> Result<Credential, CourierError> {
        let Some(credential) = self.store.get() else {
            return Err(CourierError::NotAuthenticated);
        };
        if credential.is_expired(self.config.expiry_skew_secs) {
            tracing::info!("stored credential expired; renewing before connect");
            return Ok(self.coordinator.renew(Some(&credential.access_token)).await?);
        }
        Ok(credential)
    }

    fn spawn_watcher(&self) {
        let mut watcher = self.lock_watcher();
        if watcher.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let events = self.coordinator.subscribe();
        *watcher = Some(tokio::spawn(watch_auth(events, self.connection.downgrade())));
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Courier {
    fn drop(&mut self) {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.abort();
        }
    }
}

/// Disconnect whenever the session becomes unauthorized.
async fn watch_auth(mut events: broadcast::Receiver<AuthEvent>, connection: WeakConnectionManager) {
    loop {
        match events.recv().await {
            Ok(AuthEvent::Unauthorized) => {
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                tracing::warn!("session unauthorized; closing realtime connection");
                connection.disconnect();
            }
            Ok(AuthEvent::Refreshed) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "auth watcher lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

// =============================================================================
// ROOMS
// =============================================================================

/// Remembered rooms. `awaiting` marks rooms whose first join is still owned
/// by a pending one-shot join; it clears once that join is written.
#[derive(Default)]
struct Rooms {
    entries: Mutex<Vec<RoomEntry>>,
}

struct RoomEntry {
    name: String,
    awaiting: bool,
}

impl Rooms {
    fn remember(&self, room_id: &str) {
        let mut entries = self.lock();
        match entries.iter_mut().find(|entry| entry.name == room_id) {
            Some(entry) => entry.awaiting = true,
            None => entries.push(RoomEntry {
                name: room_id.to_owned(),
                awaiting: true,
            }),
        }
    }

    fn mark_joined(&self, room_id: &str) {
        if let Some(entry) = self.lock().iter_mut().find(|entry| entry.name == room_id) {
            entry.awaiting = false;
        }
    }

    fn forget(&self, room_id: &str) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| entry.name != room_id);
        entries.len() != before
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn names(&self) -> Vec<String> {
        self.lock().iter().map(|entry| entry.name.clone()).collect()
    }

    /// Re-send joins on open. Rooms still awaiting their first join are
    /// left to the pending one-shot.
    fn rejoin(&self, connection: &WeakConnectionManager) {
        let rooms = self
            .lock()
            .iter()
            .filter(|entry| !entry.awaiting)
            .map(|entry| entry.name.clone())
            .collect::<Vec<_>>();
        let Some(connection) = connection.upgrade() else {
            return;
        };
        for room_id in rooms {
            match connection.send(&envelopes::Envelope::join(room_id.as_str())) {
                Ok(()) => tracing::info!(%room_id, "re-joined room after reconnect"),
                Err(e) => tracing::warn!(%room_id, error = %e, "re-join failed"),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RoomEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
