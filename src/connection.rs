//! Connection manager: one realtime transport, reconnected on loss.
//!
//! ARCHITECTURE
//! ============
//! ```text
//!            connect(url)
//!   Closed ───────────────▶ Connecting ──ok──▶ Open
//!     ▲  ▲                       │              │ close / send failure
//!     │  └──── Error ◀───fail────┘              ▼
//!     │          (reconnect after delay)      Closed ──▶ Connecting ...
//!     └── Failed (attempts exhausted; URL forgotten)
//! ```
//!
//! Every mutation happens under one short `Mutex<Link>` critical section;
//! listeners run after the lock is released, so they may send, connect, or
//! register listeners from inside the callback.
//!
//! A generation counter is bumped by every manual `connect`/`disconnect`.
//! Reconnect timers and connector results carry the generation they were
//! started under and are discarded when it no longer matches, so a stale
//! attempt never touches a newer transport.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use envelopes::Envelope;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::dispatch::TopicDispatcher;
use crate::transport::{Connector, TransportEvent, TransportHandle, redact_query};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Error,
    /// Reconnect attempts exhausted; nothing further is scheduled.
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is not open")]
    NotOpen,
    #[error("transport closed while sending")]
    TransportClosed,
}

/// Observer of state transitions.
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Maps the remembered URL to the one used for an automatic reconnect.
/// Returning `None` keeps the remembered URL.
pub type UrlResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fixed-delay, bounded reconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: 5,
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

struct ActiveTransport {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    reader: Option<AbortHandle>,
}

struct Link {
    state: ConnectionState,
    url: Option<String>,
    generation: u64,
    attempts: u32,
    active: Option<ActiveTransport>,
    reconnect: Option<JoinHandle<()>>,
    next_transport: u64,
}

impl Link {
    /// Drop the transport and any pending reconnect. Returns whether the
    /// state moved to `Closed`.
    fn teardown(&mut self) -> bool {
        if let Some(pending) = self.reconnect.take() {
            pending.abort();
        }
        if let Some(active) = self.active.take()
            && let Some(reader) = active.reader
        {
            reader.abort();
        }
        let live = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Error
        );
        if live {
            self.state = ConnectionState::Closed;
        }
        live
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    dispatcher: TopicDispatcher,
    policy: ReconnectPolicy,
    resolver: Mutex<Option<UrlResolver>>,
    link: Mutex<Link>,
    listeners: Mutex<Vec<(ListenerId, StateListener)>>,
    next_listener: AtomicU64,
}

/// Cheaply cloneable handle; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Non-owning handle for callbacks stored inside the manager itself.
#[derive(Clone)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    #[must_use]
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, dispatcher: TopicDispatcher, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                dispatcher,
                policy,
                resolver: Mutex::new(None),
                link: Mutex::new(Link {
                    state: ConnectionState::Closed,
                    url: None,
                    generation: 0,
                    attempts: 0,
                    active: None,
                    reconnect: None,
                    next_transport: 0,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &TopicDispatcher {
        &self.inner.dispatcher
    }

    #[must_use]
    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock_link().state
    }

    /// URL reconnects will use, if any.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.lock_link().url.clone()
    }

    /// Automatic attempts made since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock_link().attempts
    }

    pub fn set_url_resolver(&self, resolver: Option<UrlResolver>) {
        *self.inner.resolver.lock().unwrap_or_else(PoisonError::into_inner) = resolver;
    }

    /// Open a transport to `url` and return the resulting state.
    ///
    /// A no-op while already open or connecting to the same URL. Any other
    /// existing transport is closed first. Resets the reconnect counter.
    pub async fn connect(&self, url: impl Into<String>) -> ConnectionState {
        let url = url.into();
        let (generation, closed_old) = {
            let mut link = self.lock_link();
            if link.url.as_deref() == Some(url.as_str())
                && matches!(link.state, ConnectionState::Open | ConnectionState::Connecting)
            {
                tracing::debug!(url = %redact_query(&url), state = %link.state, "connect ignored; already active");
                return link.state;
            }
            let closed_old = link.teardown();
            link.generation += 1;
            link.attempts = 0;
            link.url = Some(url.clone());
            link.state = ConnectionState::Connecting;
            (link.generation, closed_old)
        };

        if closed_old {
            self.notify(ConnectionState::Closed);
        }
        self.notify(ConnectionState::Connecting);
        self.establish(generation, url).await
    }

    /// Close the transport and forget the URL so nothing reconnects.
    pub fn disconnect(&self) {
        let closed = {
            let mut link = self.lock_link();
            link.generation += 1;
            link.attempts = 0;
            link.url = None;
            link.teardown()
        };
        if closed {
            tracing::info!("realtime connection closed by client");
            self.notify(ConnectionState::Closed);
        }
    }

    /// Queue one envelope line on the open transport.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotOpen`] unless open. [`ConnectionError::TransportClosed`]
    /// when the transport is gone; this counts as a loss and triggers
    /// reconnection.
    pub fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let line = envelopes::encode_line(envelope);
        let (id, sent) = {
            let link = self.lock_link();
            let Some(active) = link.active.as_ref().filter(|_| link.state == ConnectionState::Open) else {
                return Err(ConnectionError::NotOpen);
            };
            (active.id, active.outbound.send(line).is_ok())
        };
        if sent {
            return Ok(());
        }
        tracing::warn!(topic = %envelope.topic(), "send on dead transport");
        self.transport_lost(id, true);
        Err(ConnectionError::TransportClosed)
    }

    /// Register `listener` for every future transition.
    pub fn on_state_change(&self, listener: StateListener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    async fn establish(&self, generation: u64, url: String) -> ConnectionState {
        tracing::info!(url = %redact_query(&url), "opening realtime connection");
        match self.inner.connector.open(&url).await {
            Ok(handle) => self.install(generation, handle),
            Err(e) => {
                tracing::warn!(error = %e, "realtime connection failed");
                if self.transition(generation, ConnectionState::Error)
                    && self.transition(generation, ConnectionState::Closed)
                {
                    self.schedule_reconnect(generation);
                }
                self.state()
            }
        }
    }

    fn install(&self, generation: u64, handle: TransportHandle) -> ConnectionState {
        let TransportHandle { outbound, inbound } = handle;
        let id = {
            let mut link = self.lock_link();
            if link.generation != generation {
                tracing::debug!("discarding superseded transport");
                return link.state;
            }
            link.next_transport += 1;
            let id = link.next_transport;
            link.active = Some(ActiveTransport {
                id,
                outbound,
                reader: None,
            });
            link.state = ConnectionState::Open;
            link.attempts = 0;
            id
        };
        tracing::info!("realtime connection open");
        self.notify(ConnectionState::Open);

        let reader = tokio::spawn(read_loop(self.downgrade(), id, inbound));
        let mut link = self.lock_link();
        match link.active.as_mut() {
            Some(active) if active.id == id => active.reader = Some(reader.abort_handle()),
            _ => reader.abort(),
        }
        link.state
    }

    /// React to the loss of transport `id`; stale ids are ignored.
    fn transport_lost(&self, id: u64, errored: bool) {
        let generation = {
            let mut link = self.lock_link();
            if link.active.as_ref().map(|a| a.id) != Some(id) {
                return;
            }
            if let Some(active) = link.active.take()
                && let Some(reader) = active.reader
            {
                reader.abort();
            }
            link.state = if errored {
                ConnectionState::Error
            } else {
                ConnectionState::Closed
            };
            link.generation
        };

        if errored {
            self.notify(ConnectionState::Error);
            if !self.transition(generation, ConnectionState::Closed) {
                return;
            }
        } else {
            tracing::info!("realtime connection closed by peer");
            self.notify(ConnectionState::Closed);
        }
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(&self, generation: u64) {
        let mut link = self.lock_link();
        if link.generation != generation || link.url.is_none() {
            return;
        }
        let policy = self.inner.policy;
        if link.attempts >= policy.max_attempts {
            link.url = None;
            link.state = ConnectionState::Failed;
            let attempts = link.attempts;
            drop(link);
            tracing::error!(attempts, "realtime reconnection failed; giving up");
            self.notify(ConnectionState::Failed);
            return;
        }

        link.attempts += 1;
        let attempt = link.attempts;
        tracing::info!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = u64::try_from(policy.delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling realtime reconnect"
        );
        let weak = self.downgrade();
        link.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(policy.delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.reconnect(generation).await;
            }
        }));
    }

    async fn reconnect(&self, generation: u64) {
        let resolver = self.inner.resolver.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let url = {
            let mut link = self.lock_link();
            link.reconnect = None;
            if link.generation != generation {
                return;
            }
            let Some(remembered) = link.url.clone() else {
                return;
            };
            let url = resolver
                .and_then(|resolve| resolve(&remembered))
                .unwrap_or(remembered);
            link.url = Some(url.clone());
            link.state = ConnectionState::Connecting;
            url
        };
        self.notify(ConnectionState::Connecting);
        self.establish(generation, url).await;
    }

    /// Move to `state` if `generation` is still current, then notify.
    fn transition(&self, generation: u64, state: ConnectionState) -> bool {
        {
            let mut link = self.lock_link();
            if link.generation != generation {
                return false;
            }
            link.state = state;
        }
        self.notify(state);
        true
    }

    fn notify(&self, state: ConnectionState) {
        let listeners = self
            .lock_listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect::<Vec<_>>();
        tracing::debug!(%state, listeners = listeners.len(), "connection state changed");
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                tracing::error!(%state, "connection state listener panicked");
            }
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.inner.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, StateListener)>> {
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dispatch inbound lines until the transport reports its end.
async fn read_loop(manager: WeakConnectionManager, id: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Line(line) => {
                manager.dispatcher().dispatch_line(&line);
            }
            TransportEvent::Closed => {
                manager.transport_lost(id, false);
                return;
            }
            TransportEvent::Error(reason) => {
                tracing::warn!(%reason, "realtime transport error");
                manager.transport_lost(id, true);
                return;
            }
        }
    }
    if let Some(manager) = manager.upgrade() {
        manager.transport_lost(id, true);
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
