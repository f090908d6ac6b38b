//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::sync::mpsc;

use crate::credentials::{Credential, CredentialStore, MemoryCredentialStore};
use crate::refresh::{RefreshError, TokenRefresher};
use crate::transport::{Connector, TransportError, TransportEvent, TransportHandle};

/// Unsigned JWT whose claims carry only `exp`.
pub fn jwt_expiring_at(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{claims}.sig")
}

// =============================================================================
// STORES
// =============================================================================

/// Memory store that counts mutations.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryCredentialStore,
    pub sets: AtomicUsize,
    pub clears: AtomicUsize,
}

impl CountingStore {
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            inner: MemoryCredentialStore::with_credential(credential),
            ..Self::default()
        }
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl CredentialStore for CountingStore {
    fn get(&self) -> Option<Credential> {
        self.inner.get()
    }

    fn set(&self, credential: Credential) {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(credential);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear();
    }
}

// =============================================================================
// REFRESHERS
// =============================================================================

/// Refresher with a fixed outcome and latency.
pub struct ScriptedRefresher {
    outcome: Result<Credential, RefreshError>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedRefresher {
    pub fn succeeding(access_token: &str, delay: Duration) -> Self {
        Self {
            outcome: Ok(Credential::from_tokens(access_token, "refresh-2")),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: RefreshError, delay: Duration) -> Self {
        Self {
            outcome: Err(error),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenRefresher for ScriptedRefresher {
    async fn refresh(&self, _current: &Credential) -> Result<Credential, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.outcome.clone()
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// Server side of one accepted mock transport.
pub struct Peer {
    pub url: String,
    /// Lines the client wrote.
    pub sent: mpsc::UnboundedReceiver<String>,
    /// Push events to the client.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl Peer {
    pub fn push_line(&self, line: &str) {
        self.events
            .send(TransportEvent::Line(line.to_owned()))
            .expect("client reader should be alive");
    }

    pub fn close(&self) {
        self.events.send(TransportEvent::Closed).expect("client reader should be alive");
    }

    pub fn fail(&self, reason: &str) {
        self.events
            .send(TransportEvent::Error(reason.to_owned()))
            .expect("client reader should be alive");
    }
}

/// In-process connector that accepts or refuses according to a script.
///
/// Once the script runs out every open is accepted.
#[derive(Default)]
pub struct ScriptedConnector {
    refusals: Mutex<VecDeque<bool>>,
    dead_on_arrival: AtomicUsize,
    opened: Mutex<Vec<String>>,
    peers: Mutex<VecDeque<Peer>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue outcomes for upcoming opens: `true` refuses, `false` accepts.
    pub fn script(&self, outcomes: &[bool]) {
        self.refusals.lock().expect("script lock").extend(outcomes.iter().copied());
    }

    /// The next `count` accepted transports drop their outbound receiver
    /// before the client sees them open, so the first send fails.
    pub fn accept_dead(&self, count: usize) {
        self.dead_on_arrival.fetch_add(count, Ordering::SeqCst);
    }

    /// Every URL an open was attempted with, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.opened.lock().expect("opened lock").clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.opened.lock().expect("opened lock").len()
    }

    /// Take the oldest accepted transport not yet taken.
    pub fn take_peer(&self) -> Peer {
        self.peers
            .lock()
            .expect("peers lock")
            .pop_front()
            .expect("a transport should have been accepted")
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, url: &str) -> Result<TransportHandle, TransportError> {
        self.opened.lock().expect("opened lock").push(url.to_owned());
        let refuse = self.refusals.lock().expect("script lock").pop_front().unwrap_or(false);
        if refuse {
            return Err(TransportError::Connect {
                url: url.to_owned(),
                reason: "refused by script".to_owned(),
            });
        }

        let (outbound, mut sent) = mpsc::unbounded_channel();
        let dead = self
            .dead_on_arrival
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if dead {
            sent.close();
        }
        let (events, inbound) = mpsc::unbounded_channel();
        self.peers.lock().expect("peers lock").push_back(Peer {
            url: url.to_owned(),
            sent,
            events,
        });
        Ok(TransportHandle { outbound, inbound })
    }
}
