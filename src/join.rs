//! Room join: send a `join` envelope now, or on the first transition to open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use envelopes::Envelope;

use crate::connection::{ConnectionError, ConnectionManager, ConnectionState, ListenerId, WeakConnectionManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Written to the open transport.
    Sent,
    /// Will be written on the next transition to open.
    Deferred,
}

/// Join `room_id`, deferring until the connection opens.
///
/// The deferred listener is registered before the state is re-checked, so an
/// open that lands in between is never missed, and a fired flag keeps the
/// send to exactly one. The listener stays registered until a send succeeds.
///
/// # Errors
///
/// Returns [`ConnectionError::TransportClosed`] when the open transport dies
/// during the send.
pub fn join_room(connection: &ConnectionManager, room_id: &str) -> Result<JoinOutcome, ConnectionError> {
    join_room_with(connection, room_id, || {})
}

/// [`join_room`], calling `on_sent` once the join envelope is written,
/// whether immediately or after a deferred open.
///
/// # Errors
///
/// See [`join_room`].
pub fn join_room_with<F>(
    connection: &ConnectionManager,
    room_id: &str,
    on_sent: F,
) -> Result<JoinOutcome, ConnectionError>
where
    F: Fn() + Send + Sync + 'static,
{
    if connection.state() == ConnectionState::Open {
        match connection.send(&Envelope::join(room_id)) {
            Ok(()) => {
                tracing::info!(%room_id, "joined room");
                on_sent();
                return Ok(JoinOutcome::Sent);
            }
            Err(ConnectionError::NotOpen) => {}
            Err(e) => return Err(e),
        }
    }

    let pending = Arc::new(PendingJoin {
        connection: connection.downgrade(),
        room_id: room_id.to_owned(),
        fired: AtomicBool::new(false),
        listener: Mutex::new(None),
        on_sent: Box::new(on_sent),
    });
    let id = connection.on_state_change({
        let pending = Arc::clone(&pending);
        Arc::new(move |state: ConnectionState| {
            if state == ConnectionState::Open && !pending.fire() {
                tracing::trace!("deferred join not sent on this open");
            }
        })
    });
    *pending.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);

    if connection.state() == ConnectionState::Open && pending.fire() {
        return Ok(JoinOutcome::Sent);
    }
    if pending.fired.load(Ordering::SeqCst) {
        // Fired before its id was recorded.
        connection.remove_listener(id);
    } else {
        tracing::debug!(%room_id, "join deferred until connection opens");
    }
    Ok(JoinOutcome::Deferred)
}

struct PendingJoin {
    connection: WeakConnectionManager,
    room_id: String,
    fired: AtomicBool,
    listener: Mutex<Option<ListenerId>>,
    on_sent: Box<dyn Fn() + Send + Sync>,
}

impl PendingJoin {
    /// Send the join once. Returns whether this call sent it.
    ///
    /// A failed send re-arms the join for the next open.
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(connection) = self.connection.upgrade() else {
            return false;
        };
        match connection.send(&Envelope::join(self.room_id.as_str())) {
            Ok(()) => {
                let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(id) = listener {
                    connection.remove_listener(id);
                }
                tracing::info!(room_id = %self.room_id, "joined room after connect");
                (self.on_sent)();
                true
            }
            Err(e) => {
                tracing::warn!(room_id = %self.room_id, error = %e, "deferred join failed; retrying on next open");
                self.fired.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "join_test.rs"]
mod tests;
