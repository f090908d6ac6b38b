//! Topic dispatcher: fans inbound envelopes out to subscribed handlers.
//!
//! DESIGN
//! ======
//! Handlers for `envelope.topic()` run in registration order, then handlers
//! registered under the wildcard topic. The handler lists are cloned before
//! invocation, so a handler may subscribe or unsubscribe (itself included)
//! without deadlocking; such changes apply from the next dispatch.
//!
//! ERROR HANDLING
//! ==============
//! A panicking handler is caught and logged; the remaining handlers still
//! run. Lines that do not decode are logged and dropped.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use envelopes::{Envelope, WILDCARD_TOPIC};
use tokio::sync::mpsc;

/// Subscriber callback. Identity (for unsubscribe) is the `Arc` pointer.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Clone, Default)]
pub struct TopicDispatcher {
    handlers: Arc<Mutex<HashMap<String, Vec<Handler>>>>,
}

impl TopicDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. The same handler may be registered
    /// more than once and is then invoked once per registration.
    pub fn subscribe(&self, topic: impl Into<String>, handler: Handler) {
        let topic = topic.into();
        tracing::debug!(%topic, "handler subscribed");
        self.lock().entry(topic).or_default().push(handler);
    }

    /// Wrap `f` in a [`Handler`], subscribe it, and return it for a later
    /// [`TopicDispatcher::unsubscribe`].
    pub fn subscribe_fn<F>(&self, topic: impl Into<String>, f: F) -> Handler
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(f);
        self.subscribe(topic, Arc::clone(&handler));
        handler
    }

    /// Remove every registration of `handler` under `topic`.
    ///
    /// Returns whether anything was removed.
    pub fn unsubscribe(&self, topic: &str, handler: &Handler) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(topic);
        }
        removed
    }

    /// Deliver envelopes for `topic` into an unbounded channel.
    ///
    /// The registration stays until the receiver is dropped; it is removed
    /// on the first delivery attempt after that.
    pub fn subscribe_channel(&self, topic: impl Into<String>) -> mpsc::UnboundedReceiver<Envelope> {
        let topic = topic.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::downgrade(&self.handlers);
        let slot: Arc<Mutex<Option<Handler>>> = Arc::new(Mutex::new(None));
        let handler: Handler = Arc::new({
            let topic = topic.clone();
            let slot = Arc::clone(&slot);
            move |envelope: &Envelope| {
                if tx.send(envelope.clone()).is_err() {
                    let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let (Some(own), Some(handlers)) = (taken, registry.upgrade()) {
                        TopicDispatcher { handlers }.unsubscribe(&topic, &own);
                    }
                }
            }
        });
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&handler));
        self.subscribe(topic, handler);
        rx
    }

    #[must_use]
    pub fn handler_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map_or(0, Vec::len)
    }

    /// Invoke matching handlers; returns how many were invoked.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let topic = envelope.topic();
        let (specific, wildcard) = {
            let handlers = self.lock();
            let specific = handlers.get(topic).cloned().unwrap_or_default();
            let wildcard = if topic == WILDCARD_TOPIC {
                Vec::new()
            } else {
                handlers.get(WILDCARD_TOPIC).cloned().unwrap_or_default()
            };
            (specific, wildcard)
        };

        let mut invoked = 0;
        for handler in specific.iter().chain(wildcard.iter()) {
            invoked += 1;
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                tracing::error!(%topic, "envelope handler panicked");
            }
        }
        if invoked == 0 {
            tracing::trace!(%topic, "no handlers for envelope");
        }
        invoked
    }

    /// Decode one wire line and dispatch it. Malformed lines are dropped.
    pub fn dispatch_line(&self, line: &str) -> usize {
        match envelopes::decode_line(line) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed envelope");
                0
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Handler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
