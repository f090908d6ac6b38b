//! Line transport underneath the connection manager.
//!
//! A [`Connector`] turns a URL into a [`TransportHandle`]: an outbound line
//! sender and an inbound event receiver. Dropping the outbound sender closes
//! the transport; the inbound side reports exactly one terminal event
//! (`Closed` or `Error`) before it ends.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("connect to {url} timed out")]
    Timeout { url: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// One envelope line, without its terminator.
    Line(String),
    /// The peer closed the transport cleanly.
    Closed,
    /// The transport failed.
    Error(String),
}

/// Both ends of an open transport, as seen by the client.
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransportHandle, TransportError>;
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// tokio-tungstenite transport: one text frame per outbound line.
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<TransportHandle, TransportError> {
        let (stream, _) = match tokio::time::timeout(self.connect_timeout, connect_async(url)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    url: redact_query(url),
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(TransportError::Timeout { url: redact_query(url) }),
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, outbound_rx, inbound_tx));
        Ok(TransportHandle { outbound, inbound })
    }
}

/// Shuttle lines between the socket and the handle until either side ends.
async fn pump(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            line = outbound.recv() => {
                let Some(line) = line else {
                    if let Err(e) = sink.close().await {
                        tracing::debug!(error = %e, "websocket close failed");
                    }
                    return;
                };
                if let Err(e) = sink.send(Message::Text(line.into())).await {
                    report(&inbound, TransportEvent::Error(e.to_string()));
                    return;
                }
            }
            frame = source.next() => {
                let event = match frame {
                    Some(Ok(Message::Text(text))) => {
                        if forward_lines(&inbound, text.as_str()) {
                            continue;
                        }
                        return;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if forward_lines(&inbound, &String::from_utf8_lossy(&bytes)) {
                            continue;
                        }
                        return;
                    }
                    Some(Ok(Message::Close(_))) | None => TransportEvent::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => TransportEvent::Error(e.to_string()),
                };
                report(&inbound, event);
                return;
            }
        }
    }
}

/// Returns false once nobody is reading inbound events.
fn forward_lines(inbound: &mpsc::UnboundedSender<TransportEvent>, chunk: &str) -> bool {
    envelopes::split_lines(chunk).all(|line| inbound.send(TransportEvent::Line(line.to_owned())).is_ok())
}

fn report(inbound: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
    if inbound.send(event).is_err() {
        tracing::trace!("transport event dropped; reader gone");
    }
}

/// Strip the query string so embedded credentials stay out of logs.
#[must_use]
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_owned(),
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
