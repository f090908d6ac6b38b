//! courier: resilient realtime client core.
//!
//! One long-lived connection multiplexed across topics and reconnected with
//! bounded fixed-delay retries, plus an HTTP gateway whose credential
//! renewals are serialized through a single refresh coordinator.
//!
//! Leaf-first:
//! - [`credentials`]: credential storage (memory or file)
//! - [`refresh`]: single-flight renewal with waiter fan-out
//! - [`gateway`]: bearer auth, 401 interception, retry once
//! - [`transport`]: connector seam and the WebSocket implementation
//! - [`dispatch`]: topic routing with a wildcard
//! - [`connection`]: lifecycle, reconnection, state listeners
//! - [`join`]: join control envelopes deferred until open
//! - [`client`]: the [`Courier`] service object wiring it all together

pub mod client;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatch;
pub mod gateway;
pub mod join;
pub mod refresh;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use client::{Courier, CourierError};
pub use config::{ClientConfig, ConfigError};
pub use connection::{
    ConnectionError, ConnectionManager, ConnectionState, ListenerId, ReconnectPolicy, StateListener, UrlResolver,
    WeakConnectionManager,
};
pub use credentials::{Credential, CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use dispatch::{Handler, TopicDispatcher};
pub use envelopes::{Envelope, TopicPayload};
pub use gateway::{Gateway, GatewayError, RequestOptions};
pub use join::{JoinOutcome, join_room, join_room_with};
pub use refresh::{AuthEvent, HttpTokenRefresher, RefreshCoordinator, RefreshError, TokenRefresher};
pub use transport::{Connector, TransportError, TransportEvent, TransportHandle, WebSocketConnector};
