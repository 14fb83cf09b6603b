//! # MQTT Publishing Module
//!
//! Owns the single outbound broker connection and everything that travels over it.
//!
//! ```text
//! mqtt/
//! ├── config.rs      - Broker settings and per-session identity
//! ├── payload.rs     - Pipe-delimited wire format and its parser
//! ├── backoff.rs     - Exponential reconnect delays
//! ├── transport.rs   - Transport trait and the rumqttc implementation
//! └── connection.rs  - Connection state machine and the drain loop
//! ```
//!
//! The protocol itself is delegated to `rumqttc`. This module only decides when to
//! connect, what to send, and how to react when the broker goes away: failures are
//! retried with backoff, and only an exhausted retry budget escalates to the caller.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod payload;
pub mod transport;

pub use backoff::Backoff;
pub use config::{BrokerSettings, SessionIdentity};
pub use connection::{BrokerConnection, ConnectionSettings, ConnectionState, QueuedSample};
pub use payload::{LocationPayload, PayloadError};
pub use transport::{RumqttTransport, Transport, TransportError, TransportFactory, TransportOptions};
