//! # geopublisher
//!
//! Streams periodic location samples to an MQTT broker.
//!
//! ```text
//! LocationProvider ─► SampleSource ─► PublishQueue ─► BrokerConnection ─► broker
//!                            ▲                               ▲
//!                            └────── PublisherController ────┘
//! ```
//!
//! The platform location service, the permission prompt and the MQTT wire protocol are
//! reached through traits ([`location::LocationProvider`], [`location::PermissionGate`],
//! [`mqtt::Transport`]); everything between them lives here.

pub mod config;
pub mod controller;
pub mod error;
pub mod location;
pub mod mqtt;
pub mod queue;
pub mod status;

pub use config::PublisherConfig;
pub use controller::PublisherController;
pub use error::PublisherError;
pub use location::LocationSample;
pub use queue::{OverflowPolicy, PublishQueue};
pub use status::{PublisherState, PublisherStatus};
