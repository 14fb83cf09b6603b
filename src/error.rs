//! Error definitions shared by the publisher components

use thiserror::Error;

use crate::location::SourceError;

/// Error types surfaced by the publisher
///
/// Permission, configuration and re-entrancy errors are returned synchronously from
/// [`PublisherController::start`](crate::controller::PublisherController::start).
/// Network errors are retried internally and only escalate as
/// [`PublisherError::FatalConnectionFailure`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublisherError {
    /// Location permission is absent and was not granted on request
    #[error("Location permission denied")]
    PermissionDenied,

    /// Broker unreachable, identifier refused or connect timeout
    #[error("Failed to connect to broker: {cause}")]
    ConnectError { cause: String },

    /// A single publish did not go through
    #[error("Failed to publish sample: {cause}")]
    PublishError { cause: String },

    /// The queue stayed full for the whole blocking timeout
    #[error("Publish queue is full")]
    QueueFull,

    /// `start()` was called while a session is running
    #[error("Publisher is already running")]
    AlreadyPublishing,

    /// Reconnect attempts exhausted
    #[error("Connection failed permanently after {attempts} attempts")]
    FatalConnectionFailure { attempts: u32 },

    /// Configuration rejected before a session was started
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The location provider refused to deliver updates
    #[error("Location updates unavailable: {0}")]
    LocationUnavailable(String),
}

impl From<SourceError> for PublisherError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::PermissionDenied => PublisherError::PermissionDenied,
            SourceError::Provider(cause) => PublisherError::LocationUnavailable(cause),
        }
    }
}
