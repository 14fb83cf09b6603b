//! Sample source with statum state machine for the platform location lifecycle
//!
//! ```text
//! Idle ──start()──► Active ──stop()──► (stopped, no restart)
//! ```
//!
//! The platform provider pushes fixes into a bounded channel from whatever thread it
//! runs on. A pump task drains that channel and hands every fix to the [`SampleSink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::LocationSample;

const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Update cadence handed to the platform provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    /// Desired interval between fixes
    pub interval: Duration,
    /// Fastest rate the consumer accepts
    pub min_interval: Duration,
}

impl Default for UpdateRequest {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            min_interval: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location provider error: {0}")]
    Provider(String),
}

/// Platform positioning service
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Starts periodic fixes, each delivered through `sink`
    async fn request_updates(
        &self,
        request: UpdateRequest,
        sink: mpsc::Sender<LocationSample>,
    ) -> Result<(), SourceError>;

    /// Stops fixes and releases platform resources
    async fn remove_updates(&self);
}

/// Platform permission API for fine location access
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check_permission(&self) -> bool;

    /// Asks the user; returns whether the permission is now granted
    async fn request_permission(&self) -> bool;
}

/// Receiver of every sample produced while the source is active
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn on_sample(&self, sample: LocationSample);
}

#[state]
#[derive(Debug, Clone)]
pub enum SourceState {
    Idle,
    Active,
}

#[machine]
pub struct SampleSource<S: SourceState> {
    provider: Arc<dyn LocationProvider>,
    permissions: Arc<dyn PermissionGate>,
    pump: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    stopped: bool,
}

impl SampleSource<Idle> {
    pub fn create(
        provider: Arc<dyn LocationProvider>,
        permissions: Arc<dyn PermissionGate>,
    ) -> Self {
        Self::new(
            provider,
            permissions,
            None,                     // pump
            CancellationToken::new(), // cancel
            false,                    // stopped
        )
    }

    /// Checks the permission, asking once if it is missing
    pub async fn ensure_permission(&self) -> Result<(), SourceError> {
        if self.permissions.check_permission().await {
            return Ok(());
        }

        info!("Location permission missing, requesting it");
        if self.permissions.request_permission().await {
            info!("Location permission granted");
            Ok(())
        } else {
            warn!("Location permission denied");
            Err(SourceError::PermissionDenied)
        }
    }

    /// Requests updates from the provider and transitions to Active
    pub async fn start(
        mut self,
        request: UpdateRequest,
        sink: Arc<dyn SampleSink>,
    ) -> Result<SampleSource<Active>, SourceError> {
        self.ensure_permission().await?;

        let (sample_tx, mut sample_rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        info!(
            "Requesting location updates every {:?} (min {:?})",
            request.interval, request.min_interval
        );
        self.provider.request_updates(request, sample_tx).await?;

        let cancel = self.cancel.clone();
        let pump = tokio::spawn(async move {
            loop {
                let sample = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = sample_rx.recv() => match next {
                        Some(sample) => sample,
                        None => {
                            debug!("Location provider closed its channel");
                            break;
                        }
                    },
                };

                debug!("Received location sample: {:?}", sample);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sink.on_sample(sample) => {}
                }
            }
            debug!("Sample pump finished");
        });

        self.pump = Some(pump);
        info!("Sample source active");
        Ok(self.transition())
    }
}

impl SampleSource<Active> {
    /// Stops producing samples. Safe to call more than once.
    ///
    /// When this returns the pump task has exited, so the sink sees no further samples.
    pub async fn stop(&mut self) {
        if self.stopped {
            debug!("Sample source already stopped");
            return;
        }
        self.stopped = true;

        info!("Stopping sample source");
        self.cancel.cancel();
        self.provider.remove_updates().await;

        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                error!("Sample pump task failed: {}", e);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
