//! Desktop stand-ins for the platform location and permission services

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{LocationProvider, LocationSample, PermissionGate, SourceError, UpdateRequest};

const METERS_PER_DEGREE: f64 = 111_320.0;

/// Straight-line track used by [`SimulatedProvider`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedTrack {
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub speed_mps: f64,
    /// Degrees clockwise from north
    pub heading_deg: f64,
}

impl Default for SimulatedTrack {
    fn default() -> Self {
        Self {
            start_latitude: 10.6418,
            start_longitude: -61.3995,
            speed_mps: 8.0,
            heading_deg: 45.0,
        }
    }
}

impl SimulatedTrack {
    /// Position after travelling for `elapsed_secs`
    pub fn position_at(&self, elapsed_secs: f64) -> (f64, f64) {
        let distance = self.speed_mps * elapsed_secs;
        let heading = self.heading_deg.to_radians();
        let latitude = self.start_latitude + distance * heading.cos() / METERS_PER_DEGREE;
        let longitude = self.start_longitude
            + distance * heading.sin() / (METERS_PER_DEGREE * self.start_latitude.to_radians().cos());
        (latitude, longitude)
    }
}

/// Emits fixes along a [`SimulatedTrack`] at the requested interval
pub struct SimulatedProvider {
    track: SimulatedTrack,
    running: Mutex<Option<CancellationToken>>,
}

impl SimulatedProvider {
    pub fn new(track: SimulatedTrack) -> Self {
        Self {
            track,
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LocationProvider for SimulatedProvider {
    async fn request_updates(
        &self,
        request: UpdateRequest,
        sink: mpsc::Sender<LocationSample>,
    ) -> Result<(), SourceError> {
        let cancel = CancellationToken::new();
        let previous = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone());
        if let Some(previous) = previous {
            debug!("Replacing running simulated track");
            previous.cancel();
        }

        let track = self.track;
        let period = request.interval.max(request.min_interval);
        info!("Simulated provider emitting a fix every {:?}", period);

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let (latitude, longitude) =
                            track.position_at(started.elapsed().as_secs_f64());
                        let sample = LocationSample::now(latitude, longitude, track.speed_mps);
                        if sink.send(sample).await.is_err() {
                            debug!("Sample receiver dropped, ending simulated track");
                            break;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn remove_updates(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = running {
            cancel.cancel();
        }
    }
}

/// Permission gate with a fixed answer
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission {
    granted: bool,
}

impl StaticPermission {
    pub fn granted() -> Self {
        Self { granted: true }
    }

    pub fn denied() -> Self {
        Self { granted: false }
    }
}

#[async_trait]
impl PermissionGate for StaticPermission {
    async fn check_permission(&self) -> bool {
        self.granted
    }

    async fn request_permission(&self) -> bool {
        self.granted
    }
}
