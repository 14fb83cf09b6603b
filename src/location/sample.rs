use serde::{Deserialize, Serialize};

/// One timestamped position and speed reading
///
/// Fields are private so a sample cannot change after the provider created it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    timestamp_ms: i64,
    latitude: f64,
    longitude: f64,
    speed_mps: f64,
}

impl LocationSample {
    pub fn new(timestamp_ms: i64, latitude: f64, longitude: f64, speed_mps: f64) -> Self {
        Self {
            timestamp_ms,
            latitude,
            longitude,
            speed_mps,
        }
    }

    /// Sample stamped with the current wall clock time
    pub fn now(latitude: f64, longitude: f64, speed_mps: f64) -> Self {
        Self::new(
            chrono::Utc::now().timestamp_millis(),
            latitude,
            longitude,
            speed_mps,
        )
    }

    /// Milliseconds since the Unix epoch
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn speed_mps(&self) -> f64 {
        self.speed_mps
    }

    pub fn speed_kmh(&self) -> f64 {
        self.speed_mps * 3.6
    }
}
