use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: f64 = 1e9;

/// Geographic coordinate with optional horizontal accuracy. Carried through
/// for distance computation and diagnostics.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }
}

/// One reading from the location sensor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    /// Sensor-reported speed in m/s.
    pub speed_mps: f64,
    /// Monotonic time since an arbitrary epoch. Only differences are meaningful.
    pub timestamp_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl Sample {
    pub fn new(speed_mps: f64, timestamp_ns: u64) -> Self {
        Self {
            speed_mps,
            timestamp_ns,
            position: None,
        }
    }

    /// Build a sample from a timestamp in (fractional) seconds. Negative or
    /// non-finite times map to zero.
    pub fn at_seconds(speed_mps: f64, seconds: f64) -> Self {
        Self::new(speed_mps, seconds_to_ns(seconds))
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn timestamp_s(&self) -> f64 {
        self.timestamp_ns as f64 / NANOS_PER_SECOND
    }

    /// Speed with negative and non-finite readings treated as zero.
    pub fn speed(&self) -> f64 {
        if self.speed_mps.is_finite() && self.speed_mps > 0.0 {
            self.speed_mps
        } else {
            0.0
        }
    }
}

pub(crate) fn seconds_to_ns(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * NANOS_PER_SECOND).round() as u64
    } else {
        0
    }
}

/// Availability reported by the provider through a status change.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Available,
    TemporarilyUnavailable,
    OutOfService,
}

impl ProviderStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, ProviderStatus::Available)
    }
}

/// Everything a sample source can deliver to the engine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEvent {
    Sample(Sample),
    ProviderEnabled,
    ProviderDisabled,
    StatusChanged { status: ProviderStatus },
}
