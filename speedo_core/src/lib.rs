//! Current speed, moving/stationary activity and section averages from a
//! stream of location samples.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod engine;
pub mod geo;
pub mod listeners;
pub mod replay;
pub mod sample;
pub mod section;

pub use engine::{SampleSink, SampleSource, TrackingEngine, UpdateRequest};
pub use geo::{distance_m, haversine_distance_m, vincenty_distance_m, DistanceModel};
pub use listeners::{
    ActivityListener, ListenerSet, SectionListener, SpeedListener, Subscription,
    TrackingStateListener,
};
pub use replay::{
    parse_events, scripted_speeds, summarize_events, ReplaySource, TrackSummary,
    DEMO_SPEEDS_KMH,
};
pub use sample::{Position, ProviderStatus, Sample, SourceEvent};
pub use section::{compute_section, Section};

/// Factor between m/s and km/h.
pub const MS_TO_KMH: f64 = 3.6;

pub const DEFAULT_MIN_SPEED_KMH: f64 = 5.0;
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 500;
pub const DEFAULT_UPDATE_DISTANCE_M: f64 = 0.0;
const MAX_DISPLAY_PRECISION: u8 = 3;

#[derive(Error, Debug)]
pub enum SpeedoError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to parse CSV samples: {0}")]
    CsvParse(String),
    #[error("failed to parse JSON: {0}")]
    JsonParse(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("no samples found")]
    InsufficientData,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convert m/s to whole km/h, rounding half away from zero.
pub fn ms_to_kmh(value: f64) -> i32 {
    (finite_or_zero(value) * MS_TO_KMH).round() as i32
}

/// Convert m/s to km/h without rounding.
pub fn ms_to_kmh_f64(value: f64) -> f64 {
    finite_or_zero(value) * MS_TO_KMH
}

pub fn kmh_to_ms(value: f64) -> f64 {
    finite_or_zero(value) / MS_TO_KMH
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Display options for formatted speeds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpeedFormat {
    /// Digits after the decimal separator.
    pub precision: u8,
    pub decimal_separator: char,
}

impl Default for SpeedFormat {
    fn default() -> Self {
        Self {
            precision: 0,
            decimal_separator: '.',
        }
    }
}

impl SpeedFormat {
    pub fn format_kmh(&self, kmh: f64) -> String {
        let text = format!("{:.*}", self.precision as usize, finite_or_zero(kmh));
        if self.decimal_separator == '.' {
            text
        } else {
            text.replace('.', &self.decimal_separator.to_string())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Speed at or above which the device is considered moving (km/h).
    pub min_speed_kmh: f64,
    /// Optional lower threshold for leaving the moving state (km/h). `None`
    /// keeps a single threshold for both directions.
    pub exit_speed_kmh: Option<f64>,
    /// Minimum time between samples requested from the source.
    pub update_interval_ms: u64,
    /// Minimum distance between samples requested from the source.
    pub update_distance_m: f64,
    pub distance_model: DistanceModel,
    pub display: SpeedFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_speed_kmh: DEFAULT_MIN_SPEED_KMH,
            exit_speed_kmh: None,
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            update_distance_m: DEFAULT_UPDATE_DISTANCE_M,
            distance_model: DistanceModel::default(),
            display: SpeedFormat::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), SpeedoError> {
        if !self.min_speed_kmh.is_finite() || self.min_speed_kmh <= 0.0 {
            return Err(SpeedoError::InvalidParameter(format!(
                "min_speed_kmh must be > 0, got {}",
                self.min_speed_kmh
            )));
        }
        if let Some(exit) = self.exit_speed_kmh {
            if !exit.is_finite() || exit <= 0.0 || exit > self.min_speed_kmh {
                return Err(SpeedoError::InvalidParameter(format!(
                    "exit_speed_kmh must be in (0, {}], got {}",
                    self.min_speed_kmh, exit
                )));
            }
        }
        if !self.update_distance_m.is_finite() || self.update_distance_m < 0.0 {
            return Err(SpeedoError::InvalidParameter(format!(
                "update_distance_m must be >= 0, got {}",
                self.update_distance_m
            )));
        }
        if self.display.precision > MAX_DISPLAY_PRECISION {
            return Err(SpeedoError::InvalidParameter(format!(
                "display precision must be <= {}, got {}",
                MAX_DISPLAY_PRECISION, self.display.precision
            )));
        }
        Ok(())
    }

    /// Threshold for entering the moving state, in m/s.
    pub fn min_speed_running_mps(&self) -> f64 {
        kmh_to_ms(self.min_speed_kmh)
    }

    /// Threshold for leaving the moving state, in m/s.
    pub fn exit_speed_mps(&self) -> f64 {
        kmh_to_ms(self.exit_speed_kmh.unwrap_or(self.min_speed_kmh))
    }

    pub fn from_json_str(text: &str) -> Result<Self, SpeedoError> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|e| SpeedoError::JsonParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, SpeedoError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_kmh_rounds() {
        assert_eq!(ms_to_kmh(0.0), 0);
        assert_eq!(ms_to_kmh(1.0), 4);
        assert_eq!(ms_to_kmh(10.0), 36);
        assert_eq!(ms_to_kmh(f64::NAN), 0);
        assert_eq!(ms_to_kmh(f64::INFINITY), 0);
    }

    #[test]
    fn test_kmh_round_trip() {
        for x in (0..=300).step_by(7) {
            let back = ms_to_kmh(kmh_to_ms(x as f64));
            assert_eq!(back, x);
        }
    }

    #[test]
    fn test_default_threshold() {
        let config = EngineConfig::default();
        assert!((config.min_speed_running_mps() - 5.0 / 3.6).abs() < 1e-12);
        assert_eq!(config.exit_speed_mps(), config.min_speed_running_mps());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = EngineConfig::default();
        config.min_speed_kmh = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.exit_speed_kmh = Some(6.0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.exit_speed_kmh = Some(3.0);
        assert!(config.validate().is_ok());
        assert!((config.exit_speed_mps() - 3.0 / 3.6).abs() < 1e-12);

        let mut config = EngineConfig::default();
        config.display.precision = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "min_speed_kmh": 3.0 }"#).unwrap();
        assert_eq!(config.min_speed_kmh, 3.0);
        assert_eq!(config.update_interval_ms, DEFAULT_UPDATE_INTERVAL_MS);
        assert_eq!(config.display, SpeedFormat::default());

        assert!(EngineConfig::from_json_str(r#"{ "min_speed_kmh": -1 }"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_speed_format() {
        let plain = SpeedFormat::default();
        assert_eq!(plain.format_kmh(55.24), "55");

        let french = SpeedFormat {
            precision: 1,
            decimal_separator: ',',
        };
        assert_eq!(french.format_kmh(55.24), "55,2");
        assert_eq!(french.format_kmh(f64::NAN), "0,0");
    }
}
