use serde::{Deserialize, Serialize};

use crate::geo::{distance_m, DistanceModel};
use crate::sample::Sample;
use crate::{ms_to_kmh, ms_to_kmh_f64};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// One completed movement episode, from the sample that started it to the
/// sample that closed it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub distance_m: f64,
    /// Whole seconds between anchor and closing sample.
    pub time_elapsed_s: u64,
    /// Zero when no whole second elapsed.
    pub average_speed_mps: f64,
    pub started_at_ns: u64,
    pub ended_at_ns: u64,
}

impl Section {
    pub fn average_speed_kmh(&self) -> f64 {
        ms_to_kmh_f64(self.average_speed_mps)
    }

    pub fn rounded_average_kmh(&self) -> i32 {
        ms_to_kmh(self.average_speed_mps)
    }

    /// True when the section is too short to carry a meaningful average.
    pub fn is_degenerate(&self) -> bool {
        self.time_elapsed_s == 0
    }
}

/// Build the section between `anchor` and `closing`.
///
/// Distance is 0 when either sample lacks a position. Elapsed time saturates
/// at 0 for out-of-order timestamps and the average is 0 when it does.
pub fn compute_section(anchor: &Sample, closing: &Sample, model: DistanceModel) -> Section {
    let distance_m = match (anchor.position.as_ref(), closing.position.as_ref()) {
        (Some(from), Some(to)) => distance_m(model, from, to),
        _ => 0.0,
    };
    let time_elapsed_s =
        closing.timestamp_ns.saturating_sub(anchor.timestamp_ns) / NANOS_PER_SECOND;
    let average_speed_mps = if time_elapsed_s > 0 {
        distance_m / time_elapsed_s as f64
    } else {
        0.0
    };
    Section {
        distance_m,
        time_elapsed_s,
        average_speed_mps,
        started_at_ns: anchor.timestamp_ns,
        ended_at_ns: closing.timestamp_ns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::haversine_distance_m;
    use crate::sample::Position;

    fn at(speed: f64, seconds: f64, lat: f64, lon: f64) -> Sample {
        Sample::at_seconds(speed, seconds).with_position(Position::new(lat, lon))
    }

    #[test]
    fn test_section_between_two_samples() {
        let anchor = at(2.0, 1.0, 45.0, 5.0);
        let closing = at(1.0, 12.0, 45.001, 5.0);
        let section = compute_section(&anchor, &closing, DistanceModel::Haversine);
        let expected = haversine_distance_m(45.0, 5.0, 45.001, 5.0);
        assert!((section.distance_m - expected).abs() < 1e-9);
        assert_eq!(section.time_elapsed_s, 11);
        assert!((section.average_speed_mps - expected / 11.0).abs() < 1e-9);
        assert!((section.average_speed_kmh() - expected / 11.0 * 3.6).abs() < 1e-9);
        assert_eq!(section.rounded_average_kmh(), (expected / 11.0 * 3.6).round() as i32);
    }

    #[test]
    fn test_elapsed_time_truncates_to_whole_seconds() {
        let anchor = at(2.0, 1.0, 45.0, 5.0);
        let closing = at(1.0, 3.999, 45.0, 5.0);
        let section = compute_section(&anchor, &closing, DistanceModel::Vincenty);
        assert_eq!(section.time_elapsed_s, 2);
    }

    #[test]
    fn test_out_of_order_timestamps_clamp_to_zero() {
        let anchor = at(2.0, 10.0, 45.0, 5.0);
        let closing = at(1.0, 4.0, 45.01, 5.0);
        let section = compute_section(&anchor, &closing, DistanceModel::Vincenty);
        assert_eq!(section.time_elapsed_s, 0);
        assert_eq!(section.average_speed_mps, 0.0);
        assert!(section.distance_m > 0.0);
        assert!(section.is_degenerate());
    }

    #[test]
    fn test_identical_timestamps_have_finite_average() {
        let anchor = at(2.0, 5.0, 45.0, 5.0);
        let closing = at(1.0, 5.0, 45.0, 5.0001);
        let section = compute_section(&anchor, &closing, DistanceModel::Haversine);
        assert_eq!(section.time_elapsed_s, 0);
        assert!(section.average_speed_mps.is_finite());
        assert_eq!(section.rounded_average_kmh(), 0);
    }

    #[test]
    fn test_missing_position_gives_zero_distance() {
        let anchor = Sample::at_seconds(2.0, 0.0);
        let closing = at(1.0, 10.0, 45.0, 5.0);
        let section = compute_section(&anchor, &closing, DistanceModel::Vincenty);
        assert_eq!(section.distance_m, 0.0);
        assert_eq!(section.time_elapsed_s, 10);
        assert_eq!(section.average_speed_mps, 0.0);
    }
}
