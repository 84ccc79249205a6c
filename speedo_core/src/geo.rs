use serde::{Deserialize, Serialize};

use crate::sample::Position;

pub(crate) const EARTH_RADIUS_M: f64 = 6_371_000.0;

// WGS84 ellipsoid
const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const VINCENTY_MAX_ITERATIONS: usize = 200;
const VINCENTY_TOLERANCE: f64 = 1e-12;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistanceModel {
    Haversine,
    #[default]
    Vincenty,
}

pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Inverse Vincenty distance on the WGS84 ellipsoid. Returns `None` when the
/// iteration does not converge (nearly antipodal points).
pub fn vincenty_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Option<f64> {
    let a = WGS84_A;
    let f = WGS84_F;
    let b = (1.0 - f) * a;

    let l = (lon2 - lon1).to_radians();
    let u1 = ((1.0 - f) * lat1.to_radians().tan()).atan();
    let u2 = ((1.0 - f) * lat2.to_radians().tan()).atan();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    let mut converged = false;
    let (mut sin_sigma, mut cos_sigma, mut sigma) = (0.0, 0.0, 0.0);
    let (mut cos_sq_alpha, mut cos_2sigma_m) = (0.0, 0.0);

    for _ in 0..VINCENTY_MAX_ITERATIONS {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();
        if sin_sigma == 0.0 {
            // coincident points
            return Some(0.0);
        }
        cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        cos_2sigma_m = if cos_sq_alpha != 0.0 {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        } else {
            // equatorial line
            0.0
        };
        let c = f / 16.0 * cos_sq_alpha * (4.0 + f * (4.0 - 3.0 * cos_sq_alpha));
        let previous = lambda;
        lambda = l
            + (1.0 - c)
                * f
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))));
        if (lambda - previous).abs() < VINCENTY_TOLERANCE {
            converged = true;
            break;
        }
    }
    if !converged {
        return None;
    }

    let u_sq = cos_sq_alpha * (a * a - b * b) / (b * b);
    let big_a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
    let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
    let delta_sigma = big_b
        * sin_sigma
        * (cos_2sigma_m
            + big_b / 4.0
                * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))
                    - big_b / 6.0
                        * cos_2sigma_m
                        * (-3.0 + 4.0 * sin_sigma.powi(2))
                        * (-3.0 + 4.0 * cos_2sigma_m.powi(2))));
    let s = b * big_a * (sigma - delta_sigma);
    if s.is_finite() {
        Some(s)
    } else {
        None
    }
}

/// Geodesic distance between two positions, never negative.
pub fn distance_m(model: DistanceModel, from: &Position, to: &Position) -> f64 {
    let (lat1, lon1, lat2, lon2) = (from.latitude, from.longitude, to.latitude, to.longitude);
    let d = match model {
        DistanceModel::Haversine => haversine_distance_m(lat1, lon1, lat2, lon2),
        DistanceModel::Vincenty => vincenty_distance_m(lat1, lon1, lat2, lon2)
            .unwrap_or_else(|| haversine_distance_m(lat1, lon1, lat2, lon2)),
    };
    if d.is_finite() {
        d.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_distance() {
        let dist = haversine_distance_m(0.0, 0.0, 0.0, 1.0);
        assert!((dist - 111_195.0).abs() < 200.0);
    }

    #[test]
    fn test_vincenty_one_degree_on_equator() {
        let dist = vincenty_distance_m(0.0, 0.0, 0.0, 1.0).unwrap();
        assert!((dist - 111_319.49).abs() < 1.0);
    }

    #[test]
    fn test_vincenty_same_point_is_zero() {
        assert_eq!(vincenty_distance_m(48.85, 2.35, 48.85, 2.35), Some(0.0));
    }

    #[test]
    fn test_models_agree_on_short_hops() {
        let a = Position::new(45.0, 5.0);
        let b = Position::new(45.001, 5.001);
        let h = distance_m(DistanceModel::Haversine, &a, &b);
        let v = distance_m(DistanceModel::Vincenty, &a, &b);
        assert!(h > 100.0 && h < 200.0);
        // within 0.5% of each other
        assert!((h - v).abs() / v < 0.005);
    }

    #[test]
    fn test_distance_is_never_negative_or_nan() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(0.5, 179.7);
        let d = distance_m(DistanceModel::Vincenty, &a, &b);
        assert!(d.is_finite() && d > 0.0);

        let bad = Position::new(f64::NAN, 0.0);
        assert_eq!(distance_m(DistanceModel::Haversine, &a, &bad), 0.0);
        assert_eq!(distance_m(DistanceModel::Vincenty, &a, &bad), 0.0);
    }
}
