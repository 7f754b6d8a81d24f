use serde::{Deserialize, Serialize};

use crate::clock::TimestampMs;

/// Owner of a tracked position: the local operator or a peer.
pub type SubjectId = String;

/// A single location fix. Immutable once created; ordered by `t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub lng: f64,
    pub lat: f64,
    pub t: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl PositionSample {
    /// Bare fix without motion or accuracy metadata.
    #[must_use]
    pub const fn new(lng: f64, lat: f64, t: TimestampMs) -> Self {
        Self {
            lng,
            lat,
            t,
            speed: None,
            heading: None,
            accuracy: None,
        }
    }

    #[must_use]
    pub const fn with_motion(mut self, speed: f64, heading: f64) -> Self {
        self.speed = Some(speed);
        self.heading = Some(heading);
        self
    }

    #[must_use]
    pub const fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Coordinates are finite numbers. Anything else is dropped at the
    /// append boundary.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.lng.is_finite() && self.lat.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let json = serde_json::to_string(&PositionSample::new(8.5, 47.3, 1_000)).expect("encode");
        assert_eq!(json, r#"{"lng":8.5,"lat":47.3,"t":1000}"#);
    }

    #[test]
    fn motion_fields_round_trip() {
        let sample = PositionSample::new(8.5, 47.3, 1_000)
            .with_motion(1.2, 270.0)
            .with_accuracy(4.0);
        let json = serde_json::to_string(&sample).expect("encode");
        let back: PositionSample = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, sample);
    }

    #[test]
    fn non_finite_coordinates_are_malformed() {
        assert!(!PositionSample::new(f64::NAN, 1.0, 0).is_well_formed());
        assert!(!PositionSample::new(1.0, f64::INFINITY, 0).is_well_formed());
        assert!(PositionSample::new(-179.9, 89.9, 0).is_well_formed());
    }
}
