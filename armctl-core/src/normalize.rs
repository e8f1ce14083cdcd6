//! Raw tick ↔ logical percentage mapping
//!
//! Pure functions over a [`CalibrationProfile`]. `pos_left` always maps to
//! 0 % and `pos_right` to 100 %; when the left end sits at the higher raw
//! tick (an inverted profile) the direction flips, but it does so for the
//! actuator as a whole, never per call.

use crate::calibration::{CalibrationProfile, CalibrationStore};
use crate::error::ArmError;

/// Calibrated span of one actuator, extracted from a complete profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    left: i32,
    right: i32,
}

impl Span {
    fn of(actuator: &str, profile: &CalibrationProfile) -> Result<Self, ArmError> {
        match (profile.pos_left, profile.pos_right) {
            (Some(left), Some(right)) if left != right => Ok(Span { left, right }),
            _ => Err(ArmError::incomplete(actuator)),
        }
    }

    /// Signed width in ticks; never overflows, whatever the stored points
    fn width(&self) -> f64 {
        f64::from(self.right) - f64::from(self.left)
    }
}

/// Map a raw tick to 0..=100.
pub fn to_percentage(
    actuator: &str,
    profile: &CalibrationProfile,
    raw: i32,
) -> Result<f64, ArmError> {
    let span = Span::of(actuator, profile)?;
    let pct = 100.0 * (f64::from(raw) - f64::from(span.left)) / span.width();
    Ok(pct.clamp(0.0, 100.0))
}

/// Map a percentage back to the nearest raw tick inside the calibrated range.
pub fn to_raw(actuator: &str, profile: &CalibrationProfile, percentage: f64) -> Result<i32, ArmError> {
    let span = Span::of(actuator, profile)?;
    let pct = if percentage.is_nan() {
        0.0
    } else {
        percentage.clamp(0.0, 100.0)
    };
    let raw = f64::from(span.left) + pct / 100.0 * span.width();
    let lo = span.left.min(span.right);
    let hi = span.left.max(span.right);
    Ok((raw.round() as i32).clamp(lo, hi))
}

impl CalibrationStore {
    /// [`to_percentage`] with the actuator's stored profile
    pub fn to_percentage(&self, actuator: &str, raw: i32) -> Result<f64, ArmError> {
        to_percentage(actuator, &self.read_profile(actuator)?, raw)
    }

    /// [`to_raw`] with the actuator's stored profile
    pub fn to_raw(&self, actuator: &str, percentage: f64) -> Result<i32, ArmError> {
        to_raw(actuator, &self.read_profile(actuator)?, percentage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorRegistry;

    #[test]
    fn test_linear_mapping() {
        let p = CalibrationProfile::new(1000, None, 3000);
        assert_eq!(to_percentage("a", &p, 1000).unwrap(), 0.0);
        assert_eq!(to_percentage("a", &p, 2000).unwrap(), 50.0);
        assert_eq!(to_percentage("a", &p, 3000).unwrap(), 100.0);
        assert_eq!(to_raw("a", &p, 25.0).unwrap(), 1500);
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        let p = CalibrationProfile::new(1000, None, 3000);
        assert_eq!(to_percentage("a", &p, 10).unwrap(), 0.0);
        assert_eq!(to_percentage("a", &p, 4000).unwrap(), 100.0);
        assert_eq!(to_raw("a", &p, 250.0).unwrap(), 3000);
        assert_eq!(to_raw("a", &p, -5.0).unwrap(), 1000);
    }

    #[test]
    fn test_inverted_profile_keeps_left_at_zero() {
        let p = CalibrationProfile::new(3000, None, 1000);
        assert_eq!(to_percentage("a", &p, 3000).unwrap(), 0.0);
        assert_eq!(to_percentage("a", &p, 1000).unwrap(), 100.0);
        assert_eq!(to_percentage("a", &p, 2500).unwrap(), 25.0);
        assert_eq!(to_raw("a", &p, 25.0).unwrap(), 2500);
        assert_eq!(to_raw("a", &p, 100.0).unwrap(), 1000);
    }

    #[test]
    fn test_round_trip_within_one_tick() {
        for p in [
            CalibrationProfile::new(0, None, 4095),
            CalibrationProfile::new(1873, None, 2291),
            CalibrationProfile::new(3907, Some(2000), 113),
            CalibrationProfile::new(100, None, 103),
        ] {
            let lo = p.effective_min().unwrap();
            let hi = p.effective_max().unwrap();
            for r in lo..=hi {
                let pct = to_percentage("a", &p, r).unwrap();
                let back = to_raw("a", &p, pct).unwrap();
                assert!((back - r).abs() <= 1, "{:?}: {} -> {} -> {}", p, r, pct, back);
            }
        }
    }

    #[test]
    fn test_incomplete_profile_fails() {
        let profiles = [
            CalibrationProfile::default(),
            CalibrationProfile {
                pos_left: Some(100),
                ..Default::default()
            },
            CalibrationProfile {
                pos_center: Some(2048),
                pos_right: Some(3000),
                ..Default::default()
            },
            CalibrationProfile::new(2048, Some(2048), 2048),
        ];
        for p in profiles {
            assert_eq!(
                to_percentage("wrist_roll", &p, 2048),
                Err(ArmError::incomplete("wrist_roll"))
            );
            assert_eq!(
                to_raw("wrist_roll", &p, 50.0),
                Err(ArmError::incomplete("wrist_roll"))
            );
        }
    }

    #[test]
    fn test_full_i32_span_is_finite() {
        let p = CalibrationProfile::new(i32::MIN, None, i32::MAX);
        let pct = to_percentage("a", &p, 0).unwrap();
        assert!((pct - 50.0).abs() < 1e-6);
        assert_eq!(to_raw("a", &p, 100.0).unwrap(), i32::MAX);
        assert_eq!(to_raw("a", &p, 0.0).unwrap(), i32::MIN);
    }

    #[test]
    fn test_store_helpers() {
        let mut store = CalibrationStore::new(ActuatorRegistry::so101());
        assert!(store.to_percentage("gripper", 2000).is_err());
        store
            .replace("gripper", CalibrationProfile::new(2000, None, 2400))
            .unwrap();
        assert_eq!(store.to_percentage("gripper", 2100).unwrap(), 25.0);
        assert_eq!(store.to_raw("gripper", 75.0).unwrap(), 2300);
    }
}
