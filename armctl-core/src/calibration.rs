//! Calibration Store
//!
//! Each actuator has up to three reference points, captured in raw encoder
//! ticks: the `left` end of travel, the `right` end of travel and an advisory
//! `center` used for homing. Percentage mapping needs only left and right.
//!
//! Points are captured either manually (operator parks the joint, we read
//! the encoder) or by an auto sweep that tracks the extremes while the joint
//! is moved by hand with torque released; see [`SweepTracker`].
//!
//! The persisted layout is keyed by actuator name:
//!
//! ```json
//! { "gripper": { "pos_left": 1400, "pos_center": 2048, "pos_right": 2700 } }
//! ```
//!
//! Files written by the earlier Python controller used `min_position` / `max_position`
//! and are still accepted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use strum::{Display, EnumString};

use crate::actuator::ActuatorRegistry;
use crate::error::ArmError;
use crate::io::Transport;

/// Which reference point a manual capture writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PointKind {
    Left,
    Center,
    Right,
}

/// Reference points of one actuator, in raw ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub pos_left: Option<i32>,
    pub pos_center: Option<i32>,
    pub pos_right: Option<i32>,
}

impl CalibrationProfile {
    pub fn new(left: i32, center: Option<i32>, right: i32) -> Self {
        Self {
            pos_left: Some(left),
            pos_center: center,
            pos_right: Some(right),
        }
    }

    pub fn point(&self, kind: PointKind) -> Option<i32> {
        match kind {
            PointKind::Left => self.pos_left,
            PointKind::Center => self.pos_center,
            PointKind::Right => self.pos_right,
        }
    }

    pub fn set_point(&mut self, kind: PointKind, raw: i32) {
        match kind {
            PointKind::Left => self.pos_left = Some(raw),
            PointKind::Center => self.pos_center = Some(raw),
            PointKind::Right => self.pos_right = Some(raw),
        }
    }

    pub fn effective_min(&self) -> Option<i32> {
        Some(self.pos_left?.min(self.pos_right?))
    }

    pub fn effective_max(&self) -> Option<i32> {
        Some(self.pos_left?.max(self.pos_right?))
    }

    /// Left end sits at the higher raw tick
    pub fn inverted(&self) -> bool {
        matches!((self.pos_left, self.pos_right), (Some(l), Some(r)) if l > r)
    }

    /// Both bounds set and distinct. A zero-width range cannot be normalized.
    pub fn is_complete(&self) -> bool {
        matches!((self.pos_left, self.pos_right), (Some(l), Some(r)) if l != r)
    }

    pub fn is_empty(&self) -> bool {
        self.pos_left.is_none() && self.pos_center.is_none() && self.pos_right.is_none()
    }

    /// Center point, or the middle of the calibrated range when none was captured
    pub fn home_position(&self) -> Option<i32> {
        self.pos_center.or_else(|| {
            if self.is_complete() {
                Some(midpoint(self.pos_left?, self.pos_right?))
            } else {
                None
            }
        })
    }
}

fn midpoint(a: i32, b: i32) -> i32 {
    ((i64::from(a) + i64::from(b)) / 2) as i32
}

/// On-disk record. Accepts both the current three point layout and the
/// legacy `min_position`/`max_position` layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredProfile {
    #[serde(default)]
    pos_left: Option<i32>,
    #[serde(default)]
    pos_center: Option<i32>,
    #[serde(default)]
    pos_right: Option<i32>,
    #[serde(default, skip_serializing)]
    min_position: Option<i32>,
    #[serde(default, skip_serializing)]
    max_position: Option<i32>,
}

impl From<StoredProfile> for CalibrationProfile {
    fn from(s: StoredProfile) -> Self {
        let pos_left = s.pos_left.or(s.min_position);
        let pos_right = s.pos_right.or(s.max_position);
        let legacy = s.pos_left.is_none() && s.min_position.is_some();
        let pos_center = match (s.pos_center, pos_left, pos_right) {
            (Some(c), _, _) => Some(c),
            (None, Some(l), Some(r)) if legacy => Some(midpoint(l, r)),
            _ => None,
        };
        CalibrationProfile {
            pos_left,
            pos_center,
            pos_right,
        }
    }
}

impl From<&CalibrationProfile> for StoredProfile {
    fn from(p: &CalibrationProfile) -> Self {
        StoredProfile {
            pos_left: p.pos_left,
            pos_center: p.pos_center,
            pos_right: p.pos_right,
            min_position: None,
            max_position: None,
        }
    }
}

/// Result of loading a persisted calibration document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Actuators whose profile was replaced
    pub loaded: Vec<String>,
    /// Names in the document that are not in the registry
    pub unknown: Vec<String>,
}

/// Per-actuator calibration profiles for one registry
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    registry: ActuatorRegistry,
    profiles: HashMap<String, CalibrationProfile>,
}

impl CalibrationStore {
    pub fn new(registry: ActuatorRegistry) -> Self {
        let profiles = registry
            .iter()
            .map(|a| (a.name.clone(), CalibrationProfile::default()))
            .collect();
        Self { registry, profiles }
    }

    pub fn registry(&self) -> &ActuatorRegistry {
        &self.registry
    }

    /// Read the actuator's present position and store it as `kind`.
    ///
    /// The profile is only touched after the read succeeded.
    pub fn capture_manual(
        &mut self,
        transport: &dyn Transport,
        actuator: &str,
        kind: PointKind,
    ) -> Result<i32, ArmError> {
        let raw = {
            let a = self.registry.require(actuator)?;
            transport.read_raw_position(a)?
        };
        self.set_point(actuator, kind, raw)?;
        Ok(raw)
    }

    pub fn set_point(&mut self, actuator: &str, kind: PointKind, raw: i32) -> Result<(), ArmError> {
        self.check_raw(actuator, raw)?;
        self.profile_mut(actuator)?.set_point(kind, raw);
        Ok(())
    }

    /// Store the extremes observed by a sweep. Center is left alone.
    pub fn apply_sweep(&mut self, actuator: &str, min: i32, max: i32) -> Result<(), ArmError> {
        self.check_raw(actuator, min)?;
        self.check_raw(actuator, max)?;
        let profile = self.profile_mut(actuator)?;
        profile.pos_left = Some(min);
        profile.pos_right = Some(max);
        Ok(())
    }

    pub fn read_profile(&self, actuator: &str) -> Result<CalibrationProfile, ArmError> {
        self.registry.require(actuator)?;
        Ok(self.profiles.get(actuator).copied().unwrap_or_default())
    }

    /// Profile that is guaranteed complete, or `CalibrationIncomplete`
    pub fn complete_profile(&self, actuator: &str) -> Result<CalibrationProfile, ArmError> {
        let profile = self.read_profile(actuator)?;
        if profile.is_complete() {
            Ok(profile)
        } else {
            Err(ArmError::incomplete(actuator))
        }
    }

    pub fn reset(&mut self, actuator: &str) -> Result<(), ArmError> {
        *self.profile_mut(actuator)? = CalibrationProfile::default();
        Ok(())
    }

    pub fn replace(&mut self, actuator: &str, profile: CalibrationProfile) -> Result<(), ArmError> {
        self.check_profile(actuator, &profile)?;
        *self.profile_mut(actuator)? = profile;
        Ok(())
    }

    /// Reference points must lie inside the actuator's encoder range
    fn check_raw(&self, actuator: &str, raw: i32) -> Result<(), ArmError> {
        let a = self.registry.require(actuator)?;
        if raw < a.raw_min || raw > a.raw_max {
            return Err(ArmError::invalid(format!(
                "position {} for '{}' is outside {}..={}",
                raw, actuator, a.raw_min, a.raw_max
            )));
        }
        Ok(())
    }

    fn check_profile(&self, actuator: &str, profile: &CalibrationProfile) -> Result<(), ArmError> {
        [profile.pos_left, profile.pos_center, profile.pos_right]
            .into_iter()
            .flatten()
            .try_for_each(|raw| self.check_raw(actuator, raw))
    }

    pub fn is_complete(&self, actuator: &str) -> bool {
        self.profiles
            .get(actuator)
            .map(|p| p.is_complete())
            .unwrap_or(false)
    }

    /// Profiles in registry order
    pub fn profiles(&self) -> Vec<(String, CalibrationProfile)> {
        self.registry
            .iter()
            .map(|a| {
                (
                    a.name.clone(),
                    self.profiles.get(&a.name).copied().unwrap_or_default(),
                )
            })
            .collect()
    }

    fn profile_mut(&mut self, actuator: &str) -> Result<&mut CalibrationProfile, ArmError> {
        self.registry.require(actuator)?;
        Ok(self.profiles.entry(actuator.to_string()).or_default())
    }

    // -------------------------------------------------------------------------
    // Persistence hooks
    // -------------------------------------------------------------------------

    /// Serialize every non-empty profile to the persisted JSON layout
    pub fn to_json(&self) -> Result<String, ArmError> {
        let doc: BTreeMap<String, StoredProfile> = self
            .profiles()
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(name, p)| (name.clone(), StoredProfile::from(p)))
            .collect();
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Merge a persisted document into the store.
    ///
    /// Profiles for actuators present in the document are replaced; the rest
    /// are kept. Unknown names are reported back, not treated as errors.
    /// A point outside the encoder range rejects the whole document and
    /// leaves the store untouched.
    pub fn load_json(&mut self, json: &str) -> Result<LoadReport, ArmError> {
        let doc: BTreeMap<String, StoredProfile> = serde_json::from_str(json)?;
        let mut report = LoadReport::default();
        let mut accepted = Vec::new();
        for (name, stored) in doc {
            if !self.registry.contains(&name) {
                report.unknown.push(name);
                continue;
            }
            let profile = CalibrationProfile::from(stored);
            self.check_profile(&name, &profile)?;
            accepted.push((name, profile));
        }
        for (name, profile) in accepted {
            self.profiles.insert(name.clone(), profile);
            report.loaded.push(name);
        }
        Ok(report)
    }
}

// =============================================================================
// Sweep tracking
// =============================================================================

/// Running min/max over raw samples taken during an auto sweep.
///
/// Direction is inferred from the extremes, not from sample order:
/// the sweep always stores `left = min`, `right = max`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepTracker {
    min: Option<i32>,
    max: Option<i32>,
    samples: u32,
}

impl SweepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, raw: i32) {
        self.min = Some(self.min.map_or(raw, |m| m.min(raw)));
        self.max = Some(self.max.map_or(raw, |m| m.max(raw)));
        self.samples += 1;
    }

    pub fn min(&self) -> Option<i32> {
        self.min
    }

    pub fn max(&self) -> Option<i32> {
        self.max
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Observed span in ticks, 0 when nothing moved
    pub fn span(&self) -> i32 {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => hi.saturating_sub(lo),
            _ => 0,
        }
    }

    /// `(left, right)` to store, if anything was sampled
    pub fn bounds(&self) -> Option<(i32, i32)> {
        Some((self.min?, self.max?))
    }
}
