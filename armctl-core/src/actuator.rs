//! Actuator registry
//!
//! The fixed set of servos on one arm. The registry is built once and never
//! mutated; everything else refers to actuators by name and iterates them in
//! registry order.

use serde::{Deserialize, Serialize};

use crate::error::ArmError;

/// Full scale of a 12-bit STS3215 encoder
pub const RAW_FULL_SCALE: i32 = 4095;

/// One servo on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actuator {
    /// Servo bus ID
    pub id: u8,
    pub name: String,
    /// Lowest raw tick the hardware can report
    pub raw_min: i32,
    /// Highest raw tick the hardware can report
    pub raw_max: i32,
}

impl Actuator {
    pub fn new(id: u8, name: &str, raw_min: i32, raw_max: i32) -> Self {
        Self {
            id,
            name: name.to_string(),
            raw_min,
            raw_max,
        }
    }

    /// Clamp a raw tick into the hardware range
    pub fn clamp_raw(&self, raw: i32) -> i32 {
        raw.clamp(self.raw_min, self.raw_max)
    }
}

/// Ordered, immutable set of actuators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorRegistry {
    actuators: Vec<Actuator>,
}

impl ActuatorRegistry {
    /// Build a registry, rejecting duplicate names or IDs and inverted bounds.
    pub fn new(actuators: Vec<Actuator>) -> Result<Self, ArmError> {
        for (i, a) in actuators.iter().enumerate() {
            if a.raw_min >= a.raw_max {
                return Err(ArmError::invalid(format!(
                    "actuator '{}' has raw_min {} >= raw_max {}",
                    a.name, a.raw_min, a.raw_max
                )));
            }
            if let Some(dup) = actuators[..i]
                .iter()
                .find(|b| b.name == a.name || b.id == a.id)
            {
                return Err(ArmError::invalid(format!(
                    "actuator '{}' (id {}) duplicates '{}' (id {})",
                    a.name, a.id, dup.name, dup.id
                )));
            }
        }
        Ok(Self { actuators })
    }

    /// SO-101 follower arm: six STS3215 servos on IDs 1-6
    pub fn so101() -> Self {
        let names = [
            "shoulder_pan",
            "shoulder_lift",
            "elbow_flex",
            "wrist_flex",
            "wrist_roll",
            "gripper",
        ];
        Self {
            actuators: names
                .iter()
                .enumerate()
                .map(|(i, name)| Actuator::new(i as u8 + 1, name, 0, RAW_FULL_SCALE))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Actuator> {
        self.actuators.iter().find(|a| a.name == name)
    }

    /// Like [`get`](Self::get) but fails with `UnknownActuator`
    pub fn require(&self, name: &str) -> Result<&Actuator, ArmError> {
        self.get(name)
            .ok_or_else(|| ArmError::UnknownActuator(name.to_string()))
    }

    pub fn by_id(&self, id: u8) -> Option<&Actuator> {
        self.actuators.iter().find(|a| a.id == id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Actuator> {
        self.actuators.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.actuators.iter().map(|a| a.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }

    /// Resolve a set of names to actuators in registry order.
    ///
    /// An empty selection means "all actuators".
    pub fn select(&self, names: &[String]) -> Result<Vec<&Actuator>, ArmError> {
        if names.is_empty() {
            return Ok(self.actuators.iter().collect());
        }
        for name in names {
            self.require(name)?;
        }
        Ok(self
            .actuators
            .iter()
            .filter(|a| names.iter().any(|n| n == &a.name))
            .collect())
    }
}

impl Default for ActuatorRegistry {
    fn default() -> Self {
        Self::so101()
    }
}
