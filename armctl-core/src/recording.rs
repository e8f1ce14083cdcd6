//! Motion recordings
//!
//! A recording is an ordered list of frames, each holding the logical
//! percentage of every sampled actuator at an offset from the start of
//! capture. Playback is paced by those offsets, so frames whose spacing
//! drifted at capture time replay with the same spacing.
//!
//! Persisted layout:
//!
//! ```json
//! {
//!   "interval_ms": 100,
//!   "created_at": 1760000000000,
//!   "frames": [
//!     { "timestamp_offset_ms": 0, "positions": { "gripper": 12.5 } }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::actuator::ActuatorRegistry;
use crate::error::ArmError;

/// One timestamped snapshot of actuator positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp_offset_ms: u64,
    pub positions: BTreeMap<String, f64>,
}

impl Frame {
    pub fn new(timestamp_offset_ms: u64) -> Self {
        Self {
            timestamp_offset_ms,
            positions: BTreeMap::new(),
        }
    }

    pub fn with(mut self, actuator: &str, percentage: f64) -> Self {
        self.positions.insert(actuator.to_string(), percentage);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Nominal sample spacing at capture time
    pub interval_ms: u64,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
    pub frames: Vec<Frame>,
}

/// Outcome of validating an externally supplied recording
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecording {
    pub recording: Recording,
    /// Actuator names that were dropped because the registry lacks them
    pub dropped: Vec<String>,
}

impl Recording {
    pub fn new(interval_ms: u64, created_at: u64) -> Self {
        Self {
            interval_ms,
            created_at,
            frames: Vec::new(),
        }
    }

    /// Append a frame; offsets must never go backwards.
    pub fn push(&mut self, frame: Frame) -> Result<(), ArmError> {
        if let Some(last) = self.frames.last() {
            if frame.timestamp_offset_ms < last.timestamp_offset_ms {
                return Err(ArmError::invalid(format!(
                    "frame offset {}ms precedes previous frame at {}ms",
                    frame.timestamp_offset_ms, last.timestamp_offset_ms
                )));
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Offset of the last frame relative to the first.
    ///
    /// Unvalidated frames may run backwards; that reads as zero.
    pub fn duration_ms(&self) -> u64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last
                .timestamp_offset_ms
                .saturating_sub(first.timestamp_offset_ms),
            _ => 0,
        }
    }

    /// Every actuator that appears in at least one frame
    pub fn actuators(&self) -> BTreeSet<String> {
        self.frames
            .iter()
            .flat_map(|f| f.positions.keys().cloned())
            .collect()
    }

    pub fn to_json(&self) -> Result<String, ArmError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a persisted recording against a registry.
    pub fn from_json(json: &str, registry: &ActuatorRegistry) -> Result<ValidatedRecording, ArmError> {
        let recording: Recording = serde_json::from_str(json)?;
        recording.validate(registry)
    }

    /// Check ordering and ranges, and drop actuators the registry doesn't know.
    ///
    /// Unknown names are not an error so recordings stay usable across arm
    /// variants; the caller decides whether to warn about them.
    pub fn validate(mut self, registry: &ActuatorRegistry) -> Result<ValidatedRecording, ArmError> {
        if self.interval_ms == 0 {
            return Err(ArmError::invalid("recording interval_ms must be positive"));
        }

        let mut dropped = BTreeSet::new();
        let mut previous = 0u64;
        for (i, frame) in self.frames.iter_mut().enumerate() {
            if frame.timestamp_offset_ms < previous {
                return Err(ArmError::invalid(format!(
                    "frame {} offset {}ms precedes previous frame at {}ms",
                    i, frame.timestamp_offset_ms, previous
                )));
            }
            previous = frame.timestamp_offset_ms;

            if let Some((name, value)) = frame
                .positions
                .iter()
                .find(|(_, v)| !v.is_finite() || **v < 0.0 || **v > 100.0)
            {
                return Err(ArmError::invalid(format!(
                    "frame {} position {} for '{}' is outside 0..=100",
                    i, value, name
                )));
            }

            frame.positions.retain(|name, _| {
                let known = registry.contains(name);
                if !known {
                    dropped.insert(name.clone());
                }
                known
            });
        }

        Ok(ValidatedRecording {
            recording: self,
            dropped: dropped.into_iter().collect(),
        })
    }
}
