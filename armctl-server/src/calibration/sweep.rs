//! Automatic range sweep
//!
//! Torque is released on one actuator at a time and its present position is
//! sampled on a fixed cadence while the operator moves the joint through its
//! full travel. The extremes seen become `pos_left` (min) and `pos_right`
//! (max); `pos_center` is left alone.
//!
//! Actuators are swept in registry order and independently: a failure on one
//! is reported and the sweep moves on to the next.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use armctl_core::{ArmError, CalibrationProfile, CommandSource, SweepTracker};

use crate::arbiter::Arbiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SweepOptions {
    /// Time between two position samples
    #[serde(with = "millis")]
    pub sample_interval: Duration,
    /// Samples taken per actuator, so each joint gets
    /// `sample_interval * samples_per_actuator` of travel time
    pub samples_per_actuator: u32,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(50),
            samples_per_actuator: 100,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// One progress event, emitted per sample and per step
#[derive(Debug, Clone, PartialEq)]
pub struct SweepProgress {
    /// Since the start of the whole sweep
    pub elapsed: Duration,
    pub actuator: String,
    pub message: String,
}

/// How the sweep of one actuator ended
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// The observed extremes were stored; this is the new profile
    Calibrated(CalibrationProfile),
    /// Cancelled before the actuator finished; its previous profile is kept
    Cancelled,
    /// Nothing was stored
    Failed(ArmError),
}

/// Result for one actuator
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub actuator: String,
    pub outcome: SweepOutcome,
}

impl SweepReport {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, SweepOutcome::Calibrated(_))
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == SweepOutcome::Cancelled
    }
}

struct Progress<'a> {
    start: Instant,
    sink: &'a mpsc::UnboundedSender<SweepProgress>,
}

impl Progress<'_> {
    fn emit(&self, actuator: &str, message: impl Into<String>) {
        // A dropped receiver only means nobody is watching
        let _ = self.sink.send(SweepProgress {
            elapsed: self.start.elapsed(),
            actuator: actuator.to_string(),
            message: message.into(),
        });
    }
}

/// Sweep `actuators` (empty = all) one after the other.
///
/// Returns one report per actuator, in registry order. Cancelling `cancel`
/// stops at the next sample; the actuator being swept and any not yet
/// started are reported as cancelled and keep their previous profile.
pub async fn run_auto_sweep(
    arbiter: &Arbiter,
    actuators: &[String],
    options: SweepOptions,
    sink: &mpsc::UnboundedSender<SweepProgress>,
    cancel: &CancellationToken,
) -> Result<Vec<SweepReport>, ArmError> {
    if options.sample_interval.is_zero() || options.samples_per_actuator == 0 {
        return Err(ArmError::invalid(
            "sweep needs a positive sample interval and sample count",
        ));
    }
    let selected: Vec<String> = arbiter
        .registry()
        .select(actuators)?
        .into_iter()
        .map(|a| a.name.clone())
        .collect();

    let progress = Progress {
        start: Instant::now(),
        sink,
    };
    let mut reports = Vec::with_capacity(selected.len());

    for name in selected {
        let outcome = if cancel.is_cancelled() {
            SweepOutcome::Cancelled
        } else {
            sweep_one(arbiter, &name, options, &progress, cancel).await
        };
        match &outcome {
            SweepOutcome::Calibrated(profile) => info!(
                "Sweep of {}: left={:?} right={:?}",
                name, profile.pos_left, profile.pos_right
            ),
            SweepOutcome::Cancelled => {
                info!("Sweep of {} cancelled", name);
                progress.emit(&name, "cancelled");
            }
            SweepOutcome::Failed(e) => {
                warn!("Sweep of {} failed: {}", name, e);
                progress.emit(&name, format!("failed: {}", e));
            }
        }
        reports.push(SweepReport {
            actuator: name,
            outcome,
        });
    }

    Ok(reports)
}

async fn sweep_one(
    arbiter: &Arbiter,
    name: &str,
    options: SweepOptions,
    progress: &Progress<'_>,
    cancel: &CancellationToken,
) -> SweepOutcome {
    let target = [name.to_string()];
    let claim = match arbiter.claim(&target, CommandSource::Calibration) {
        Ok(claim) => claim,
        Err(e) => return SweepOutcome::Failed(e),
    };
    let outcome = async {
        arbiter.release(&target)?;
        progress.emit(name, "torque released, move the joint through its full range");
        let Some(tracker) = sample(arbiter, name, options, progress, cancel).await? else {
            return Ok(SweepOutcome::Cancelled);
        };

        let (min, max) = tracker
            .bounds()
            .ok_or_else(|| ArmError::invalid("no samples taken"))?;
        if min == max {
            warn!("{} did not move during the sweep", name);
        }
        let mut store = arbiter.calibration_mut();
        store.apply_sweep(name, min, max)?;
        Ok::<_, ArmError>(SweepOutcome::Calibrated(store.read_profile(name)?))
    }
    .await
    .unwrap_or_else(SweepOutcome::Failed);
    arbiter.release_claim(&claim);

    if let SweepOutcome::Calibrated(profile) = &outcome {
        let message = match (profile.is_complete(), profile.pos_left, profile.pos_right) {
            (true, Some(left), Some(right)) => format!("done: {}..{}", left, right),
            _ => "done, but no travel was observed".to_string(),
        };
        progress.emit(name, message);
    }
    outcome
}

async fn sample(
    arbiter: &Arbiter,
    name: &str,
    options: SweepOptions,
    progress: &Progress<'_>,
    cancel: &CancellationToken,
) -> Result<Option<SweepTracker>, ArmError> {
    let mut tracker = SweepTracker::new();
    let start = Instant::now();

    for i in 0..options.samples_per_actuator {
        let deadline = start + options.sample_interval * i;
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Sweep of {} cancelled after {} samples", name, tracker.samples());
                return Ok(None);
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let raw = arbiter.read_raw(name)?;
        tracker.observe(raw);
        progress.emit(
            name,
            format!(
                "sample {}/{}: raw={} min={} max={}",
                i + 1,
                options.samples_per_actuator,
                raw,
                tracker.min().unwrap_or(raw),
                tracker.max().unwrap_or(raw)
            ),
        );
    }

    Ok(Some(tracker))
}
