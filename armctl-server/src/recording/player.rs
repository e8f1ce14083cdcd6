//! Motion playback - drives claimed actuators through a recording's frames.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use armctl_core::state::progress_percent;
use armctl_core::{
    ActuatorCommand, ArmError, CommandSource, PlaybackOutcome, PlaybackSummary, Recording,
};

use crate::arbiter::{Arbiter, BusClaim};

/// Where a finished playback leaves its summary
pub type SummarySlot = Arc<Mutex<Option<PlaybackSummary>>>;

/// State shared between the handle and the driver task
struct Progress {
    current_index: AtomicUsize,
    stop_requested: AtomicBool,
    finished: AtomicBool,
}

/// Active playback handle
pub struct ActivePlayback {
    progress: Arc<Progress>,
    claim: Arc<BusClaim>,
    total_frames: usize,
    started_at: Instant,
    handle: JoinHandle<PlaybackSummary>,
}

impl ActivePlayback {
    /// Index of the last applied frame; `total_frames` once all were applied
    pub fn current_index(&self) -> usize {
        self.progress.current_index.load(Ordering::Relaxed)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn progress(&self) -> f64 {
        progress_percent(self.current_index(), self.total_frames)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The driver has exited and written its summary
    pub fn is_finished(&self) -> bool {
        self.progress.finished.load(Ordering::SeqCst)
    }

    pub fn actuators(&self) -> &[String] {
        self.claim.actuators()
    }

    /// Ask the driver to stop and wait for it. The driver checks between
    /// frames and wakes from its wait immediately.
    pub async fn stop(self) -> Option<PlaybackSummary> {
        self.progress.stop_requested.store(true, Ordering::SeqCst);
        self.claim.token().cancel();
        match self.handle.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Playback task ended abnormally: {}", e);
                None
            }
        }
    }
}

/// Claim and lock the recording's actuators, then spawn the driver.
///
/// The recording must already be validated against the registry. It must
/// name at least one actuator and every actuator in it must be calibrated;
/// this is checked before anything is claimed so a bad recording never
/// touches the bus.
pub fn start_playback(
    arbiter: Arc<Arbiter>,
    recording: Recording,
    summary: SummarySlot,
) -> Result<ActivePlayback, ArmError> {
    if recording.is_empty() {
        return Err(ArmError::invalid("recording has no frames"));
    }
    let actuators: Vec<String> = recording.actuators().into_iter().collect();
    if actuators.is_empty() {
        return Err(ArmError::invalid("recording drives no known actuator"));
    }
    {
        let store = arbiter.calibration();
        for name in &actuators {
            store.complete_profile(name)?;
        }
    }

    let claim = arbiter.claim(&actuators, CommandSource::Playback)?;
    if let Err(e) = arbiter.lock(claim.actuators()) {
        arbiter.release_claim(&claim);
        return Err(e);
    }
    let claim = Arc::new(claim);

    info!(
        "Starting playback of {} frames ({}ms) on {:?}",
        recording.len(),
        recording.duration_ms(),
        actuators
    );

    let progress = Arc::new(Progress {
        current_index: AtomicUsize::new(0),
        stop_requested: AtomicBool::new(false),
        finished: AtomicBool::new(false),
    });
    let total_frames = recording.len();
    let started_at = Instant::now();

    let handle = tokio::spawn(playback_task(
        arbiter,
        recording,
        claim.clone(),
        progress.clone(),
        started_at,
        summary,
    ));

    Ok(ActivePlayback {
        progress,
        claim,
        total_frames,
        started_at,
        handle,
    })
}

/// Playback task that runs in the background
async fn playback_task(
    arbiter: Arc<Arbiter>,
    recording: Recording,
    claim: Arc<BusClaim>,
    progress: Arc<Progress>,
    started_at: Instant,
    summary_slot: SummarySlot,
) -> PlaybackSummary {
    let total = recording.len();
    let token = claim.token().clone();
    let interrupted = |progress: &Progress| {
        if progress.stop_requested.load(Ordering::SeqCst) {
            PlaybackOutcome::Stopped
        } else {
            PlaybackOutcome::Released
        }
    };

    let mut result: Result<(), (PlaybackOutcome, Option<String>)> = Ok(());
    for (i, frame) in recording.frames.iter().enumerate() {
        let due = started_at + Duration::from_millis(frame.timestamp_offset_ms);
        tokio::select! {
            _ = token.cancelled() => {
                result = Err((interrupted(&progress), None));
                break;
            }
            _ = tokio::time::sleep_until(due) => {}
        }

        let applied = {
            let arbiter = arbiter.clone();
            let positions = frame.positions.clone();
            match tokio::task::spawn_blocking(move || apply_frame(&arbiter, &positions)).await {
                Ok(applied) => applied.map_err(|e| e.to_string()),
                Err(e) => Err(format!("frame task failed: {}", e)),
            }
        };
        if let Err(e) = applied {
            result = if token.is_cancelled() {
                Err((interrupted(&progress), None))
            } else {
                warn!("Playback aborted at frame {}: {}", i, e);
                Err((PlaybackOutcome::Failed, Some(e)))
            };
            break;
        }
        progress.current_index.store(i, Ordering::Relaxed);
    }

    let outcome = match result {
        Ok(()) => {
            progress.current_index.store(total, Ordering::Relaxed);
            // Let pollers see 100% for one nominal interval
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(recording.interval_ms)) => {}
            }
            (PlaybackOutcome::Completed, None)
        }
        Err(outcome) => outcome,
    };

    arbiter.release_claim(&claim);

    let current_index = progress.current_index.load(Ordering::Relaxed);
    let summary = PlaybackSummary {
        outcome: outcome.0,
        current_index,
        total_frames: total,
        progress: progress_percent(current_index, total),
        error: outcome.1,
    };
    info!(
        "Playback {} at frame {}/{}",
        summary.outcome, current_index, total
    );
    debug!("Playback ran for {:?}", started_at.elapsed());

    *summary_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
    progress.finished.store(true, Ordering::SeqCst);
    summary
}

/// Write one frame. Serial transactions block, so this runs off the runtime.
fn apply_frame(arbiter: &Arbiter, positions: &BTreeMap<String, f64>) -> Result<(), ArmError> {
    positions.iter().try_for_each(|(name, percentage)| {
        arbiter
            .submit(&ActuatorCommand::new(name, *percentage, CommandSource::Playback))
            .map(|_| ())
    })
}
