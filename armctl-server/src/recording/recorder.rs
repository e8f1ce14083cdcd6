//! Motion recorder - samples calibrated actuators into frames.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use armctl_core::{ArmError, Frame, Recording};

use crate::arbiter::Arbiter;

/// Active recording handle
pub struct ActiveRecording {
    cancel: CancellationToken,
    frames_captured: Arc<AtomicUsize>,
    /// Why the sampler stopped early, if it did
    error: Arc<Mutex<Option<String>>>,
    actuators: Vec<String>,
    started_at: Instant,
    interval_ms: u64,
    handle: JoinHandle<Recording>,
}

impl ActiveRecording {
    pub fn frames_captured(&self) -> usize {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Actuators being sampled
    pub fn actuators(&self) -> &[String] {
        &self.actuators
    }

    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop sampling and hand back everything captured so far
    pub async fn stop(self) -> Recording {
        self.cancel.cancel();
        match self.handle.await {
            Ok(recording) => recording,
            Err(e) => {
                warn!("Recording task ended abnormally: {}", e);
                Recording::new(self.interval_ms, 0)
            }
        }
    }
}

/// Start sampling every calibrated actuator every `interval_ms`.
///
/// The recorder only reads; it takes no bus claim, so the joints can be
/// moved by hand (torque released) or jogged while recording.
pub fn start_recording(arbiter: Arc<Arbiter>, interval_ms: u64) -> Result<ActiveRecording, ArmError> {
    if interval_ms == 0 {
        return Err(ArmError::invalid("recording interval must be positive"));
    }

    let actuators: Vec<String> = {
        let store = arbiter.calibration();
        arbiter
            .registry()
            .iter()
            .filter(|a| store.is_complete(&a.name))
            .map(|a| a.name.clone())
            .collect()
    };
    if actuators.is_empty() {
        let first = arbiter.registry().names().into_iter().next().unwrap_or_default();
        return Err(ArmError::incomplete(&first));
    }

    let skipped = arbiter.registry().len() - actuators.len();
    if skipped > 0 {
        warn!("Recording without {} uncalibrated actuator(s)", skipped);
    }
    info!(
        "Starting recording of {:?} every {}ms",
        actuators, interval_ms
    );

    let cancel = CancellationToken::new();
    let frames_captured = Arc::new(AtomicUsize::new(0));
    let error = Arc::new(Mutex::new(None));
    let started_at = Instant::now();
    let created_at = chrono::Utc::now().timestamp_millis().max(0) as u64;

    let handle = tokio::spawn(sampler_task(
        arbiter,
        actuators.clone(),
        Recording::new(interval_ms, created_at),
        started_at,
        cancel.clone(),
        frames_captured.clone(),
        error.clone(),
    ));

    Ok(ActiveRecording {
        cancel,
        frames_captured,
        error,
        actuators,
        started_at,
        interval_ms,
        handle,
    })
}

/// Sampler loop. Ticks are scheduled from the start instant, so a slow read
/// delays one frame without shifting the ones after it.
async fn sampler_task(
    arbiter: Arc<Arbiter>,
    actuators: Vec<String>,
    mut recording: Recording,
    started_at: Instant,
    cancel: CancellationToken,
    frames_captured: Arc<AtomicUsize>,
    error: Arc<Mutex<Option<String>>>,
) -> Recording {
    let interval = Duration::from_millis(recording.interval_ms);
    let mut tick: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(started_at + interval * tick) => {}
        }
        tick += 1;

        let offset = started_at.elapsed().as_millis() as u64;
        let sampled = {
            let arbiter = arbiter.clone();
            let actuators = actuators.clone();
            match tokio::task::spawn_blocking(move || sample_frame(&arbiter, &actuators, offset))
                .await
            {
                Ok(sampled) => sampled.map_err(|e| e.to_string()),
                Err(e) => Err(format!("sample task failed: {}", e)),
            }
        };
        match sampled {
            Ok(frame) => {
                if let Err(e) = recording.push(frame) {
                    warn!("Dropping frame at {}ms: {}", offset, e);
                    continue;
                }
                frames_captured.store(recording.len(), Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Recording stopped after {} frames: {}", recording.len(), e);
                *error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                break;
            }
        }
    }

    debug!(
        "Recorder finished: {} frames over {}ms",
        recording.len(),
        recording.duration_ms()
    );
    recording
}

/// Read every actuator once. Runs on the blocking pool.
fn sample_frame(arbiter: &Arbiter, actuators: &[String], offset: u64) -> Result<Frame, ArmError> {
    let mut frame = Frame::new(offset);
    for name in actuators {
        let percentage = arbiter.read_percentage(name)?;
        frame = frame.with(name, percentage);
    }
    Ok(frame)
}
