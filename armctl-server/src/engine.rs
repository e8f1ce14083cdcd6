//! Motion engine
//!
//! Owns the arbiter and the single recording/playback slot, and exposes the
//! operations a front end calls: calibration capture, sweep, homing,
//! lock/release, jog, record, play and a status snapshot for polling.
//!
//! ```text
//!             start_recording            stop_recording
//!   Idle ───────────────────▶ Recording ───────────────▶ Idle
//!     │
//!     │ start_playback       stop_playback / release / error / last frame
//!     └────────────────────▶ Playing ─────────────────────────────▶ Idle
//! ```
//!
//! A playback that ends on its own is reaped lazily: the driver publishes
//! its summary and the next call that looks at the slot sees it finished.

use log::{info, warn};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use armctl_core::state::progress_percent;
use armctl_core::{
    ActuatorCommand, ArmError, CalibrationProfile, CalibrationStatus, CalibrationStore,
    CommandSource, LoadReport, PlaybackSummary, PointKind, Recording, SessionKind, SessionStatus,
    StatusSnapshot,
};

use crate::arbiter::Arbiter;
use crate::calibration::{self, SweepOptions, SweepProgress, SweepReport};
use crate::recording::{self, ActivePlayback, ActiveRecording, SummarySlot};
use crate::transport::SharedTransport;

enum Session {
    Idle,
    Recording(ActiveRecording),
    Playing(ActivePlayback),
}

pub struct MotionEngine {
    arbiter: Arc<Arbiter>,
    session: Mutex<Session>,
    last_playback: SummarySlot,
}

impl MotionEngine {
    pub fn new(transport: SharedTransport, calibration: CalibrationStore) -> Self {
        Self {
            arbiter: Arc::new(Arbiter::new(transport, calibration)),
            session: Mutex::new(Session::Idle),
            last_playback: Arc::new(Mutex::new(None)),
        }
    }

    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }

    /// Session slot with a finished playback already reaped
    fn session(&self) -> MutexGuard<'_, Session> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(&*session, Session::Playing(p) if p.is_finished()) {
            *session = Session::Idle;
        }
        session
    }

    fn ensure_idle(session: &Session) -> Result<(), ArmError> {
        match session {
            Session::Idle => Ok(()),
            Session::Recording(_) => Err(ArmError::invalid("a recording is in progress")),
            Session::Playing(_) => Err(ArmError::invalid("a playback is in progress")),
        }
    }

    // -------------------------------------------------------------------------
    // Calibration
    // -------------------------------------------------------------------------

    /// Read the present position of `actuator` and store it as a reference point
    pub fn capture_manual(&self, actuator: &str, kind: PointKind) -> Result<i32, ArmError> {
        let raw = self.arbiter.calibration_mut().capture_manual(
            self.arbiter.transport().as_ref(),
            actuator,
            kind,
        )?;
        info!("Captured {} {} = {}", actuator, kind, raw);
        Ok(raw)
    }

    pub fn read_profile(&self, actuator: &str) -> Result<CalibrationProfile, ArmError> {
        self.arbiter.calibration().read_profile(actuator)
    }

    pub fn reset(&self, actuator: &str) -> Result<(), ArmError> {
        self.arbiter.calibration_mut().reset(actuator)?;
        info!("Calibration of {} cleared", actuator);
        Ok(())
    }

    pub fn load_calibration(&self, json: &str) -> Result<LoadReport, ArmError> {
        self.arbiter.calibration_mut().load_json(json)
    }

    pub fn calibration_json(&self) -> Result<String, ArmError> {
        self.arbiter.calibration().to_json()
    }

    /// Copy of the calibration store, e.g. for persisting
    pub fn calibration_snapshot(&self) -> CalibrationStore {
        self.arbiter.calibration().clone()
    }

    pub async fn run_auto_sweep(
        &self,
        actuators: &[String],
        options: SweepOptions,
        sink: &mpsc::UnboundedSender<SweepProgress>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SweepReport>, ArmError> {
        calibration::run_auto_sweep(&self.arbiter, actuators, options, sink, cancel).await
    }

    // -------------------------------------------------------------------------
    // Direct control
    // -------------------------------------------------------------------------

    pub fn submit(&self, cmd: &ActuatorCommand) -> Result<i32, ArmError> {
        self.arbiter.submit(cmd)
    }

    /// Manual move of one actuator to a percentage
    pub fn jog(&self, actuator: &str, percentage: f64) -> Result<i32, ArmError> {
        self.arbiter.submit(&ActuatorCommand::manual(actuator, percentage))
    }

    pub fn lock(&self, actuators: &[String]) -> Result<(), ArmError> {
        self.arbiter.lock(actuators)
    }

    /// Always allowed. Aborts a playback that drives any released actuator.
    pub fn release(&self, actuators: &[String]) -> Result<(), ArmError> {
        self.arbiter.release(actuators)
    }

    /// Send `actuators` (empty = all) to their calibrated center, or to the
    /// middle of the range when no center was captured, then engage torque.
    ///
    /// Every actuator is attempted; the first error is returned.
    pub fn home(&self, actuators: &[String]) -> Result<(), ArmError> {
        let targets: Vec<(String, f64)> = {
            let store = self.arbiter.calibration();
            let mut targets = Vec::new();
            for a in self.arbiter.registry().select(actuators)? {
                let profile = store.complete_profile(&a.name)?;
                let home = profile
                    .home_position()
                    .ok_or_else(|| ArmError::incomplete(&a.name))?;
                targets.push((a.name.clone(), store.to_percentage(&a.name, home)?));
            }
            targets
        };

        let names: Vec<String> = targets.iter().map(|(n, _)| n.clone()).collect();
        let claim = self.arbiter.claim(&names, CommandSource::Homing)?;

        let mut first_error = None;
        for (name, percentage) in &targets {
            let moved = self
                .arbiter
                .submit(&ActuatorCommand::new(name, *percentage, CommandSource::Homing))
                .and_then(|_| self.arbiter.engage(name));
            if let Err(e) = moved {
                warn!("Homing {} failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        self.arbiter.release_claim(&claim);
        info!("Homed {:?}", names);
        first_error.map_or(Ok(()), Err)
    }

    // -------------------------------------------------------------------------
    // Recording / playback
    // -------------------------------------------------------------------------

    pub fn start_recording(&self, interval_ms: u64) -> Result<(), ArmError> {
        let mut session = self.session();
        Self::ensure_idle(&session)?;
        let active = recording::start_recording(self.arbiter.clone(), interval_ms)?;
        *session = Session::Recording(active);
        Ok(())
    }

    /// Stop sampling and return the frames; `None` if nothing was recording
    pub async fn stop_recording(&self) -> Option<Recording> {
        let active = {
            let mut session = self.session();
            match mem::replace(&mut *session, Session::Idle) {
                Session::Recording(active) => active,
                other => {
                    *session = other;
                    return None;
                }
            }
        };
        let recording = active.stop().await;
        info!(
            "Recording stopped: {} frames over {}ms",
            recording.len(),
            recording.duration_ms()
        );
        Some(recording)
    }

    /// Validate the recording, lock and claim its actuators and start playing.
    ///
    /// Unknown actuator names are dropped (and logged); an empty recording
    /// or a busy slot is `InvalidArgument`.
    pub fn start_playback(&self, recording: Recording) -> Result<(), ArmError> {
        let mut session = self.session();
        Self::ensure_idle(&session)?;

        let validated = recording.validate(self.arbiter.registry())?;
        if !validated.dropped.is_empty() {
            warn!("Playing without unknown actuators {:?}", validated.dropped);
        }
        let active = recording::start_playback(
            self.arbiter.clone(),
            validated.recording,
            self.last_playback.clone(),
        )?;
        *session = Session::Playing(active);
        Ok(())
    }

    /// Stop at the next frame boundary and wait for the driver to exit.
    ///
    /// Returns the summary, or `None` if nothing was playing.
    pub async fn stop_playback(&self) -> Option<PlaybackSummary> {
        let active = {
            let mut session = self.session();
            match mem::replace(&mut *session, Session::Idle) {
                Session::Playing(active) => active,
                other => {
                    *session = other;
                    return None;
                }
            }
        };
        active.stop().await
    }

    /// Wait until a running playback ends on its own
    pub async fn wait_playback(&self) -> Option<PlaybackSummary> {
        loop {
            {
                let session = self.session();
                if !matches!(&*session, Session::Playing(_)) {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        self.last_playback()
    }

    pub fn last_playback(&self) -> Option<PlaybackSummary> {
        self.last_playback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn session_status(&self) -> SessionStatus {
        match &*self.session() {
            Session::Idle => SessionStatus::idle(),
            Session::Recording(r) => SessionStatus {
                kind: SessionKind::Recording,
                elapsed_ms: r.elapsed().as_millis() as u64,
                frames_captured: r.frames_captured(),
                error: r.error(),
                ..Default::default()
            },
            Session::Playing(p) => {
                let current_index = p.current_index();
                SessionStatus {
                    kind: SessionKind::Playing,
                    elapsed_ms: p.elapsed().as_millis() as u64,
                    current_index,
                    total_frames: p.total_frames(),
                    progress: progress_percent(current_index, p.total_frames()),
                    ..Default::default()
                }
            }
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let calibration = self
            .arbiter
            .calibration()
            .profiles()
            .into_iter()
            .map(|(actuator, profile)| CalibrationStatus {
                actuator,
                complete: profile.is_complete(),
                profile,
            })
            .collect();

        StatusSnapshot {
            session: self.session_status(),
            last_playback: self.last_playback(),
            calibration,
            bus: self.arbiter.bus_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EmulatorTransport;
    use armctl_core::{ActuatorRegistry, Frame, PlaybackOutcome, TorqueState};
    use std::time::Duration;
    use tokio::time::Instant;

    fn engine() -> (MotionEngine, Arc<EmulatorTransport>) {
        let registry = ActuatorRegistry::so101();
        let io = Arc::new(EmulatorTransport::new(&registry));
        let mut store = CalibrationStore::new(registry.clone());
        for a in registry.iter() {
            store
                .replace(&a.name, CalibrationProfile::new(1000, None, 3000))
                .unwrap();
        }
        (MotionEngine::new(io.clone(), store), io)
    }

    fn recording(actuators: &[&str]) -> Recording {
        let mut rec = Recording::new(100, 0);
        for i in 0..5u64 {
            let mut frame = Frame::new(i * 100);
            for name in actuators {
                frame = frame.with(name, 20.0 * i as f64);
            }
            rec.push(frame).unwrap();
        }
        rec
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_playback_stays_idle() {
        let (engine, _io) = engine();
        let err = engine.start_playback(Recording::new(100, 0)).unwrap_err();
        assert!(matches!(err, ArmError::InvalidArgument(_)));
        assert_eq!(engine.status().session.kind, SessionKind::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_blocks_only_recorded_actuators() {
        let (engine, _io) = engine();
        engine
            .start_playback(recording(&["elbow_flex", "gripper"]))
            .unwrap();

        assert!(matches!(
            engine.jog("elbow_flex", 50.0),
            Err(ArmError::BusConflict {
                holder: CommandSource::Playback,
                ..
            })
        ));
        assert!(engine.jog("wrist_roll", 50.0).is_ok());
        assert!(engine.start_recording(100).is_err());
        assert!(engine.start_playback(recording(&["wrist_roll"])).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_playback_after_third_frame() {
        let (engine, _io) = engine();
        engine.start_playback(recording(&["gripper"])).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = engine.status().session;
        assert_eq!(status.kind, SessionKind::Playing);
        assert_eq!(status.current_index, 2);
        assert_eq!(status.progress, 40.0);

        let stopped_at = Instant::now();
        let summary = engine.stop_playback().await.unwrap();
        assert!(stopped_at.elapsed() <= Duration::from_millis(100));
        assert_eq!(summary.current_index, 2);
        assert_eq!(summary.outcome, PlaybackOutcome::Stopped);
        assert_eq!(engine.status().session.kind, SessionKind::Idle);
        assert_eq!(engine.status().last_playback, Some(summary));
        assert!(engine.stop_playback().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_is_observable_then_idle() {
        let (engine, _io) = engine();
        engine.start_playback(recording(&["gripper"])).unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        let status = engine.status().session;
        assert_eq!(status.kind, SessionKind::Playing);
        assert_eq!(status.current_index, 5);
        assert_eq!(status.progress, 100.0);

        let summary = engine.wait_playback().await.unwrap();
        assert_eq!(summary.outcome, PlaybackOutcome::Completed);
        let snapshot = engine.status();
        assert_eq!(snapshot.session.kind, SessionKind::Idle);
        assert_eq!(snapshot.last_playback.unwrap().progress, 100.0);
        // Torque stays engaged on the last commanded position
        assert_eq!(snapshot.bus[5].torque, TorqueState::Locked);
        assert_eq!(snapshot.bus[5].last_raw, Some(2600));
        assert_eq!(snapshot.bus[5].holder, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_aborts_playback() {
        let (engine, _io) = engine();
        engine.start_playback(recording(&["gripper"])).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        engine.release(&[]).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let snapshot = engine.status();
        assert_eq!(snapshot.session.kind, SessionKind::Idle);
        assert_eq!(
            snapshot.last_playback.unwrap().outcome,
            PlaybackOutcome::Released
        );
        assert!(snapshot.bus.iter().all(|b| b.torque == TorqueState::Released));
        assert!(engine.jog("gripper", 10.0).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_reported_in_status() {
        let (engine, io) = engine();
        let gripper = engine.arbiter().registry().get("gripper").unwrap().clone();
        engine.start_playback(recording(&["gripper"])).unwrap();
        io.fail_writes_after(&gripper, 1);

        let summary = engine.wait_playback().await.unwrap();
        assert_eq!(summary.outcome, PlaybackOutcome::Failed);
        assert_eq!(summary.current_index, 0);
        assert!(summary.error.is_some());
        assert_eq!(engine.status().session.kind, SessionKind::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_then_replay() {
        let (engine, io) = engine();
        let wrist = engine.arbiter().registry().get("wrist_flex").unwrap().clone();
        io.script_reads(&wrist, &[1000, 2000, 3000]);

        assert!(engine.stop_recording().await.is_none());
        engine.start_recording(50).unwrap();
        assert!(engine.start_recording(50).is_err());
        tokio::time::sleep(Duration::from_millis(120)).await;

        let status = engine.status().session;
        assert_eq!(status.kind, SessionKind::Recording);
        assert_eq!(status.frames_captured, 3);

        let rec = engine.stop_recording().await.unwrap();
        assert_eq!(rec.len(), 3);
        assert_eq!(engine.status().session.kind, SessionKind::Idle);

        let json = rec.to_json().unwrap();
        let reloaded = Recording::from_json(&json, engine.arbiter().registry()).unwrap();
        assert_eq!(reloaded.recording, rec);

        engine.start_playback(reloaded.recording).unwrap();
        let summary = engine.wait_playback().await.unwrap();
        assert_eq!(summary.outcome, PlaybackOutcome::Completed);
        assert_eq!(io.position(&wrist), 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_without_calibration() {
        let (engine, _io) = engine();
        for name in engine.arbiter().registry().names() {
            engine.reset(&name).unwrap();
        }
        assert!(matches!(
            engine.start_recording(100),
            Err(ArmError::CalibrationIncomplete { .. })
        ));
        assert_eq!(engine.status().session.kind, SessionKind::Idle);
        assert_eq!(engine.status().calibration.iter().filter(|c| c.complete).count(), 0);
    }

    #[test]
    fn test_capture_and_home() {
        let (engine, io) = engine();
        let gripper = engine.arbiter().registry().get("gripper").unwrap().clone();
        io.set_position(&gripper, 2500);
        assert_eq!(engine.capture_manual("gripper", PointKind::Center).unwrap(), 2500);
        engine.reset("elbow_flex").unwrap();

        // elbow_flex is no longer calibrated, so nothing moves
        assert!(matches!(
            engine.home(&[]),
            Err(ArmError::CalibrationIncomplete { .. })
        ));
        assert!(io.events().is_empty());

        engine
            .home(&["gripper".to_string(), "wrist_roll".to_string()])
            .unwrap();
        assert_eq!(io.position(&gripper), 2500);
        assert!(io.torque(&gripper));
        // No center captured: middle of the range
        let wrist = engine.arbiter().registry().get("wrist_roll").unwrap();
        assert_eq!(io.position(wrist), 2000);
        assert!(engine
            .status()
            .bus
            .iter()
            .all(|b| b.holder.is_none()));
    }

    #[test]
    fn test_home_refused_during_playback_claim() {
        let (engine, _io) = engine();
        let _claim = engine
            .arbiter()
            .claim(&["gripper".to_string()], CommandSource::Playback)
            .unwrap();
        assert!(matches!(
            engine.home(&["gripper".to_string()]),
            Err(ArmError::BusConflict { .. })
        ));
    }

    #[test]
    fn test_home_takes_over_calibration_claim() {
        let (engine, io) = engine();
        let _sweep = engine
            .arbiter()
            .claim(&["gripper".to_string()], CommandSource::Calibration)
            .unwrap();

        engine.home(&["gripper".to_string()]).unwrap();
        let gripper = engine.arbiter().registry().get("gripper").unwrap();
        assert_eq!(io.position(gripper), 2000);
        assert!(io.torque(gripper));
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_of_unknown_actuators_leaves_arm_free() {
        let (engine, _io) = engine();
        assert!(engine.start_playback(recording(&["tail"])).is_err());
        assert_eq!(engine.status().session.kind, SessionKind::Idle);
        assert!(engine.status().bus.iter().all(|b| b.holder.is_none()));
        engine.jog("gripper", 50.0).unwrap();
    }
}
