//! Control arbiter
//!
//! Every write to an actuator goes through here. Ownership is tracked per
//! actuator, so a sweep of one joint and a manual jog of another can run at
//! the same time. Precedence:
//!
//! | holder \ source | manual   | homing   | calibration | playback |
//! |-----------------|----------|----------|-------------|----------|
//! | none            | accepted | accepted | accepted    | rejected |
//! | homing          | conflict | accepted | accepted    | rejected |
//! | calibration     | conflict | accepted | accepted    | rejected |
//! | playback        | conflict | conflict | conflict    | accepted |
//!
//! Sessions take a [`BusClaim`] over the actuators they drive. Claims follow
//! the same table: homing takes over a calibration or homing claim, every
//! other live claim is a conflict. Releasing
//! torque under a playback claim cancels that claim's token, which the
//! playback driver observes and aborts on.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use armctl_core::state::{BusStatus, TorqueState};
use armctl_core::{
    normalize, Actuator, ActuatorCommand, ActuatorRegistry, ArmError, CalibrationStore,
    CommandSource,
};

use crate::transport::SharedTransport;

pub type SharedCalibration = Arc<RwLock<CalibrationStore>>;

#[derive(Debug)]
struct Claim {
    id: u64,
    source: CommandSource,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct BusState {
    torque: TorqueState,
    claim: Option<Claim>,
    last_raw: Option<i32>,
}

impl BusState {
    /// Live claim, ignoring one whose token was already cancelled
    fn holder(&self) -> Option<CommandSource> {
        self.claim
            .as_ref()
            .filter(|c| !c.token.is_cancelled())
            .map(|c| c.source)
    }
}

/// Ownership of a set of actuators by one session
#[derive(Debug)]
pub struct BusClaim {
    id: u64,
    actuators: Vec<String>,
    token: CancellationToken,
}

impl BusClaim {
    pub fn actuators(&self) -> &[String] {
        &self.actuators
    }

    /// Cancelled when the claim is revoked (torque released under playback)
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_revoked(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct Arbiter {
    registry: ActuatorRegistry,
    transport: SharedTransport,
    calibration: SharedCalibration,
    buses: HashMap<String, Mutex<BusState>>,
    next_claim: AtomicU64,
}

impl Arbiter {
    pub fn new(transport: SharedTransport, calibration: CalibrationStore) -> Self {
        let registry = calibration.registry().clone();
        let buses = registry
            .iter()
            .map(|a| (a.name.clone(), Mutex::new(BusState::default())))
            .collect();
        Self {
            registry,
            transport,
            calibration: Arc::new(RwLock::new(calibration)),
            buses,
            next_claim: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &ActuatorRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn calibration(&self) -> RwLockReadGuard<'_, CalibrationStore> {
        self.calibration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calibration_mut(&self) -> RwLockWriteGuard<'_, CalibrationStore> {
        self.calibration
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bus(&self, actuator: &str) -> Result<MutexGuard<'_, BusState>, ArmError> {
        let bus = self
            .buses
            .get(actuator)
            .ok_or_else(|| ArmError::UnknownActuator(actuator.to_string()))?;
        Ok(bus.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Convert and write one command, subject to bus ownership.
    ///
    /// Returns the raw tick that was written.
    pub fn submit(&self, cmd: &ActuatorCommand) -> Result<i32, ArmError> {
        let actuator = self.registry.require(&cmd.actuator)?;
        let mut bus = self.bus(&actuator.name)?;

        match (cmd.source, bus.holder()) {
            (CommandSource::Playback, Some(CommandSource::Playback)) => {}
            (CommandSource::Playback, Some(holder)) => {
                return Err(ArmError::conflict(&actuator.name, holder))
            }
            (CommandSource::Playback, None) => {
                return Err(ArmError::invalid(format!(
                    "playback command for '{}' without a playback claim",
                    actuator.name
                )))
            }
            (CommandSource::Manual, Some(holder)) => {
                return Err(ArmError::conflict(&actuator.name, holder))
            }
            (_, Some(CommandSource::Playback)) => {
                return Err(ArmError::conflict(&actuator.name, CommandSource::Playback))
            }
            _ => {}
        }

        let profile = self.calibration().complete_profile(&actuator.name)?;
        let raw = normalize::to_raw(&actuator.name, &profile, cmd.percentage)?;
        self.transport.write_raw_position(actuator, raw)?;
        bus.last_raw = Some(raw);
        Ok(raw)
    }

    /// Take ownership of `actuators` for a session.
    ///
    /// The names are taken literally; an empty list claims nothing and is
    /// `InvalidArgument`. All or nothing: if any actuator has a live claim
    /// that `source` may not take over, the whole request fails with
    /// `BusConflict` and nothing changes.
    pub fn claim(&self, actuators: &[String], source: CommandSource) -> Result<BusClaim, ArmError> {
        if source == CommandSource::Manual {
            return Err(ArmError::invalid("manual control cannot claim the bus"));
        }
        if actuators.is_empty() {
            return Err(ArmError::invalid("a bus claim needs at least one actuator"));
        }
        let selected = self.registry.select(actuators)?;

        // Lock in registry order so concurrent claims cannot deadlock
        let mut guards = Vec::with_capacity(selected.len());
        for a in &selected {
            let bus = self.bus(&a.name)?;
            match (source, bus.holder()) {
                (_, None) => {}
                (CommandSource::Homing, Some(CommandSource::Homing | CommandSource::Calibration)) => {}
                (_, Some(holder)) => return Err(ArmError::conflict(&a.name, holder)),
            }
            guards.push(bus);
        }
        for (a, bus) in selected.iter().zip(&guards) {
            if let Some(holder) = bus.holder() {
                info!("{} taken over from {} by {}", a.name, holder, source);
            }
        }

        let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        for bus in guards.iter_mut() {
            bus.claim = Some(Claim {
                id,
                source,
                token: token.clone(),
            });
        }
        let names: Vec<String> = selected.iter().map(|a| a.name.clone()).collect();
        debug!("Bus claim {} by {} on {:?}", id, source, names);

        Ok(BusClaim {
            id,
            actuators: names,
            token,
        })
    }

    /// Give back a claim. Actuators already taken over by someone else are left alone.
    pub fn release_claim(&self, claim: &BusClaim) {
        for name in &claim.actuators {
            if let Ok(mut bus) = self.bus(name) {
                if bus.claim.as_ref().map(|c| c.id) == Some(claim.id) {
                    bus.claim = None;
                }
            }
        }
        debug!("Bus claim {} released", claim.id);
    }

    /// Hold the present position and engage torque.
    ///
    /// The goal register is set to the present position first so the joint
    /// does not jump. Every actuator is attempted; the first error is returned.
    pub fn lock(&self, actuators: &[String]) -> Result<(), ArmError> {
        let mut first_error = None;
        for a in self.registry.select(actuators)? {
            if let Err(e) = self.hold_and_lock(a) {
                warn!("Cannot lock {}: {}", a.name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn hold_and_lock(&self, actuator: &Actuator) -> Result<(), ArmError> {
        let mut bus = self.bus(&actuator.name)?;
        let present = self.transport.read_raw_position(actuator)?;
        self.transport.write_raw_position(actuator, present)?;
        self.transport.set_torque(actuator, true)?;
        bus.torque = TorqueState::Locked;
        bus.last_raw = Some(present);
        debug!("{} locked at {}", actuator.name, present);
        Ok(())
    }

    /// Engage torque without touching the goal register
    pub(crate) fn engage(&self, actuator: &str) -> Result<(), ArmError> {
        let a = self.registry.require(actuator)?;
        let mut bus = self.bus(actuator)?;
        self.transport.set_torque(a, true)?;
        bus.torque = TorqueState::Locked;
        Ok(())
    }

    /// Disengage torque. Always allowed, whoever holds the bus.
    ///
    /// A playback claim on a released actuator is revoked, which aborts the
    /// playback at its next step.
    pub fn release(&self, actuators: &[String]) -> Result<(), ArmError> {
        let mut first_error = None;
        for a in self.registry.select(actuators)? {
            let mut bus = self.bus(&a.name)?;
            if let Some(claim) = bus
                .claim
                .take_if(|c| c.source == CommandSource::Playback)
            {
                info!("Releasing {} aborts playback claim {}", a.name, claim.id);
                claim.token.cancel();
            }
            match self.transport.set_torque(a, false) {
                Ok(()) => bus.torque = TorqueState::Released,
                Err(e) => {
                    warn!("Cannot release {}: {}", a.name, e);
                    first_error.get_or_insert(ArmError::from(e));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn read_raw(&self, actuator: &str) -> Result<i32, ArmError> {
        let a = self.registry.require(actuator)?;
        Ok(self.transport.read_raw_position(a)?)
    }

    /// Present position as a calibrated percentage
    pub fn read_percentage(&self, actuator: &str) -> Result<f64, ArmError> {
        let raw = self.read_raw(actuator)?;
        self.calibration().to_percentage(actuator, raw)
    }

    /// Ownership snapshot in registry order
    pub fn bus_status(&self) -> Vec<BusStatus> {
        self.registry
            .iter()
            .filter_map(|a| {
                let bus = self.bus(&a.name).ok()?;
                Some(BusStatus {
                    actuator: a.name.clone(),
                    torque: bus.torque,
                    holder: bus.holder(),
                    last_raw: bus.last_raw,
                })
            })
            .collect()
    }

    pub fn holder(&self, actuator: &str) -> Result<Option<CommandSource>, ArmError> {
        Ok(self.bus(actuator)?.holder())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{BusEvent, EmulatorTransport};
    use armctl_core::CalibrationProfile;

    /// Arbiter over an emulated bus with every actuator calibrated to 1000..3000
    pub(crate) fn calibrated_arbiter() -> (Arc<Arbiter>, Arc<EmulatorTransport>) {
        let registry = ActuatorRegistry::so101();
        let io = Arc::new(EmulatorTransport::new(&registry));
        let mut store = CalibrationStore::new(registry.clone());
        for a in registry.iter() {
            store
                .replace(&a.name, CalibrationProfile::new(1000, Some(2000), 3000))
                .unwrap();
        }
        let arbiter = Arc::new(Arbiter::new(io.clone(), store));
        (arbiter, io)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_manual_submit_writes_raw() {
        let (arbiter, io) = calibrated_arbiter();
        let raw = arbiter
            .submit(&ActuatorCommand::manual("gripper", 25.0))
            .unwrap();
        assert_eq!(raw, 1500);
        assert_eq!(io.writes_to("gripper"), vec![1500]);
        assert_eq!(arbiter.bus_status()[5].last_raw, Some(1500));
    }

    #[test]
    fn test_manual_rejected_while_claimed() {
        let (arbiter, io) = calibrated_arbiter();
        let claim = arbiter
            .claim(&names(&["elbow_flex"]), CommandSource::Playback)
            .unwrap();

        let err = arbiter
            .submit(&ActuatorCommand::manual("elbow_flex", 50.0))
            .unwrap_err();
        assert_eq!(err, ArmError::conflict("elbow_flex", CommandSource::Playback));
        // Other actuators are unaffected
        assert!(arbiter
            .submit(&ActuatorCommand::manual("gripper", 50.0))
            .is_ok());
        // Homing does not preempt playback
        assert!(matches!(
            arbiter.submit(&ActuatorCommand::new("elbow_flex", 10.0, CommandSource::Homing)),
            Err(ArmError::BusConflict { .. })
        ));
        assert!(arbiter
            .submit(&ActuatorCommand::new("elbow_flex", 50.0, CommandSource::Playback))
            .is_ok());

        arbiter.release_claim(&claim);
        assert!(arbiter
            .submit(&ActuatorCommand::manual("elbow_flex", 50.0))
            .is_ok());
        assert_eq!(io.writes_to("elbow_flex"), vec![2000, 2000]);
    }

    #[test]
    fn test_calibration_claim_blocks_manual_not_homing() {
        let (arbiter, _io) = calibrated_arbiter();
        let _claim = arbiter
            .claim(&names(&["wrist_flex"]), CommandSource::Calibration)
            .unwrap();
        assert!(matches!(
            arbiter.submit(&ActuatorCommand::manual("wrist_flex", 50.0)),
            Err(ArmError::BusConflict {
                holder: CommandSource::Calibration,
                ..
            })
        ));
        assert!(arbiter
            .submit(&ActuatorCommand::new("wrist_flex", 50.0, CommandSource::Homing))
            .is_ok());
    }

    #[test]
    fn test_homing_claim_takes_over_calibration_only() {
        let (arbiter, _io) = calibrated_arbiter();
        let sweep = arbiter
            .claim(&names(&["gripper"]), CommandSource::Calibration)
            .unwrap();
        let homing = arbiter
            .claim(&names(&["gripper"]), CommandSource::Homing)
            .unwrap();
        assert_eq!(arbiter.holder("gripper").unwrap(), Some(CommandSource::Homing));
        // The displaced claim no longer owns anything
        arbiter.release_claim(&sweep);
        assert_eq!(arbiter.holder("gripper").unwrap(), Some(CommandSource::Homing));
        arbiter.release_claim(&homing);

        let _playback = arbiter
            .claim(&names(&["wrist_flex"]), CommandSource::Playback)
            .unwrap();
        assert_eq!(
            arbiter
                .claim(&names(&["wrist_flex"]), CommandSource::Homing)
                .unwrap_err(),
            ArmError::conflict("wrist_flex", CommandSource::Playback)
        );
        let _sweep = arbiter
            .claim(&names(&["elbow_flex"]), CommandSource::Calibration)
            .unwrap();
        assert!(arbiter
            .claim(&names(&["elbow_flex"]), CommandSource::Calibration)
            .is_err());
    }

    #[test]
    fn test_empty_claim_is_rejected() {
        let (arbiter, _io) = calibrated_arbiter();
        assert!(matches!(
            arbiter.claim(&[], CommandSource::Playback),
            Err(ArmError::InvalidArgument(_))
        ));
        assert!(arbiter.bus_status().iter().all(|b| b.holder.is_none()));
    }

    #[test]
    fn test_playback_requires_claim() {
        let (arbiter, _io) = calibrated_arbiter();
        assert!(matches!(
            arbiter.submit(&ActuatorCommand::new("gripper", 50.0, CommandSource::Playback)),
            Err(ArmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_claims_are_all_or_nothing() {
        let (arbiter, _io) = calibrated_arbiter();
        let _sweep = arbiter
            .claim(&names(&["gripper"]), CommandSource::Calibration)
            .unwrap();
        let err = arbiter
            .claim(&names(&["wrist_roll", "gripper"]), CommandSource::Playback)
            .unwrap_err();
        assert_eq!(err, ArmError::conflict("gripper", CommandSource::Calibration));
        assert_eq!(arbiter.holder("wrist_roll").unwrap(), None);
        assert!(arbiter
            .claim(&names(&["gripper"]), CommandSource::Manual)
            .is_err());
    }

    #[test]
    fn test_uncalibrated_submit_fails_without_write() {
        let (arbiter, io) = calibrated_arbiter();
        arbiter.calibration_mut().reset("gripper").unwrap();
        assert_eq!(
            arbiter
                .submit(&ActuatorCommand::manual("gripper", 50.0))
                .unwrap_err(),
            ArmError::incomplete("gripper")
        );
        assert!(io.writes_to("gripper").is_empty());
    }

    #[test]
    fn test_lock_holds_present_position() {
        let (arbiter, io) = calibrated_arbiter();
        let a = arbiter.registry().get("shoulder_lift").unwrap().clone();
        io.set_position(&a, 1234);

        arbiter.lock(&names(&["shoulder_lift"])).unwrap();
        assert_eq!(
            io.events(),
            vec![
                BusEvent::Write {
                    actuator: "shoulder_lift".to_string(),
                    raw: 1234
                },
                BusEvent::Torque {
                    actuator: "shoulder_lift".to_string(),
                    engaged: true
                },
            ]
        );
        assert_eq!(io.position(&a), 1234);
        assert_eq!(arbiter.bus_status()[1].torque, TorqueState::Locked);
    }

    #[test]
    fn test_lock_attempts_every_actuator() {
        let (arbiter, io) = calibrated_arbiter();
        let pan = arbiter.registry().get("shoulder_pan").unwrap().clone();
        io.fail_reads(&pan, true);

        let err = arbiter.lock(&[]).unwrap_err();
        assert!(err.is_transport());
        let status = arbiter.bus_status();
        assert_eq!(status[0].torque, TorqueState::Unknown);
        assert!(status[1..].iter().all(|b| b.torque == TorqueState::Locked));
    }

    #[test]
    fn test_release_revokes_playback_claim() {
        let (arbiter, io) = calibrated_arbiter();
        let claim = arbiter
            .claim(&names(&["elbow_flex", "gripper"]), CommandSource::Playback)
            .unwrap();

        arbiter.release(&names(&["gripper"])).unwrap();
        assert!(claim.is_revoked());
        assert!(!io.torque(arbiter.registry().get("gripper").unwrap()));
        // Revoked everywhere: the shared token is cancelled
        assert_eq!(arbiter.holder("elbow_flex").unwrap(), None);
        assert!(arbiter
            .submit(&ActuatorCommand::manual("gripper", 10.0))
            .is_ok());
    }

    #[test]
    fn test_release_keeps_calibration_claim() {
        let (arbiter, _io) = calibrated_arbiter();
        let claim = arbiter
            .claim(&names(&["gripper"]), CommandSource::Calibration)
            .unwrap();
        arbiter.release(&names(&["gripper"])).unwrap();
        assert!(!claim.is_revoked());
        assert_eq!(
            arbiter.holder("gripper").unwrap(),
            Some(CommandSource::Calibration)
        );
    }

    #[test]
    fn test_stale_release_claim_is_ignored() {
        let (arbiter, _io) = calibrated_arbiter();
        let first = arbiter
            .claim(&names(&["gripper"]), CommandSource::Playback)
            .unwrap();
        arbiter.release(&names(&["gripper"])).unwrap();
        let second = arbiter
            .claim(&names(&["gripper"]), CommandSource::Playback)
            .unwrap();

        arbiter.release_claim(&first);
        assert_eq!(
            arbiter.holder("gripper").unwrap(),
            Some(CommandSource::Playback)
        );
        arbiter.release_claim(&second);
        assert_eq!(arbiter.holder("gripper").unwrap(), None);
    }
}
