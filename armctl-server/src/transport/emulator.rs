//! In-memory servo bus.
//!
//! Used by `--emulator` to exercise the controller without an arm attached,
//! and by the tests as a scripted bus: readings can be queued per actuator,
//! failures injected, and every write is logged for inspection.

use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use armctl_core::io::{PortInfo, Transport, TransportError};
use armctl_core::{Actuator, ActuatorRegistry};

/// One operation seen on the emulated bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Write { actuator: String, raw: i32 },
    Torque { actuator: String, engaged: bool },
}

#[derive(Debug, Clone, Default)]
struct Servo {
    position: i32,
    goal: Option<i32>,
    torque: bool,
    scripted: VecDeque<i32>,
    fail_reads: bool,
    /// Writes left before every further write fails
    writes_until_failure: Option<usize>,
}

#[derive(Debug, Default)]
struct EmulatorState {
    servos: HashMap<u8, Servo>,
    log: Vec<BusEvent>,
}

pub struct EmulatorTransport {
    state: Mutex<EmulatorState>,
}

impl EmulatorTransport {
    /// Every servo starts at mid-scale with torque off, like freshly powered hardware
    pub fn new(registry: &ActuatorRegistry) -> Self {
        let servos = registry
            .iter()
            .map(|a| {
                (
                    a.id,
                    Servo {
                        position: (a.raw_min + a.raw_max) / 2,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(EmulatorState {
                servos,
                log: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_servo<T>(&self, actuator: &Actuator, f: impl FnOnce(&mut Servo) -> T) -> T {
        let mut state = self.state();
        f(state.servos.entry(actuator.id).or_default())
    }

    /// Move a joint as if by hand
    pub fn set_position(&self, actuator: &Actuator, raw: i32) {
        self.with_servo(actuator, |s| s.position = raw);
    }

    pub fn position(&self, actuator: &Actuator) -> i32 {
        self.with_servo(actuator, |s| s.position)
    }

    pub fn torque(&self, actuator: &Actuator) -> bool {
        self.with_servo(actuator, |s| s.torque)
    }

    /// Queue readings returned before the live position; the last one sticks
    pub fn script_reads(&self, actuator: &Actuator, samples: &[i32]) {
        self.with_servo(actuator, |s| s.scripted.extend(samples.iter().copied()));
    }

    pub fn fail_reads(&self, actuator: &Actuator, fail: bool) {
        self.with_servo(actuator, |s| s.fail_reads = fail);
    }

    /// Allow `after` more writes to this actuator, then fail every write
    pub fn fail_writes_after(&self, actuator: &Actuator, after: usize) {
        self.with_servo(actuator, |s| s.writes_until_failure = Some(after));
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.state().log.clone()
    }

    /// Raw ticks written to one actuator, in order
    pub fn writes_to(&self, actuator: &str) -> Vec<i32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BusEvent::Write { actuator: a, raw } if a == actuator => Some(raw),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        self.state().log.clear();
    }
}

impl Transport for EmulatorTransport {
    fn read_raw_position(&self, actuator: &Actuator) -> Result<i32, TransportError> {
        self.with_servo(actuator, |s| {
            if s.fail_reads {
                return Err(TransportError::timeout(actuator.id));
            }
            if let Some(raw) = s.scripted.pop_front() {
                s.position = raw;
            }
            Ok(s.position)
        })
    }

    fn write_raw_position(&self, actuator: &Actuator, raw: i32) -> Result<(), TransportError> {
        let mut state = self.state();
        let servo = state.servos.entry(actuator.id).or_default();
        match servo.writes_until_failure {
            Some(0) => return Err(TransportError::timeout(actuator.id)),
            Some(n) => servo.writes_until_failure = Some(n - 1),
            None => {}
        }
        let raw = actuator.clamp_raw(raw);
        servo.goal = Some(raw);
        if servo.torque {
            servo.position = raw;
        }
        state.log.push(BusEvent::Write {
            actuator: actuator.name.clone(),
            raw,
        });
        Ok(())
    }

    fn set_torque(&self, actuator: &Actuator, engaged: bool) -> Result<(), TransportError> {
        let mut state = self.state();
        let servo = state.servos.entry(actuator.id).or_default();
        servo.torque = engaged;
        // An engaged servo drives to its goal register
        if let (true, Some(goal)) = (engaged, servo.goal) {
            servo.position = goal;
        }
        state.log.push(BusEvent::Torque {
            actuator: actuator.name.clone(),
            engaged,
        });
        debug!(
            "emulator: torque {} on {}",
            if engaged { "on" } else { "off" },
            actuator.name
        );
        Ok(())
    }

    fn list_ports(&self) -> Vec<PortInfo> {
        vec![PortInfo {
            name: "emulator".to_string(),
            description: Some("In-memory servo bus".to_string()),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reads_then_live_position() {
        let registry = ActuatorRegistry::so101();
        let io = EmulatorTransport::new(&registry);
        let a = registry.get("gripper").unwrap();

        assert_eq!(io.read_raw_position(a).unwrap(), 2047);
        io.script_reads(a, &[10, 90]);
        assert_eq!(io.read_raw_position(a).unwrap(), 10);
        assert_eq!(io.read_raw_position(a).unwrap(), 90);
        assert_eq!(io.read_raw_position(a).unwrap(), 90);
    }

    #[test]
    fn test_writes_move_only_with_torque() {
        let registry = ActuatorRegistry::so101();
        let io = EmulatorTransport::new(&registry);
        let a = registry.get("elbow_flex").unwrap();

        io.write_raw_position(a, 1000).unwrap();
        assert_eq!(io.position(a), 2047);
        io.set_torque(a, true).unwrap();
        assert_eq!(io.position(a), 1000);
        io.write_raw_position(a, 1200).unwrap();
        assert_eq!(io.position(a), 1200);
        assert_eq!(io.writes_to("elbow_flex"), vec![1000, 1200]);
    }

    #[test]
    fn test_injected_failures() {
        let registry = ActuatorRegistry::so101();
        let io = EmulatorTransport::new(&registry);
        let a = registry.get("wrist_roll").unwrap();

        io.fail_reads(a, true);
        assert!(io.read_raw_position(a).unwrap_err().is_timeout());

        io.fail_writes_after(a, 1);
        assert!(io.write_raw_position(a, 5).is_ok());
        assert!(io.write_raw_position(a, 6).is_err());
        assert_eq!(io.writes_to("wrist_roll"), vec![5]);
    }
}
