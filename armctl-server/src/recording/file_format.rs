//! Recording files on disk.
//!
//! Recordings are stored as pretty-printed JSON in the layout defined by
//! [`armctl_core::Recording`]. Files from the earlier Python controller use a
//! different layout, raw ticks keyed by servo ID and times in seconds:
//!
//! ```json
//! {
//!   "name": "recording",
//!   "sample_period_s": 0.1,
//!   "servo_ids": [1, 2, 3, 4, 5, 6],
//!   "frames": [ { "t": 0.0, "pos": { "1": 2048, "2": 1990 } } ]
//! }
//! ```
//!
//! [`import_legacy`] converts those with the current calibration. The legacy
//! `name` is ignored; every legacy file carries the same one.

use log::{debug, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use armctl_core::{ArmError, CalibrationStore, Frame, Recording, ValidatedRecording};

use crate::storage::StorageError;

/// Extension of recording files
pub const RECORDING_EXTENSION: &str = "json";

/// Write a recording, pretty printed with a trailing newline
pub fn write_recording(path: &Path, recording: &Recording) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| StorageError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, recording).map_err(|e| StorageError::json(path, e))?;
    writer
        .write_all(b"\n")
        .and_then(|_| writer.flush())
        .map_err(|e| StorageError::io(path, e))?;
    debug!("Wrote {} frames to {}", recording.len(), path.display());
    Ok(())
}

/// Read and validate a recording. Unknown actuator names are dropped with a warning.
pub fn read_recording(
    path: &Path,
    store: &CalibrationStore,
) -> Result<ValidatedRecording, StorageError> {
    if !path.exists() {
        return Err(StorageError::NotFound(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let recording: Recording =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| StorageError::json(path, e))?;
    let validated = recording.validate(store.registry())?;
    if !validated.dropped.is_empty() {
        warn!(
            "{}: ignoring unknown actuators {:?}",
            path.display(),
            validated.dropped
        );
    }
    Ok(validated)
}

#[derive(Debug, Deserialize)]
struct LegacyFrame {
    t: f64,
    pos: BTreeMap<String, i32>,
}

#[derive(Debug, Deserialize)]
struct LegacyRecording {
    sample_period_s: f64,
    #[serde(default)]
    frames: Vec<LegacyFrame>,
}

/// Result of converting a legacy recording
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyImport {
    pub recording: Recording,
    /// Servos left out: unknown IDs, or actuators without a complete calibration
    pub skipped: Vec<String>,
}

/// Convert a legacy recording to calibrated percentages.
///
/// Offsets are rebased on the first frame. Legacy files hold every servo in
/// every frame, so servos that cannot be normalized are dropped as a whole.
pub fn import_legacy(
    json: &str,
    store: &CalibrationStore,
    created_at: u64,
) -> Result<LegacyImport, ArmError> {
    let legacy: LegacyRecording = serde_json::from_str(json)?;
    if !(legacy.sample_period_s.is_finite() && legacy.sample_period_s > 0.0) {
        return Err(ArmError::invalid("sample_period_s must be positive"));
    }
    let interval_ms = ((legacy.sample_period_s * 1000.0).round() as u64).max(1);
    let registry = store.registry();

    let mut skipped = BTreeSet::new();
    let mut usable: BTreeMap<String, String> = BTreeMap::new();
    for key in legacy.frames.iter().flat_map(|f| f.pos.keys()) {
        if usable.contains_key(key) || skipped.contains(key) {
            continue;
        }
        let actuator = key.parse::<u8>().ok().and_then(|id| registry.by_id(id));
        match actuator {
            Some(a) if store.is_complete(&a.name) => {
                usable.insert(key.clone(), a.name.clone());
            }
            Some(a) => {
                skipped.insert(a.name.clone());
            }
            None => {
                skipped.insert(key.clone());
            }
        }
    }

    let base_t = legacy.frames.first().map(|f| f.t).unwrap_or(0.0);
    let mut recording = Recording::new(interval_ms, created_at);
    for (i, legacy_frame) in legacy.frames.iter().enumerate() {
        let offset = ((legacy_frame.t - base_t) * 1000.0).round();
        if !offset.is_finite() || offset < 0.0 {
            return Err(ArmError::invalid(format!(
                "frame {} time {}s precedes the first frame",
                i, legacy_frame.t
            )));
        }
        let mut frame = Frame::new(offset as u64);
        for (key, raw) in &legacy_frame.pos {
            if let Some(name) = usable.get(key) {
                frame = frame.with(name, store.to_percentage(name, *raw)?);
            }
        }
        recording.push(frame)?;
    }

    let skipped: Vec<String> = skipped.into_iter().collect();
    if !skipped.is_empty() {
        warn!("Legacy import skipped {:?}", skipped);
    }
    Ok(LegacyImport {
        recording,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use armctl_core::{ActuatorRegistry, CalibrationProfile};
    use tempfile::TempDir;

    fn store() -> CalibrationStore {
        let mut store = CalibrationStore::new(ActuatorRegistry::so101());
        store
            .replace("shoulder_pan", CalibrationProfile::new(1000, None, 3000))
            .unwrap();
        store
            .replace("gripper", CalibrationProfile::new(2400, None, 2000))
            .unwrap();
        store
    }

    #[test]
    fn test_write_then_read_preserves_frames() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("wave.json");
        let mut rec = Recording::new(100, 1_760_000_000_000);
        rec.push(Frame::new(0).with("gripper", 12.5)).unwrap();
        rec.push(Frame::new(104).with("gripper", 80.0)).unwrap();

        write_recording(&path, &rec).unwrap();
        assert!(fs::read_to_string(&path).unwrap().ends_with("}\n"));
        let loaded = read_recording(&path, &store()).unwrap();
        assert_eq!(loaded.recording, rec);
        assert!(loaded.dropped.is_empty());
    }

    #[test]
    fn test_read_drops_unknown_actuators() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("other_arm.json");
        fs::write(
            &path,
            r#"{"interval_ms": 50, "created_at": 0, "frames": [
                {"timestamp_offset_ms": 0, "positions": {"gripper": 10.0, "tail": 3.0}}
            ]}"#,
        )
        .unwrap();
        let loaded = read_recording(&path, &store()).unwrap();
        assert_eq!(loaded.dropped, vec!["tail"]);
        assert_eq!(loaded.recording.frames[0].positions.len(), 1);
    }

    #[test]
    fn test_read_errors() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.json");
        assert!(matches!(
            read_recording(&missing, &store()),
            Err(StorageError::NotFound(_))
        ));

        let bad = temp.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            read_recording(&bad, &store()),
            Err(StorageError::Json { .. })
        ));

        let backwards = temp.path().join("backwards.json");
        fs::write(
            &backwards,
            r#"{"interval_ms": 50, "created_at": 0, "frames": [
                {"timestamp_offset_ms": 100, "positions": {}},
                {"timestamp_offset_ms": 50, "positions": {}}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            read_recording(&backwards, &store()),
            Err(StorageError::Arm(ArmError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn test_import_legacy() {
        let json = r#"{
            "name": "recording",
            "sample_period_s": 0.05,
            "servo_ids": [1, 2, 3, 4, 5, 6],
            "frames": [
                {"t": 12.5, "pos": {"1": 1000, "2": 2048, "6": 2400, "9": 7}},
                {"t": 12.551, "pos": {"1": 2000, "2": 2048, "6": 2100, "9": 7}}
            ]
        }"#;
        let import = import_legacy(json, &store(), 42).unwrap();
        assert_eq!(import.skipped, vec!["9", "shoulder_lift"]);

        let rec = import.recording;
        assert_eq!(rec.interval_ms, 50);
        assert_eq!(rec.created_at, 42);
        assert_eq!(rec.frames[0], Frame::new(0).with("shoulder_pan", 0.0).with("gripper", 0.0));
        assert_eq!(
            rec.frames[1],
            Frame::new(51).with("shoulder_pan", 50.0).with("gripper", 75.0)
        );
    }

    #[test]
    fn test_import_legacy_rejects_bad_period() {
        let json = r#"{"sample_period_s": 0, "servo_ids": [], "frames": []}"#;
        assert!(matches!(
            import_legacy(json, &store(), 0),
            Err(ArmError::InvalidArgument(_))
        ));
    }
}
