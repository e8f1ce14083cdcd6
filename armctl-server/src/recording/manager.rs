//! Recording file manager.
//!
//! Handles listing, metadata extraction, saving, loading and deletion of
//! recordings in the recordings directory.

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use armctl_core::{CalibrationStore, Recording, ValidatedRecording};

use crate::config::get_project_dirs;
use crate::storage::StorageError;

use super::file_format::{read_recording, write_recording, RECORDING_EXTENSION};

/// Get the recordings directory path
pub fn recordings_dir() -> Result<PathBuf, StorageError> {
    let mut path = get_project_dirs()?.data_dir().to_owned();
    path.push("recordings");
    Ok(path)
}

/// Information about a recording file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingInfo {
    /// Filename (without path)
    pub filename: String,
    /// Full path to the file
    #[serde(skip_serializing)]
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Recording duration in milliseconds
    pub duration_ms: u64,
    /// Number of frames
    pub frame_count: usize,
    /// Nominal sample interval
    pub interval_ms: u64,
    /// Creation time (Unix timestamp ms)
    pub created_at: u64,
    /// File modification time (Unix timestamp ms)
    pub modified_ms: u64,
    /// Actuators present in at least one frame
    pub actuators: Vec<String>,
}

/// Manager for recording files
pub struct RecordingManager {
    base_dir: PathBuf,
}

impl RecordingManager {
    /// Create a new RecordingManager in the default data directory
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_base_dir(recordings_dir()?))
    }

    /// Create with a custom base directory
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        if let Err(e) = fs::create_dir_all(&base_dir) {
            error!("Failed to create recordings directory: {}", e);
        } else {
            debug!("Recordings directory: {}", base_dir.display());
        }
        Self { base_dir }
    }

    /// Get the base directory path
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// List all recordings, newest first
    pub fn list_recordings(&self) -> Vec<RecordingInfo> {
        let mut recordings = Vec::new();

        if let Ok(entries) = fs::read_dir(&self.base_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file()
                    && path.extension().is_some_and(|ext| ext == RECORDING_EXTENSION)
                {
                    if let Some(info) = self.get_recording_info(&path) {
                        recordings.push(info);
                    }
                }
            }
        }

        recordings.sort_by(|a, b| {
            b.modified_ms
                .cmp(&a.modified_ms)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        recordings
    }

    /// Get information about a specific recording.
    ///
    /// Files that do not parse as recordings are skipped.
    pub fn get_recording_info(&self, path: &Path) -> Option<RecordingInfo> {
        let filename = path.file_name()?.to_str()?.to_string();

        let metadata = fs::metadata(path).ok()?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let text = fs::read_to_string(path).ok()?;
        let recording: Recording = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                return None;
            }
        };

        Some(RecordingInfo {
            filename,
            path: path.to_path_buf(),
            size: metadata.len(),
            duration_ms: recording.duration_ms(),
            frame_count: recording.len(),
            interval_ms: recording.interval_ms,
            created_at: recording.created_at,
            modified_ms,
            actuators: recording.actuators().into_iter().collect(),
        })
    }

    /// Get full path for a recording
    pub fn get_recording_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    /// Save a recording under `filename` (the extension is added when missing).
    ///
    /// Existing recordings are never overwritten.
    pub fn save(&self, filename: &str, recording: &Recording) -> Result<RecordingInfo, StorageError> {
        let filename = with_extension(filename);
        let path = self.get_recording_path(&filename);
        if !self.is_safe_path(&path) {
            return Err(StorageError::InvalidName(filename));
        }
        if path.exists() {
            return Err(StorageError::Exists(path));
        }
        write_recording(&path, recording)?;
        info!("Saved recording: {}", path.display());
        self.get_recording_info(&path)
            .ok_or(StorageError::NotFound(path))
    }

    /// Load and validate a recording against the store's registry
    pub fn load(
        &self,
        filename: &str,
        store: &CalibrationStore,
    ) -> Result<ValidatedRecording, StorageError> {
        let path = self.resolve(filename)?;
        info!("Loading recording: {}", path.display());
        read_recording(&path, store)
    }

    /// Delete a recording
    pub fn delete(&self, filename: &str) -> Result<(), StorageError> {
        let path = self.resolve(filename)?;
        fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
        info!("Deleted recording: {}", path.display());
        Ok(())
    }

    /// Generate a unique filename for a new recording
    pub fn generate_filename(&self, prefix: Option<&str>) -> String {
        let now = chrono::Local::now();
        let prefix = prefix.unwrap_or("recording");
        let base_name = format!("{}_{}", prefix, now.format("%Y%m%d_%H%M%S"));

        // Find a unique name
        let mut name = format!("{}.{}", base_name, RECORDING_EXTENSION);
        let mut counter = 1;
        while self.base_dir.join(&name).exists() {
            name = format!("{}_{}.{}", base_name, counter, RECORDING_EXTENSION);
            counter += 1;
        }

        name
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf, StorageError> {
        let path = self.get_recording_path(&with_extension(filename));
        if !path.exists() {
            return Err(StorageError::NotFound(path));
        }
        if !self.is_safe_path(&path) {
            return Err(StorageError::InvalidName(filename.to_string()));
        }
        Ok(path)
    }

    /// Check if a path is safely within our base directory
    fn is_safe_path(&self, path: &Path) -> bool {
        let Ok(base) = self.base_dir.canonicalize() else {
            return false;
        };
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&base),
            Err(_) => {
                // Path doesn't exist yet, check parent
                path.parent()
                    .and_then(|p| p.canonicalize().ok())
                    .is_some_and(|p| p.starts_with(&base))
            }
        }
    }
}

fn with_extension(filename: &str) -> String {
    if Path::new(filename)
        .extension()
        .is_some_and(|ext| ext == RECORDING_EXTENSION)
    {
        filename.to_string()
    } else {
        format!("{}.{}", filename, RECORDING_EXTENSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armctl_core::{ActuatorRegistry, Frame};
    use tempfile::TempDir;

    fn create_test_manager() -> (RecordingManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let manager = RecordingManager::with_base_dir(temp_dir.path().to_path_buf());
        (manager, temp_dir)
    }

    fn sample() -> Recording {
        let mut rec = Recording::new(100, 1_760_000_000_000);
        rec.push(Frame::new(0).with("gripper", 10.0)).unwrap();
        rec.push(Frame::new(100).with("gripper", 20.0).with("wrist_roll", 5.0))
            .unwrap();
        rec
    }

    #[test]
    fn test_save_list_load_delete() {
        let (manager, _temp) = create_test_manager();
        let info = manager.save("wave", &sample()).unwrap();
        assert_eq!(info.filename, "wave.json");
        assert_eq!(info.frame_count, 2);
        assert_eq!(info.duration_ms, 100);
        assert_eq!(info.actuators, vec!["gripper", "wrist_roll"]);

        let listed = manager.list_recordings();
        assert_eq!(listed.len(), 1);

        let store = CalibrationStore::new(ActuatorRegistry::so101());
        let loaded = manager.load("wave", &store).unwrap();
        assert_eq!(loaded.recording, sample());

        manager.delete("wave.json").unwrap();
        assert!(manager.list_recordings().is_empty());
        assert!(matches!(
            manager.delete("wave"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_skips_foreign_files() {
        let (manager, temp) = create_test_manager();
        manager.save("a", &sample()).unwrap();
        fs::write(temp.path().join("notes.txt"), "hello").unwrap();
        fs::write(temp.path().join("calibration.json"), "{}").unwrap();
        let names: Vec<String> = manager
            .list_recordings()
            .into_iter()
            .map(|i| i.filename)
            .collect();
        assert_eq!(names, vec!["a.json"]);
    }

    #[test]
    fn test_generate_filename() {
        let (manager, _temp) = create_test_manager();
        let name = manager.generate_filename(None);
        assert!(name.starts_with("recording_"));
        assert!(name.ends_with(".json"));

        manager.save(&name, &sample()).unwrap();
        let second = manager.generate_filename(None);
        assert_ne!(second, name);

        assert!(manager.generate_filename(Some("pick")).starts_with("pick_"));
    }

    #[test]
    fn test_rejects_paths_outside_base() {
        let (manager, _temp) = create_test_manager();
        assert!(matches!(
            manager.save("../escape", &sample()),
            Err(StorageError::InvalidName(_))
        ));
    }

    #[test]
    fn test_save_refuses_existing_name() {
        let (manager, _temp) = create_test_manager();
        manager.save("wave", &sample()).unwrap();

        let mut other = Recording::new(50, 0);
        other.push(Frame::new(0).with("gripper", 90.0)).unwrap();
        assert!(matches!(
            manager.save("wave.json", &other),
            Err(StorageError::Exists(_))
        ));

        let store = CalibrationStore::new(ActuatorRegistry::so101());
        assert_eq!(manager.load("wave", &store).unwrap().recording, sample());
    }

    #[test]
    fn test_list_reports_backwards_offsets_as_zero_length() {
        let (manager, temp) = create_test_manager();
        fs::write(
            temp.path().join("backwards.json"),
            r#"{"interval_ms": 50, "created_at": 0, "frames": [
                {"timestamp_offset_ms": 100, "positions": {"gripper": 10.0}},
                {"timestamp_offset_ms": 50, "positions": {"gripper": 20.0}}
            ]}"#,
        )
        .unwrap();

        let listed = manager.list_recordings();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].duration_ms, 0);
        assert_eq!(listed[0].frame_count, 2);
    }

    #[test]
    fn test_list_empty_directory() {
        let (manager, _temp) = create_test_manager();
        assert!(manager.list_recordings().is_empty());
    }
}
