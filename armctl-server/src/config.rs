//! Persistent settings and well-known directories.
//!
//! Settings live in `settings.json` in the config directory
//! (`~/.config/armctl/` on Linux). Command line flags override them for a
//! single run; `armctl config --save` writes the effective values back.

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::calibration::SweepOptions;
use crate::storage::StorageError;
use crate::transport::DEFAULT_BAUD;

pub fn get_project_dirs() -> Result<ProjectDirs, StorageError> {
    ProjectDirs::from("org", "so-arm", "armctl").ok_or(StorageError::NoProjectDirs)
}

pub fn settings_path() -> Result<PathBuf, StorageError> {
    let mut path = get_project_dirs()?.config_dir().to_owned();
    path.push("settings.json");
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Serial port of the servo bus
    pub port: Option<String>,
    pub baud: u32,
    /// Sample interval for new recordings
    pub recording_interval_ms: u64,
    pub sweep: SweepOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: None,
            baud: DEFAULT_BAUD,
            recording_interval_ms: 100,
            sweep: SweepOptions::default(),
        }
    }
}

impl Settings {
    /// Load from `path`; a missing or unreadable file yields the defaults
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Self::default();
        }
        match fs::read_to_string(path).map(|text| serde_json::from_str::<Settings>(&text)) {
            Ok(Ok(settings)) => {
                debug!("Loaded settings from {}", path.display());
                settings
            }
            Ok(Err(e)) => {
                warn!("Ignoring malformed settings {}: {}", path.display(), e);
                Self::default()
            }
            Err(e) => {
                warn!("Cannot read settings {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| StorageError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|e| StorageError::json(path, e))?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|e| StorageError::io(path, e))?;
        info!("Stored settings -> {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load(&temp.path().join("settings.json"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.baud, 1_000_000);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("armctl").join("settings.json");
        let settings = Settings {
            port: Some("/dev/ttyACM0".to_string()),
            recording_interval_ms: 40,
            sweep: SweepOptions {
                sample_interval: Duration::from_millis(25),
                samples_per_actuator: 200,
            },
            ..Default::default()
        };
        settings.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"recordingIntervalMs\": 40"));
        assert!(text.contains("\"sampleInterval\": 25"));
        assert_eq!(Settings::load(&path), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        fs::write(&path, r#"{"port": "COM3"}"#).unwrap();
        let settings = Settings::load(&path);
        assert_eq!(settings.port.as_deref(), Some("COM3"));
        assert_eq!(settings.recording_interval_ms, 100);

        fs::write(&path, "not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }
}
