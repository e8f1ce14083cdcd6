//! Command execution for the `armctl` binary.
//!
//! Each command opens what it needs (settings, calibration file, transport),
//! does its work and persists calibration changes before returning.
//! Long-running commands (`calibrate`, `record`, `play`) stop cleanly when
//! the subsystem is asked to shut down (Ctrl-C).

use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;

use armctl_core::{ActuatorRegistry, CalibrationStore, Transport};

use crate::calibration::SweepProgress;
use crate::config::{settings_path, Settings};
use crate::engine::MotionEngine;
use crate::recording::{import_legacy, read_recording, RecordingManager};
use crate::storage::{default_calibration_path, CalibrationFile};
use crate::transport::{self, available_ports, EmulatorTransport};
use crate::{Cli, Command, CommandError};

/// Everything a command may need, resolved from flags and stored settings
struct Context {
    cli: Cli,
    settings: Settings,
    calibration_file: CalibrationFile,
}

impl Context {
    fn new(cli: Cli) -> Result<Self, CommandError> {
        let settings = Settings::load(&settings_path()?);
        let calibration_path = match &cli.calibration {
            Some(path) => path.clone(),
            None => default_calibration_path()?,
        };
        Ok(Self {
            cli,
            settings,
            calibration_file: CalibrationFile::new(calibration_path),
        })
    }

    /// Settings with command line overrides applied
    fn effective_settings(&self) -> Settings {
        let mut settings = self.settings.clone();
        if let Some(port) = &self.cli.port {
            settings.port = Some(port.clone());
        }
        if let Some(baud) = self.cli.baud {
            settings.baud = baud;
        }
        settings
    }

    fn load_calibration(&self) -> Result<CalibrationStore, CommandError> {
        let mut store = CalibrationStore::new(ActuatorRegistry::so101());
        self.calibration_file.load_into(&mut store)?;
        Ok(store)
    }

    fn open_engine(&self) -> Result<MotionEngine, CommandError> {
        let store = self.load_calibration()?;
        let settings = self.effective_settings();
        let transport = transport::open(
            settings.port.as_deref(),
            settings.baud,
            self.cli.emulator,
            store.registry(),
        )?;
        Ok(MotionEngine::new(transport, store))
    }

    fn save_calibration(&self, engine: &MotionEngine) -> Result<(), CommandError> {
        self.calibration_file.save(&engine.calibration_snapshot())?;
        info!("Calibration saved to {}", self.calibration_file.path().display());
        Ok(())
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CommandError> {
    let text = serde_json::to_string_pretty(value).map_err(armctl_core::ArmError::from)?;
    println!("{}", text);
    Ok(())
}

/// Run one command to completion
pub async fn run(cli: Cli, subsys: SubsystemHandle) -> Result<(), CommandError> {
    let command = cli.command.clone();
    let ctx = Context::new(cli)?;
    debug!("armctl {} running {:?}", crate::VERSION, command);

    match command {
        Command::Ports => {
            let ports = if ctx.cli.emulator {
                EmulatorTransport::new(&ActuatorRegistry::so101()).list_ports()
            } else {
                available_ports()
            };
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                match port.description {
                    Some(d) => println!("{}\t{}", port.name, d),
                    None => println!("{}", port.name),
                }
            }
        }

        Command::Status => {
            let engine = ctx.open_engine()?;
            print_json(&engine.status())?;
        }

        Command::Calibrate {
            actuators,
            sample_interval_ms,
            samples,
        } => {
            let engine = ctx.open_engine()?;
            let mut options = ctx.settings.sweep;
            if let Some(ms) = sample_interval_ms {
                options.sample_interval = Duration::from_millis(ms);
            }
            if let Some(n) = samples {
                options.samples_per_actuator = n;
            }

            let (tx, mut rx) = mpsc::unbounded_channel::<SweepProgress>();
            let printer = tokio::spawn(async move {
                while let Some(p) = rx.recv().await {
                    println!(
                        "[{:>6.1}s] {:<14} {}",
                        p.elapsed.as_secs_f64(),
                        p.actuator,
                        p.message
                    );
                }
            });

            let cancel = subsys.create_cancellation_token();
            let reports = engine
                .run_auto_sweep(&actuators, options, &tx, &cancel)
                .await;
            drop(tx);
            let _ = printer.await;
            let reports = reports?;

            ctx.save_calibration(&engine)?;
            let cancelled = reports.iter().filter(|r| r.is_cancelled()).count();
            if cancelled > 0 {
                println!("Calibration cancelled, {} actuator(s) left as they were", cancelled);
            }
            let failed = reports
                .iter()
                .filter(|r| !r.is_ok() && !r.is_cancelled())
                .count();
            if failed > 0 {
                return Err(CommandError::Partial {
                    failed,
                    total: reports.len(),
                });
            }
        }

        Command::Capture { actuator, point } => {
            let engine = ctx.open_engine()?;
            let raw = engine.capture_manual(&actuator, point)?;
            ctx.save_calibration(&engine)?;
            println!("{} {} = {}", actuator, point, raw);
        }

        Command::Reset { actuator } => {
            let engine = ctx.open_engine()?;
            engine.reset(&actuator)?;
            ctx.save_calibration(&engine)?;
        }

        Command::Home { actuators } => {
            ctx.open_engine()?.home(&actuators)?;
        }

        Command::Lock { actuators } => {
            ctx.open_engine()?.lock(&actuators)?;
        }

        Command::Release { actuators } => {
            ctx.open_engine()?.release(&actuators)?;
        }

        Command::Jog {
            actuator,
            percentage,
        } => {
            let raw = ctx.open_engine()?.jog(&actuator, percentage)?;
            println!("{} -> {}", actuator, raw);
        }

        Command::Record {
            interval_ms,
            duration_s,
            name,
        } => {
            let engine = ctx.open_engine()?;
            let manager = RecordingManager::new()?;
            let interval_ms = interval_ms.unwrap_or(ctx.settings.recording_interval_ms);

            // Free the joints so the arm can be guided by hand
            engine.release(&[])?;
            engine.start_recording(interval_ms)?;
            println!("Recording every {}ms, press Ctrl-C to stop", interval_ms);

            match duration_s {
                Some(secs) => {
                    tokio::select! {
                        _ = subsys.on_shutdown_requested() => {}
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    }
                }
                None => subsys.on_shutdown_requested().await,
            }

            if let Some(e) = engine.session_status().error {
                warn!("Recording ended early: {}", e);
            }
            let recording = engine.stop_recording().await;
            if let Err(e) = engine.lock(&[]) {
                warn!("Could not lock the arm after recording: {}", e);
            }

            let Some(recording) = recording.filter(|r| !r.is_empty()) else {
                println!("Nothing recorded");
                return Ok(());
            };
            let filename = match name {
                Some(n) => n,
                None => manager.generate_filename(None),
            };
            let info = manager.save(&filename, &recording)?;
            println!(
                "Saved {} ({} frames, {:.1}s)",
                info.filename,
                info.frame_count,
                info.duration_ms as f64 / 1000.0
            );
        }

        Command::Play { recording } => {
            let engine = ctx.open_engine()?;
            let path = PathBuf::from(&recording);
            let validated = if path.is_file() {
                read_recording(&path, &engine.calibration_snapshot())?
            } else {
                RecordingManager::new()?.load(&recording, &engine.calibration_snapshot())?
            };

            engine.start_playback(validated.recording)?;
            let summary = tokio::select! {
                summary = engine.wait_playback() => summary,
                _ = subsys.on_shutdown_requested() => engine.stop_playback().await,
            };
            match summary {
                Some(s) => {
                    println!(
                        "Playback {}: frame {}/{} ({:.0}%)",
                        s.outcome, s.current_index, s.total_frames, s.progress
                    );
                    if let Some(e) = s.error {
                        return Err(CommandError::Playback(e));
                    }
                }
                None => println!("Playback ended"),
            }
        }

        Command::Recordings => {
            let manager = RecordingManager::new()?;
            let recordings = manager.list_recordings();
            if recordings.is_empty() {
                println!("No recordings in {}", manager.base_dir().display());
            }
            for r in recordings {
                println!(
                    "{:<36} {:>6} frames {:>8.1}s  {}",
                    r.filename,
                    r.frame_count,
                    r.duration_ms as f64 / 1000.0,
                    r.actuators.join(",")
                );
            }
        }

        Command::Delete { recording } => {
            RecordingManager::new()?.delete(&recording)?;
            println!("Deleted {}", recording);
        }

        Command::Import { file, name } => {
            let store = ctx.load_calibration()?;
            let json = std::fs::read_to_string(&file)
                .map_err(|e| crate::storage::StorageError::io(&file, e))?;
            let created_at = chrono::Utc::now().timestamp_millis().max(0) as u64;
            let import = import_legacy(&json, &store, created_at)?;

            let manager = RecordingManager::new()?;
            let filename = match name {
                Some(n) => n,
                None => manager.generate_filename(Some("imported")),
            };
            let info = manager.save(&filename, &import.recording)?;
            println!("Imported {} frames into {}", info.frame_count, info.filename);
            if !import.skipped.is_empty() {
                println!("Skipped (unknown or uncalibrated): {}", import.skipped.join(", "));
            }
        }

        Command::Config { save } => {
            let settings = ctx.effective_settings();
            print_json(&settings)?;
            if save {
                settings.save(&settings_path()?)?;
            }
        }
    }

    Ok(())
}
