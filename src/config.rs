//! Appliance configuration loaded from YAML.
//!
//! Every field has a default, so a configuration file only needs to name what
//! it changes:
//!
//! ```rust
//! use vigil::VigilConfig;
//!
//! let config = VigilConfig::parse(
//!     r#"
//! server:
//!   address: "127.0.0.1:0"
//!   workers: 2
//! recording:
//!   override_trigger: 200
//! "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.server.workers, 2);
//! assert_eq!(config.recording.override_trigger, 200);
//! assert_eq!(config.recording.override_buffer, 80);
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, VigilError};

/// Port the recorder listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 23949;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub server: ServerConfig,
    pub recording: RecordingConfig,
    pub accumulator: AccumulatorConfig,
    pub detection: DetectionConfig,
    /// Bound on each thread join during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            recording: RecordingConfig::default(),
            accumulator: AccumulatorConfig::default(),
            detection: DetectionConfig::default(),
            shutdown_timeout_ms: 2000,
        }
    }
}

/// Event-driven server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub workers: usize,
    pub queue_capacity: usize,
    pub read_chunk_bytes: usize,
    /// Largest message payload a connection may announce before it is dropped.
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            workers: 1,
            queue_capacity: crate::queue::DEFAULT_QUEUE_CAPACITY,
            read_chunk_bytes: 1024,
            max_payload_bytes: crate::wire::MAX_PAYLOAD_SIZE,
        }
    }
}

impl ServerConfig {
    /// Check the settings a running server depends on.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.workers == 0 {
            return Err("server.workers must be at least 1".into());
        }
        if self.queue_capacity == 0 || self.read_chunk_bytes == 0 {
            return Err("server queue capacity and read chunk must be positive".into());
        }
        if self.max_payload_bytes == 0 {
            return Err("server.max_payload_bytes must be positive".into());
        }
        Ok(())
    }
}

/// Segment writer and capture session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub output_dir: PathBuf,
    pub queue_capacity: usize,
    /// Backlog above which the writer bypasses the recording gate.
    pub override_trigger: usize,
    /// Distance below the trigger at which the bypass is lifted again.
    pub override_buffer: usize,
    /// Once a recording starts, keep writing this long without re-checking occupancy.
    pub min_recording_period_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            fps: 16,
            width: 640,
            height: 480,
            output_dir: PathBuf::from("videos"),
            queue_capacity: 3000,
            override_trigger: 180,
            override_buffer: 80,
            min_recording_period_secs: 3,
        }
    }
}

impl RecordingConfig {
    /// Backlog below which an active override is cleared.
    pub fn override_stop(&self) -> usize {
        self.override_trigger.saturating_sub(self.override_buffer)
    }

    pub fn min_recording_period(&self) -> Duration {
        Duration::from_secs(self.min_recording_period_secs)
    }
}

/// Background-model accumulator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    pub queue_capacity: usize,
    /// Backlog that triggers congestion shedding.
    pub high_water: usize,
    /// Items discarded in one shedding step.
    pub shed_batch: usize,
    /// Weight of the incoming frame when blending.
    pub alpha: f32,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self { queue_capacity: 1000, high_water: 100, shed_batch: 95, alpha: 0.5 }
    }
}

/// Thresholds for the pixel-delta occupancy detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Luma difference from the background that marks a pixel as changed.
    pub delta_threshold: f32,
    /// Changed pixels needed to call the scene occupied.
    pub min_area: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self { delta_threshold: 5.0, min_area: 5000 }
    }
}

impl VigilConfig {
    /// Parse configuration from YAML text and validate it.
    pub fn parse(yaml: &str) -> Result<Self> {
        Self::parse_with_origin(yaml, Path::new("<inline>"))
    }

    /// Load and validate a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            VigilError::io_error(format!("reading configuration {}", path.display()), e)
        })?;
        Self::parse_with_origin(&text, path)
    }

    fn parse_with_origin(yaml: &str, origin: &Path) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| VigilError::config_error(origin, e.to_string()))?;
        config.validate().map_err(|details| VigilError::config_error(origin, details))?;
        Ok(config)
    }

    /// Check value ranges and relationships between settings.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.server.validate()?;
        if self.recording.fps == 0 {
            return Err("recording.fps must be positive".into());
        }
        if self.recording.queue_capacity == 0 {
            return Err("recording.queue_capacity must be positive".into());
        }
        if self.recording.override_buffer >= self.recording.override_trigger {
            return Err(format!(
                "recording.override_buffer ({}) must be below override_trigger ({})",
                self.recording.override_buffer, self.recording.override_trigger
            ));
        }
        if self.accumulator.queue_capacity == 0 {
            return Err("accumulator.queue_capacity must be positive".into());
        }
        if self.accumulator.shed_batch > self.accumulator.high_water {
            return Err(format!(
                "accumulator.shed_batch ({}) must not exceed high_water ({})",
                self.accumulator.shed_batch, self.accumulator.high_water
            ));
        }
        if !(self.accumulator.alpha > 0.0 && self.accumulator.alpha <= 1.0) {
            return Err(format!("accumulator.alpha ({}) must be in (0, 1]", self.accumulator.alpha));
        }
        if self.detection.delta_threshold < 0.0 {
            return Err("detection.delta_threshold must not be negative".into());
        }
        Ok(())
    }

    /// Ensure the segment output directory exists.
    pub fn verify_output_dir(&self) -> Result<()> {
        if self.recording.output_dir.is_dir() {
            Ok(())
        } else {
            Err(VigilError::config_error(
                &self.recording.output_dir,
                "recording output directory does not exist",
            ))
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Pause between accumulator items when not congested: 0.95 of a frame interval.
    pub fn relief_interval(&self) -> Duration {
        Duration::from_secs_f64(0.95 / f64::from(self.recording.fps))
    }
}
