// Configuration management for Vigil

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detection::{default_label_aliases, FailurePolicy};
use crate::encoding::ContainerFormat;
use crate::events::DEFAULT_SUBSCRIBER_CAPACITY;

/// Highest accepted camera frame rate
pub const MAX_FRAME_RATE: f64 = 1000.0;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root folder for recordings and alert logs
    #[serde(default = "get_default_storage_path")]
    pub storage_path: PathBuf,

    /// Capture device index
    #[serde(default)]
    pub camera_index: u32,

    /// Nominal camera frame rate, used to size the rolling buffer and recordings
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,

    /// First backoff delay after a failed frame read
    #[serde(default = "default_read_retry_base_ms")]
    pub read_retry_base_ms: u64,

    /// Backoff delay cap; the delay doubles per consecutive failure up to this
    #[serde(default = "default_read_retry_max_ms")]
    pub read_retry_max_ms: u64,

    /// Consecutive failed reads after which monitoring is torn down
    #[serde(default = "default_max_read_failures")]
    pub max_consecutive_read_failures: u32,

    /// Continuous detection time before an alert fires and recording starts
    #[serde(default = "default_alert_threshold_secs")]
    pub alert_threshold_secs: f64,

    /// Time recording continues after the last detection
    #[serde(default = "default_post_event_window_secs")]
    pub post_event_window_secs: f64,

    /// Time without detections before a session is cleared.
    /// An alerted session is never cleared before its recording closes.
    #[serde(default = "default_reset_grace_secs")]
    pub reset_grace_secs: f64,

    /// Seconds of pre-incident footage kept in memory
    #[serde(default = "default_buffer_capacity_secs")]
    pub buffer_capacity_secs: f64,

    /// Recording container
    #[serde(default)]
    pub container: ContainerFormat,

    /// External detector: program followed by its arguments
    #[serde(default)]
    pub detector_command: Vec<String>,

    /// Longest wait for one detector reply before the process is restarted
    #[serde(default = "default_detector_timeout_ms")]
    pub detector_timeout_ms: u64,

    /// Detections below this confidence are ignored
    #[serde(default)]
    pub min_confidence: f32,

    /// What to do with frames whose detection failed
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Per-subscriber event queue depth
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// Model label -> reported label (e.g. "pistol" -> "gun").
    /// Kept last: TOML tables must follow plain values.
    #[serde(default = "default_label_aliases")]
    pub label_aliases: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: get_default_storage_path(),
            camera_index: 0,
            frame_rate: default_frame_rate(),
            read_retry_base_ms: default_read_retry_base_ms(),
            read_retry_max_ms: default_read_retry_max_ms(),
            max_consecutive_read_failures: default_max_read_failures(),
            alert_threshold_secs: default_alert_threshold_secs(),
            post_event_window_secs: default_post_event_window_secs(),
            reset_grace_secs: default_reset_grace_secs(),
            buffer_capacity_secs: default_buffer_capacity_secs(),
            container: ContainerFormat::default(),
            detector_command: Vec::new(),
            detector_timeout_ms: default_detector_timeout_ms(),
            min_confidence: 0.0,
            failure_policy: FailurePolicy::default(),
            subscriber_capacity: default_subscriber_capacity(),
            label_aliases: default_label_aliases(),
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config {}: {}", config_path.display(), e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file {}: {}", config_path.display(), e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.storage_path.join("recordings")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.storage_path.join("logs")
    }

    /// Reject values the monitor cannot run with; return warnings for
    /// values it can run with but that behave differently than they read.
    pub fn validate(&self) -> anyhow::Result<Vec<String>> {
        let windows = [
            ("alert_threshold_secs", self.alert_threshold_secs),
            ("post_event_window_secs", self.post_event_window_secs),
            ("reset_grace_secs", self.reset_grace_secs),
            ("buffer_capacity_secs", self.buffer_capacity_secs),
        ];
        for (name, value) in windows {
            if !value.is_finite() || value < 0.0 || Duration::try_from_secs_f64(value).is_err() {
                anyhow::bail!("{} must be a non-negative number of seconds, got {}", name, value);
            }
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 || self.frame_rate > MAX_FRAME_RATE {
            anyhow::bail!("frame_rate must be within (0, {}], got {}", MAX_FRAME_RATE, self.frame_rate);
        }
        if self.detector_timeout_ms == 0 {
            anyhow::bail!("detector_timeout_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("min_confidence must be within 0..=1, got {}", self.min_confidence);
        }

        let mut warnings = Vec::new();
        if self.reset_grace_secs < self.post_event_window_secs {
            warnings.push(format!(
                "reset_grace_secs ({}) is shorter than post_event_window_secs ({}); \
                 alerted sessions reset when their recording closes, {}s after the last detection",
                self.reset_grace_secs, self.post_event_window_secs, self.post_event_window_secs
            ));
        }
        if self.buffer_capacity_secs > crate::recording::preroll::MAX_BUFFER_SECS {
            warnings.push(format!(
                "buffer_capacity_secs ({}) is capped at {}s",
                self.buffer_capacity_secs,
                crate::recording::preroll::MAX_BUFFER_SECS
            ));
        }
        if self.read_retry_base_ms > self.read_retry_max_ms {
            warnings.push(format!(
                "read_retry_base_ms ({}) exceeds read_retry_max_ms ({}); the cap applies",
                self.read_retry_base_ms, self.read_retry_max_ms
            ));
        }
        if self.detector_command.is_empty() {
            warnings.push("detector_command is empty; monitoring cannot start without a detector".into());
        }
        Ok(warnings)
    }
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vigil")
        .join("config.toml")
}

/// Get the default storage path for recordings and logs
fn get_default_storage_path() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Vigil")
}

fn default_frame_rate() -> f64 {
    30.0
}

fn default_read_retry_base_ms() -> u64 {
    100
}

fn default_read_retry_max_ms() -> u64 {
    1000
}

fn default_max_read_failures() -> u32 {
    10
}

fn default_alert_threshold_secs() -> f64 {
    5.0
}

fn default_post_event_window_secs() -> f64 {
    10.0
}

fn default_reset_grace_secs() -> f64 {
    5.0
}

fn default_buffer_capacity_secs() -> f64 {
    10.0
}

fn default_detector_timeout_ms() -> u64 {
    5000
}

fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}
