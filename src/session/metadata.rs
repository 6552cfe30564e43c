// Incident record structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detection::Detection;

/// Alert type written into every log record
pub const ALERT_TYPE_WEAPON: &str = "WEAPON_DETECTED";

/// One fired alert. Appended once per incident session, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLogEntry {
    /// When the alert fired (capture time of the triggering frame)
    pub timestamp: DateTime<Utc>,

    #[serde(default = "default_alert_type")]
    pub alert_type: String,

    /// How long detections had persisted when the alert fired, rounded to 0.01s
    pub duration_seconds: f64,

    /// Detections in the triggering frame
    pub detections: Vec<Detection>,

    #[serde(default)]
    pub detection_count: usize,

    pub threshold_seconds: f64,

    /// Recording started for this incident, if the recorder could be opened
    pub recording_name: Option<String>,

    #[serde(default)]
    pub session_id: Option<Uuid>,
}

impl AlertLogEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        duration_secs: f64,
        detections: Vec<Detection>,
        threshold_secs: f64,
        recording_name: Option<String>,
        session_id: Uuid,
    ) -> Self {
        Self {
            timestamp,
            alert_type: default_alert_type(),
            duration_seconds: (duration_secs * 100.0).round() / 100.0,
            detection_count: detections.len(),
            detections,
            threshold_seconds: threshold_secs,
            recording_name,
            session_id: Some(session_id),
        }
    }
}

/// A completed (or in-progress) recording file in the library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub filename: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Short session token used in log lines and file names
pub fn short_token(session_id: &Uuid) -> String {
    session_id.simple().to_string()[..8].to_string()
}

fn default_alert_type() -> String {
    ALERT_TYPE_WEAPON.to_string()
}
