// Detection adapter
//
// Wraps the external detection capability. Raw model output is normalized here
// exactly once (lowercase labels, alias folding, confidence floor) so the
// incident logic never has to know the model's vocabulary.

pub mod process;

pub use process::ExternalProcessModel;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::video::Frame;

/// Error raised by a detection model for a single frame
#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Detector process error: {0}")]
    Process(String),

    #[error("Malformed detector output: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Axis-aligned box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One labeled detection in a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "class")]
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Outcome of running detection on one frame
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionResult {
    Ok(Vec<Detection>),
    Failed(String),
}

impl DetectionResult {
    pub fn is_positive(&self) -> bool {
        matches!(self, DetectionResult::Ok(d) if !d.is_empty())
    }
}

/// What the incident logic does with a frame whose detection failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Count the frame as "nothing detected" (keeps timers moving, can mask a broken model)
    #[default]
    TreatAsNegative,
    /// Record and buffer the frame but leave the incident state untouched
    SkipFrame,
    /// Tear down monitoring and report it failed
    StopMonitoring,
}

/// The external detection capability
pub trait DetectionModel: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError>;
}

impl<F> DetectionModel for F
where
    F: FnMut(&Frame) -> Result<Vec<Detection>, DetectionError> + Send,
{
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        self(frame)
    }
}

/// Default label aliases: narrow model classes folded into broader categories
pub fn default_label_aliases() -> HashMap<String, String> {
    HashMap::from([("pistol".to_string(), "gun".to_string())])
}

/// Normalizes model output and converts model errors into `DetectionResult::Failed`
pub struct DetectionAdapter {
    model: Box<dyn DetectionModel>,
    aliases: HashMap<String, String>,
    min_confidence: f32,
}

impl DetectionAdapter {
    pub fn new(model: Box<dyn DetectionModel>) -> Self {
        Self {
            model,
            aliases: default_label_aliases(),
            min_confidence: 0.0,
        }
    }

    /// Replace the alias table. Keys and values are lowercased.
    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases
            .into_iter()
            .map(|(from, to)| (from.to_lowercase(), to.to_lowercase()))
            .collect();
        self
    }

    /// Drop detections below this confidence
    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    pub fn detect(&mut self, frame: &Frame) -> DetectionResult {
        match self.model.infer(frame) {
            Ok(raw) => DetectionResult::Ok(
                raw.into_iter()
                    .filter_map(|d| self.normalize(d))
                    .collect(),
            ),
            Err(e) => DetectionResult::Failed(e.to_string()),
        }
    }

    fn normalize(&self, mut detection: Detection) -> Option<Detection> {
        if !detection.confidence.is_finite() {
            return None;
        }
        detection.confidence = detection.confidence.clamp(0.0, 1.0);
        if detection.confidence < self.min_confidence {
            return None;
        }

        let label = detection.label.trim().to_lowercase();
        detection.label = match self.aliases.get(&label) {
            Some(broader) => broader.clone(),
            None => label,
        };
        Some(detection)
    }
}
