// Vigil - camera incident monitor
// Main library entry point

pub mod config;
pub mod detection;
pub mod encoding;
pub mod events;
#[cfg(feature = "gstreamer")]
pub mod gstreamer_init;
pub mod recording;
pub mod session;
pub mod video;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use config::Config;
use detection::{DetectionAdapter, ExternalProcessModel};
use recording::Monitor;
use video::SourceOpener;

/// Detector described by the config: the external model wrapped with the
/// configured aliases and confidence floor
pub fn build_detector(config: &Config) -> anyhow::Result<DetectionAdapter> {
    let model = ExternalProcessModel::new(&config.detector_command)
        .context("Detector is not configured")?
        .with_reply_timeout(Duration::from_millis(config.detector_timeout_ms));
    Ok(DetectionAdapter::new(Box::new(model))
        .with_aliases(config.label_aliases.clone())
        .with_min_confidence(config.min_confidence))
}

/// Camera opener for this build
pub fn default_source_opener() -> anyhow::Result<Arc<dyn SourceOpener>> {
    #[cfg(feature = "gstreamer")]
    {
        Ok(Arc::new(video::GstCameraOpener::default()))
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        anyhow::bail!("Camera capture needs the `gstreamer` feature")
    }
}

/// Monitor wired from config with the build's camera and recording backends
pub fn build_monitor(config: Config) -> anyhow::Result<Monitor> {
    let detector = build_detector(&config)?;
    let opener = default_source_opener()?;
    let sinks = config
        .container
        .sink_factory()
        .context("Recording container is not available")?;
    Ok(Monitor::new(config, opener, detector, sinks))
}
