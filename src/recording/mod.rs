// Recording modules

pub mod incident;
pub mod monitor;
pub mod preroll;
pub mod recorder;

pub use incident::{
    AlertStateMachine, IncidentConfig, IncidentSession, IncidentState, IncidentStatus, StepOutcome,
};
pub use monitor::{Monitor, MonitorError, MonitorStatus};
pub use preroll::{FrameBufferEntry, RollingFrameBuffer};
pub use recorder::{IncidentRecorder, RecordingSummary, WriteOutcome};

use std::path::Path;

use crate::encoding::{avi_file_needs_repair, repair_avi_file};

/// Repair AVI recordings left open by a crash or power loss.
///
/// Returns the number of files repaired. Files that cannot be repaired are
/// logged and left in place.
pub fn recover_interrupted_recordings(dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut repaired = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_avi = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("avi"))
            .unwrap_or(false);
        if !is_avi || !avi_file_needs_repair(&path) {
            continue;
        }

        match repair_avi_file(&path) {
            Ok(frames) => {
                log::info!("Repaired interrupted recording {} ({} frames)", path.display(), frames);
                repaired += 1;
            }
            Err(e) => log::warn!("Could not repair {}: {}", path.display(), e),
        }
    }
    repaired
}
