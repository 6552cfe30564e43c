// Incident records on disk: alert log and recording library

pub mod alert_log;
pub mod metadata;
pub mod storage;

pub use alert_log::{AlertLog, AlertLogError, AlertSummary};
pub use metadata::*;
pub use storage::{LibraryError, RangeRead, RecordingLibrary};
