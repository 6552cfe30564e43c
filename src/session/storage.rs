// Recording library: listing, safe name resolution, deletion, range reads

use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use super::RecordingInfo;

/// Extensions the recorder produces
pub const RECORDING_EXTENSIONS: &[&str] = &["avi", "mkv"];

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("Invalid recording name '{0}': must be a plain file name inside the recordings directory")]
    PathTraversal(String),

    #[error("Recording not found: {0}")]
    NotFound(String),

    #[error("Invalid range {start}-{end} for a {len}-byte file")]
    InvalidRange { start: u64, end: u64, len: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A slice of a recording file, as served for partial delivery
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRead {
    pub data: Vec<u8>,
    /// First byte offset (inclusive)
    pub start: u64,
    /// Last byte offset (inclusive)
    pub end: u64,
    pub total_len: u64,
}

impl RangeRead {
    /// `Content-Range` header value for this slice
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total_len)
    }
}

/// Directory of incident recordings
#[derive(Debug, Clone)]
pub struct RecordingLibrary {
    dir: PathBuf,
}

impl RecordingLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map a user-supplied file name to a path inside the library.
    ///
    /// Only a single normal path component is accepted; separators, `..`,
    /// absolute paths and hidden files are rejected without touching the disk.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, LibraryError> {
        let reject = || LibraryError::PathTraversal(name.to_string());

        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
            return Err(reject());
        }
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.dir.join(name)),
            _ => Err(reject()),
        }
    }

    /// Recordings in the library, newest first
    pub fn list(&self) -> Result<Vec<RecordingInfo>, LibraryError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut recordings = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_recording = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| RECORDING_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if !is_recording {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }

            recordings.push(RecordingInfo {
                filename: filename.to_string(),
                size_bytes: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        recordings.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then_with(|| b.filename.cmp(&a.filename)));
        Ok(recordings)
    }

    pub fn delete(&self, name: &str) -> Result<(), LibraryError> {
        let path = self.existing(name)?;
        std::fs::remove_file(&path)?;
        log::info!("Deleted recording {}", name);
        Ok(())
    }

    /// Read bytes `start..=end` (end clamped to the file length).
    /// `end = None` reads to the end of the file.
    pub fn read_range(&self, name: &str, start: u64, end: Option<u64>) -> Result<RangeRead, LibraryError> {
        let path = self.existing(name)?;
        let mut file = std::fs::File::open(&path)?;
        let total_len = file.metadata()?.len();

        let last = total_len.saturating_sub(1);
        let end = end.unwrap_or(last).min(last);
        if total_len == 0 || start > end {
            return Err(LibraryError::InvalidRange { start, end, len: total_len });
        }

        let mut data = vec![0u8; (end - start + 1) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut data)?;

        Ok(RangeRead { data, start, end, total_len })
    }

    fn existing(&self, name: &str) -> Result<PathBuf, LibraryError> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(LibraryError::NotFound(name.to_string()));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, RecordingLibrary) {
        let dir = tempfile::tempdir().unwrap();
        for (name, data) in files {
            std::fs::write(dir.path().join(name), data).unwrap();
        }
        let library = RecordingLibrary::new(dir.path());
        (dir, library)
    }

    #[test]
    fn traversal_attempts_are_rejected() {
        let (_dir, library) = library_with(&[]);
        for bad in ["../secret.avi", "/etc/passwd", "a/b.avi", "..", ".hidden", "", "c:\\x.avi"] {
            assert!(matches!(library.resolve(bad), Err(LibraryError::PathTraversal(_))), "{}", bad);
        }
        assert!(library.resolve("incident_20261018_120000_abcd1234.avi").is_ok());
    }

    #[test]
    fn list_only_returns_recordings() {
        let (_dir, library) = library_with(&[("a.avi", b"1234"), ("b.mkv", b"12"), ("notes.txt", b"x")]);
        let mut names: Vec<_> = library.list().unwrap().into_iter().map(|r| r.filename).collect();
        names.sort();
        assert_eq!(names, vec!["a.avi", "b.mkv"]);
    }

    #[test]
    fn missing_directory_lists_empty() {
        let library = RecordingLibrary::new("/nonexistent/vigil/recordings");
        assert!(library.list().unwrap().is_empty());
    }

    #[test]
    fn range_reads_are_clamped() {
        let (_dir, library) = library_with(&[("clip.avi", b"0123456789")]);

        let head = library.read_range("clip.avi", 0, Some(3)).unwrap();
        assert_eq!(head.data, b"0123");
        assert_eq!(head.content_range(), "bytes 0-3/10");

        let tail = library.read_range("clip.avi", 7, None).unwrap();
        assert_eq!(tail.data, b"789");

        let clamped = library.read_range("clip.avi", 8, Some(100)).unwrap();
        assert_eq!(clamped.end, 9);

        assert!(matches!(
            library.read_range("clip.avi", 11, None),
            Err(LibraryError::InvalidRange { .. })
        ));
    }

    #[test]
    fn delete_removes_file_and_rejects_unknown() {
        let (dir, library) = library_with(&[("clip.avi", b"x")]);
        library.delete("clip.avi").unwrap();
        assert!(!dir.path().join("clip.avi").exists());
        assert!(matches!(library.delete("clip.avi"), Err(LibraryError::NotFound(_))));
        assert!(matches!(library.delete("../clip.avi"), Err(LibraryError::PathTraversal(_))));
    }
}
