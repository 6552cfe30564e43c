// Append-only alert log, one JSON object per line, one file per UTC date

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Serialize;

use super::AlertLogEntry;

/// File name prefix for daily alert logs
pub const LOG_PREFIX: &str = "weapon_alerts_";

/// Date format used in file names and date queries
pub const DATE_FORMAT: &str = "%Y%m%d";

/// Longest range a summary covers
pub const MAX_SUMMARY_DAYS: u32 = 3660;

#[derive(Debug, thiserror::Error)]
pub enum AlertLogError {
    #[error("Invalid log date '{0}', expected YYYYMMDD")]
    InvalidDate(String),

    #[error("Failed to serialize alert: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alert counts per day, keyed by YYYYMMDD
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSummary {
    pub days: BTreeMap<String, usize>,
    pub total_alerts: usize,
}

/// Date-partitioned alert log rooted at a directory
#[derive(Debug, Clone)]
pub struct AlertLog {
    dir: PathBuf,
}

impl AlertLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file holding alerts for `date`
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}{}.json", LOG_PREFIX, date.format(DATE_FORMAT)))
    }

    /// Append one record to the file for the entry's UTC date
    pub fn append(&self, entry: &AlertLogEntry) -> Result<PathBuf, AlertLogError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(entry.timestamp.date_naive());

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        // Terminate a line torn by an earlier crash so this record stays on its own line
        if ends_mid_line(&mut file)? {
            log::warn!("Alert log {} ends with a partial line", path.display());
            line.insert(0, '\n');
        }
        // Single write so a crash leaves at most one partial trailing line
        file.write_all(line.as_bytes())?;
        file.flush()?;

        Ok(path)
    }

    /// Read all records for a date. Blank and unparsable lines are skipped.
    pub fn read_day(&self, date: NaiveDate) -> Result<Vec<AlertLogEntry>, AlertLogError> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(std::fs::File::open(&path)?);
        let mut entries = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<AlertLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("Skipping unreadable line {} in {}: {}", line_no + 1, path.display(), e),
            }
        }
        Ok(entries)
    }

    /// Read records for a `YYYYMMDD` date string supplied by a user
    pub fn read_date_str(&self, date: &str) -> Result<Vec<AlertLogEntry>, AlertLogError> {
        self.read_day(parse_log_date(date)?)
    }

    /// Count records for `days` days ending at `today`
    /// The range is capped at [`MAX_SUMMARY_DAYS`] and at the earliest representable date.
    pub fn summary(&self, today: NaiveDate, days: u32) -> Result<AlertSummary, AlertLogError> {
        let mut counts = BTreeMap::new();
        for offset in 0..days.min(MAX_SUMMARY_DAYS) {
            let Some(date) = today.checked_sub_signed(ChronoDuration::days(offset as i64)) else {
                break;
            };
            let count = self.read_day(date)?.len();
            counts.insert(date.format(DATE_FORMAT).to_string(), count);
        }
        let total_alerts = counts.values().sum();
        Ok(AlertSummary { days: counts, total_alerts })
    }
}

fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Parse a strict `YYYYMMDD` date. Anything else (including path fragments) is rejected.
pub fn parse_log_date(date: &str) -> Result<NaiveDate, AlertLogError> {
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AlertLogError::InvalidDate(date.to_string()));
    }
    NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|_| AlertLogError::InvalidDate(date.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn entry_at(day: u32, hour: u32) -> AlertLogEntry {
        let ts = Utc.with_ymd_and_hms(2026, 10, day, hour, 0, 0).unwrap();
        AlertLogEntry::new(ts, 5.2, Vec::new(), 5.0, Some("incident.avi".into()), Uuid::new_v4())
    }

    #[test]
    fn appends_into_utc_date_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let log = AlertLog::new(dir.path());

        log.append(&entry_at(17, 23)).unwrap();
        log.append(&entry_at(18, 0)).unwrap();
        log.append(&entry_at(18, 9)).unwrap();

        let d17 = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let d18 = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(log.read_day(d17).unwrap().len(), 1);
        assert_eq!(log.read_day(d18).unwrap().len(), 2);
        assert!(log.path_for(d18).ends_with("weapon_alerts_20261018.json"));
    }

    #[test]
    fn partial_and_blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = AlertLog::new(dir.path());
        let path = log.append(&entry_at(18, 1)).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\n   \n{\"timestamp\":\"2026-10-18T0").unwrap();

        let entries = log.read_date_str("20261018").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].recording_name.as_deref(), Some("incident.avi"));
    }

    #[test]
    fn missing_day_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AlertLog::new(dir.path().join("not-created-yet"));
        assert!(log.read_date_str("20200101").unwrap().is_empty());
    }

    #[test]
    fn malformed_dates_are_rejected() {
        for bad in ["2026-10-18", "../../etc", "20261340", "", "2026101"] {
            assert!(matches!(parse_log_date(bad), Err(AlertLogError::InvalidDate(_))), "{}", bad);
        }
    }

    #[test]
    fn summary_counts_each_day() {
        let dir = tempfile::tempdir().unwrap();
        let log = AlertLog::new(dir.path());
        log.append(&entry_at(18, 1)).unwrap();
        log.append(&entry_at(18, 2)).unwrap();
        log.append(&entry_at(15, 2)).unwrap();
        log.append(&entry_at(1, 2)).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let summary = log.summary(today, 7).unwrap();
        assert_eq!(summary.days.len(), 7);
        assert_eq!(summary.days["20261018"], 2);
        assert_eq!(summary.days["20261015"], 1);
        assert_eq!(summary.total_alerts, 3);
    }

    #[test]
    fn append_after_a_torn_line_starts_a_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = AlertLog::new(dir.path());
        let path = log.append(&entry_at(18, 1)).unwrap();

        // A crash mid-write leaves no trailing newline
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"timestamp\":\"2026-10").unwrap();
        drop(file);

        log.append(&entry_at(18, 2)).unwrap();
        log.append(&entry_at(18, 3)).unwrap();

        let entries = log.read_date_str("20261018").unwrap();
        assert_eq!(entries.len(), 3);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with("}\n"));
    }

    #[test]
    fn summary_range_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = AlertLog::new(dir.path());

        let near_min = NaiveDate::MIN + ChronoDuration::days(2);
        assert_eq!(log.summary(near_min, u32::MAX).unwrap().days.len(), 3);

        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let summary = log.summary(today, 4_000_000_000).unwrap();
        assert_eq!(summary.days.len(), MAX_SUMMARY_DAYS as usize);
        assert_eq!(summary.total_alerts, 0);
    }
}
