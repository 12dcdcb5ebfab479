//! A file sink that starts a new file on a time boundary.
//!
//! File names carry a stamp for the boundary (`app.20200201.log` for daily
//! rolling); on each roll the sink deletes the oldest stamped files beyond
//! the retention count. Problems while rolling are reported through the
//! internal channel and the sink simply tries again with the next record.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use snafu::ResultExt;

use crate::priority::{attempt, Priority};
use crate::record::Record;
use crate::sinks::{format_line, IoSnafu, Sink, SinkError, Threshold};

/// How often a new file is started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollFrequency {
    /// A new file every month. Checked daily; re-opening the same file is
    /// harmless and keeps the boundary arithmetic simple.
    Monthly,
    /// A new file every day at 00:00:00 UTC.
    Daily,
    /// A new file every hour.
    Hourly,
    /// A new file every minute.
    EveryMinute,
    /// A new file every second. Mainly useful for testing.
    EverySecond,
}

impl RollFrequency {
    /// The roll boundary in microseconds.
    fn boundary_micros(self) -> i64 {
        match self {
            RollFrequency::Monthly | RollFrequency::Daily => 86_400_000_000,
            RollFrequency::Hourly => 3_600_000_000,
            RollFrequency::EveryMinute => 60_000_000,
            RollFrequency::EverySecond => 1_000_000,
        }
    }

    /// The chrono format of the stamp embedded in the file name.
    fn stamp_format(self) -> &'static str {
        match self {
            RollFrequency::Monthly => "%Y%m",
            RollFrequency::Daily => "%Y%m%d",
            RollFrequency::Hourly => "%Y%m%d_%H00",
            RollFrequency::EveryMinute => "%Y%m%d_%H%M",
            RollFrequency::EverySecond => "%Y%m%d_%H%M%S",
        }
    }
}

/// A sink writing to time-stamped files in one directory.
pub struct RollingFileSink {
    threshold: Threshold,
    directory: PathBuf,
    file_name: String,
    frequency: RollFrequency,
    max_files: u32,
    file: Option<File>,
    next_roll_at: i64,
}

impl RollingFileSink {
    /// Creates the sink. `file_name` is the base name; the stamp is inserted
    /// before its extension. At most `max_files` stamped files besides the
    /// current one are kept in `directory`.
    pub fn new(
        priority: Priority,
        directory: impl Into<PathBuf>,
        file_name: impl Into<String>,
        frequency: RollFrequency,
        max_files: u32,
    ) -> Self {
        Self {
            threshold: Threshold::new(priority),
            directory: directory.into(),
            file_name: file_name.into(),
            frequency,
            max_files,
            file: None,
            next_roll_at: 0,
        }
    }

    /// Dynamically changes the priority gate.
    pub fn set_priority(&self, priority: Priority) {
        self.threshold.set(priority);
    }

    fn stem(&self) -> &str {
        Path::new(&self.file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.file_name)
    }

    fn extension(&self) -> String {
        Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default()
    }

    /// Closes the current file, opens the one for `timestamp` and applies
    /// the retention policy.
    fn roll(&mut self, timestamp: i64, priority_bits: u8) {
        let boundary = self.frequency.boundary_micros();
        self.next_roll_at = timestamp - timestamp.rem_euclid(boundary) + boundary;

        let Some(when) = DateTime::<Utc>::from_timestamp_micros(timestamp) else {
            self.report_roll_error("Error rolling log: invalid timestamp", priority_bits);
            return;
        };
        let stamp = when.format(self.frequency.stamp_format()).to_string();
        let path = self
            .directory
            .join(format!("{}.{stamp}{}", self.stem(), self.extension()));

        self.file = None;
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => self.file = Some(file),
            Err(err) => {
                // Reporting this for an elevated record could loop on the
                // very message that reports the failure.
                if attempt(priority_bits) == 0 {
                    let detail = err.to_string();
                    crate::logger::log_internal(
                        Priority::Error,
                        file!(),
                        line!(),
                        "roll",
                        "Error creating log: {}",
                        |record| {
                            record.append(detail.as_str());
                        },
                    );
                }
                return;
            }
        }

        self.delete_stale_files(priority_bits);
    }

    /// Deletes the oldest stamped files so that no more than `max_files`
    /// remain besides the newest one.
    fn delete_stale_files(&self, priority_bits: u8) {
        let prefix = format!("{}.", self.stem());
        let suffix = self.extension();
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) => {
                self.report_roll_error_detail("Error rolling log: {}", &err.to_string(), priority_bits);
                return;
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix) && name.ends_with(&suffix))
            .collect();
        if names.is_empty() {
            return;
        }
        names.sort();
        // The newest entry is the file just opened; keep it out of the
        // retention count.
        let old = names.len() - 1;
        let keep = (self.max_files as usize).min(old);
        for name in &names[..old - keep] {
            let path = self.directory.join(name);
            if let Err(err) = std::fs::remove_file(&path) {
                self.report_roll_error_detail(
                    "Error deleting log: {}",
                    &err.to_string(),
                    priority_bits,
                );
            }
        }
    }

    fn report_roll_error(&self, message: &'static str, priority_bits: u8) {
        if attempt(priority_bits) == 0 {
            crate::logger::log_internal(Priority::Error, file!(), line!(), "roll", message, |_| {});
        }
    }

    fn report_roll_error_detail(
        &self,
        pattern: &'static str,
        detail: &str,
        priority_bits: u8,
    ) {
        if attempt(priority_bits) == 0 {
            crate::logger::log_internal(
                Priority::Warn,
                file!(),
                line!(),
                "roll",
                pattern,
                |record| {
                    record.append(detail);
                },
            );
        }
    }
}

impl Sink for RollingFileSink {
    fn is_enabled(&self, priority: Priority) -> bool {
        self.threshold.is_enabled(priority)
    }

    fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        let timestamp = record.timestamp_micros();
        if timestamp >= self.next_roll_at || self.file.is_none() {
            self.roll(timestamp, record.priority_bits());
        }
        let Some(file) = &mut self.file else {
            // No file could be created; skip this record and retry with the
            // next one.
            return Ok(());
        };
        let mut line = format_line(record);
        line.push('\n');
        file.write_all(line.as_bytes()).context(IoSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::*;

    fn record_at(micros: i64, message: &'static str) -> Record {
        let mut record = Record::new(Priority::Info, "r.rs", 1, "t", Some(message));
        record.set_timestamp_micros(micros);
        record
    }

    const T0: i64 = 1_580_560_496_789_000; // 2020-02-01 12:34:56.789

    #[test]
    fn writes_into_a_stamped_file() {
        let dir = TempDir::new().unwrap();
        let mut sink =
            RollingFileSink::new(Priority::Trace, dir.path(), "app.log", RollFrequency::Daily, 4);
        sink.write(&record_at(T0, "first")).unwrap();
        sink.write(&record_at(T0 + 1_000, "second")).unwrap();

        let content = std::fs::read_to_string(dir.path().join("app.20200201.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn rolls_on_the_time_boundary() {
        let dir = TempDir::new().unwrap();
        let mut sink = RollingFileSink::new(
            Priority::Trace,
            dir.path(),
            "app.log",
            RollFrequency::EverySecond,
            10,
        );
        sink.write(&record_at(T0, "one")).unwrap();
        sink.write(&record_at(T0 + 1_000_000, "two")).unwrap();

        assert!(dir.path().join("app.20200201_123456.log").exists());
        assert!(dir.path().join("app.20200201_123457.log").exists());
    }

    #[test]
    fn retention_deletes_the_oldest_files() {
        let dir = TempDir::new().unwrap();
        let mut sink = RollingFileSink::new(
            Priority::Trace,
            dir.path(),
            "app.log",
            RollFrequency::EverySecond,
            1,
        );
        for second in 0..4 {
            sink.write(&record_at(T0 + second * 1_000_000, "tick")).unwrap();
        }

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        // The current file plus one retained predecessor.
        assert_eq!(
            names,
            vec![
                String::from("app.20200201_123458.log"),
                String::from("app.20200201_123459.log"),
            ],
        );
    }

    #[test]
    fn monthly_reopens_the_same_file_across_days() {
        let dir = TempDir::new().unwrap();
        let mut sink = RollingFileSink::new(
            Priority::Trace,
            dir.path(),
            "app.log",
            RollFrequency::Monthly,
            4,
        );
        sink.write(&record_at(T0, "day one")).unwrap();
        sink.write(&record_at(T0 + 86_400_000_000, "day two")).unwrap();

        let content = std::fs::read_to_string(dir.path().join("app.202002.log")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
