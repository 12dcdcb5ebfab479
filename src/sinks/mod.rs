//! Output destinations and the text helpers they share.
//!
//! A sink gates on an atomic priority threshold and writes rendered records.
//! All writes happen on the consumer thread; a sink may block, and failures
//! propagate to the logger which retries through its own pipeline.

pub mod console;
pub mod file;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use snafu::Snafu;

use crate::priority::Priority;
use crate::record::Record;

pub use console::{DebugLines, DebugSink, StderrSink};
pub use file::{RollFrequency, RollingFileSink};

/// A sink's write failed.
#[derive(Debug, Snafu)]
pub enum SinkError {
    /// An I/O error from the underlying stream or file.
    #[snafu(display("sink I/O error: {source}"))]
    Io {
        /// The OS-level error.
        source: std::io::Error,
    },
    /// Any other failure.
    #[snafu(display("{message}"))]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

/// An output destination for rendered records.
///
/// `write` is invoked on the single consumer thread only. Errors (and
/// panics) are caught by the logger and reported through its own pipeline
/// with an elevated priority.
pub trait Sink: Send {
    /// Whether records of this priority are written by this sink.
    fn is_enabled(&self, priority: Priority) -> bool;

    /// Writes one record. May block on I/O.
    fn write(&mut self, record: &Record) -> Result<(), SinkError>;
}

/// The atomic priority gate shared by sink implementations.
///
/// Updates may come from any thread; checks run on the consumer.
pub struct Threshold(AtomicU8);

impl Threshold {
    pub fn new(priority: Priority) -> Self {
        Self(AtomicU8::new(priority.bits()))
    }

    /// True iff `priority` meets the threshold.
    pub fn is_enabled(&self, priority: Priority) -> bool {
        priority.bits() >= self.0.load(Ordering::Acquire)
    }

    /// Dynamically changes the threshold.
    pub fn set(&self, priority: Priority) {
        self.0.store(priority.bits(), Ordering::Release);
    }
}

/// Returns the text for a priority: one of `TRACE`, `DEBUG`, `INFO`,
/// `WARN`, `ERROR`, `FATAL`, or `-` for the unset priority. Internal
/// elevations map to the same strings as their base priority.
pub fn format_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::None => "-",
        Priority::Trace => "TRACE",
        Priority::Debug => "DEBUG",
        Priority::Info => "INFO",
        Priority::Warn => "WARN",
        Priority::Error => "ERROR",
        Priority::Fatal => "FATAL",
    }
}

/// Formats a timestamp as `YYYY-MM-DD HH:MM:SS.mmm` in UTC, or
/// `0000-00-00 00:00:00.000` when the value cannot be represented.
pub fn format_timestamp(micros: i64) -> String {
    match DateTime::<Utc>::from_timestamp_micros(micros) {
        Some(timestamp) => timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => String::from("0000-00-00 00:00:00.000"),
    }
}

/// Renders the standard output line (without the trailing newline):
/// `<timestamp> <PRIORITY> [<thread>] <file>:<line> <function> <message>`.
pub fn format_line(record: &Record) -> String {
    let mut line = String::with_capacity(128);
    line.push_str(&format_timestamp(record.timestamp_micros()));
    let _ = write!(
        line,
        " {} [{}] {}:{} {} ",
        format_priority(record.priority()),
        record.thread_id(),
        record.file(),
        record.line(),
        record.function(),
    );
    line.push_str(&record.message());
    line
}
