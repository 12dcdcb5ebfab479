//! Console sinks: stderr for real use, an in-memory capture for debugging
//! and the test suite.

use std::io::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::ResultExt;

use crate::priority::Priority;
use crate::record::Record;
use crate::sinks::{format_line, IoSnafu, Sink, SinkError, Threshold};

/// Writes every admitted record as one line to standard error.
pub struct StderrSink {
    threshold: Threshold,
}

impl StderrSink {
    pub fn new(priority: Priority) -> Self {
        Self { threshold: Threshold::new(priority) }
    }

    /// Dynamically changes the priority gate.
    pub fn set_priority(&self, priority: Priority) {
        self.threshold.set(priority);
    }
}

impl Sink for StderrSink {
    fn is_enabled(&self, priority: Priority) -> bool {
        self.threshold.is_enabled(priority)
    }

    fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        let mut line = format_line(record);
        line.push('\n');
        let mut stderr = std::io::stderr().lock();
        stderr.write_all(line.as_bytes()).context(IoSnafu)?;
        Ok(())
    }
}

/// Shared handle to the lines captured by a [`DebugSink`].
#[derive(Clone)]
pub struct DebugLines(Arc<Mutex<Vec<String>>>);

impl DebugLines {
    /// A copy of all captured lines.
    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Removes and returns all captured lines.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Captures rendered lines in memory.
///
/// The debugging companion of [`StderrSink`]; also what the test suite
/// observes output through.
pub struct DebugSink {
    threshold: Threshold,
    lines: DebugLines,
}

impl DebugSink {
    pub fn new(priority: Priority) -> Self {
        Self {
            threshold: Threshold::new(priority),
            lines: DebugLines(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// A handle observing the captured lines, valid after the sink has been
    /// handed to the logger.
    pub fn lines(&self) -> DebugLines {
        self.lines.clone()
    }

    /// Dynamically changes the priority gate.
    pub fn set_priority(&self, priority: Priority) {
        self.threshold.set(priority);
    }
}

impl Sink for DebugSink {
    fn is_enabled(&self, priority: Priority) -> bool {
        self.threshold.is_enabled(priority)
    }

    fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        self.lines.0.lock().push(format_line(record));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_sink_captures_lines() {
        let mut sink = DebugSink::new(Priority::Debug);
        let lines = sink.lines();

        let mut record = Record::new(Priority::Info, "c.rs", 3, "t", Some("hello {}"));
        record.append(1i32);
        record.set_timestamp_micros(1_580_560_496_789_000);
        sink.write(&record).unwrap();

        let captured = lines.take();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].ends_with("hello 1"));
        assert!(lines.snapshot().is_empty());
    }

    #[test]
    fn sink_respects_threshold() {
        let sink = DebugSink::new(Priority::Warn);
        assert!(!sink.is_enabled(Priority::Info));
        assert!(sink.is_enabled(Priority::Error));
        sink.set_priority(Priority::Trace);
        assert!(sink.is_enabled(Priority::Info));
    }
}
