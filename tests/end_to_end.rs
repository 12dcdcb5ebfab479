//! End-to-end scenarios through the full pipeline: producers, queue,
//! consumer thread and sinks.
//!
//! The logger is process-global state, so every test takes the session lock,
//! initializes its own logger and shuts it down before releasing.

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use regex::Regex;

use deferlog::sinks::{DebugLines, DebugSink, Sink, SinkError};
use deferlog::{escape, with_context, ErrorCategory, Priority, SystemError};

static SESSION: Mutex<()> = Mutex::new(());

/// Routes the crate's own tracing diagnostics into the test output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Runs `body` against a fresh logger wired to a capture sink. The session
/// lock is held throughout because the logger is process-global.
fn with_capture_logger(threshold: Priority, body: impl FnOnce(&DebugLines)) {
    let _guard = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    init_tracing();
    let sink = DebugSink::new(threshold);
    let lines = sink.lines();
    deferlog::initialize(vec![Box::new(sink)]);
    body(&lines);
    deferlog::shutdown();
}

struct InvalidArg(&'static str);

impl fmt::Debug for InvalidArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvalidArg({})", self.0)
    }
}

impl fmt::Display for InvalidArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl StdError for InvalidArg {}

struct TestCategory;

impl ErrorCategory for TestCategory {
    fn name(&self) -> &str {
        "TestError"
    }

    fn message(&self, _code: i32) -> String {
        String::from("This is an error message")
    }
}

static TEST_CATEGORY: TestCategory = TestCategory;

#[test]
fn basic_line_through_a_string_sink() {
    with_capture_logger(Priority::Trace, |lines| {
        deferlog::log(Priority::Debug, "f.rs", 99, "fn", "{}", |record| {
            record.append(7i32);
        });
        deferlog::flush();

        let captured = lines.take();
        assert_eq!(captured.len(), 1);
        let expected = Regex::new(r"^[0-9 :.\-]{23} DEBUG \[\d+\] f\.rs:99 fn 7$").unwrap();
        assert!(expected.is_match(&captured[0]), "unexpected line: {}", captured[0]);
    });
}

#[test]
fn buffer_growth_does_not_corrupt_arguments() {
    with_capture_logger(Priority::Trace, |lines| {
        let big = "x".repeat(1024);
        deferlog::log(Priority::Debug, "f.rs", 99, "fn", "{} {:.3}", move |record| {
            record.append("Test").append(big.as_str());
        });
        deferlog::flush();

        let captured = lines.take();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].ends_with("Test xxx"), "unexpected line: {}", captured[0]);
    });
}

#[test]
fn escaped_character_renders_as_two_characters() {
    with_capture_logger(Priority::Trace, |lines| {
        deferlog::log(Priority::Debug, "f.rs", 1, "fn", "{}{}", |record| {
            record.append(escape('\n')).append('!');
        });
        deferlog::flush();

        let captured = lines.take();
        assert!(captured[0].ends_with("\\n!"), "unexpected line: {}", captured[0]);
    });
}

#[test]
fn context_error_renders_its_capture_site() {
    with_capture_logger(Priority::Trace, |lines| {
        let error = with_context(
            InvalidArg("testarg"),
            "myfile.cpp",
            15,
            "exfunc",
            Some("Exception {} - {}"),
            |record| {
                record.append(1.8f64).append("test");
            },
        );
        deferlog::log(
            Priority::Debug,
            "f.rs",
            99,
            "fn",
            "{0} {1:%[%C (%c={0}) ]}caused by {1:%w}{1:%[: %l\n@ %F:%L]}{2:.4}",
            |record| {
                record.append("Error").append(&error).append("");
            },
        );
        deferlog::flush();

        let captured = lines.take();
        assert!(
            captured[0].ends_with("Error caused by testarg: Exception 1.8 - test\n@ myfile.cpp:15"),
            "unexpected line: {}",
            captured[0],
        );
    });
}

#[test]
fn system_error_renders_code_and_category() {
    with_capture_logger(Priority::Trace, |lines| {
        let error = with_context(
            SystemError::new(7, &TEST_CATEGORY, "testmsg"),
            "myfile.cpp",
            15,
            "exfunc",
            Some("Exception {} - {}"),
            |record| {
                record.append(1.8f64).append("test");
            },
        );
        deferlog::log(
            Priority::Debug,
            "f.rs",
            99,
            "fn",
            "{0} {1:%[%C (%c={0}) ]}caused by {1:%w}{1:%[: %l\n@ %F:%L]}{2:.4}",
            |record| {
                record.append("Error").append(&error).append("");
            },
        );
        deferlog::flush();

        let captured = lines.take();
        assert!(
            captured[0].ends_with(
                "Error TestError (7=Error) caused by testmsg: This is an error message: \
                 Exception 1.8 - test\n@ myfile.cpp:15"
            ),
            "unexpected line: {}",
            captured[0],
        );
    });
}

#[test]
fn many_producers_every_record_rendered_exactly_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 500;

    with_capture_logger(Priority::Trace, |lines| {
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = (producer * PER_PRODUCER + i) as u64;
                        deferlog::log(Priority::Info, "p.rs", 1, "produce", "#{}", move |record| {
                            record.append(value);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        deferlog::flush();

        let captured = lines.take();
        assert_eq!(captured.len(), PRODUCERS * PER_PRODUCER);
        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        for line in &captured {
            let value: usize = line
                .rsplit('#')
                .next()
                .and_then(|digits| digits.parse().ok())
                .expect("line must end in the record number");
            assert!(!seen[value], "record {value} rendered twice");
            seen[value] = true;
        }
        assert!(seen.iter().all(|seen| *seen));
    });
}

#[test]
fn checkpoint_flush_observes_prior_records() {
    with_capture_logger(Priority::Trace, |lines| {
        for value in 0..100u64 {
            deferlog::log(Priority::Info, "f.rs", 1, "fn", "{}", move |record| {
                record.append(value);
            });
        }
        deferlog::flush();
        assert_eq!(lines.snapshot().len(), 100);
    });
}

#[test]
fn macros_capture_the_call_site() {
    with_capture_logger(Priority::Trace, |lines| {
        deferlog::log_debug!("answer is {}", 42i32);
        deferlog::flush();

        let captured = lines.take();
        assert_eq!(captured.len(), 1);
        assert!(
            captured[0].contains("end_to_end.rs:") && captured[0].ends_with("answer is 42"),
            "unexpected line: {}",
            captured[0],
        );
    });
}

#[test]
fn threshold_gates_low_priority_records() {
    with_capture_logger(Priority::Warn, |lines| {
        deferlog::log(Priority::Debug, "f.rs", 1, "fn", "dropped", |_| {});
        deferlog::log(Priority::Error, "f.rs", 1, "fn", "kept", |_| {});
        deferlog::flush();

        let captured = lines.take();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].ends_with("kept"));
    });
}

#[test]
fn no_throw_logging_swallows_producer_panics() {
    with_capture_logger(Priority::Trace, |lines| {
        deferlog::log_no_throw(Priority::Info, "f.rs", 1, "fn", "never built", |_| {
            panic!("argument construction failed");
        });
        deferlog::flush_to_empty();

        let captured = lines.take();
        assert_eq!(captured.len(), 1);
        assert!(
            captured[0].ends_with("Error logging"),
            "unexpected line: {}",
            captured[0],
        );
    });
}

#[test]
fn shutdown_drains_pending_records() {
    let guard = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    let sink = DebugSink::new(Priority::Trace);
    let lines = sink.lines();
    deferlog::initialize(vec![Box::new(sink)]);
    for value in 0..50u64 {
        deferlog::log(Priority::Info, "f.rs", 1, "fn", "{}", move |record| {
            record.append(value);
        });
    }
    // No flush: shutdown itself must drain.
    deferlog::shutdown();
    assert_eq!(lines.take().len(), 50);
    drop(guard);
}

/// A sink that fails every admitted write.
struct FailingSink {
    writes: Arc<AtomicUsize>,
}

impl Sink for FailingSink {
    fn is_enabled(&self, _priority: Priority) -> bool {
        true
    }

    fn write(&mut self, _record: &deferlog::Record) -> Result<(), SinkError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        Err(SinkError::Failed { message: String::from("sink exploded") })
    }
}

#[test]
fn failing_sink_is_capped_after_three_attempts() {
    let guard = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    let writes = Arc::new(AtomicUsize::new(0));
    let panics_before = deferlog::panic_invocations();
    deferlog::initialize(vec![Box::new(FailingSink { writes: Arc::clone(&writes) })]);

    deferlog::log(Priority::Info, "f.rs", 1, "fn", "original", |_| {});
    deferlog::flush_to_empty();
    deferlog::shutdown();

    // The original write plus the two re-entered error reports; the third
    // failure goes to the panic fallback instead of the queue.
    assert_eq!(writes.load(Ordering::Relaxed), 3);
    assert_eq!(deferlog::panic_invocations(), panics_before + 1);
    drop(guard);
}
