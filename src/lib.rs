//! Asynchronous, low-latency structured logging with deferred formatting.
//!
//! Producer threads encode typed arguments into fixed-size [`Record`]s —
//! no string formatting, no I/O, no waiting beyond a bounded spin when the
//! queue rotates segments. A single background consumer drains the records,
//! renders each one against its stored pattern and hands the text to every
//! registered [`Sink`](sinks::Sink) whose priority threshold admits it.
//!
//! ```no_run
//! use deferlog::sinks::{RollFrequency, RollingFileSink, StderrSink};
//! use deferlog::{log_info, Priority};
//!
//! deferlog::initialize(vec![
//!     Box::new(StderrSink::new(Priority::Warn)),
//!     Box::new(RollingFileSink::new(
//!         Priority::Trace,
//!         "logs",
//!         "app.log",
//!         RollFrequency::Daily,
//!         30,
//!     )),
//! ]);
//!
//! log_info!("listening on port {}", 8080u16);
//!
//! deferlog::shutdown();
//! ```
//!
//! Errors can carry captured context from their raise site: see
//! [`with_context`] and the `%`-directive spec language documented on
//! [`error::spec`](crate::error).

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)] // offsets are checked against the u32 buffer cap
#![allow(clippy::missing_panics_doc)]

pub mod error;
pub(crate) mod fmt;
pub mod logger;
mod macros;
pub mod priority;
pub(crate) mod queue;
pub mod record;
pub mod sinks;

pub use error::{with_context, ErrorCategory, ErrorContext, OsError, SystemError, Traced};
pub use fmt::RenderError;
pub use logger::{
    add_sink, flush, flush_to_empty, initialize, initialize_paused, is_initialized, log,
    log_no_throw, log_record, shutdown, start,
};
pub use macros::short_file_name;
pub use priority::Priority;
pub use record::encode::{escape, Encode};
pub use record::{EncodeError, Record};

#[doc(hidden)]
pub use logger::panic_invocations;
