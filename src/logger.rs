//! The process-wide logger: producer entry points, the consumer thread and
//! the recursion guard for logging failures.
//!
//! The logger is explicit global state: [`initialize`] creates it and
//! [`shutdown`] drains and destroys it. Producers reach it through an atomic
//! pointer; there is deliberately no lazy initialization. Records produced
//! while no logger is active are dropped without an error.

use std::io::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::priority::{attempt, with_attempt, Priority};
use crate::queue::{FlushMode, RecordQueue};
use crate::record::Record;
use crate::sinks::Sink;

const STATE_INIT: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

/// How long the consumer sleeps between wake-up checks when idle.
const IDLE_WAIT: Duration = Duration::from_secs(5);
/// How long a flush sleeps between progress checks.
const FLUSH_WAIT: Duration = Duration::from_millis(200);

struct Inner {
    state: AtomicU8,
    queue: RecordQueue,
    wake: Condvar,
    mutex: Mutex<()>,
    /// Write-held by the consumer around each record it processes, so a
    /// flush observing the queue as drained can wait for the record in
    /// flight before returning.
    processing: RwLock<()>,
    /// Append-only before `start`, read-only by the consumer afterwards.
    sinks: Mutex<Vec<Box<dyn Sink>>>,
}

/// Owner of the consumer thread; dropping drains the queue and joins.
struct Logger {
    inner: Arc<Inner>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Logger {
    fn create() -> Self {
        let inner = Arc::new(Inner {
            state: AtomicU8::new(STATE_INIT),
            queue: RecordQueue::new(),
            wake: Condvar::new(),
            mutex: Mutex::new(()),
            processing: RwLock::new(()),
            sinks: Mutex::new(Vec::new()),
        });
        let consumer_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name(String::from("deferlog-consumer"))
            .spawn(move || consumer(&consumer_inner));
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(err) => panic!("cannot spawn log consumer thread: {err}"),
        };
        Self { inner, thread }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.inner.state.store(STATE_SHUTDOWN, Ordering::Release);
        self.inner.wake.notify_all();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("log consumer thread panicked during shutdown");
                panic_fallback(file!(), line!(), "Error during shutdown");
            }
        }
    }
}

/// The owning slot plus the atomic pointer producers read. The pointer is
/// cleared after the owner is destroyed so the logger can still log its own
/// shutdown; `shutdown` MUST therefore be the last call into the crate.
static OWNER: Mutex<Option<Logger>> = Mutex::new(None);
static ACTIVE: AtomicPtr<Inner> = AtomicPtr::new(std::ptr::null_mut());

fn active() -> Option<&'static Inner> {
    let inner = ACTIVE.load(Ordering::Acquire);
    if inner.is_null() {
        None
    } else {
        // SAFETY: the pointee is kept alive by OWNER; see the shutdown
        // contract above.
        Some(unsafe { &*inner })
    }
}

/// Creates the logger, registers `sinks` and starts consuming.
///
/// MUST be called before any logging; replaces (and drains) a previously
/// initialized logger.
pub fn initialize(sinks: Vec<Box<dyn Sink>>) {
    initialize_paused();
    for sink in sinks {
        add_sink(sink);
    }
    start();
}

/// Creates the logger but leaves the consumer waiting, so sinks can still be
/// registered. Finish with [`start`].
pub fn initialize_paused() {
    let mut owner = OWNER.lock();
    if let Some(previous) = owner.take() {
        ACTIVE.store(std::ptr::null_mut(), Ordering::Release);
        drop(previous);
    }
    let logger = Logger::create();
    ACTIVE.store(Arc::as_ptr(&logger.inner).cast_mut(), Ordering::Release);
    *owner = Some(logger);
}

/// Whether a logger is currently active.
pub fn is_initialized() -> bool {
    !ACTIVE.load(Ordering::Acquire).is_null()
}

/// Registers a sink. Only valid between [`initialize_paused`] and
/// [`start`]; the sink list is read without locking guarantees afterwards.
pub fn add_sink(sink: Box<dyn Sink>) {
    if let Some(inner) = active() {
        inner.sinks.lock().push(sink);
    }
}

/// Transitions the logger to ready and wakes the consumer.
pub fn start() {
    if let Some(inner) = active() {
        inner.state.store(STATE_READY, Ordering::Release);
        inner.wake.notify_all();
    }
}

/// Builds a record and enqueues it.
///
/// Blocking only on the bounded segment-rotation path. `file`, `function`
/// and `pattern` MUST be literals. May panic while encoding arguments (see
/// [`Record::append`]); once the record is enqueued no failure path remains.
pub fn log(
    priority: Priority,
    file: &'static str,
    line: u32,
    function: &'static str,
    pattern: &'static str,
    build: impl FnOnce(&mut Record),
) {
    let Some(inner) = active() else {
        return;
    };
    let mut record = Record::new(priority, file, line, function, Some(pattern));
    build(&mut record);
    inner.enqueue(record);
}

/// Enqueues an already-built record.
pub fn log_record(record: Record) {
    if let Some(inner) = active() {
        inner.enqueue(record);
    }
}

/// Like [`log`] but swallows every failure, converting panics during record
/// construction into an internal error message.
pub fn log_no_throw(
    priority: Priority,
    file: &'static str,
    line: u32,
    function: &'static str,
    pattern: &'static str,
    build: impl FnOnce(&mut Record),
) {
    let attempted = panic::catch_unwind(AssertUnwindSafe(|| {
        log(priority, file, line, function, pattern, build);
    }));
    if attempted.is_err() {
        let recovered = panic::catch_unwind(|| {
            log(Priority::Error, file, line, function, "Error logging", |_| {});
        });
        if recovered.is_err() {
            panic_fallback(file, line, "Error logging");
        }
    }
}

/// Logs a message from inside the logger itself.
///
/// The attempt counter inherited from the thread-local memo prevents
/// unbounded recursion: at the cap the message is routed to the panic
/// fallback instead of the queue.
pub(crate) fn log_internal(
    priority: Priority,
    file: &'static str,
    line: u32,
    function: &'static str,
    pattern: &'static str,
    build: impl FnOnce(&mut Record),
) {
    let counter = recursion::current().min(3);
    if counter == 3 {
        panic_fallback(file, line, "Error logging error");
        return;
    }
    let Some(inner) = active() else {
        return;
    };
    let mut record =
        Record::with_bits(with_attempt(priority.bits(), counter), file, line, function, Some(pattern));
    build(&mut record);
    inner.enqueue(record);
}

/// Waits until every record enqueued before the call has been written.
pub fn flush() {
    if let Some(inner) = active() {
        inner.flush(FlushMode::Checkpoint);
    }
}

/// Waits until the queue holds no records at all, including records logged
/// while draining (error reports from sinks, for instance).
pub fn flush_to_empty() {
    if let Some(inner) = active() {
        inner.flush(FlushMode::Drain);
    }
}

/// Drains the queue, stops the consumer thread and destroys the logger.
/// MUST be the last call into the crate.
pub fn shutdown() {
    let logger = OWNER.lock().take();
    // Dropping joins the consumer after a full drain; the pointer stays
    // valid meanwhile so the logger can report on its own shutdown.
    drop(logger);
    ACTIVE.store(std::ptr::null_mut(), Ordering::Release);
}

impl Inner {
    fn enqueue(&self, record: Record) {
        self.queue.push(record);
        self.wake.notify_one();
    }

    fn flush(&self, mode: FlushMode) {
        {
            let mut guard = self.mutex.lock();
            while self.state.load(Ordering::Acquire) == STATE_INIT {
                let _ = self.wake.wait_for(&mut guard, IDLE_WAIT);
            }
        }
        self.queue.flush(mode, || std::thread::sleep(FLUSH_WAIT));
        // The queue no longer holds the awaited records, but the last one
        // popped may still be inside a sink; wait for it.
        drop(self.processing.read());
    }

    /// Renders one record into every sink whose threshold admits it.
    fn process(&self, record: Record) {
        let bits = record.priority_bits();
        let priority = record.priority();
        let mut sinks = self.sinks.lock();
        for sink in sinks.iter_mut() {
            if !sink.is_enabled(priority) {
                continue;
            }
            recursion::note_write(bits);
            match panic::catch_unwind(AssertUnwindSafe(|| sink.write(&record))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => self.handle_sink_failure(bits, Some(&error)),
                Err(_) => self.handle_sink_failure(bits, None),
            }
        }
    }

    /// Reports a failed sink write by re-entering the logger at an elevated
    /// priority. The attempt counter in the failing record's priority byte
    /// bounds the depth: the fourth stage goes to the panic fallback.
    fn handle_sink_failure(&self, bits: u8, error: Option<&crate::sinks::SinkError>) {
        let counter = (attempt(bits) + 1).min(3);
        recursion::note_failure(counter);
        if counter == 3 {
            panic_fallback(file!(), line!(), "Error writing log");
            return;
        }
        let elevated = with_attempt(Priority::Error.bits(), counter);
        let report = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut record = match error {
                Some(_) => Record::with_bits(
                    elevated,
                    file!(),
                    line!(),
                    "process",
                    Some("Error writing log: {}"),
                ),
                None => {
                    Record::with_bits(elevated, file!(), line!(), "process", Some("Error writing log"))
                }
            };
            if let Some(error) = error {
                record.append(error as &(dyn std::error::Error + 'static));
            }
            self.enqueue(record);
        }));
        if report.is_err() {
            panic_fallback(file!(), line!(), "Error writing log");
        }
    }
}

/// Main loop of the consumer thread.
fn consumer(inner: &Inner) {
    {
        let mut guard = inner.mutex.lock();
        while inner.state.load(Ordering::Acquire) == STATE_INIT {
            let _ = inner.wake.wait_for(&mut guard, IDLE_WAIT);
        }
    }
    lower_thread_priority();

    while inner.state.load(Ordering::Acquire) == STATE_READY {
        // The write lock spans both the pop and the sink writes: once a
        // flush observes the queue as drained, the record in flight is
        // already covered by the lock it is about to take.
        let in_flight = inner.processing.write();
        match inner.queue.try_pop() {
            Some(record) => inner.process(record),
            None => {
                drop(in_flight);
                let mut guard = inner.mutex.lock();
                if inner.state.load(Ordering::Acquire) == STATE_READY {
                    let _ = inner.wake.wait_for(&mut guard, IDLE_WAIT);
                }
            }
        }
    }

    // Shutdown: drain everything that is still queued, including any error
    // reports produced while draining.
    loop {
        let _in_flight = inner.processing.write();
        let Some(record) = inner.queue.try_pop() else {
            break;
        };
        inner.process(record);
    }
}

/// The consumer runs below normal scheduling priority to keep out of the
/// application's way.
#[cfg(target_os = "linux")]
fn lower_thread_priority() {
    // SAFETY: plain syscalls on the calling thread. The `which` cast papers
    // over glibc's `__priority_which_t` vs `c_int` mismatch.
    let outcome = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS as _, tid, 10)
    };
    if outcome != 0 {
        let detail = std::io::Error::last_os_error().to_string();
        log_internal(
            Priority::Warn,
            file!(),
            line!(),
            "consumer",
            "Error configuring consumer thread: {}",
            |record| {
                record.append(detail.as_str());
            },
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn lower_thread_priority() {}

pub(crate) mod recursion {
    //! Thread-local memo of the recursion guard.
    //!
    //! Tracks the highest attempt stage seen on the consumer thread so a
    //! success in the middle of nested failure handlers does not reset the
    //! counter, and so internal messages emitted by sink code inherit the
    //! elevation.

    use std::cell::Cell;

    thread_local! {
        static COMBINED: Cell<u8> = const { Cell::new(0) };
    }

    /// Notes that the consumer is about to write a record with the given
    /// priority bits. Internal messages logged during the write carry at
    /// least the record's counter plus one.
    pub(crate) fn note_write(bits: u8) {
        COMBINED.with(|memo| memo.set(crate::priority::attempt(bits) + 1));
    }

    /// Raises the memo to a failure handler's stage.
    pub(crate) fn note_failure(counter: u8) {
        COMBINED.with(|memo| memo.set(memo.get().max(counter)));
    }

    pub(crate) fn current() -> u8 {
        COMBINED.with(Cell::get)
    }
}

static PANIC_INVOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// Last-resort error reporting: writes one line to stderr and returns.
///
/// Used when the logger cannot log its own failure anymore. Never enqueues,
/// never panics.
pub(crate) fn panic_fallback(file: &str, line: u32, message: &str) {
    PANIC_INVOCATIONS.fetch_add(1, Ordering::Relaxed);
    tracing::error!(%file, line = line, "logging failure: {message}");
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "PANIC: {message} @ {file}:{line}");
}

/// Number of panic-fallback invocations so far. Test instrumentation.
#[doc(hidden)]
pub fn panic_invocations() -> usize {
    PANIC_INVOCATIONS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_tracks_the_highest_stage() {
        recursion::note_write(Priority::Debug.bits());
        assert_eq!(recursion::current(), 1);
        recursion::note_failure(2);
        assert_eq!(recursion::current(), 2);
        // A later write of a non-elevated record resets the memo.
        recursion::note_write(Priority::Info.bits());
        assert_eq!(recursion::current(), 1);
        // Writes of elevated records keep their stage.
        recursion::note_write(with_attempt(Priority::Error.bits(), 2));
        assert_eq!(recursion::current(), 3);
    }

    #[test]
    fn logging_without_a_logger_is_a_silent_drop() {
        // No logger is initialized in unit tests; both entry points must be
        // no-ops rather than panics.
        log(Priority::Info, "f.rs", 1, "t", "{}", |record| {
            record.append(1i32);
        });
        log_no_throw(Priority::Info, "f.rs", 1, "t", "{}", |record| {
            record.append(1i32);
        });
        assert!(!is_initialized());
    }

    #[test]
    fn panic_fallback_counts_invocations() {
        let before = panic_invocations();
        panic_fallback("f.rs", 1, "test fallback");
        assert_eq!(panic_invocations(), before + 1);
    }
}
