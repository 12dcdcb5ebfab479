//! The in-memory representation of one log event.
//!
//! A [`Record`] is a fixed-size header plus an argument buffer. Small
//! payloads live in the inline buffer that fills the rest of the record's 256
//! bytes; once an append outgrows it, the arguments relocate to a 16-aligned
//! heap buffer that grows in 512-byte chunks. Producers only ever encode into
//! the buffer; all formatting happens later on the consumer thread.

pub(crate) mod codec;
pub mod custom;
pub mod encode;

use std::alloc::{self, handle_alloc_error, Layout};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use snafu::Snafu;

use crate::priority::Priority;
use crate::{fmt, fmt::RenderError};

/// Total size of a [`Record`] in bytes. MUST be a power of two.
pub const RECORD_SIZE: usize = 256;

/// Upper bound for the alignment of anything stored in an argument buffer.
///
/// Both the inline buffer and every heap buffer are aligned to this value, so
/// padding amounts computed from buffer offsets stay valid when arguments are
/// relocated between buffers.
pub(crate) const MAX_ALIGN: usize = 16;

const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Capacity of the buffer stored inside the record itself.
pub(crate) const INLINE_SIZE: usize = RECORD_SIZE - HEADER_SIZE;

/// Failed to encode an argument into a record.
#[derive(Debug, Snafu)]
pub enum EncodeError {
    /// The argument buffer is capped at `u32::MAX` bytes.
    #[snafu(display("argument buffer cannot hold {needed} bytes"))]
    CapacityExceeded {
        /// The total size the buffer would have needed.
        needed: u64,
    },
}

/// A heap argument buffer with the same modular alignment as the inline one.
struct AlignedBuf {
    ptr: NonNull<u8>,
    cap: u32,
}

impl AlignedBuf {
    fn new(cap: u32) -> Self {
        debug_assert!(cap > 0);
        // SAFETY: MAX_ALIGN is a power of two and cap is bounded by u32::MAX,
        // far below the isize overflow limit.
        let layout = unsafe { Layout::from_size_align_unchecked(cap as usize, MAX_ALIGN) };
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Self { ptr, cap }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the identical layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.cap as usize, MAX_ALIGN);
            alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

// SAFETY: the buffer is plain bytes owned by the holder; nothing references
// the allocation from other threads.
unsafe impl Send for AlignedBuf {}

#[repr(C)]
struct Header {
    /// Microseconds since the Unix epoch in UTC; 0 while unset.
    timestamp: i64,
    /// Source file. Always a `'static` literal, referenced, never copied.
    file: &'static str,
    /// Enclosing function. Same lifetime contract as `file`.
    function: &'static str,
    /// The message pattern, or `None` for the nested record of an error
    /// context constructed without one.
    pattern: Option<&'static str>,
    heap: Option<AlignedBuf>,
    thread_id: u32,
    line: u32,
    /// Number of buffer bytes written.
    used: u32,
    /// Current buffer capacity: `INLINE_SIZE` while inline, the heap
    /// capacity afterwards. Invariant: `used <= size`.
    size: u32,
    /// Priority byte including the attempt counter in its low two bits.
    priority: u8,
    /// Set when at least one argument needs per-argument dispatch on copy
    /// and teardown.
    has_nontrivial: bool,
}

/// One log event: header plus typed argument buffer.
///
/// Records are built on the producer thread via [`Record::append`], moved
/// into the queue, and rendered exactly once by the consumer.
#[repr(C, align(16))]
pub struct Record {
    // The inline buffer comes first so it starts at the record's alignment.
    inline: [u8; INLINE_SIZE],
    header: Header,
}

const _: () = assert!(RECORD_SIZE.is_power_of_two());
const _: () = assert!(mem::size_of::<Record>() == RECORD_SIZE);
const _: () = assert!(mem::align_of::<Record>() == MAX_ALIGN);
const _: () = assert!(INLINE_SIZE % mem::align_of::<Header>() == 0);

// SAFETY: the argument buffer only ever stores values whose encode
// implementations require `Send` payloads, and the header's string references
// are `'static`.
unsafe impl Send for Record {}

impl Record {
    /// Creates an empty record. The timestamp stays unset until [`stamp`]
    /// runs at enqueue time.
    ///
    /// `file`, `function` and `pattern` MUST be string literals; only the
    /// references are stored.
    ///
    /// [`stamp`]: Record::stamp
    pub fn new(
        priority: Priority,
        file: &'static str,
        line: u32,
        function: &'static str,
        pattern: Option<&'static str>,
    ) -> Self {
        Self::with_bits(priority.bits(), file, line, function, pattern)
    }

    pub(crate) fn with_bits(
        priority_bits: u8,
        file: &'static str,
        line: u32,
        function: &'static str,
        pattern: Option<&'static str>,
    ) -> Self {
        Self {
            inline: [0; INLINE_SIZE],
            header: Header {
                timestamp: 0,
                file,
                function,
                pattern,
                heap: None,
                thread_id: current_thread_id(),
                line,
                used: 0,
                size: INLINE_SIZE as u32,
                priority: priority_bits,
                has_nontrivial: false,
            },
        }
    }

    /// Sets the timestamp to "now".
    ///
    /// Not part of the constructor so the queue can stamp records after the
    /// slot has been reserved, keeping per-slot (timestamp, publish) order
    /// consistent.
    pub fn stamp(&mut self) {
        self.header.timestamp = now_micros();
    }

    /// Appends an argument, panicking on the (pathological) capacity error.
    ///
    /// Returns `self` for chaining. Use [`Record::try_append`] where the
    /// 4 GiB buffer cap is a reachable condition.
    pub fn append<T: encode::Encode>(&mut self, value: T) -> &mut Self {
        match value.encode(self) {
            Ok(()) => self,
            Err(err) => panic!("cannot append log argument: {err}"),
        }
    }

    /// Appends an argument, reporting capacity exhaustion instead of
    /// panicking.
    pub fn try_append<T: encode::Encode>(&mut self, value: T) -> Result<&mut Self, EncodeError> {
        value.encode(self)?;
        Ok(self)
    }

    /// The priority with the attempt counter masked off.
    pub fn priority(&self) -> Priority {
        Priority::from_bits(self.header.priority)
    }

    pub(crate) fn priority_bits(&self) -> u8 {
        self.header.priority
    }

    /// Microseconds since the Unix epoch, or 0 when not yet stamped.
    pub fn timestamp_micros(&self) -> i64 {
        self.header.timestamp
    }

    pub(crate) fn set_timestamp_micros(&mut self, micros: i64) {
        self.header.timestamp = micros;
    }

    /// The id of the thread which created the record.
    pub fn thread_id(&self) -> u32 {
        self.header.thread_id
    }

    /// The source file of the log statement.
    pub fn file(&self) -> &'static str {
        self.header.file
    }

    /// The source line of the log statement.
    pub fn line(&self) -> u32 {
        self.header.line
    }

    /// The function containing the log statement.
    pub fn function(&self) -> &'static str {
        self.header.function
    }

    /// The unformatted message pattern.
    pub fn pattern(&self) -> Option<&'static str> {
        self.header.pattern
    }

    /// Renders the message by decoding the argument buffer against the
    /// stored pattern.
    pub fn render(&self) -> Result<String, RenderError> {
        // SAFETY: the buffer contains `used` bytes of slots written by the
        // codec and is kept valid by the record's invariants.
        let args = unsafe { codec::decode_args(self.buffer_bytes()) };
        fmt::render(self.header.pattern.unwrap_or(""), &args)
    }

    /// Like [`Record::render`] but recovers from pattern errors: the failing
    /// record renders as `<ERROR>` and an internal error is logged.
    pub fn message(&self) -> String {
        match self.render() {
            Ok(message) => message,
            Err(err) => {
                let text = err.to_string();
                crate::logger::log_internal(
                    Priority::Error,
                    file!(),
                    line!(),
                    "message",
                    "Error formatting log message: {}",
                    |record| {
                        record.append(text.as_str());
                    },
                );
                String::from("<ERROR>")
            }
        }
    }

    pub(crate) fn used(&self) -> u32 {
        self.header.used
    }

    pub(crate) fn has_nontrivial(&self) -> bool {
        self.header.has_nontrivial
    }

    pub(crate) fn set_has_nontrivial(&mut self) {
        self.header.has_nontrivial = true;
    }

    /// Whether the arguments have outgrown the inline buffer.
    pub(crate) fn is_heap(&self) -> bool {
        self.header.heap.is_some()
    }

    pub(crate) fn buffer(&self) -> *const u8 {
        match &self.header.heap {
            None => self.inline.as_ptr(),
            Some(buf) => buf.ptr.as_ptr(),
        }
    }

    pub(crate) fn buffer_mut(&mut self) -> *mut u8 {
        match &mut self.header.heap {
            None => self.inline.as_mut_ptr(),
            Some(buf) => buf.ptr.as_ptr(),
        }
    }

    /// The written part of the argument buffer.
    pub(crate) fn buffer_bytes(&self) -> &[u8] {
        // SAFETY: `used` bytes have been written through `write_ptr`.
        unsafe { std::slice::from_raw_parts(self.buffer(), self.header.used as usize) }
    }

    /// Advances the `used` mark after a slot has been written.
    pub(crate) fn advance(&mut self, bytes: u32) {
        debug_assert!(self.header.used + bytes <= self.header.size);
        self.header.used += bytes;
    }

    /// Current write position, growing the buffer so that `additional` more
    /// bytes fit.
    ///
    /// Growth allocates the next 512-byte chunk with the same modular
    /// alignment as the previous buffer and relocates all arguments, so any
    /// padding computed before the call stays valid after it.
    pub(crate) fn write_ptr(&mut self, additional: u32) -> Result<*mut u8, EncodeError> {
        let required = u64::from(self.header.used) + u64::from(additional);
        if required > u64::from(u32::MAX) {
            return Err(EncodeError::CapacityExceeded { needed: required });
        }
        if required as u32 > self.header.size {
            self.grow(codec::next_chunk(required as u32));
        }
        // SAFETY: `used <= size` and the buffer holds `size` bytes.
        Ok(unsafe { self.buffer_mut().add(self.header.used as usize) })
    }

    fn grow(&mut self, new_size: u32) {
        let new_buf = AlignedBuf::new(new_size);
        let used = self.header.used;
        // Rust values are bitwise-movable, so relocation transfers ownership
        // of any non-trivial payloads without running per-argument hooks; the
        // old buffer is freed without destructors for the same reason.
        // SAFETY: both buffers are MAX_ALIGN-aligned and hold >= `used` bytes.
        unsafe {
            ptr::copy_nonoverlapping(self.buffer(), new_buf.ptr.as_ptr(), used as usize);
        }
        self.header.heap = Some(new_buf);
        self.header.size = new_size;
    }
}

impl Clone for Record {
    fn clone(&self) -> Self {
        let mut copy = Self {
            inline: [0; INLINE_SIZE],
            header: Header {
                timestamp: self.header.timestamp,
                file: self.header.file,
                function: self.header.function,
                pattern: self.header.pattern,
                heap: self.header.heap.as_ref().map(|_| AlignedBuf::new(self.header.size)),
                thread_id: self.header.thread_id,
                line: self.header.line,
                used: self.header.used,
                size: self.header.size,
                priority: self.header.priority,
                has_nontrivial: self.header.has_nontrivial,
            },
        };
        let used = self.header.used;
        // SAFETY: source and target buffers are MAX_ALIGN-aligned, hold
        // `used` valid bytes resp. capacity, and the dispatch only runs over
        // slots the codec wrote.
        unsafe {
            if self.header.has_nontrivial {
                codec::copy_objects(self.buffer(), copy.buffer_mut(), used);
            } else {
                ptr::copy_nonoverlapping(self.buffer(), copy.buffer_mut(), used as usize);
            }
        }
        copy
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        if self.header.has_nontrivial {
            // SAFETY: the buffer holds `used` bytes of valid slots; each
            // non-trivial payload is dropped exactly once because clones
            // duplicate and relocations transfer ownership.
            unsafe {
                codec::call_destructors(self.buffer_mut(), self.header.used);
            }
        }
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("priority", &self.priority())
            .field("file", &self.header.file)
            .field("line", &self.header.line)
            .field("used", &self.header.used)
            .field("size", &self.header.size)
            .finish_non_exhaustive()
    }
}

/// Microseconds since the Unix epoch in UTC.
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// A small sequential id for the current thread.
///
/// The platform thread id is not observable as a number on stable Rust, so
/// ids are handed out on first use per thread.
pub(crate) fn current_thread_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}
