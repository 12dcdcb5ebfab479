//! Errors that carry captured logging context.
//!
//! Rust has no exceptions, so "throwing with context" becomes wrapping: the
//! helper [`with_context`] composes a user error with an [`ErrorContext`]
//! captured at the raise site. The context holds a nested record (its own
//! argument buffer, source location and timestamp), the error's bare
//! message, and, for [`SystemError`] values, the OS error code and its
//! process-static category. Appending such an error to an outer record
//! stores one of three layouts: stack-based when the nested buffer is
//! inline, heap-based when it has grown, and plain when there is no context
//! at all.

pub(crate) mod spec;

use std::error::Error as StdError;
use std::fmt;
use std::ptr;
use std::sync::{Arc, OnceLock};

use crate::priority::Priority;
use crate::record::codec::{
    self, Kind, EXC_INFO_ALIGN, EXC_INFO_SIZE, LEN_SIZE, OS_ERR_SIZE, TAG_SIZE,
};
use crate::record::encode::{self, Encode};
use crate::record::{EncodeError, Record, MAX_ALIGN};

/// Classifies OS error codes, analogous to the platform error categories.
///
/// Implementations MUST be process-static: records store plain references
/// and resolve names and messages when they are rendered.
pub trait ErrorCategory: Send + Sync {
    /// Short identifier of the category.
    fn name(&self) -> &str;
    /// Human-readable message for a code of this category.
    fn message(&self, code: i32) -> String;
}

/// An OS error code together with its category.
#[derive(Clone, Copy)]
pub struct OsError {
    /// The numeric error code.
    pub code: i32,
    /// The process-static category the code belongs to.
    pub category: &'static dyn ErrorCategory,
}

impl fmt::Debug for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsError")
            .field("code", &self.code)
            .field("category", &self.category.name())
            .finish()
    }
}

type SharedWhat = Arc<OnceLock<String>>;

/// An error wrapping an OS error code, with lazy message formatting.
///
/// Unlike the platform's error types the full message is not built until it
/// is first needed; copies share the computed string.
pub struct SystemError {
    code: i32,
    category: &'static dyn ErrorCategory,
    message: String,
    what: SharedWhat,
}

impl SystemError {
    /// Creates a new error for the given code and category.
    pub fn new(code: i32, category: &'static dyn ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            code,
            category,
            message: message.into(),
            what: SharedWhat::default(),
        }
    }

    /// The OS error code and category.
    pub fn os_error(&self) -> OsError {
        OsError { code: self.code, category: self.category }
    }

    /// The bare message this error was created with.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Clone for SystemError {
    fn clone(&self) -> Self {
        Self {
            code: self.code,
            category: self.category,
            message: self.message.clone(),
            // Copies share the lazily computed message.
            what: Arc::clone(&self.what),
        }
    }
}

impl fmt::Display for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = self.what.get_or_init(|| {
            let detail = self.category.message(self.code);
            if self.message.is_empty() {
                detail
            } else {
                format!("{}: {detail}", self.message)
            }
        });
        f.write_str(what)
    }
}

impl fmt::Debug for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemError")
            .field("code", &self.code)
            .field("category", &self.category.name())
            .field("message", &self.message)
            .finish()
    }
}

impl StdError for SystemError {}

/// Logging context captured when an error is raised.
///
/// Copyable so the composed error can cross the usual error-propagation
/// boundaries.
pub struct ErrorContext {
    record: Record,
    message: String,
    os: Option<OsError>,
}

impl ErrorContext {
    fn capture(
        error: &(dyn StdError + 'static),
        file: &'static str,
        line: u32,
        function: &'static str,
        pattern: Option<&'static str>,
        build: impl FnOnce(&mut Record),
    ) -> Self {
        let mut record = Record::new(Priority::None, file, line, function, pattern);
        record.stamp();
        build(&mut record);
        // The OS error information is captured here, at the raise site; the
        // categories are process-static so the reference stays valid for the
        // life of any record the context ends up in.
        let os = error.downcast_ref::<SystemError>().map(SystemError::os_error);
        let message = match error.downcast_ref::<SystemError>() {
            Some(system) => system.message().to_owned(),
            None => error.to_string(),
        };
        Self { record, message, os }
    }

    /// The source file captured at the raise site.
    pub fn file(&self) -> &'static str {
        self.record.file()
    }

    /// The source line captured at the raise site.
    pub fn line(&self) -> u32 {
        self.record.line()
    }

    /// The function captured at the raise site.
    pub fn function(&self) -> &'static str {
        self.record.function()
    }

    /// The context message pattern, if one was supplied.
    pub fn pattern(&self) -> Option<&'static str> {
        self.record.pattern()
    }

    /// The wrapped error's own message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The OS error information, when the wrapped error carries one.
    pub fn os_error(&self) -> Option<OsError> {
        self.os
    }

    pub(crate) fn record(&self) -> &Record {
        &self.record
    }
}

impl Clone for ErrorContext {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            message: self.message.clone(),
            os: self.os,
        }
    }
}

impl fmt::Debug for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorContext")
            .field("file", &self.file())
            .field("line", &self.line())
            .field("message", &self.message)
            .field("os", &self.os)
            .finish_non_exhaustive()
    }
}

/// An error composed with captured logging context.
///
/// Built by [`with_context`]; the `Display` output is the what()-style
/// message (pattern-formatted context message, or the wrapped error's own
/// message, with the category message appended for OS errors), computed
/// lazily and shared between clones.
pub struct Traced<E> {
    source: E,
    context: ErrorContext,
    what: SharedWhat,
}

/// Composes `error` with logging context captured at the call site.
///
/// `file` and `function` MUST be literals (`file!()` and the enclosing
/// function's name); `build` appends the arguments for `pattern` to the
/// nested record. This is the "throw" helper: raising the result is
/// returning it inside `Err`.
pub fn with_context<E>(
    error: E,
    file: &'static str,
    line: u32,
    function: &'static str,
    pattern: Option<&'static str>,
    build: impl FnOnce(&mut Record),
) -> Traced<E>
where
    E: StdError + 'static,
{
    let context = ErrorContext::capture(&error, file, line, function, pattern, build);
    Traced { source: error, context, what: SharedWhat::default() }
}

impl<E> Traced<E> {
    /// The captured logging context.
    ///
    /// This is the accessor a handler uses to inspect the raise site of an
    /// error it caught.
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// The wrapped error.
    pub fn get_ref(&self) -> &E {
        &self.source
    }

    /// Unwraps the composed error.
    pub fn into_inner(self) -> E {
        self.source
    }
}

impl<E: StdError> Traced<E> {
    fn what(&self) -> &str {
        self.what.get_or_init(|| {
            let mut text = match self.context.pattern() {
                Some(_) => match self.context.record.render() {
                    Ok(message) => message,
                    Err(err) => {
                        let detail = err.to_string();
                        crate::logger::log_internal(
                            Priority::Error,
                            file!(),
                            line!(),
                            "what",
                            "Error creating error message: {}",
                            |record| {
                                record.append(detail.as_str());
                            },
                        );
                        return String::from("<ERROR>");
                    }
                },
                None => self.context.message.clone(),
            };
            if let Some(os) = self.context.os {
                if !text.is_empty() {
                    text.push_str(": ");
                }
                text.push_str(&os.category.message(os.code));
            }
            text
        })
    }
}

impl<E: Clone> Clone for Traced<E> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            context: self.context.clone(),
            what: Arc::clone(&self.what),
        }
    }
}

impl<E: StdError> fmt::Display for Traced<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.what())
    }
}

impl<E: fmt::Debug> fmt::Debug for Traced<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Traced")
            .field("source", &self.source)
            .field("context", &self.context)
            .finish()
    }
}

impl<E: StdError + 'static> StdError for Traced<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

//
// Buffer representation
//

/// Fixed leading part of a stack- or heap-based error slot. Mirrors the
/// record header fields it was captured from.
#[repr(C)]
pub(crate) struct ExcInfo {
    pub timestamp: i64,
    pub file: &'static str,
    pub function: &'static str,
    pub pattern: Option<&'static str>,
    pub thread_id: u32,
    pub line: u32,
    /// Bytes in the nested argument buffer.
    pub used: u32,
    /// Length of the error's own message in bytes.
    pub msg_len: u16,
    pub has_nontrivial: bool,
}

/// Trailing OS error information of the system-error slot variants. Written
/// and read unaligned.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct OsErrRepr {
    pub code: i32,
    pub category: &'static dyn ErrorCategory,
}

/// Decoded view of the context part of an error slot.
pub(crate) struct ErrorCtxView<'a> {
    pub timestamp: i64,
    pub file: &'static str,
    pub function: &'static str,
    pub pattern: Option<&'static str>,
    pub thread_id: u32,
    pub line: u32,
    /// The nested argument buffer; its base keeps the buffer alignment, so
    /// nested paddings resolve the same way they were written.
    pub buffer: &'a [u8],
}

impl<'a> ErrorCtxView<'a> {
    pub(crate) fn new(info: &ExcInfo, buffer: &'a [u8]) -> Self {
        Self {
            timestamp: info.timestamp,
            file: info.file,
            function: info.function,
            pattern: info.pattern,
            thread_id: info.thread_id,
            line: info.line,
            buffer,
        }
    }
}

/// A decoded error argument.
pub(crate) struct ErrorArg<'a> {
    /// Captured context; `None` for the plain variants.
    pub ctx: Option<ErrorCtxView<'a>>,
    /// The error's own message.
    pub message: &'a str,
    pub os: Option<OsError>,
}

//
// Capturing into an outer record
//

impl<E: StdError + 'static> Encode for &Traced<E> {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        append_error_parts(record, Some(self.context()), self.context.message(), self.context.os)
    }
}

impl Encode for &SystemError {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        append_error_parts(record, None, self.message(), Some(self.os_error()))
    }
}

/// A plain error without captured context. When the error is a
/// [`SystemError`], its code and category ride along.
impl Encode for &(dyn StdError + 'static) {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        match self.downcast_ref::<SystemError>() {
            Some(system) => append_error_parts(record, None, system.message(), Some(system.os_error())),
            None => {
                let message = self.to_string();
                append_error_parts(record, None, &message, None)
            }
        }
    }
}

fn trim_message(message: &str) -> &str {
    const MAX: usize = u16::MAX as usize;
    if message.len() <= MAX {
        return message;
    }
    let mut cut = MAX;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    crate::logger::log_internal(
        Priority::Warn,
        file!(),
        line!(),
        "capture",
        "Error message of length {} trimmed to {}",
        |record| {
            record.append(message.len() as u64).append(cut as u64);
        },
    );
    &message[..cut]
}

/// Writes one error slot, choosing the layout from the captured state.
fn append_error_parts(
    record: &mut Record,
    ctx: Option<&ErrorContext>,
    message: &str,
    os: Option<OsError>,
) -> Result<(), EncodeError> {
    let escape = encode::escape_requested();
    let message = trim_message(message);
    let msg_len = message.len() as u32;

    let Some(context) = ctx else {
        return write_plain(record, message, os, escape);
    };

    let nested = context.record();
    let info = ExcInfo {
        timestamp: nested.timestamp_micros(),
        file: nested.file(),
        function: nested.function(),
        pattern: nested.pattern(),
        thread_id: nested.thread_id(),
        line: nested.line(),
        used: nested.used(),
        msg_len: msg_len as u16,
        has_nontrivial: nested.has_nontrivial(),
    };
    let os_size = if os.is_some() { OS_ERR_SIZE } else { 0 };

    if !nested.is_heap() {
        // Stack variant: the nested buffer embeds behind the info block.
        let kind = if os.is_some() { Kind::StackSystemError } else { Kind::StackError };
        let base = TAG_SIZE + EXC_INFO_SIZE + msg_len + info.used + os_size;
        let mut slot = record.write_ptr(base)?;
        let pad0 = codec::padding_for(record.used() + TAG_SIZE, EXC_INFO_ALIGN);
        if pad0 > 0 {
            slot = record.write_ptr(base + pad0)?;
        }
        let msg_at = TAG_SIZE + pad0 + EXC_INFO_SIZE;
        let pad1 = codec::padding_for(record.used() + msg_at + msg_len, MAX_ALIGN as u32);
        if pad1 > 0 {
            slot = record.write_ptr(base + pad0 + pad1)?;
        }
        let buffer_at = msg_at + msg_len + pad1;
        // SAFETY: `base + pad0 + pad1` bytes are reserved at `slot`; the
        // info block lands on an aligned offset thanks to `pad0` and the
        // nested buffer on a MAX_ALIGN offset thanks to `pad1`.
        unsafe {
            codec::write_at::<u8>(slot, 0, kind.tag(false, escape));
            ptr::write(slot.add((TAG_SIZE + pad0) as usize).cast::<ExcInfo>(), info);
            ptr::copy_nonoverlapping(message.as_ptr(), slot.add(msg_at as usize), msg_len as usize);
            let dst = slot.add(buffer_at as usize);
            if nested.has_nontrivial() {
                codec::copy_objects(nested.buffer(), dst, nested.used());
            } else {
                ptr::copy_nonoverlapping(nested.buffer(), dst, nested.used() as usize);
            }
            if let Some(os) = os {
                let repr = OsErrRepr { code: os.code, category: os.category };
                codec::write_at::<OsErrRepr>(slot, buffer_at + nested.used(), repr);
            }
        }
        record.advance(base + pad0 + pad1);
    } else {
        // Heap variant: the nested buffer lives on its own block owned by
        // the outer record.
        let kind = if os.is_some() { Kind::HeapSystemError } else { Kind::HeapError };
        let base = TAG_SIZE + EXC_INFO_SIZE + 8 + msg_len + os_size;
        let mut slot = record.write_ptr(base)?;
        let pad0 = codec::padding_for(record.used() + TAG_SIZE, EXC_INFO_ALIGN);
        if pad0 > 0 {
            slot = record.write_ptr(base + pad0)?;
        }
        let ptr_at = TAG_SIZE + pad0 + EXC_INFO_SIZE;
        let msg_at = ptr_at + 8;
        // SAFETY: the reservation covers `base + pad0` bytes; the block is
        // freed by the slot's destructor dispatch.
        unsafe {
            let block = codec::alloc_error_block(nested.used());
            if nested.has_nontrivial() {
                codec::copy_objects(nested.buffer(), block, nested.used());
            } else {
                ptr::copy_nonoverlapping(nested.buffer(), block, nested.used() as usize);
            }
            codec::write_at::<u8>(slot, 0, kind.tag(false, escape));
            ptr::write(slot.add((TAG_SIZE + pad0) as usize).cast::<ExcInfo>(), info);
            codec::write_at::<*mut u8>(slot, ptr_at, block);
            ptr::copy_nonoverlapping(message.as_ptr(), slot.add(msg_at as usize), msg_len as usize);
            if let Some(os) = os {
                let repr = OsErrRepr { code: os.code, category: os.category };
                codec::write_at::<OsErrRepr>(slot, msg_at + msg_len, repr);
            }
        }
        record.advance(base + pad0);
    }
    // Error slots always take the dispatching copy and teardown paths: heap
    // variants own a block, stack variants may nest non-trivial arguments.
    record.set_has_nontrivial();
    Ok(())
}

fn write_plain(
    record: &mut Record,
    message: &str,
    os: Option<OsError>,
    escape: bool,
) -> Result<(), EncodeError> {
    let kind = if os.is_some() { Kind::PlainSystemError } else { Kind::PlainError };
    let os_size = if os.is_some() { OS_ERR_SIZE } else { 0 };
    let msg_len = message.len() as u32;
    let size = TAG_SIZE + LEN_SIZE + os_size + msg_len;
    let slot = record.write_ptr(size)?;
    // SAFETY: `size` bytes are reserved at `slot`.
    unsafe {
        codec::write_at::<u8>(slot, 0, kind.tag(false, escape));
        codec::write_at::<u16>(slot, TAG_SIZE, msg_len as u16);
        if let Some(os) = os {
            let repr = OsErrRepr { code: os.code, category: os.category };
            codec::write_at::<OsErrRepr>(slot, TAG_SIZE + LEN_SIZE, repr);
        }
        ptr::copy_nonoverlapping(
            message.as_ptr(),
            slot.add((TAG_SIZE + LEN_SIZE + os_size) as usize),
            msg_len as usize,
        );
    }
    record.advance(size);
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::test_support::{InvalidArg, TEST_CATEGORY};
    use super::*;

    fn throw_invalid() -> Traced<InvalidArg> {
        with_context(
            InvalidArg("testarg"),
            "myfile.cpp",
            15,
            "exfunc",
            Some("Exception {} - {}"),
            |record| {
                record.append(1.8f64).append("test");
            },
        )
    }

    #[test]
    fn context_captures_raise_site() {
        let traced = throw_invalid();
        let context = traced.context();
        assert_eq!(context.file(), "myfile.cpp");
        assert_eq!(context.line(), 15);
        assert_eq!(context.function(), "exfunc");
        assert_eq!(context.message(), "testarg");
        assert!(context.os_error().is_none());
        assert!(context.record().timestamp_micros() > 0);
    }

    #[test]
    fn what_formats_the_context_pattern() {
        let traced = throw_invalid();
        assert_eq!(traced.to_string(), "Exception 1.8 - test");
    }

    #[test]
    fn what_without_pattern_uses_the_source_message() {
        let traced = with_context(InvalidArg("bare"), "f.rs", 1, "t", None, |_| {});
        assert_eq!(traced.to_string(), "bare");
    }

    #[test]
    fn system_error_captures_code_and_category() {
        let traced = with_context(
            SystemError::new(7, &TEST_CATEGORY, "testmsg"),
            "myfile.cpp",
            15,
            "exfunc",
            None,
            |_| {},
        );
        let os = traced.context().os_error().expect("os error captured");
        assert_eq!(os.code, 7);
        assert_eq!(os.category.name(), "TestError");
        assert_eq!(traced.to_string(), "testmsg: This is an error message");
    }

    #[test]
    fn clones_share_the_computed_message() {
        let traced = throw_invalid();
        let copy = traced.clone();
        assert_eq!(traced.to_string(), "Exception 1.8 - test");
        // The clone sees the already-initialized cache.
        assert!(copy.what.get().is_some());
        assert_eq!(copy.to_string(), "Exception 1.8 - test");
    }

    #[test]
    fn system_error_display_is_lazy_and_shared() {
        let error = SystemError::new(7, &TEST_CATEGORY, "testmsg");
        let copy = error.clone();
        assert!(error.what.get().is_none());
        assert_eq!(error.to_string(), "testmsg: This is an error message");
        assert!(copy.what.get().is_some());
    }

    #[test]
    fn traced_exposes_the_source() {
        let traced = throw_invalid();
        assert_eq!(traced.get_ref().0, "testarg");
        assert!(traced.source().is_some());
        assert_eq!(traced.into_inner().0, "testarg");
    }

    #[test]
    fn context_can_nest_another_traced_error() {
        let inner = with_context(
            InvalidArg("root cause"),
            "inner.rs",
            3,
            "deep",
            Some("inner {}"),
            |record| {
                record.append(1i32);
            },
        );
        let outer = with_context(
            InvalidArg("wrapper"),
            "outer.rs",
            7,
            "shallow",
            Some("outer holds {0:%w}"),
            move |record| {
                record.append(&inner);
            },
        );

        let mut record = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{0:%l}"));
        record.append(&outer);
        assert_eq!(record.render().unwrap(), "outer holds root cause");

        // Cloning walks the nested error slot recursively; both copies must
        // render the same text.
        let copy = record.clone();
        drop(record);
        assert_eq!(copy.render().unwrap(), "outer holds root cause");
    }

    #[test]
    fn record_with_error_slot_survives_growth() {
        let traced = throw_invalid();
        let mut record = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{0:%l} {1:.3}"));
        record.append(&traced);
        let filler = "y".repeat(1024);
        record.append(filler.as_str());
        assert_eq!(record.render().unwrap(), "Exception 1.8 - test yyy");
    }

    #[test]
    fn heap_variant_owns_an_independent_buffer_copy() {
        let big = "z".repeat(400);
        let traced = with_context(
            InvalidArg("grown"),
            "f.rs",
            1,
            "t",
            Some("{:.1}"),
            move |record| {
                record.append(big);
            },
        );
        assert!(traced.context().record().is_heap());

        let mut first = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{0:%l}"));
        first.append(&traced);
        let second = first.clone();
        // Dropping the original must not free the clone's nested block.
        drop(first);
        drop(traced);
        assert_eq!(second.render().unwrap(), "z");
    }

    #[test]
    fn long_error_messages_are_trimmed() {
        let at_limit = "a".repeat(u16::MAX as usize);
        let error = LongMessage(at_limit.clone());
        let mut record = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{0:%w}"));
        record.append(&error as &(dyn StdError + 'static));
        assert_eq!(record.render().unwrap(), at_limit);

        let over_limit = "a".repeat(u16::MAX as usize + 1);
        let error = LongMessage(over_limit);
        let mut record = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{0:%w}"));
        record.append(&error as &(dyn StdError + 'static));
        assert_eq!(record.render().unwrap(), at_limit);
    }

    /// An error whose message length is controlled by the test.
    #[derive(Debug)]
    struct LongMessage(String);

    impl fmt::Display for LongMessage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl StdError for LongMessage {}
}
