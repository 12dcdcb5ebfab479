//! Logging macros capturing the call site.
//!
//! The `log_*!` family forwards to [`crate::log`] with `file!()`, `line!()`
//! and the enclosing function's name filled in; the `slog_*!` family uses
//! the no-throw entry point. Arguments after the pattern are appended to the
//! record in order.

/// The name of the enclosing function, without its module path.
#[macro_export]
macro_rules! function_name {
    () => {{
        fn marker() {}
        fn name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let full = name_of(marker);
        let full = full.strip_suffix("::marker").unwrap_or(full);
        match full.rfind("::") {
            Some(at) => &full[at + 2..],
            None => full,
        }
    }};
}

/// Trims a path to the part after the last separator, so log lines carry
/// `lib.rs` instead of the full `file!()` path.
#[must_use]
pub fn short_file_name(path: &'static str) -> &'static str {
    let bytes = path.as_bytes();
    let mut index = bytes.len();
    while index > 0 {
        let byte = bytes[index - 1];
        if byte == b'/' || byte == b'\\' {
            break;
        }
        index -= 1;
    }
    &path[index..]
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log_at {
    ($entry:ident, $priority:expr, $pattern:expr $(, $arg:expr)* $(,)?) => {{
        let file = $crate::short_file_name(file!());
        let function = $crate::function_name!();
        $crate::$entry($priority, file, line!(), function, $pattern, |record| {
            $( record.append($arg); )*
            let _ = record;
        });
    }};
}

/// Logs at [`Priority::Trace`](crate::Priority::Trace).
#[macro_export]
macro_rules! log_trace {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log, $crate::Priority::Trace, $pattern $(, $arg)*)
    };
}

/// Logs at [`Priority::Debug`](crate::Priority::Debug).
#[macro_export]
macro_rules! log_debug {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log, $crate::Priority::Debug, $pattern $(, $arg)*)
    };
}

/// Logs at [`Priority::Info`](crate::Priority::Info).
#[macro_export]
macro_rules! log_info {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log, $crate::Priority::Info, $pattern $(, $arg)*)
    };
}

/// Logs at [`Priority::Warn`](crate::Priority::Warn).
#[macro_export]
macro_rules! log_warn {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log, $crate::Priority::Warn, $pattern $(, $arg)*)
    };
}

/// Logs at [`Priority::Error`](crate::Priority::Error).
#[macro_export]
macro_rules! log_error {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log, $crate::Priority::Error, $pattern $(, $arg)*)
    };
}

/// Logs at [`Priority::Fatal`](crate::Priority::Fatal).
#[macro_export]
macro_rules! log_fatal {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log, $crate::Priority::Fatal, $pattern $(, $arg)*)
    };
}

/// Like [`log_trace!`] but swallows all failures.
#[macro_export]
macro_rules! slog_trace {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log_no_throw, $crate::Priority::Trace, $pattern $(, $arg)*)
    };
}

/// Like [`log_debug!`] but swallows all failures.
#[macro_export]
macro_rules! slog_debug {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log_no_throw, $crate::Priority::Debug, $pattern $(, $arg)*)
    };
}

/// Like [`log_info!`] but swallows all failures.
#[macro_export]
macro_rules! slog_info {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log_no_throw, $crate::Priority::Info, $pattern $(, $arg)*)
    };
}

/// Like [`log_warn!`] but swallows all failures.
#[macro_export]
macro_rules! slog_warn {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log_no_throw, $crate::Priority::Warn, $pattern $(, $arg)*)
    };
}

/// Like [`log_error!`] but swallows all failures.
#[macro_export]
macro_rules! slog_error {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log_no_throw, $crate::Priority::Error, $pattern $(, $arg)*)
    };
}

/// Like [`log_fatal!`] but swallows all failures.
#[macro_export]
macro_rules! slog_fatal {
    ($pattern:expr $(, $arg:expr)* $(,)?) => {
        $crate::__log_at!(log_no_throw, $crate::Priority::Fatal, $pattern $(, $arg)*)
    };
}

/// Logs a `Copy` value and evaluates to it, so an expression can be logged
/// by wrapping it. The value is appended as argument `{0}`, further
/// arguments follow.
///
/// ```
/// # fn compute() -> i32 { 21 }
/// let doubled = deferlog::log_result!(deferlog::Priority::Debug, compute() * 2, "doubled: {}");
/// assert_eq!(doubled, 42);
/// ```
#[macro_export]
macro_rules! log_result {
    ($priority:expr, $result:expr, $pattern:expr $(, $arg:expr)* $(,)?) => {{
        let result = $result;
        $crate::__log_at!(log, $priority, $pattern, result $(, $arg)*);
        result
    }};
}

/// Raises an error composed with logging context: expands to an early
/// `return Err(...)` carrying a [`Traced`](crate::Traced) error.
#[macro_export]
macro_rules! throw_with_context {
    ($error:expr) => {
        return Err($crate::with_context(
            $error,
            $crate::short_file_name(file!()),
            line!(),
            $crate::function_name!(),
            None,
            |_| {},
        ))
    };
    ($error:expr, $pattern:expr $(, $arg:expr)* $(,)?) => {
        return Err($crate::with_context(
            $error,
            $crate::short_file_name(file!()),
            line!(),
            $crate::function_name!(),
            Some($pattern),
            |record| {
                $( record.append($arg); )*
                let _ = record;
            },
        ))
    };
}
