//! The pattern language for formatting error arguments.
//!
//! Distinct from the outer `{…}` replacement fields: directives start with
//! `%`, a backslash escapes one character, and `%[...]` groups emit their
//! content only when at least one directive inside produced output. `{N}`
//! references resolve against the outer record's argument frame.

use std::fmt::Write;

use crate::error::{ErrorArg, ErrorCtxView};
use crate::fmt::{self, Arg, RenderError};

/// The spec applied when a pattern references an error argument without one.
pub(crate) const DEFAULT_SPEC: &str = "%w%[ (%C %c)]%[ @\\{%T \\[%t\\] %F:%L %f\\}]";

/// Arguments of the nested buffer are decoded at most once per format run.
#[derive(Default)]
struct NestedCache<'a> {
    args: Option<Vec<Arg<'a>>>,
}

impl<'a> NestedCache<'a> {
    fn args(&mut self, ctx: &ErrorCtxView<'a>) -> &[Arg<'a>] {
        self.args.get_or_insert_with(|| {
            // SAFETY: the nested buffer was written by the codec and keeps
            // the buffer alignment; see `ErrorCtxView::buffer`.
            unsafe { crate::record::codec::decode_args(ctx.buffer) }
        })
    }
}

/// Formats `err` according to `spec`, appending to `out`.
///
/// Returns whether any directive produced non-empty output, which is what
/// `%[...]` groups condition on.
pub(crate) fn format_error(
    err: &ErrorArg<'_>,
    spec: &str,
    outer: &[Arg<'_>],
    out: &mut String,
) -> Result<bool, RenderError> {
    let mut cache = NestedCache::default();
    format_with(err, spec, outer, out, &mut cache)
}

fn format_with<'a>(
    err: &ErrorArg<'a>,
    spec: &str,
    outer: &[Arg<'_>],
    out: &mut String,
    cache: &mut NestedCache<'a>,
) -> Result<bool, RenderError> {
    let bytes = spec.as_bytes();
    let mut produced = false;
    let mut i = 0usize;
    let mut from = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                out.push_str(&spec[from..i]);
                let Some(escaped) = spec[i + 1..].chars().next() else {
                    return Err(RenderError::Malformed { at: i });
                };
                out.push(escaped);
                i += 1 + escaped.len_utf8();
                from = i;
            }
            b'{' => {
                out.push_str(&spec[from..i]);
                i = reference(spec, i, outer, out)?;
                from = i;
            }
            b'%' => {
                out.push_str(&spec[from..i]);
                let Some(&directive) = bytes.get(i + 1) else {
                    return Err(RenderError::Malformed { at: i });
                };
                if directive == b'[' {
                    let close = find_group_end(spec, i + 2)?;
                    let mut inner = String::new();
                    if format_with(err, &spec[i + 2..close], outer, &mut inner, cache)? {
                        out.push_str(&inner);
                        produced = true;
                    }
                    i = close + 1;
                } else {
                    produced |= apply_directive(err, directive, outer, out, cache)?;
                    i += 2;
                }
                from = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&spec[from..]);
    Ok(produced)
}

/// Handles a `{N[:spec]}` reference into the outer argument frame.
fn reference(
    spec: &str,
    start: usize,
    outer: &[Arg<'_>],
    out: &mut String,
) -> Result<usize, RenderError> {
    let bytes = spec.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && bytes[i] != b':' && bytes[i] != b'}' {
        i += 1;
    }
    if i == bytes.len() || i == start + 1 {
        return Err(RenderError::Malformed { at: start });
    }
    let id = &spec[start + 1..i];
    let index: usize = if id.bytes().all(|b| b.is_ascii_digit()) {
        id.parse().map_err(|_| RenderError::Malformed { at: start })?
    } else {
        return Err(RenderError::UnknownName { name: id.to_owned() });
    };
    let sub = if bytes[i] == b':' {
        let sub_from = i + 1;
        while i < bytes.len() && bytes[i] != b'}' {
            i += 1;
        }
        if i == bytes.len() {
            return Err(RenderError::Malformed { at: start });
        }
        &spec[sub_from..i]
    } else {
        ""
    };
    let arg = outer.get(index).ok_or(RenderError::IndexOutOfRange { index })?;
    out.push_str(&fmt::render_single(arg, sub, outer)?);
    Ok(i + 1)
}

/// Finds the `]` closing a group whose content starts at `from`. Groups
/// nest through `%[` and a backslash escapes one character.
fn find_group_end(spec: &str, from: usize) -> Result<usize, RenderError> {
    let bytes = spec.as_bytes();
    let mut depth = 1u32;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'%' => {
                if bytes.get(i + 1) == Some(&b'[') {
                    depth += 1;
                    i += 2;
                } else {
                    i += 2;
                }
            }
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    Err(RenderError::Malformed { at: from })
}

fn apply_directive<'a>(
    err: &ErrorArg<'a>,
    directive: u8,
    outer: &[Arg<'_>],
    out: &mut String,
    cache: &mut NestedCache<'a>,
) -> Result<bool, RenderError> {
    match directive {
        b'T' => Ok(err.ctx.as_ref().is_some_and(|ctx| {
            out.push_str(&crate::sinks::format_timestamp(ctx.timestamp));
            true
        })),
        b't' => Ok(err.ctx.as_ref().is_some_and(|ctx| {
            let _ = write!(out, "{}", ctx.thread_id);
            true
        })),
        b'F' => Ok(err.ctx.as_ref().is_some_and(|ctx| {
            out.push_str(ctx.file);
            true
        })),
        b'L' => Ok(err.ctx.as_ref().is_some_and(|ctx| {
            let _ = write!(out, "{}", ctx.line);
            true
        })),
        b'f' => Ok(err.ctx.as_ref().is_some_and(|ctx| {
            out.push_str(ctx.function);
            true
        })),
        b'l' => log_message(err, out, cache),
        b'w' => what(err, out, cache),
        b'c' => Ok(err.os.map_or(false, |os| {
            let code = os.code as u32;
            if code & 0xFFFF_0000 != 0 {
                let _ = write!(out, "{code:#x}");
            } else {
                let _ = write!(out, "{code}");
            }
            true
        })),
        b'C' => Ok(err.os.map_or(false, |os| {
            out.push_str(os.category.name());
            true
        })),
        b'm' => Ok(err.os.map_or(false, |os| {
            out.push_str(&os.category.message(os.code));
            true
        })),
        other => Err(RenderError::UnknownDirective { directive: other as char }),
    }
}

/// `%l`: the context's pattern filled from the nested argument buffer.
fn log_message<'a>(
    err: &ErrorArg<'a>,
    out: &mut String,
    cache: &mut NestedCache<'a>,
) -> Result<bool, RenderError> {
    let Some(ctx) = &err.ctx else {
        return Ok(false);
    };
    let Some(pattern) = ctx.pattern else {
        return Ok(false);
    };
    let args = cache.args(ctx);
    out.push_str(&fmt::render(pattern, args)?);
    Ok(true)
}

/// `%w`: the error's own message if one was captured, else the context
/// message; system-error variants append the category message.
fn what<'a>(
    err: &ErrorArg<'a>,
    out: &mut String,
    cache: &mut NestedCache<'a>,
) -> Result<bool, RenderError> {
    if !err.message.is_empty() {
        out.push_str(err.message);
        if let Some(os) = err.os {
            out.push_str(": ");
            out.push_str(&os.category.message(os.code));
        }
        return Ok(true);
    }
    let had_message = log_message(err, out, cache)?;
    match err.os {
        Some(os) => {
            if had_message {
                out.push_str(": ");
            }
            out.push_str(&os.category.message(os.code));
            Ok(true)
        }
        None => Ok(had_message),
    }
}
