//! The replacement-field engine used to render records.
//!
//! Patterns use `{index:spec}` / `{name:spec}` fields with the usual
//! fill/align/sign/`#`/`0`/width/`.precision`/type spec grammar. Two
//! extensions exist: a `?alt` suffix names the literal to emit for null
//! pointees, and error arguments interpret their spec as the `%`-directive
//! language of [`crate::error::spec`]. Escaped arguments have their
//! formatted output C-escaped exactly once, guarded against double escaping
//! by a thread-local depth counter.

use std::borrow::Cow;
use std::cell::Cell;

use snafu::Snafu;

pub(crate) use crate::record::codec::{Arg, Value};

/// The format engine rejected a pattern/argument pairing.
#[derive(Debug, Snafu)]
pub enum RenderError {
    /// The pattern is not well-formed.
    #[snafu(display("malformed pattern at byte {at}"))]
    Malformed {
        /// Byte offset of the offending character.
        at: usize,
    },
    /// Records carry positional arguments only.
    #[snafu(display("unknown argument reference `{name}`"))]
    UnknownName {
        /// The name used in the pattern.
        name: String,
    },
    /// A field referenced an argument that was never appended.
    #[snafu(display("argument index {index} out of range"))]
    IndexOutOfRange {
        /// The referenced index.
        index: usize,
    },
    /// An error spec used a directive outside the supported set.
    #[snafu(display("unknown format directive `%{directive}`"))]
    UnknownDirective {
        /// The unrecognized directive character.
        directive: char,
    },
}

thread_local! {
    static ESCAPE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Renders `pattern` against decoded arguments.
pub(crate) fn render(pattern: &str, args: &[Arg<'_>]) -> Result<String, RenderError> {
    let mut out = String::with_capacity(pattern.len() + 16);
    let bytes = pattern.as_bytes();
    let mut i = 0;
    let mut next_auto = 0usize;
    let mut literal_from = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push_str(&pattern[literal_from..i]);
                out.push('{');
                i += 2;
                literal_from = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push_str(&pattern[literal_from..i]);
                out.push('}');
                i += 2;
                literal_from = i;
            }
            b'}' => return Err(RenderError::Malformed { at: i }),
            b'{' => {
                out.push_str(&pattern[literal_from..i]);
                let (reference, spec, end) = parse_field(pattern, i)?;
                let index = match reference {
                    FieldRef::Auto => {
                        let index = next_auto;
                        next_auto += 1;
                        index
                    }
                    FieldRef::Index(index) => index,
                    FieldRef::Name(name) => {
                        return Err(RenderError::UnknownName { name: name.to_owned() })
                    }
                };
                let arg = args
                    .get(index)
                    .ok_or(RenderError::IndexOutOfRange { index })?;
                format_arg(arg, spec, args, &mut out)?;
                i = end;
                literal_from = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&pattern[literal_from..]);
    Ok(out)
}

/// Formats one argument with `spec` into a fresh string. Used by the error
/// spec language for `{N}` references.
pub(crate) fn render_single(
    arg: &Arg<'_>,
    spec: &str,
    args: &[Arg<'_>],
) -> Result<String, RenderError> {
    let mut out = String::new();
    format_arg(arg, spec, args, &mut out)?;
    Ok(out)
}

enum FieldRef<'p> {
    Auto,
    Index(usize),
    Name(&'p str),
}

/// Parses the field starting at the `{` at `start`. Returns the reference,
/// the raw spec (without the leading `:`) and the offset just past the `}`.
fn parse_field(pattern: &str, start: usize) -> Result<(FieldRef<'_>, &str, usize), RenderError> {
    let bytes = pattern.as_bytes();
    let mut i = start + 1;
    let ref_from = i;
    while i < bytes.len() && bytes[i] != b':' && bytes[i] != b'}' {
        i += 1;
    }
    if i == bytes.len() {
        return Err(RenderError::Malformed { at: start });
    }
    let reference = &pattern[ref_from..i];
    let reference = if reference.is_empty() {
        FieldRef::Auto
    } else if reference.bytes().all(|b| b.is_ascii_digit()) {
        FieldRef::Index(reference.parse().map_err(|_| RenderError::Malformed { at: ref_from })?)
    } else {
        FieldRef::Name(reference)
    };

    if bytes[i] == b'}' {
        return Ok((reference, "", i + 1));
    }

    // Scan the spec up to the matching brace. Error specs may nest `{N}`
    // references and escape characters with a backslash.
    let spec_from = i + 1;
    let mut depth = 0u32;
    i = spec_from;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 1;
                if i == bytes.len() {
                    return Err(RenderError::Malformed { at: i - 1 });
                }
            }
            b'{' => depth += 1,
            b'}' if depth == 0 => {
                return Ok((reference, &pattern[spec_from..i], i + 1));
            }
            b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    Err(RenderError::Malformed { at: start })
}

fn format_arg(
    arg: &Arg<'_>,
    spec: &str,
    args: &[Arg<'_>],
    out: &mut String,
) -> Result<(), RenderError> {
    with_escape_filter(arg.escaped, out, |out| match &arg.value {
        Value::Error(err) => {
            let spec = if spec.is_empty() { crate::error::spec::DEFAULT_SPEC } else { spec };
            crate::error::spec::format_error(err, spec, args, out).map(drop)
        }
        value => {
            let spec = Spec::parse(spec)?;
            format_value(value, &spec, out)
        }
    })
}

/// Runs `body`, C-escaping its output when the argument asked for it.
///
/// A nested invocation (an escaped error argument whose context holds
/// escaped arguments of its own) must not escape twice; the thread-local
/// depth counter suppresses the inner pass.
fn with_escape_filter(
    escaped: bool,
    out: &mut String,
    body: impl FnOnce(&mut String) -> Result<(), RenderError>,
) -> Result<(), RenderError> {
    if !escaped || ESCAPE_DEPTH.with(Cell::get) > 0 {
        return body(out);
    }
    let mut tmp = String::new();
    ESCAPE_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = body(&mut tmp);
    ESCAPE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result?;
    match escape_c(&tmp) {
        Cow::Borrowed(_) => out.push_str(&tmp),
        Cow::Owned(escaped) => out.push_str(&escaped),
    }
    Ok(())
}

/// Escapes a string according to C rules.
///
/// Only the backslash and bytes below 0x20 are replaced; everything else
/// passes through untouched. Borrows when no replacement was needed.
pub(crate) fn escape_c(text: &str) -> Cow<'_, str> {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let bytes = text.as_bytes();
    let mut result = String::new();
    let mut from = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\\' || b < 0x20 {
            if result.is_empty() {
                result.reserve(text.len() + 4);
            }
            result.push_str(&text[from..i]);
            result.push('\\');
            match b {
                b'\\' => result.push('\\'),
                b'\n' => result.push('n'),
                b'\r' => result.push('r'),
                b'\t' => result.push('t'),
                0x08 => result.push('b'),
                0x0c => result.push('f'),
                0x0b => result.push('v'),
                0x07 => result.push('a'),
                _ => {
                    result.push('x');
                    result.push(HEX[usize::from(b) / 16] as char);
                    result.push(HEX[usize::from(b) % 16] as char);
                }
            }
            from = i + 1;
        }
    }
    if result.is_empty() {
        Cow::Borrowed(text)
    } else {
        result.push_str(&text[from..]);
        Cow::Owned(result)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Center,
    Right,
}

/// A parsed format spec.
struct Spec<'s> {
    fill: char,
    align: Option<Align>,
    plus: bool,
    alternate: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
    ty: Option<char>,
    /// Text after `?`: the literal to print for null pointees.
    null_alt: Option<&'s str>,
}

impl<'s> Spec<'s> {
    fn parse(spec: &'s str) -> Result<Self, RenderError> {
        let (spec, null_alt) = match spec.find('?') {
            Some(at) => (&spec[..at], Some(&spec[at + 1..])),
            None => (spec, None),
        };
        let mut parsed = Spec {
            fill: ' ',
            align: None,
            plus: false,
            alternate: false,
            zero: false,
            width: 0,
            precision: None,
            ty: None,
            null_alt,
        };
        let chars: Vec<char> = spec.chars().collect();
        let mut i = 0;

        let as_align = |c: char| match c {
            '<' => Some(Align::Left),
            '^' => Some(Align::Center),
            '>' => Some(Align::Right),
            _ => None,
        };
        if chars.len() >= 2 {
            if let Some(align) = as_align(chars[1]) {
                parsed.fill = chars[0];
                parsed.align = Some(align);
                i = 2;
            }
        }
        if parsed.align.is_none() {
            if let Some(align) = chars.first().copied().and_then(as_align) {
                parsed.align = Some(align);
                i = 1;
            }
        }
        if chars.get(i) == Some(&'+') {
            parsed.plus = true;
            i += 1;
        }
        if chars.get(i) == Some(&'#') {
            parsed.alternate = true;
            i += 1;
        }
        if chars.get(i) == Some(&'0') {
            parsed.zero = true;
            i += 1;
        }
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            parsed.width = parsed.width * 10 + chars[i].to_digit(10).unwrap_or(0) as usize;
            i += 1;
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let mut precision = 0usize;
            let mut digits = 0;
            while chars.get(i).is_some_and(char::is_ascii_digit) {
                precision = precision * 10 + chars[i].to_digit(10).unwrap_or(0) as usize;
                i += 1;
                digits += 1;
            }
            if digits == 0 {
                return Err(RenderError::Malformed { at: 0 });
            }
            parsed.precision = Some(precision);
        }
        if let Some(&ty) = chars.get(i) {
            if !matches!(ty, 'b' | 'o' | 'x' | 'X' | 'e' | 'E' | 'd') {
                return Err(RenderError::Malformed { at: 0 });
            }
            parsed.ty = Some(ty);
            i += 1;
        }
        if i != chars.len() {
            return Err(RenderError::Malformed { at: 0 });
        }
        Ok(parsed)
    }
}

fn format_value(value: &Value<'_>, spec: &Spec<'_>, out: &mut String) -> Result<(), RenderError> {
    match value {
        Value::Null => {
            out.push_str(spec.null_alt.unwrap_or("(null)"));
            Ok(())
        }
        Value::Bool(v) => {
            pad(out, if *v { "true" } else { "false" }, spec, Align::Left);
            Ok(())
        }
        Value::Char(v) => {
            let mut buffer = [0u8; 4];
            pad(out, v.encode_utf8(&mut buffer), spec, Align::Left);
            Ok(())
        }
        Value::I8(v) => signed(out, i128::from(*v), spec),
        Value::I16(v) => signed(out, i128::from(*v), spec),
        Value::I32(v) => signed(out, i128::from(*v), spec),
        Value::I64(v) => signed(out, i128::from(*v), spec),
        Value::U8(v) => unsigned(out, u128::from(*v), spec),
        Value::U16(v) => unsigned(out, u128::from(*v), spec),
        Value::U32(v) => unsigned(out, u128::from(*v), spec),
        Value::U64(v) => unsigned(out, u128::from(*v), spec),
        Value::F32(v) => float(out, f64::from(*v), spec),
        Value::F64(v) => float(out, *v, spec),
        Value::Ptr(address) => {
            let text = format!("{address:#x}");
            pad(out, &text, spec, Align::Right);
            Ok(())
        }
        Value::Str(text) => {
            string(out, text, spec);
            Ok(())
        }
        Value::WideStr(units) => {
            match String::from_utf16(units) {
                Ok(text) => string(out, &text, spec),
                Err(_) => {
                    report_encoding_error(units.len());
                    out.push_str("<ERROR>");
                }
            }
            Ok(())
        }
        Value::Custom(display) => {
            let text = format!("{display}");
            string(out, &text, spec);
            Ok(())
        }
        Value::Error(_) => unreachable!("error arguments use the directive language"),
    }
}

fn report_encoding_error(units: usize) {
    crate::logger::log_internal(
        crate::priority::Priority::Error,
        file!(),
        line!(),
        "render",
        "Invalid UTF-16 string of {} units",
        |record| {
            record.append(units as u64);
        },
    );
}

fn signed(out: &mut String, value: i128, spec: &Spec<'_>) -> Result<(), RenderError> {
    let sign = if value < 0 {
        "-"
    } else if spec.plus {
        "+"
    } else {
        ""
    };
    integer(out, sign, value.unsigned_abs(), spec)
}

fn unsigned(out: &mut String, value: u128, spec: &Spec<'_>) -> Result<(), RenderError> {
    integer(out, if spec.plus { "+" } else { "" }, value, spec)
}

fn integer(out: &mut String, sign: &str, magnitude: u128, spec: &Spec<'_>) -> Result<(), RenderError> {
    let digits = match spec.ty {
        None | Some('d') => magnitude.to_string(),
        Some('x') => format!("{magnitude:x}"),
        Some('X') => format!("{magnitude:X}"),
        Some('o') => format!("{magnitude:o}"),
        Some('b') => format!("{magnitude:b}"),
        Some(_) => return Err(RenderError::Malformed { at: 0 }),
    };
    let prefix = if spec.alternate {
        match spec.ty {
            Some('x') => "0x",
            Some('X') => "0X",
            Some('o') => "0o",
            Some('b') => "0b",
            _ => "",
        }
    } else {
        ""
    };
    push_number(out, sign, prefix, &digits, spec);
    Ok(())
}

fn float(out: &mut String, value: f64, spec: &Spec<'_>) -> Result<(), RenderError> {
    let rendered = match (spec.ty, spec.precision) {
        (None | Some('d'), None) => format!("{value}"),
        (None | Some('d'), Some(precision)) => format!("{value:.precision$}"),
        (Some('e'), None) => format!("{value:e}"),
        (Some('e'), Some(precision)) => format!("{value:.precision$e}"),
        (Some('E'), None) => format!("{value:E}"),
        (Some('E'), Some(precision)) => format!("{value:.precision$E}"),
        (Some(_), _) => return Err(RenderError::Malformed { at: 0 }),
    };
    let (sign, digits) = match rendered.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None if spec.plus && value.is_sign_positive() => ("+", rendered.as_str()),
        None => ("", rendered.as_str()),
    };
    push_number(out, sign, "", digits, spec);
    Ok(())
}

fn push_number(out: &mut String, sign: &str, prefix: &str, digits: &str, spec: &Spec<'_>) {
    let body_len = sign.len() + prefix.len() + digits.chars().count();
    if spec.zero && spec.align.is_none() && spec.width > body_len {
        out.push_str(sign);
        out.push_str(prefix);
        for _ in 0..spec.width - body_len {
            out.push('0');
        }
        out.push_str(digits);
        return;
    }
    let text = format!("{sign}{prefix}{digits}");
    pad(out, &text, spec, Align::Right);
}

fn string(out: &mut String, text: &str, spec: &Spec<'_>) {
    match spec.precision {
        Some(precision) if text.chars().count() > precision => {
            let truncated: String = text.chars().take(precision).collect();
            pad(out, &truncated, spec, Align::Left);
        }
        _ => pad(out, text, spec, Align::Left),
    }
}

fn pad(out: &mut String, text: &str, spec: &Spec<'_>, default_align: Align) {
    let len = text.chars().count();
    if spec.width <= len {
        out.push_str(text);
        return;
    }
    let missing = spec.width - len;
    let (before, after) = match spec.align.unwrap_or(default_align) {
        Align::Left => (0, missing),
        Align::Right => (missing, 0),
        Align::Center => (missing / 2, missing - missing / 2),
    };
    for _ in 0..before {
        out.push(spec.fill);
    }
    out.push_str(text);
    for _ in 0..after {
        out.push(spec.fill);
    }
}
