//! Encoding of the supported argument kinds into a record.
//!
//! Producers hand values to [`Record::append`]; each value knows how to
//! serialize itself into a slot. Wrapping a value in [`escape`] marks the
//! slot for C-escaped output; the flag is thread-local and consulted exactly
//! once per written slot.

use std::cell::Cell;
use std::mem;
use std::ptr;

use crate::priority::Priority;
use crate::record::codec::{self, Kind, LEN_SIZE, TAG_SIZE};
use crate::record::{EncodeError, Record};

/// Longest string stored inline, in bytes resp. UTF-16 code units.
const MAX_STRING_LEN: usize = u16::MAX as usize;

thread_local! {
    static ESCAPE: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn escape_requested() -> bool {
    ESCAPE.with(Cell::get)
}

/// A value whose output will be escaped according to C rules.
///
/// Built by [`escape`].
pub struct Escaped<T>(T);

/// Marks an argument for output escaping: `\n` renders as the two characters
/// `\` `n`, bytes below `0x20` as `\xHH`.
pub fn escape<T: Encode>(value: T) -> Escaped<T> {
    Escaped(value)
}

/// Serialization of one argument into a record's buffer.
///
/// Implemented for the closed set of supported kinds; custom types go
/// through [`Record::append_custom`] and [`Record::append_custom_owned`].
pub trait Encode {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError>;
}

impl<T: Encode> Encode for Escaped<T> {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        ESCAPE.with(|flag| flag.set(true));
        let result = self.0.encode(record);
        ESCAPE.with(|flag| flag.set(false));
        result
    }
}

fn write_value<T: Copy>(record: &mut Record, kind: Kind, value: T) -> Result<(), EncodeError> {
    let tag = kind.tag(false, escape_requested());
    let size = TAG_SIZE + mem::size_of::<T>() as u32;
    let slot = record.write_ptr(size)?;
    // SAFETY: `size` bytes are reserved at `slot`.
    unsafe {
        codec::write_at::<u8>(slot, 0, tag);
        codec::write_at::<T>(slot, TAG_SIZE, value);
    }
    record.advance(size);
    Ok(())
}

fn write_null(record: &mut Record) -> Result<(), EncodeError> {
    let tag = Kind::Null.tag(false, escape_requested());
    let slot = record.write_ptr(TAG_SIZE)?;
    // SAFETY: one byte is reserved at `slot`.
    unsafe {
        codec::write_at::<u8>(slot, 0, tag);
    }
    record.advance(TAG_SIZE);
    Ok(())
}

fn write_pointee<T: Primitive>(record: &mut Record, value: &T) -> Result<(), EncodeError> {
    // T::KIND always names a member of the closed kind set.
    let Some(kind) = Kind::from_tag(T::KIND) else {
        unreachable!()
    };
    let tag = kind.tag(true, escape_requested());
    let size = TAG_SIZE + mem::size_of::<T>() as u32;
    let mut slot = record.write_ptr(size)?;
    let pad = codec::padding_for(record.used() + TAG_SIZE, mem::align_of::<T>() as u32);
    if pad > 0 {
        slot = record.write_ptr(size + pad)?;
    }
    // SAFETY: `size + pad` bytes are reserved; the payload address is
    // aligned for T thanks to the padding.
    unsafe {
        codec::write_at::<u8>(slot, 0, tag);
        ptr::write(slot.add((TAG_SIZE + pad) as usize).cast::<T>(), *value);
    }
    record.advance(size + pad);
    Ok(())
}

fn write_str(record: &mut Record, text: &str) -> Result<(), EncodeError> {
    let tag = Kind::Str8.tag(false, escape_requested());
    let len = if text.len() > MAX_STRING_LEN {
        let mut cut = MAX_STRING_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        warn_trimmed(text.len(), cut);
        cut
    } else {
        text.len()
    };
    let size = TAG_SIZE + LEN_SIZE + len as u32;
    let slot = record.write_ptr(size)?;
    // SAFETY: `size` bytes are reserved at `slot`; characters need no
    // padding.
    unsafe {
        codec::write_at::<u8>(slot, 0, tag);
        codec::write_at::<u16>(slot, TAG_SIZE, len as u16);
        ptr::copy_nonoverlapping(
            text.as_ptr(),
            slot.add((TAG_SIZE + LEN_SIZE) as usize),
            len,
        );
    }
    record.advance(size);
    Ok(())
}

fn write_wide(record: &mut Record, units: &[u16]) -> Result<(), EncodeError> {
    let tag = Kind::Str16.tag(false, escape_requested());
    let len = if units.len() > MAX_STRING_LEN {
        warn_trimmed(units.len(), MAX_STRING_LEN);
        MAX_STRING_LEN
    } else {
        units.len()
    };
    let size = TAG_SIZE + LEN_SIZE + (len as u32) * 2;
    let mut slot = record.write_ptr(size)?;
    let pad = codec::padding_for(record.used() + TAG_SIZE + LEN_SIZE, 2);
    if pad > 0 {
        slot = record.write_ptr(size + pad)?;
    }
    // SAFETY: `size + pad` bytes are reserved; the code units start at a
    // 2-aligned offset.
    unsafe {
        codec::write_at::<u8>(slot, 0, tag);
        codec::write_at::<u16>(slot, TAG_SIZE, len as u16);
        ptr::copy_nonoverlapping(
            units.as_ptr().cast::<u8>(),
            slot.add((TAG_SIZE + LEN_SIZE + pad) as usize),
            len * 2,
        );
    }
    record.advance(size + pad);
    Ok(())
}

fn warn_trimmed(from: usize, to: usize) {
    crate::logger::log_internal(
        Priority::Warn,
        file!(),
        line!(),
        "encode",
        "String of length {} trimmed to {}",
        |record| {
            record.append(from as u64).append(to as u64);
        },
    );
}

/// The argument kinds which can also be logged through a null-safe pointer.
///
/// Sealed; the set is closed by design.
pub trait Primitive: Copy + sealed::Sealed {
    #[doc(hidden)]
    const KIND: u8;
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! primitives {
    ($($ty:ty => $kind:ident => $store:expr;)*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Primitive for $ty {
                const KIND: u8 = Kind::$kind as u8;
            }

            impl Encode for $ty {
                fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
                    let store = $store;
                    write_value(record, Kind::$kind, store(self))
                }
            }
        )*
    };
}

primitives! {
    bool => Bool => |v: bool| v as u8;
    char => Char => |v: char| v as u32;
    i8 => I8 => |v| v;
    u8 => U8 => |v| v;
    i16 => I16 => |v| v;
    u16 => U16 => |v| v;
    i32 => I32 => |v| v;
    u32 => U32 => |v| v;
    i64 => I64 => |v| v;
    u64 => U64 => |v| v;
    f32 => F32 => |v| v;
    f64 => F64 => |v| v;
}

impl Encode for isize {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        write_value(record, Kind::I64, self as i64)
    }
}

impl Encode for usize {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        write_value(record, Kind::U64, self as u64)
    }
}

/// Null-safe pointee: `None` encodes a null slot, `Some` the pointed-to
/// value with the pointer flag set so format specs may supply `?alt`.
impl<T: Primitive> Encode for Option<&T> {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        match self {
            None => write_null(record),
            Some(value) => write_pointee(record, value),
        }
    }
}

/// Addresses are logged as opaque values; the pointee MUST NOT be accessed
/// because it may no longer exist when the record is rendered.
impl<T> Encode for *const T {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        write_value(record, Kind::Ptr, self as usize as u64)
    }
}

impl<T> Encode for *mut T {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        write_value(record, Kind::Ptr, self as usize as u64)
    }
}

impl Encode for &str {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        write_str(record, self)
    }
}

impl Encode for &String {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        write_str(record, self)
    }
}

impl Encode for String {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        write_str(record, &self)
    }
}

/// UTF-16 text, stored as raw code units and converted when rendered.
impl Encode for &[u16] {
    fn encode(self, record: &mut Record) -> Result<(), EncodeError> {
        write_wide(record, self)
    }
}
