//! Custom argument payloads.
//!
//! Two flavors exist. `Copy` payloads are stored together with a
//! monomorphized function pointer that reconstructs the display reference
//! from the payload bytes. Payloads that are merely `Clone` additionally
//! carry a static vtable so the buffer can duplicate and tear them down
//! without knowing their type. Moving a buffer never touches the vtable:
//! Rust values are bitwise-movable, so relocation transfers ownership.

use std::fmt::Display;
use std::mem;
use std::ptr;

use crate::record::codec::{self, Kind, CUSTOM_HEADER, TAG_SIZE};
use crate::record::{encode, EncodeError, Record, MAX_ALIGN};

/// Reconstructs a display reference from a payload the encoder wrote.
pub(crate) type MakeDisplayFn = unsafe fn(*const u8) -> *const (dyn Display + 'static);

/// Per-type dispatch table for payloads that need more than a byte copy.
pub(crate) struct ArgVtable {
    /// Duplicates the payload. May panic (a clone is allowed to fail).
    pub clone: unsafe fn(*const u8, *mut u8),
    /// Runs the payload's destructor. Must not panic.
    pub drop: unsafe fn(*mut u8),
    pub display: MakeDisplayFn,
}

unsafe fn make_display<T: Display + 'static>(payload: *const u8) -> *const (dyn Display + 'static) {
    payload.cast::<T>() as *const dyn Display
}

unsafe fn clone_payload<T: Clone>(src: *const u8, dst: *mut u8) {
    let copy = (*src.cast::<T>()).clone();
    ptr::write(dst.cast::<T>(), copy);
}

unsafe fn drop_payload<T>(payload: *mut u8) {
    ptr::drop_in_place(payload.cast::<T>());
}

fn vtable_of<T: Clone + Display + Send + 'static>() -> &'static ArgVtable {
    const {
        &ArgVtable {
            clone: clone_payload::<T>,
            drop: drop_payload::<T>,
            display: make_display::<T>,
        }
    }
}

/// Static admission checks for a custom payload type.
fn check_payload<T>() {
    const {
        assert!(
            mem::size_of::<T>() < 1 << 28,
            "custom log arguments are capped at 2^28 bytes"
        );
        assert!(
            mem::align_of::<T>() <= MAX_ALIGN,
            "custom log arguments must not require alignment above 16"
        );
    }
}

impl Record {
    /// Appends a custom value that is plain data (`Copy`).
    ///
    /// The bytes of `value` are copied into the buffer and rendered through
    /// its `Display` implementation when the record is formatted.
    pub fn append_custom<T>(&mut self, value: &T) -> &mut Self
    where
        T: Copy + Display + Send + 'static,
    {
        match write_trivial(self, value) {
            Ok(()) => self,
            Err(err) => panic!("cannot append log argument: {err}"),
        }
    }

    /// Appends a custom value that owns resources (`Clone`).
    ///
    /// The value moves into the buffer; its destructor runs when the record
    /// is dropped.
    pub fn append_custom_owned<T>(&mut self, value: T) -> &mut Self
    where
        T: Clone + Display + Send + 'static,
    {
        match write_owned(self, value) {
            Ok(()) => self,
            Err(err) => panic!("cannot append log argument: {err}"),
        }
    }
}

fn write_trivial<T>(record: &mut Record, value: &T) -> Result<(), EncodeError>
where
    T: Copy + Display + Send + 'static,
{
    check_payload::<T>();
    let payload = write_custom_header(
        record,
        Kind::TrivialCustom,
        DispatchPtr::Make(make_display::<T>),
        mem::size_of::<T>() as u32,
        mem::align_of::<T>() as u32,
    )?;
    // SAFETY: `payload` is aligned for T and has size_of::<T>() reserved.
    unsafe {
        ptr::write(payload.cast::<T>(), *value);
    }
    Ok(())
}

fn write_owned<T>(record: &mut Record, value: T) -> Result<(), EncodeError>
where
    T: Clone + Display + Send + 'static,
{
    check_payload::<T>();
    let payload = write_custom_header(
        record,
        Kind::OwnedCustom,
        DispatchPtr::Vtable(vtable_of::<T>()),
        mem::size_of::<T>() as u32,
        mem::align_of::<T>() as u32,
    )?;
    // SAFETY: `payload` is aligned for T; ownership of `value` transfers
    // into the buffer, which from here on is responsible for dropping it.
    unsafe {
        ptr::write(payload.cast::<T>(), value);
    }
    record.set_has_nontrivial();
    Ok(())
}

enum DispatchPtr {
    Make(MakeDisplayFn),
    Vtable(&'static ArgVtable),
}

/// Writes tag, padding amount, dispatch pointer and size; returns the
/// address where the payload goes and advances `used` past the whole slot.
fn write_custom_header(
    record: &mut Record,
    kind: Kind,
    dispatch: DispatchPtr,
    size: u32,
    align: u32,
) -> Result<*mut u8, EncodeError> {
    let escape = encode::escape_requested();
    let total = CUSTOM_HEADER + size;
    let mut slot = record.write_ptr(total)?;
    let pad = codec::padding_for(record.used() + CUSTOM_HEADER, align);
    if pad > 0 {
        slot = record.write_ptr(total + pad)?;
    }
    // SAFETY: `slot` points at `total + pad` reserved bytes.
    unsafe {
        codec::write_at::<u8>(slot, 0, kind.tag(false, escape));
        codec::write_at::<u8>(slot, TAG_SIZE, pad as u8);
        match dispatch {
            DispatchPtr::Make(make) => codec::write_at::<MakeDisplayFn>(slot, TAG_SIZE + 1, make),
            DispatchPtr::Vtable(vtable) => {
                codec::write_at::<*const ArgVtable>(slot, TAG_SIZE + 1, vtable);
            }
        }
        codec::write_at::<u32>(slot, TAG_SIZE + 1 + 8, size);
    }
    record.advance(total + pad);
    // SAFETY: stays within the reservation made above.
    Ok(unsafe { slot.add((CUSTOM_HEADER + pad) as usize) })
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::priority::Priority;
    use crate::record::Record;

    #[derive(Clone, Copy)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl fmt::Display for Point {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "({}, {})", self.x, self.y)
        }
    }

    /// Counts clones and drops through shared counters.
    #[derive(Clone)]
    struct Tracked {
        label: String,
        drops: Arc<AtomicUsize>,
    }

    impl fmt::Display for Tracked {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.label)
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn trivial_custom_renders_through_display() {
        let mut record = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{}"));
        record.append_custom(&Point { x: 3, y: -4 });
        assert_eq!(record.render().unwrap(), "(3, -4)");
    }

    #[test]
    fn owned_custom_drops_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut record = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{}"));
            record.append_custom_owned(Tracked {
                label: String::from("alive"),
                drops: Arc::clone(&drops),
            });
            assert_eq!(record.render().unwrap(), "alive");
            assert_eq!(drops.load(Ordering::Relaxed), 0);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cloned_record_duplicates_owned_payloads() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut record = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{}"));
            record.append_custom_owned(Tracked {
                label: String::from("shared"),
                drops: Arc::clone(&drops),
            });
            let copy = record.clone();
            drop(record);
            assert_eq!(copy.render().unwrap(), "shared");
        }
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn growth_relocates_owned_payloads_without_double_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut record = Record::new(Priority::Debug, "f.rs", 1, "t", Some("{} {}"));
            record.append_custom_owned(Tracked {
                label: String::from("early"),
                drops: Arc::clone(&drops),
            });
            let filler = "y".repeat(1024);
            record.append(filler.as_str());
            assert_eq!(record.render().unwrap(), format!("early {filler}"));
        }
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
