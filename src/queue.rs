//! The segmented MPSC queue between producers and the consumer thread.
//!
//! Records live in fixed-capacity segments. Producers reserve a slot with a
//! single `fetch_add`, move-construct the record into it, stamp its
//! timestamp and publish the slot's ready flag with release ordering. The
//! producer that fills a segment's last slot rotates in the next one; any
//! producer that grabbed an index past the capacity busy-waits for that
//! rotation, bounded by a single allocation latency. The segment list is
//! guarded by a spin lock because it is touched from the wait-free producer
//! path.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::record::{Record, RECORD_SIZE};

/// Byte budget of one segment. Kept small under test so segment rotation is
/// exercised without pushing tens of thousands of records.
#[cfg(not(test))]
const SEGMENT_BYTES: usize = 8 * 1024 * 1024;
#[cfg(test)]
const SEGMENT_BYTES: usize = 64 * 1024;

/// Records per segment: whatever fits into the byte budget after the
/// segment's counters.
pub(crate) const SEGMENT_CAPACITY: u32 =
    ((SEGMENT_BYTES - 2 * std::mem::size_of::<AtomicU32>()) / RECORD_SIZE) as u32;

const _: () = assert!(SEGMENT_CAPACITY > 1);

struct Slot {
    ready: AtomicBool,
    record: UnsafeCell<MaybeUninit<Record>>,
}

/// One fixed-capacity block of record slots.
struct Segment {
    slots: Box<[Slot]>,
    /// Slots still unclaimed; the `fetch_sub` returning 1 is the
    /// segment-full signal.
    remaining: CachePadded<AtomicU32>,
    /// Slots the consumer has moved out, so teardown drops exactly the
    /// published-but-unconsumed records.
    consumed: AtomicU32,
}

impl Segment {
    fn new() -> Box<Self> {
        let slots = (0..SEGMENT_CAPACITY)
            .map(|_| Slot {
                ready: AtomicBool::new(false),
                record: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Box::new(Self {
            slots,
            remaining: CachePadded::new(AtomicU32::new(SEGMENT_CAPACITY)),
            consumed: AtomicU32::new(0),
        })
    }

    /// Moves `record` into the slot at `index` and publishes it.
    ///
    /// Returns `true` when this was the segment's last free slot.
    fn push(&self, index: u32, mut record: Record) -> bool {
        record.stamp();
        let slot = &self.slots[index as usize];
        // SAFETY: `index` was handed out by the queue's fetch_add exactly
        // once, so this thread is the slot's only writer.
        unsafe {
            (*slot.record.get()).write(record);
        }
        slot.ready.store(true, Ordering::Release);
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Moves the record at `index` out if it has been published.
    fn try_pop(&self, index: u32) -> Option<Record> {
        let slot = &self.slots[index as usize];
        if !slot.ready.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the acquire load pairs with the producer's release store,
        // so the record is fully constructed; the single consumer reads each
        // index at most once and `consumed` excludes it from teardown.
        let record = unsafe { ptr::read((*slot.record.get()).as_ptr()) };
        self.consumed.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let consumed = self.consumed.load(Ordering::Acquire);
        for slot in self.slots.iter().skip(consumed as usize) {
            if slot.ready.load(Ordering::Acquire) {
                // SAFETY: published but never popped; drop in place.
                unsafe {
                    (*slot.record.get()).assume_init_drop();
                }
            }
        }
    }
}

// SAFETY: slots are single-writer (the reserving producer) / single-reader
// (the consumer), synchronized through the ready flags.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// Test-and-set spin lock over the segment list.
///
/// Held only for a deque push/pop, so contention is bounded by the segment
/// rotation rate.
struct SpinLock {
    flag: AtomicBool,
}

impl SpinLock {
    const fn new() -> Self {
        Self { flag: AtomicBool::new(false) }
    }

    fn lock(&self) -> SpinGuard<'_> {
        let backoff = Backoff::new();
        while self.flag.swap(true, Ordering::Acquire) {
            backoff.snooze();
        }
        SpinGuard { lock: self }
    }
}

struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}

/// Which records a flush waits for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FlushMode {
    /// Wait until every record enqueued strictly before the call has been
    /// consumed.
    Checkpoint,
    /// Wait until the queue holds no records at all, including any enqueued
    /// while draining.
    Drain,
}

/// The ordered sequence of segments.
pub(crate) struct RecordQueue {
    write_index: CachePadded<AtomicU32>,
    current_write: CachePadded<AtomicPtr<Segment>>,
    /// Consumer-private positions, atomic so flushes can observe them.
    read_index: AtomicU32,
    current_read: AtomicPtr<Segment>,
    lock: SpinLock,
    segments: UnsafeCell<VecDeque<Box<Segment>>>,
}

// SAFETY: the segment list is guarded by the spin lock; every other field is
// atomic.
unsafe impl Send for RecordQueue {}
unsafe impl Sync for RecordQueue {}

impl RecordQueue {
    pub(crate) fn new() -> Self {
        let queue = Self {
            write_index: CachePadded::new(AtomicU32::new(0)),
            current_write: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            read_index: AtomicU32::new(0),
            current_read: AtomicPtr::new(ptr::null_mut()),
            lock: SpinLock::new(),
            segments: UnsafeCell::new(VecDeque::new()),
        };
        queue.rotate_write_segment();
        queue
    }

    fn with_segments<R>(&self, body: impl FnOnce(&mut VecDeque<Box<Segment>>) -> R) -> R {
        let _guard = self.lock.lock();
        // SAFETY: the spin lock serializes all access to the deque.
        body(unsafe { &mut *self.segments.get() })
    }

    /// Appends a fresh segment and makes it the write target.
    fn rotate_write_segment(&self) {
        let segment = Segment::new();
        let raw = ptr::from_ref::<Segment>(&*segment).cast_mut();
        self.current_write.store(raw, Ordering::Release);
        self.with_segments(|segments| {
            segments.push_back(segment);
            // Release so that any producer observing the reset cursor also
            // observes the new `current_write`; pairs with the acquire RMW
            // in `push`.
            self.write_index.store(0, Ordering::Release);
        });
    }

    /// Enqueues a record. Wait-free except when the current segment is being
    /// rotated, where it busy-waits for the rotating producer.
    pub(crate) fn push(&self, record: Record) {
        loop {
            // Acquire pairs with the release reset in `rotate_write_segment`:
            // a producer that sees an in-range index must also see the
            // segment that index belongs to, not the predecessor it replaced.
            let index = self.write_index.fetch_add(1, Ordering::Acquire);
            if index < SEGMENT_CAPACITY {
                // SAFETY: the write segment stays in the list until the
                // consumer has drained it, which cannot happen before this
                // slot's ready flag is published.
                let segment = unsafe { &*self.current_write.load(Ordering::Acquire) };
                if segment.push(index, record) {
                    self.rotate_write_segment();
                }
                return;
            }
            // Another producer is rotating in the next segment.
            let backoff = Backoff::new();
            while self.write_index.load(Ordering::Acquire) >= SEGMENT_CAPACITY {
                backoff.snooze();
            }
        }
    }

    /// Moves the next record out of the queue, in FIFO order.
    ///
    /// MUST only be called from the single consumer thread.
    pub(crate) fn try_pop(&self) -> Option<Record> {
        let mut segment = self.current_read.load(Ordering::Acquire);
        if segment.is_null() {
            segment = self.with_segments(|segments| match segments.front() {
                Some(front) => ptr::from_ref::<Segment>(front).cast_mut(),
                None => ptr::null_mut(),
            });
            if segment.is_null() {
                return None;
            }
            self.current_read.store(segment, Ordering::Release);
        }

        let index = self.read_index.load(Ordering::Relaxed);
        // SAFETY: segments are only removed from the list by this consumer.
        let record = unsafe { (*segment).try_pop(index) }?;
        self.read_index.store(index + 1, Ordering::Release);
        if index + 1 == SEGMENT_CAPACITY {
            self.current_read.store(ptr::null_mut(), Ordering::Release);
            self.read_index.store(0, Ordering::Release);
            self.with_segments(|segments| {
                segments.pop_front();
            });
        }
        Some(record)
    }

    /// Whether the consumer has caught up with every published record.
    ///
    /// The four loads are individually racy; only meaningful once all
    /// producers and the consumer have stopped, which is why this is test
    /// instrumentation and not part of the flush protocol.
    #[cfg(test)]
    fn is_drained(&self) -> bool {
        let write = self.current_write.load(Ordering::Acquire);
        let write_index = self.write_index.load(Ordering::Acquire);
        let read = self.current_read.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Acquire);
        if write_index >= SEGMENT_CAPACITY {
            return false;
        }
        let single_segment = self.with_segments(|segments| segments.len() == 1);
        single_segment && (read == write || read.is_null()) && read_index >= write_index
    }

    /// Waits until the records selected by `mode` have been consumed,
    /// calling `wait` whenever progress stalls.
    pub(crate) fn flush(&self, mode: FlushMode, mut wait: impl FnMut()) {
        'snapshot: loop {
            // A stable snapshot of the write position.
            let (write_segment, write_index) = loop {
                let segment = self.current_write.load(Ordering::Acquire);
                let index = self.write_index.load(Ordering::Acquire);
                if self.current_write.load(Ordering::Acquire) == segment
                    && index < SEGMENT_CAPACITY
                {
                    break (segment, index);
                }
            };
            loop {
                let read_segment = self.current_read.load(Ordering::Acquire);
                let read_index = self.read_index.load(Ordering::Acquire);
                if self.current_read.load(Ordering::Acquire) != read_segment
                    || read_index >= SEGMENT_CAPACITY
                {
                    // Rotation in progress, read again without waiting.
                    continue;
                }

                if !read_segment.is_null() && read_segment == write_segment {
                    if write_index <= read_index {
                        match mode {
                            FlushMode::Checkpoint => return,
                            FlushMode::Drain => {
                                // Done only if nothing new arrived since the
                                // snapshot.
                                if self.current_write.load(Ordering::Acquire) == write_segment
                                    && self.write_index.load(Ordering::Acquire) == write_index
                                {
                                    return;
                                }
                                continue 'snapshot;
                            }
                        }
                    }
                } else {
                    // The reader is behind on an older segment (or idle); the
                    // snapshot is consumed once the write segment has left
                    // the list.
                    let gone = self.with_segments(|segments| {
                        !segments
                            .iter()
                            .any(|segment| ptr::eq(&**segment, write_segment))
                    });
                    if gone {
                        match mode {
                            FlushMode::Checkpoint => return,
                            FlushMode::Drain => continue 'snapshot,
                        }
                    }
                }
                wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::priority::Priority;

    fn record(value: u64) -> Record {
        let mut record = Record::new(Priority::Debug, "q.rs", 1, "t", Some("{}"));
        record.append(value);
        record
    }

    fn value_of(record: &Record) -> u64 {
        record.render().unwrap().parse().unwrap()
    }

    #[test]
    fn fifo_within_a_thread() {
        let queue = RecordQueue::new();
        for value in 0..100 {
            queue.push(record(value));
        }
        for value in 0..100 {
            let popped = queue.try_pop().expect("value must be queued");
            assert_eq!(value_of(&popped), value);
        }
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn pop_on_empty_queue_is_none() {
        let queue = RecordQueue::new();
        assert!(queue.try_pop().is_none());
        assert!(queue.is_drained());
    }

    #[test]
    fn push_stamps_the_timestamp() {
        let queue = RecordQueue::new();
        queue.push(record(1));
        let popped = queue.try_pop().unwrap();
        assert!(popped.timestamp_micros() > 0);
    }

    #[test]
    fn segment_rotation_preserves_order() {
        let queue = RecordQueue::new();
        let total = u64::from(SEGMENT_CAPACITY) * 2 + 17;
        for value in 0..total {
            queue.push(record(value));
        }
        for value in 0..total {
            let popped = queue.try_pop().expect("rotation must not lose records");
            assert_eq!(value_of(&popped), value);
        }
        assert!(queue.try_pop().is_none());
        assert!(queue.is_drained());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: u64 = 8;
        let per_producer = u64::from(SEGMENT_CAPACITY) / 2 + 13;
        let queue = Arc::new(RecordQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        queue.push(record(producer * per_producer + i));
                    }
                })
            })
            .collect();

        let mut seen = vec![false; (PRODUCERS * per_producer) as usize];
        let mut count = 0u64;
        while count < PRODUCERS * per_producer {
            if let Some(popped) = queue.try_pop() {
                let value = value_of(&popped) as usize;
                assert!(!seen[value], "record {value} observed twice");
                seen[value] = true;
                count += 1;
            } else {
                thread::yield_now();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(queue.try_pop().is_none());
        assert!(seen.iter().all(|seen| *seen));
    }

    #[test]
    fn dropping_the_queue_drops_pending_records() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Clone)]
        struct Counted(Arc<AtomicUsize>);

        impl std::fmt::Display for Counted {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("counted")
            }
        }

        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = RecordQueue::new();
            for _ in 0..5 {
                let mut record = Record::new(Priority::Debug, "q.rs", 1, "t", Some("{}"));
                record.append_custom_owned(Counted(Arc::clone(&drops)));
                queue.push(record);
            }
            let popped = queue.try_pop().unwrap();
            drop(popped);
            assert_eq!(drops.load(Ordering::Relaxed), 1);
        }
        // The four unconsumed records were destroyed with the queue.
        assert_eq!(drops.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn checkpoint_flush_returns_once_consumed() {
        let queue = Arc::new(RecordQueue::new());
        for value in 0..50 {
            queue.push(record(value));
        }
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut popped = 0;
                while popped < 50 {
                    if queue.try_pop().is_some() {
                        popped += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };
        queue.flush(FlushMode::Checkpoint, thread::yield_now);
        consumer.join().unwrap();
        assert!(queue.is_drained());
    }

    #[test]
    fn drain_flush_waits_for_late_records() {
        let queue = Arc::new(RecordQueue::new());
        queue.push(record(0));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut popped = 0;
                while popped < 2 {
                    if queue.try_pop().is_some() {
                        popped += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };
        // The second record arrives while the drain is already waiting.
        let late_producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(10));
                queue.push(record(1));
            })
        };
        queue.flush(FlushMode::Drain, thread::yield_now);
        late_producer.join().unwrap();
        consumer.join().unwrap();
        assert!(queue.is_drained());
    }
}
