//! Lock-free MPSC job queue.
//!
//! Fixed-capacity ring of slots, each holding a job plus a one-word "ready"
//! flag. Multiple producers contend only on a CAS of `tail`; the single
//! consumer needs no synchronization on `head`.
//!
//! # Index representation
//!
//! `head` and `tail` are monotonically increasing u64 counters. A counter
//! packs an `(index, wraparound-lap)` pair: `index = count % capacity`,
//! `lap = count / capacity`. Because the counters never wrap in practice,
//! two positions with the same slot index but different laps are always
//! distinguishable, which rules out ABA on wraparound.
//!
//! # Publish-after-write
//!
//! The sole safety rule: a slot's data must never be visible to the consumer
//! before its ready flag is set. Producers write the value first, then
//! Release-store `ready = true`; the consumer Acquire-loads `ready` before
//! touching the value.
//!
//! # Full/empty semantics
//!
//! The queue is full when the next tail index would collide with the head
//! index, so a ring of capacity C holds at most C-1 items. `peek` returns
//! empty both when the queue is empty and when the head slot is still being
//! written by its claiming producer — the consumer simply retries later.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct Slot<T> {
    /// Publish flag. Set (Release) only after the value is fully written;
    /// cleared by the consumer when the value is moved out.
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity multi-producer single-consumer ring of jobs.
///
/// # Consumer contract
///
/// `peek` and `pop` must only ever be called from one thread at a time (the
/// owning worker). `push` may be called from any number of threads.
pub struct JobQueue<T> {
    slots: Box<[Slot<T>]>,
    /// Consumer position (monotonic count). Written only by the consumer.
    head: CachePadded<AtomicU64>,
    /// Producer position (monotonic count). Advanced by CAS.
    tail: CachePadded<AtomicU64>,
}

// SAFETY: producers and the consumer access disjoint slots; the ready flag
// plus the head/tail counters enforce the access discipline.
unsafe impl<T: Send> Send for JobQueue<T> {}
unsafe impl<T: Send> Sync for JobQueue<T> {}

impl<T> JobQueue<T> {
    /// Create a queue with `capacity` slots (usable capacity is
    /// `capacity - 1`; one slot stays empty to distinguish full from empty).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "job queue capacity must be at least 2");
        let slots = (0..capacity)
            .map(|_| Slot {
                ready: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Attempt to enqueue `value`.
    ///
    /// Returns `Err(value)` with no insertion if the queue is full — no
    /// blocking, no growth. Producers loop only on CAS contention.
    pub fn push(&self, value: T) -> Result<(), T> {
        let capacity = self.slots.len() as u64;
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            let head = self.head.load(Ordering::Acquire);
            // Next tail index would collide with head index: full. A stale
            // head can only make this check conservative (false full).
            if tail.wrapping_sub(head) >= capacity - 1 {
                return Err(value);
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let slot = &self.slots[(tail % capacity) as usize];
                    // SAFETY: the CAS gave this producer exclusive claim on
                    // the slot; the previous occupant of this index was
                    // consumed (occupancy < capacity-1 at claim time) and the
                    // consumer will not read it until `ready` is set below.
                    unsafe {
                        (*slot.value.get()).write(value);
                    }
                    // Publish-after-write: value first, then the flag.
                    slot.ready.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(current) => tail = current,
            }
        }
    }

    /// Return a reference to the head item without removing it.
    ///
    /// Empty result covers both "queue empty" and "head slot still being
    /// written by its producer".
    pub fn peek(&self) -> Option<&T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[(head % self.slots.len() as u64) as usize];
        if !slot.ready.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: ready was observed set with Acquire, so the producer's
        // write to the value happens-before this read. Only the single
        // consumer can clear the flag, so the reference stays valid until
        // this thread calls `pop`.
        Some(unsafe { (*slot.value.get()).assume_init_ref() })
    }

    /// Remove and return the head item.
    ///
    /// Must only be called after a successful `peek` on the same thread.
    pub fn pop(&self) -> T {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[(head % self.slots.len() as u64) as usize];
        debug_assert!(slot.ready.load(Ordering::Acquire), "pop without peek");
        // SAFETY: ready is set, so the value is initialized; moving it out
        // before clearing the flag keeps producers from reclaiming the slot
        // while we still hold the bytes.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.ready.store(false, Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        value
    }

    /// Consumer-side emptiness check; same visibility caveats as `peek`.
    pub fn is_empty(&self) -> bool {
        self.peek().is_none()
    }
}

impl<T> Drop for JobQueue<T> {
    fn drop(&mut self) {
        // Drop any published items remaining in the ring. Slots claimed but
        // never published (producer died mid-write) are leaked intentionally;
        // that can only happen after a fatal abort.
        while self.peek().is_some() {
            drop(self.pop());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_capacity_minus_one_usable() {
        let queue = JobQueue::new(4);
        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert!(queue.push(3).is_ok());
        // 4th push fails: next tail index would collide with head.
        assert_eq!(queue.push(4), Err(4));
    }

    #[test]
    fn test_wraparound_after_pop() {
        let queue = JobQueue::new(4);
        for i in 0..3 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.push(99), Err(99));

        assert_eq!(queue.peek(), Some(&0));
        assert_eq!(queue.pop(), 0);

        // One freed slot, one more push succeeds.
        assert!(queue.push(3).is_ok());
        assert_eq!(queue.push(4), Err(4));
    }

    #[test]
    fn test_single_producer_fifo_order() {
        let queue = JobQueue::new(8);
        for i in 0..7 {
            queue.push(i).unwrap();
        }
        for expected in 0..7 {
            assert_eq!(queue.peek(), Some(&expected));
            assert_eq!(queue.pop(), expected);
        }
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_peek_empty() {
        let queue: JobQueue<u32> = JobQueue::new(4);
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_wraparound_many_laps() {
        let queue = JobQueue::new(3);
        for lap in 0..100 {
            queue.push(lap * 2).unwrap();
            queue.push(lap * 2 + 1).unwrap();
            assert_eq!(queue.pop(), lap * 2);
            assert_eq!(queue.pop(), lap * 2 + 1);
        }
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_multi_producer_single_consumer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let queue = Arc::new(JobQueue::new(64));
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut item = (p, i);
                    loop {
                        match queue.push(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        // Single consumer: per-producer order must be preserved even though
        // the interleaving across producers is unordered.
        let mut last_seen = [None::<usize>; PRODUCERS];
        let mut total = 0;
        while total < PRODUCERS * PER_PRODUCER {
            if queue.peek().is_some() {
                let (p, i) = queue.pop();
                if let Some(prev) = last_seen[p] {
                    assert!(i > prev, "producer {} order violated: {} after {}", p, i, prev);
                }
                last_seen[p] = Some(i);
                total += 1;
            } else {
                std::thread::yield_now();
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_drop_releases_remaining_items() {
        let queue = JobQueue::new(8);
        let marker = Arc::new(());
        for _ in 0..5 {
            queue.push(marker.clone()).unwrap();
        }
        drop(queue);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
