//! Bounded single-producer/single-consumer ring buffer.
//!
//! Used for the background-worker hand-off (one ring per (RPC instance,
//! worker) direction) and the session-management event queue drained in
//! event-loop step 6. FIFO order is preserved per queue.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed-capacity SPSC ring. Capacity is rounded up internally; callers
/// should treat [`SpscRing::push`] failure as backpressure (`kRingExhausted`),
/// not as an error to propagate blindly.
pub struct SpscRing<T> {
    buf: Box<[Slot<T>]>,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SpscRing capacity must be non-zero");
        let buf = (0..capacity)
            .map(|_| Slot { value: UnsafeCell::new(MaybeUninit::uninit()) })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { buf, capacity, head: AtomicUsize::new(0), tail: AtomicUsize::new(0) }
    }

    fn index(&self, raw: usize) -> usize {
        raw % self.capacity
    }

    /// Called by the single producer. Returns `Err(item)` if the ring is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity {
            return Err(item);
        }
        let idx = self.index(tail);
        unsafe {
            (*self.buf[idx].value.get()).write(item);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Called by the single consumer. Returns `None` if the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = self.index(head);
        let value = unsafe { (*self.buf[idx].value.get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::SpscRing;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_single_thread() {
        let ring: SpscRing<u32> = SpscRing::new(4);
        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn push_fails_when_full() {
        let ring: SpscRing<u32> = SpscRing::new(2);
        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert_eq!(ring.push(3), Err(3));
    }

    #[test]
    fn preserves_fifo_across_threads() {
        let ring = Arc::new(SpscRing::<u64>::new(64));
        let producer_ring = ring.clone();
        let producer = thread::spawn(move || {
            let mut next = 0u64;
            while next < 10_000 {
                if producer_ring.push(next).is_ok() {
                    next += 1;
                }
            }
        });

        let mut received = Vec::with_capacity(10_000);
        while received.len() < 10_000 {
            if let Some(v) = ring.pop() {
                received.push(v);
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..10_000).collect::<Vec<_>>());
    }
}
