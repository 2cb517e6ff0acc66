//! A fixed-capacity single-producer/single-consumer ring buffer.
//!
//! Used for the read-cache promotion queue and the session release queue:
//! one thread only ever pushes, another only ever pops. Capacity is always a
//! power of two so index wraparound is a mask instead of a modulo.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SpscRing<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: AtomicUsize, // next slot to pop, advanced by the consumer
    tail: AtomicUsize, // next slot to push, advanced by the producer
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// `capacity` is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        self.tail.load(Ordering::Acquire).wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer-only. Returns `Err(value)` if the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.buf.len() {
            return Err(value);
        }
        let slot = &self.buf[tail & self.mask];
        unsafe {
            (*slot.get()).write(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer-only.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &self.buf[head & self.mask];
        let value = unsafe { (*slot.get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T: Copy> SpscRing<T> {
    /// Safe to call from multiple consumer threads concurrently (turning
    /// this into an SPMC ring), at the cost of a CAS instead of a plain
    /// store to advance `head`. Requires `T: Copy` since a failed CAS means
    /// re-reading the same slot.
    pub fn pop_concurrent(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let slot = &self.buf[head & self.mask];
            let value = unsafe { (*slot.get()).assume_init_read() };
            if self
                .head
                .compare_exchange_weak(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(value);
            }
        }
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_capacity_up_to_power_of_two() {
        let r: SpscRing<u32> = SpscRing::new(100);
        assert_eq!(r.capacity(), 128);
    }

    #[test]
    fn fifo_order_and_full_detection() {
        let r: SpscRing<u32> = SpscRing::new(4);
        assert_eq!(r.push(1), Ok(()));
        assert_eq!(r.push(2), Ok(()));
        assert_eq!(r.push(3), Ok(()));
        assert_eq!(r.push(4), Ok(()));
        assert_eq!(r.push(5), Err(5));
        assert_eq!(r.pop(), Some(1));
        assert_eq!(r.push(5), Ok(()));
        assert_eq!(r.pop(), Some(2));
        assert_eq!(r.pop(), Some(3));
        assert_eq!(r.pop(), Some(4));
        assert_eq!(r.pop(), Some(5));
        assert_eq!(r.pop(), None);
    }

    #[test]
    fn concurrent_producer_consumer_preserves_all_items() {
        use std::sync::Arc;
        use std::thread;
        let ring: Arc<SpscRing<u32>> = Arc::new(SpscRing::new(16));
        let producer_ring = ring.clone();
        let producer = thread::spawn(move || {
            for i in 0..10_000u32 {
                loop {
                    if producer_ring.push(i).is_ok() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        });
        let mut received = Vec::with_capacity(10_000);
        while received.len() < 10_000 {
            if let Some(v) = ring.pop() {
                received.push(v);
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..10_000).collect::<Vec<_>>());
    }
}
