//! Bounded single-producer/single-consumer ring.
//!
//! The only cross-thread interface between a producer and its writer thread.
//! Head and tail are monotonically increasing indices synchronized with
//! acquire/release ordering; slots are only touched by the side that owns
//! them, so no locks are involved. The consumer parks when idle and is
//! unparked on push (the park token makes the pop-then-park race benign).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::Thread;
use std::time::Duration;

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    /// Set when either side is dropped; unblocks the other side.
    closed: AtomicBool,
    consumer: OnceLock<Thread>,
}

// Safety: a slot is written only by the producer while it is outside the
// [head, tail) window and read only by the consumer while inside it; the
// release store on the index publishing the slot orders the accesses.
unsafe impl<T: Send> Sync for Ring<T> {}
unsafe impl<T: Send> Send for Ring<T> {}

pub(crate) fn ring<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0);
    let mut slots = Vec::with_capacity(capacity);
    slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
    let ring = Arc::new(Ring {
        slots: slots.into_boxed_slice(),
        capacity,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        consumer: OnceLock::new(),
    });
    (
        Producer { ring: ring.clone() },
        Consumer { ring },
    )
}

pub(crate) struct Producer<T> {
    ring: Arc<Ring<T>>,
}

pub(crate) struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
    /// Push without blocking. Returns the value when the ring is full or the
    /// consumer is gone.
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        if self.ring.closed.load(Ordering::Acquire) {
            return Err(value);
        }
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        if tail - head == self.ring.capacity {
            return Err(value);
        }
        let slot = &self.ring.slots[tail % self.ring.capacity];
        unsafe { (*slot.get()).write(value) };
        self.ring.tail.store(tail + 1, Ordering::Release);
        if let Some(consumer) = self.ring.consumer.get() {
            consumer.unpark();
        }
        Ok(())
    }

    /// Push, blocking while the ring is full. Fails only when the consumer
    /// has gone away.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let mut value = value;
        let mut spins = 0u32;
        loop {
            match self.try_push(value) {
                Ok(()) => return Ok(()),
                Err(v) if self.ring.closed.load(Ordering::Acquire) => return Err(v),
                Err(v) => value = v,
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else if spins < 256 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
    }

    /// True once the consumer side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.ring.closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.ring.closed.store(true, Ordering::Release);
        if let Some(consumer) = self.ring.consumer.get() {
            consumer.unpark();
        }
    }
}

impl<T> Consumer<T> {
    /// Record the consuming thread so pushes can unpark it.
    pub fn register(&self) {
        let _ = self.ring.consumer.set(std::thread::current());
    }

    pub fn pop(&mut self) -> Option<T> {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &self.ring.slots[head % self.ring.capacity];
        let value = unsafe { (*slot.get()).assume_init_read() };
        self.ring.head.store(head + 1, Ordering::Release);
        Some(value)
    }

    /// True once the producer side has been dropped; drained commands may
    /// still be pending.
    pub fn is_closed(&self) -> bool {
        self.ring.closed.load(Ordering::Acquire)
    }

    /// Park until a push (or timeout). Call only after `register`.
    pub fn wait(&self, timeout: Duration) {
        std::thread::park_timeout(timeout);
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.ring.closed.store(true, Ordering::Release);
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for i in head..tail {
            unsafe { (*self.slots[i % self.capacity].get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_within_capacity() {
        let (mut tx, mut rx) = ring::<u32>(4);
        tx.try_push(1).unwrap();
        tx.try_push(2).unwrap();
        tx.try_push(3).unwrap();
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        tx.try_push(4).unwrap();
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), Some(4));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn try_push_full() {
        let (mut tx, mut rx) = ring::<u32>(2);
        tx.try_push(1).unwrap();
        tx.try_push(2).unwrap();
        assert_eq!(tx.try_push(3), Err(3));
        assert_eq!(rx.pop(), Some(1));
        tx.try_push(3).unwrap();
    }

    #[test]
    fn push_fails_after_consumer_drop() {
        let (mut tx, rx) = ring::<u32>(2);
        drop(rx);
        assert_eq!(tx.push(7), Err(7));
    }

    #[test]
    fn cross_thread_transfer() {
        let (mut tx, mut rx) = ring::<u64>(8);
        let n = 10_000u64;
        let handle = std::thread::spawn(move || {
            rx.register();
            let mut expected = 0;
            while expected < n {
                match rx.pop() {
                    Some(v) => {
                        assert_eq!(v, expected);
                        expected += 1;
                    }
                    None => rx.wait(Duration::from_millis(1)),
                }
            }
        });
        for i in 0..n {
            tx.push(i).unwrap();
        }
        handle.join().unwrap();
    }

    #[test]
    fn drop_releases_pending_items() {
        let (mut tx, rx) = ring(4);
        let payload = Arc::new(());
        tx.try_push(payload.clone()).unwrap();
        tx.try_push(payload.clone()).unwrap();
        drop(rx);
        drop(tx);
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}
