//! Lock-free single-producer single-consumer ring for received CAN events.
//!
//! The only channel between interrupt and main-loop context in the whole
//! firmware: the CAN receive ISR pushes timestamped events, the main loop
//! drains them. Indices are free-running and accessed with acquire/release
//! ordering: the producer's release store of the write index publishes the
//! slot contents, the consumer's acquire load observes them. No critical
//! sections, no index ever moves past an unread slot: a full ring drops the
//! incoming event and counts the overrun instead.

use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Bounded SPSC ring holding up to `N` elements.
///
/// Split into a [`Producer`] / [`Consumer`] pair before use; the `&mut`
/// receiver of [`split`](Self::split) guarantees each side exists exactly
/// once.
pub struct RxRing<T, const N: usize> {
    buffer: [UnsafeCell<MaybeUninit<T>>; N],
    /// Next slot to read. Written by the consumer only.
    read: AtomicUsize,
    /// Next slot to write. Written by the producer only.
    write: AtomicUsize,
    /// Events dropped because the ring was full.
    overruns: AtomicU32,
}

// Safety: the producer/consumer split confines each index to one side; slot
// handover is ordered by the release/acquire pair on `write` (and `read` for
// reuse in the other direction).
unsafe impl<T: Send, const N: usize> Sync for RxRing<T, N> {}

impl<T: Copy, const N: usize> RxRing<T, N> {
    /// Empty ring.
    pub const fn new() -> Self {
        Self {
            buffer: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            overruns: AtomicU32::new(0),
        }
    }

    /// Split into the ISR-side producer and the main-loop consumer.
    pub fn split(&mut self) -> (Producer<'_, T, N>, Consumer<'_, T, N>) {
        (
            Producer {
                ring: self,
                _not_sync: PhantomData,
            },
            Consumer {
                ring: self,
                _not_sync: PhantomData,
            },
        )
    }

    /// Number of elements the ring can hold.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Total number of events dropped on a full ring.
    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn push(&self, value: T) -> bool {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Relaxed);
        if write.wrapping_sub(read) >= N {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Safety: the slot is outside the readable window, so the consumer
        // is not accessing it; only one producer exists.
        unsafe {
            (*self.buffer[write % N].get()).write(value);
        }
        self.write.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    fn pop(&self) -> Option<T> {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Relaxed);
        if read == write {
            return None;
        }
        // Safety: the slot is inside the readable window published by the
        // producer's release store; only one consumer exists.
        let value = unsafe { (*self.buffer[read % N].get()).assume_init_read() };
        self.read.store(read.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    fn len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }
}

impl<T: Copy, const N: usize> Default for RxRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of the ring. Lives in interrupt context.
pub struct Producer<'a, T, const N: usize> {
    ring: &'a RxRing<T, N>,
    _not_sync: PhantomData<*mut ()>,
}

// Safety: moving the producer to another context (the ISR) is fine; it is
// the existence of more than one that would not be.
unsafe impl<T: Send, const N: usize> Send for Producer<'_, T, N> {}

impl<T: Copy, const N: usize> Producer<'_, T, N> {
    /// Push one event. On a full ring the event is dropped, the overrun
    /// counter is incremented and `false` is returned.
    pub fn push(&mut self, value: T) -> bool {
        self.ring.push(value)
    }
}

/// Read side of the ring. Lives in the main loop.
pub struct Consumer<'a, T, const N: usize> {
    ring: &'a RxRing<T, N>,
    _not_sync: PhantomData<*mut ()>,
}

// Safety: see `Producer`.
unsafe impl<T: Send, const N: usize> Send for Consumer<'_, T, N> {}

impl<T: Copy, const N: usize> Consumer<'_, T, N> {
    /// Pop the oldest event. Note that the consumer also implements
    /// [`Iterator`] to drain events until the ring is empty.
    pub fn receive(&mut self) -> nb::Result<T, Infallible> {
        self.ring.pop().ok_or(nb::Error::WouldBlock)
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// `true` if no events are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of events dropped on a full ring.
    pub fn overruns(&self) -> u32 {
        self.ring.overruns()
    }
}

impl<T: Copy, const N: usize> Iterator for Consumer<'_, T, N> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.ring.pop()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn fifo_order_preserved() {
        let mut ring: RxRing<u32, 8> = RxRing::new();
        let (mut producer, mut consumer) = ring.split();
        for i in 0..5 {
            assert!(producer.push(i));
        }
        let drained: Vec<u32> = consumer.by_ref().collect();
        assert_eq!(drained, [0, 1, 2, 3, 4]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn full_ring_drops_and_counts() {
        let mut ring: RxRing<u32, 4> = RxRing::new();
        let (mut producer, mut consumer) = ring.split();
        for i in 0..4 {
            assert!(producer.push(i));
        }
        assert!(!producer.push(99));
        assert!(!producer.push(100));
        assert_eq!(consumer.overruns(), 2);
        // The readable window is untouched by the drops.
        let drained: Vec<u32> = consumer.by_ref().collect();
        assert_eq!(drained, [0, 1, 2, 3]);
    }

    #[test]
    fn interleaved_wraps_around() {
        let mut ring: RxRing<u32, 4> = RxRing::new();
        let (mut producer, mut consumer) = ring.split();
        let mut expected = 0;
        for i in 0..100 {
            assert!(producer.push(i));
            if i % 2 == 1 {
                // Drain two for every two pushed, one iteration late.
                assert_eq!(consumer.receive(), Ok(expected));
                assert_eq!(consumer.receive(), Ok(expected + 1));
                expected += 2;
            }
        }
        assert_eq!(consumer.overruns(), 0);
    }

    #[test]
    fn no_event_observed_twice_across_threads() {
        static RING: RxRing<u32, 128> = RxRing::new();
        // Safety stand-in for the singleton split: tests construct the
        // handles directly on the static ring.
        let mut producer = Producer {
            ring: &RING,
            _not_sync: PhantomData,
        };
        let mut consumer = Consumer {
            ring: &RING,
            _not_sync: PhantomData,
        };

        const COUNT: u32 = 100_000;
        std::thread::scope(|scope| {
            scope.spawn(move || {
                let mut i = 0;
                while i < COUNT {
                    if producer.push(i) {
                        i += 1;
                    }
                    std::hint::spin_loop();
                }
            });

            let mut expected = 0;
            while expected < COUNT {
                if let Some(value) = consumer.next() {
                    assert_eq!(value, expected, "event lost, duplicated or reordered");
                    expected += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });
    }
}
