//! # Interrupt-Fed Byte Queue
//!
//! This module provides the bounded FIFO that sits between the UART receive
//! interrupt and the transport's blocking read.
//!
//! ## Design Principles
//!
//! 1. **Static Allocation**: Capacity is a const generic, fixed at creation.
//!
//! 2. **Never Blocks the Producer**: [`ByteQueue::push`] is safe to call from
//!    interrupt context. When the queue is full the new byte is dropped and an
//!    overflow counter increments; existing bytes are never reordered.
//!
//! 3. **Lock-Free Access**: Free-running atomic indices for the single
//!    producer / single consumer pattern, plus a waker so the consumer can
//!    sleep until the next byte instead of spinning.
//!
//! ## Memory Layout
//!
//! ```text
//! ┌──────────┬───────────────────────┬───────────┐
//! │ consumed │    readable bytes     │   free    │
//! └──────────┴───────────────────────┴───────────┘
//!            ▲                       ▲
//!          tail                    head
//!     (consumer only)          (producer only)
//! ```

use core::cell::UnsafeCell;
use core::future::poll_fn;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use core::task::{Context, Poll};

use embassy_sync::waitqueue::AtomicWaker;

/// Default queue depth, sized to hold one full chunk envelope several times over
pub const RX_QUEUE_SIZE: usize = 4096;

/// Receive counters for diagnostics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueStats {
    /// Bytes accepted into the queue since creation
    pub received: u32,
    /// Bytes dropped because the queue was full
    pub overflows: u32,
}

/// Bounded single-producer / single-consumer byte FIFO
///
/// The producer is the UART receive interrupt (or, on a host, the thread
/// pumping the serial port); the consumer is [`crate::UartTransport`].
///
/// # Example
///
/// ```rust
/// use camlink::queue::ByteQueue;
///
/// let queue: ByteQueue<8> = ByteQueue::new();
/// assert!(queue.push(0x76));
/// assert_eq!(queue.pop(), Some(0x76));
/// assert_eq!(queue.pop(), None);
/// ```
pub struct ByteQueue<const N: usize> {
    data: UnsafeCell<[u8; N]>,

    /// Next slot the producer writes (free-running)
    head: AtomicUsize,

    /// Next slot the consumer reads (free-running)
    tail: AtomicUsize,

    received: AtomicU32,
    overflows: AtomicU32,
    waker: AtomicWaker,
}

// SAFETY: `head` is only advanced by the producer and `tail` only by the
// consumer; a slot is written before `head` is published with Release and read
// after it is observed with Acquire, so no slot is accessed by both sides.
unsafe impl<const N: usize> Sync for ByteQueue<N> {}

impl<const N: usize> ByteQueue<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "ByteQueue capacity must be a power of two");
        N - 1
    };

    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            data: UnsafeCell::new([0u8; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            received: AtomicU32::new(0),
            overflows: AtomicU32::new(0),
            waker: AtomicWaker::new(),
        }
    }

    /// Total number of bytes the queue can hold
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of bytes waiting to be read
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    /// Producer side: enqueue one received byte
    ///
    /// Returns `false` if the queue was full and the byte was dropped.
    /// Never blocks, so it may be called from interrupt context.
    pub fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= N {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // SAFETY: the slot at `head` is outside the readable window, so the
        // consumer does not touch it until `head` is published below.
        unsafe {
            (*self.data.get())[head & Self::MASK] = byte;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        self.received.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
        true
    }

    /// Producer side: enqueue a burst of bytes, returning how many were kept
    pub fn push_slice(&self, bytes: &[u8]) -> usize {
        bytes.iter().filter(|&&b| self.push(b)).count()
    }

    /// Consumer side: dequeue one byte if available
    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        // SAFETY: `tail != head`, so the slot was fully written and published
        // by the producer, which will not reuse it until `tail` advances.
        let byte = unsafe { (*self.data.get())[tail & Self::MASK] };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    /// Consumer side: poll for one byte, registering the waker if empty
    pub fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<u8> {
        if let Some(byte) = self.pop() {
            return Poll::Ready(byte);
        }
        self.waker.register(cx.waker());
        // Re-check so a byte pushed between the first pop and the
        // registration is not missed.
        match self.pop() {
            Some(byte) => Poll::Ready(byte),
            None => Poll::Pending,
        }
    }

    /// Consumer side: wait until a byte is available and dequeue it
    pub async fn pop_wait(&self) -> u8 {
        poll_fn(|cx| self.poll_pop(cx)).await
    }

    /// Consumer side: discard everything currently buffered
    ///
    /// Returns the number of bytes discarded.
    pub fn reset(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.swap(head, Ordering::AcqRel);
        head.wrapping_sub(tail)
    }

    /// Snapshot of the receive counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            received: self.received.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

impl<const N: usize> Default for ByteQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
