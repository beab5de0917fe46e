//! Event queue module
//!
//! The double-buffered FIFO that moves socket occurrences from
//! concurrent I/O tasks into single-threaded tick processing. Producers
//! push into a mutex-guarded pending queue; once per tick the consumer
//! swaps the pending storage into its own processing deque in O(1) and
//! pops from it without holding any lock. This is the only
//! synchronization primitive between network I/O and application logic.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// A socket lifecycle occurrence, queued for deferred processing.
#[derive(Debug)]
pub enum SocketEvent {
    /// The connection finished its handshake.
    Open,
    /// The connection was torn down.
    Close,
    /// One logical message arrived.
    Message(bytes::Bytes),
}

/// Thread-safe producer side of a double-buffered FIFO.
///
/// The consumer owns its processing `VecDeque` and calls [`drain`]
/// to exchange storage with the pending side. The swap is a pointer
/// exchange, never an element copy, so handler execution time on the
/// consumer thread cannot block producers.
///
/// [`drain`]: EventQueue::drain
pub struct EventQueue<T> {
    pending: Mutex<VecDeque<T>>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Push one item. Callable from any task.
    pub fn push(&self, item: T) {
        self.pending.lock().push_back(item);
    }

    /// Swap all pending items into `processing`, leaving the pending
    /// side empty. `processing` must be empty on entry; its storage is
    /// handed to the pending side for reuse, so capacity is recycled
    /// across ticks in both directions.
    pub fn drain(&self, processing: &mut VecDeque<T>) {
        debug_assert!(processing.is_empty());
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return;
        }
        std::mem::swap(&mut *pending, processing);
    }

    /// Number of items currently pending.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
