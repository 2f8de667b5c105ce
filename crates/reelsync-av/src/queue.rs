//! Bounded packet queues connecting pipeline threads.
//!
//! A [`PacketQueue`] is a FIFO with a mutable capacity and a mutable
//! keep-length. Producers block while it is full, consumers block while it
//! holds no more than keep-length items and the producer has not called
//! [`finish`](PacketQueue::finish). Every wait is a short timed wait so the
//! caller's abort flag is looked at on each iteration; after an abort the
//! owning side relaxes the bounds (or closes the queue) to unstick whoever is
//! still blocked on the other end.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Capacity used where a queue must never block its producer.
pub const UNBOUNDED: usize = usize::MAX;

const MIN_WAIT: Duration = Duration::from_millis(1);
const MAX_WAIT: Duration = Duration::from_millis(64);

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    keep_length: usize,
    finished: bool,
    closed: bool,
}

impl<T> QueueState<T> {
    /// Never below keep-length + 1, or producer and consumer could both wait.
    fn effective_capacity(&self) -> usize {
        self.capacity.max(self.keep_length.saturating_add(1))
    }

    fn ready(&self) -> bool {
        if self.finished {
            !self.items.is_empty()
        } else {
            self.items.len() > self.keep_length
        }
    }
}

/// Blocking FIFO with runtime-adjustable capacity and keep-length.
pub struct PacketQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> fmt::Debug for PacketQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PacketQueue")
            .field("name", &self.name)
            .field("len", &state.items.len())
            .field("capacity", &state.capacity)
            .field("keep_length", &state.keep_length)
            .field("finished", &state.finished)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> PacketQueue<T> {
    /// Create a queue. A capacity of zero is treated as one.
    pub fn new(name: &'static str, capacity: usize, keep_length: usize) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                keep_length,
                finished: false,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Queue name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an item, blocking while the queue is full.
    ///
    /// The item is handed back when `abort` is set or the queue is closed.
    pub fn push(&self, item: T, abort: &AtomicBool) -> Result<(), T> {
        let mut state = self.state.lock();
        let mut wait = MIN_WAIT;
        loop {
            if state.closed || abort.load(Ordering::Acquire) {
                trace!(queue = self.name, "push abandoned");
                return Err(item);
            }
            if state.items.len() < state.effective_capacity() {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            self.not_full.wait_for(&mut state, wait);
            wait = (wait * 2).min(MAX_WAIT);
        }
    }

    /// Take the front item, blocking while no more than keep-length items
    /// are queued.
    ///
    /// Returns `None` once the queue is finished and drained, closed, or
    /// when `abort` is set.
    pub fn pop(&self, abort: &AtomicBool) -> Option<T> {
        let mut state = self.state.lock();
        let mut wait = MIN_WAIT;
        loop {
            if state.closed || abort.load(Ordering::Acquire) {
                return None;
            }
            if state.ready() {
                let item = state.items.pop_front();
                self.not_full.notify_one();
                return item;
            }
            if state.finished {
                return None;
            }
            self.not_empty.wait_for(&mut state, wait);
            wait = (wait * 2).min(MAX_WAIT);
        }
    }

    /// Take the front item if one is available above keep-length.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed || !state.ready() {
            return None;
        }
        let item = state.items.pop_front();
        self.not_full.notify_one();
        item
    }

    /// Take every item available above keep-length.
    pub fn drain_ready(&self) -> Vec<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        let floor = if state.finished { 0 } else { state.keep_length };
        let take = state.items.len().saturating_sub(floor);
        let drained: Vec<T> = state.items.drain(..take).collect();
        if !drained.is_empty() {
            self.not_full.notify_all();
        }
        drained
    }

    /// Producer is done: consumers may drain everything, then get `None`.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        self.not_empty.notify_all();
    }

    /// Shut the queue down: pending and future pushes and pops give up.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Change the capacity. Zero is treated as one.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity.max(1);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Change the keep-length.
    pub fn set_keep_length(&self, keep_length: usize) {
        let mut state = self.state.lock();
        state.keep_length = keep_length;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Current keep-length.
    pub fn keep_length(&self) -> usize {
        self.state.lock().keep_length
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True when a push would have to wait.
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.items.len() >= state.effective_capacity()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`finish`](Self::finish) was called.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// True once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Run `f` over the queued items, front to back, under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(std::collections::vec_deque::Iter<'_, T>) -> R) -> R {
        let state = self.state.lock();
        f(state.items.iter())
    }
}

/// Queue occupancy snapshot for performance monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct QueueUsage {
    /// Video packets waiting for the codec.
    pub video_in: usize,
    /// Auxiliary packets accepted and waiting for the writer (L2).
    pub aux_in: usize,
    /// Items waiting for the output stage.
    pub video_out: usize,
    /// Auxiliary items waiting for the output stage.
    pub aux_out: usize,
    /// Items waiting for the encode stage.
    pub aux_encode: usize,
    /// Items waiting for the process stage.
    pub aux_process: usize,
}
