//! The batcher collects records emitted by a source and cuts them into windows.
//!
//! Emitting and cutting share one lock: a record is stamped and buffered inside the same
//! critical section the cut uses to swap the buffer out. Every record therefore lands in
//! exactly one batch, and the batch's window always contains the record's arrival time.
use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::types::{Batch, Record, Window, WindowIndex};

struct Buffer<V> {
    records: Vec<Record<V>>,
    window_start: Instant,
    next_index: WindowIndex,
    finished: bool,
}

/// Accumulates records and hands them out as [Batch]es of consecutive windows
pub struct Batcher<V> {
    inner: Arc<Mutex<Buffer<V>>>,
}

impl<V> Default for Batcher<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Batcher<V> {
    /// Create a batcher whose first window has index `0`
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a batcher whose first window has the given index.
    /// Used to resume window numbering after recovering from a checkpoint.
    pub fn starting_at(index: WindowIndex) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buffer {
                records: Vec::new(),
                window_start: Instant::now(),
                next_index: index,
                finished: false,
            })),
        }
    }

    /// Get a handle sources use to emit records into this batcher
    pub fn input(&self) -> BatchInput<V> {
        BatchInput {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Cut the current window: swap the buffer for an empty one and return its contents as a
    /// batch with the next window index. Returns an empty batch if nothing was emitted.
    pub fn cut(&self) -> Batch<V> {
        let mut guard = lock(&self.inner);
        // windows are half-open, so the end must lie strictly after every stamp handed out so far
        let end = Instant::now().max(guard.window_start) + Duration::from_nanos(1);
        let records = mem::take(&mut guard.records);
        let window = Window {
            index: guard.next_index,
            start: guard.window_start,
            end,
        };
        guard.next_index += 1;
        guard.window_start = end;
        drop(guard);
        debug!(window = window.index, records = records.len(), "Cut window");
        Batch::new(window, records)
    }

    /// Index the next call to [Batcher::cut] will assign
    pub fn next_index(&self) -> WindowIndex {
        lock(&self.inner).next_index
    }

    /// Number of records waiting for the next cut
    pub fn pending(&self) -> usize {
        lock(&self.inner).records.len()
    }

    /// True once an input signaled end-of-stream
    pub fn is_finished(&self) -> bool {
        lock(&self.inner).finished
    }
}

/// Cloneable handle for emitting records into a [Batcher]
pub struct BatchInput<V> {
    inner: Arc<Mutex<Buffer<V>>>,
}

impl<V> Clone for BatchInput<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> BatchInput<V> {
    /// Stamp a value with its arrival time and buffer it for the current window
    pub fn emit(&self, value: V) {
        let mut guard = lock(&self.inner);
        // stamped under the lock so the record can not arrive "after" a concurrent cut
        let arrived_at = Instant::now().max(guard.window_start);
        let record = Record::new(value, arrived_at);
        guard.records.push(record);
    }

    /// Signal that no more records will be emitted
    pub fn finish(&self) {
        lock(&self.inner).finished = true;
    }
}

/// Lock the buffer. A panicking emitter can not leave the buffer in an inconsistent state
/// (a push either happened or it did not), so a poisoned lock is recovered.
fn lock<V>(inner: &Mutex<Buffer<V>>) -> MutexGuard<'_, Buffer<V>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
