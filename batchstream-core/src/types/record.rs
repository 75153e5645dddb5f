use std::time::{Duration, Instant};

use super::WindowIndex;

/// A single unit of input, stamped with the moment the source emitted it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<V> {
    /// The payload
    pub value: V,
    /// When the record was handed to the batcher
    pub arrived_at: Instant,
}

impl<V> Record<V> {
    /// Create a record which arrived at the given instant
    pub fn new(value: V, arrived_at: Instant) -> Self {
        Self { value, arrived_at }
    }
}

/// The time interval `[start, end)` and index identifying one micro-batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Position of the window in the stream
    pub index: WindowIndex,
    /// Inclusive lower bound
    pub start: Instant,
    /// Exclusive upper bound
    pub end: Instant,
}

impl Window {
    /// Check whether an instant falls into this window
    pub fn contains(&self, instant: &Instant) -> bool {
        self.start <= *instant && *instant < self.end
    }
}

/// An immutable, ordered slice of records cut at a window boundary.
/// Batches may be empty, an empty batch is still a valid window.
#[derive(Debug, Clone)]
pub struct Batch<V> {
    window: Window,
    records: Vec<Record<V>>,
}

impl<V> Batch<V> {
    pub(crate) fn new(window: Window, records: Vec<Record<V>>) -> Self {
        Self { window, records }
    }

    /// Create a batch from plain values, stamping all of them with the window start.
    /// This is mostly useful for replaying recorded input or for tests.
    pub fn from_values(index: WindowIndex, values: impl IntoIterator<Item = V>) -> Self {
        let now = Instant::now();
        let records = values.into_iter().map(|v| Record::new(v, now)).collect();
        Self::new(
            Window {
                index,
                start: now,
                end: now + Duration::from_nanos(1),
            },
            records,
        )
    }

    /// Bounds and index of the batch's window
    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Index of the batch's window
    pub fn index(&self) -> WindowIndex {
        self.window.index
    }

    /// Records in arrival order
    pub fn records(&self) -> &[Record<V>] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no record arrived during the window
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take the records out of the batch
    pub fn into_records(self) -> Vec<Record<V>> {
        self.records
    }
}

/// A `(key, value)` pair produced by a pipeline from the records of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedEntry<K, V> {
    /// Key selecting the state the value is applied to
    pub key: K,
    /// Value handed to the update function
    pub value: V,
}

impl<K, V> KeyedEntry<K, V> {
    /// Pair a key with a value
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}
