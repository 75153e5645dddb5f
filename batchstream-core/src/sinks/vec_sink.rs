use std::{
    ops::RangeBounds,
    sync::{Arc, Mutex},
};

use super::{Sink, WindowOutput};

/// Collects window outputs into a shared vector.
/// All clones share the vector, so a clone kept by a test sees everything the driver's copy
/// received.
#[derive(Clone)]
pub struct VecSink<T> {
    inner: Arc<Mutex<Vec<T>>>,
}
impl<T> Default for VecSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> VecSink<T> {
    pub fn new() -> Self {
        VecSink {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn give(&self, value: T) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(value)
    }

    /// Remove the given range of collected values
    pub fn drain_vec<R: RangeBounds<usize>>(&self, range: R) -> Vec<T> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(range)
            .collect()
    }

    /// Number of values currently held
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> IntoIterator for VecSink<T> {
    type Item = T;

    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.drain_vec(..).into_iter()
    }
}

impl<K, R> Sink<K, R> for VecSink<WindowOutput<K, R>>
where
    K: Send + 'static,
    R: Send + 'static,
{
    fn emit(&mut self, output: WindowOutput<K, R>) {
        self.give(output);
    }
}
