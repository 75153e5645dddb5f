//! Keyed state kept across windows.
//!
//! The [StateStore] splits its keys over hash partitions, each behind its own lock. A window's
//! update first takes every partition lock it needs and only then mutates anything, so an
//! update either applies completely or not at all. Partitions are then updated in parallel,
//! with exactly one writer per partition.
use std::{
    mem,
    sync::{Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{Key, KeyedEntry, WindowIndex};

pub mod partitioners;

use partitioners::hash_select;

/// How long to back off between attempts on a contended lock
const LOCK_POLL: Duration = Duration::from_micros(200);

/// User defined accumulator logic.
///
/// Called once per key and window with every value the window produced for that key and the
/// key's current state (`None` on first occurrence). Returns the new state and a result to
/// emit for this window.
pub trait UpdateFn<K, V, S, R>: Sync {
    fn update(&self, key: &K, incoming: Option<Vec<V>>, current: Option<S>) -> (S, R);
}

impl<K, V, S, R, F> UpdateFn<K, V, S, R> for F
where
    F: Fn(&K, Option<Vec<V>>, Option<S>) -> (S, R) + Sync,
{
    fn update(&self, key: &K, incoming: Option<Vec<V>>, current: Option<S>) -> (S, R) {
        self(key, incoming, current)
    }
}

/// Which keys the update function is called for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateScope {
    /// Only keys which received values in the window
    #[default]
    TouchedKeys,
    /// Every stored key. Keys without values in the window receive `None` as input.
    AllKeys,
}

/// Errors reading or updating a [StateStore]. A failed update never changes the store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// A lock was not acquired within the store's lock timeout
    #[error("Timed out after {0:?} waiting for a state partition lock")]
    LockTimeout(Duration),
    /// An update function panicked while holding the partition's lock
    #[error("State partition {0} is poisoned by a panicked update")]
    Poisoned(usize),
    /// The window is at or below the last applied window
    #[error("Window {window} was already applied (last applied window is {last})")]
    StaleWindow {
        /// Window which was offered
        window: WindowIndex,
        /// Last applied window
        last: WindowIndex,
    },
    /// The window is past the one following the last applied window
    #[error("Window {got} would skip windows, expected window {expected}")]
    WindowGap {
        /// The only window which may be applied next
        expected: WindowIndex,
        /// Window which was offered
        got: WindowIndex,
    },
}

impl StateError {
    /// True for errors which may go away when the update is attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::LockTimeout(_))
    }
}

/// Contents of a [StateStore] at a window boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: Key, S: DeserializeOwned"))]
pub struct StateSnapshot<K: Key, S> {
    /// Last window applied to the state, `None` if no window was applied yet
    pub last_window: Option<WindowIndex>,
    /// State of every key
    pub state: IndexMap<K, S>,
}

/// Key-value state partitioned by key hash
pub struct StateStore<K, S> {
    /// Last applied window. Held for the whole update, which serializes windows.
    window: Mutex<Option<WindowIndex>>,
    partitions: Vec<Mutex<IndexMap<K, S>>>,
    lock_timeout: Duration,
    scope: UpdateScope,
}

/// Values one key received in the window, tagged with the key's first appearance
type TouchedKey<K, V> = (usize, K, Vec<V>);
/// A result, ordered by first appearance. Untouched keys (only in [UpdateScope::AllKeys]) have
/// no position and are reported last.
type KeyResult<K, R> = (Option<usize>, K, R);

impl<K, S> StateStore<K, S>
where
    K: Key,
    S: Send,
{
    /// Create an empty store with the given number of partitions (at least one)
    pub fn new(partitions: usize, lock_timeout: Duration) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| Mutex::new(IndexMap::new()))
            .collect();
        Self {
            window: Mutex::new(None),
            partitions,
            lock_timeout,
            scope: UpdateScope::default(),
        }
    }

    /// Choose which keys the update function is called for
    pub fn with_scope(mut self, scope: UpdateScope) -> Self {
        self.scope = scope;
        self
    }

    /// Number of hash partitions
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Apply one window's entries.
    ///
    /// Runs `update_fn` exactly once for every distinct key in `entries` and stores the new
    /// state. Returns the results for those keys, in the order the keys first appear in
    /// `entries`. An error leaves the store unchanged.
    pub fn update<V, R>(
        &self,
        window: WindowIndex,
        entries: Vec<KeyedEntry<K, V>>,
        update_fn: &(impl UpdateFn<K, V, S, R> + ?Sized),
    ) -> Result<Vec<(K, R)>, StateError>
    where
        V: Send,
        R: Send,
    {
        let deadline = Instant::now() + self.lock_timeout;
        let mut last_window = lock_until(&self.window, deadline, self.lock_timeout, 0)?;
        check_window(*last_window, window)?;

        let mut per_partition = self.group_entries(entries);
        let mut guards = Vec::new();
        for (p, touched) in per_partition.iter().enumerate() {
            if touched.is_empty() && self.scope == UpdateScope::TouchedKeys {
                continue;
            }
            // ascending partition order, so two updates can never deadlock
            guards.push((
                p,
                lock_until(&self.partitions[p], deadline, self.lock_timeout, p)?,
            ));
        }

        let scope = self.scope;
        let locked = guards.len();
        let work = guards
            .iter_mut()
            .map(|(p, guard)| (&mut **guard, mem::take(&mut per_partition[*p])))
            .collect_vec();

        let results: Vec<Vec<KeyResult<K, R>>> = if work.len() <= 1 {
            work.into_iter()
                .map(|(state, touched)| apply_partition(state, touched, scope, update_fn))
                .collect()
        } else {
            thread::scope(|s| {
                let handles = work
                    .into_iter()
                    .map(|(state, touched)| {
                        s.spawn(move || apply_partition(state, touched, scope, update_fn))
                    })
                    .collect_vec();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                    .collect()
            })
        };

        *last_window = Some(window);
        let mut results = results.into_iter().flatten().collect_vec();
        // stable sort keeps untouched keys in partition order
        results.sort_by_key(|(order, _, _)| (order.is_none(), *order));
        debug!(
            window,
            keys = results.len(),
            partitions = locked,
            "Applied window to state"
        );
        Ok(results.into_iter().map(|(_, k, r)| (k, r)).collect())
    }

    /// Group entries by key and the keys by partition
    fn group_entries<V>(&self, entries: Vec<KeyedEntry<K, V>>) -> Vec<Vec<TouchedKey<K, V>>> {
        let mut by_key: IndexMap<K, Vec<V>> = IndexMap::new();
        for entry in entries {
            by_key.entry(entry.key).or_default().push(entry.value);
        }
        let mut per_partition: Vec<Vec<TouchedKey<K, V>>> =
            (0..self.partitions.len()).map(|_| Vec::new()).collect();
        for (order, (key, values)) in by_key.into_iter().enumerate() {
            per_partition[hash_select(&key, self.partitions.len())].push((order, key, values));
        }
        per_partition
    }

    /// Index of the last window applied to this store
    pub fn last_window(&self) -> Result<Option<WindowIndex>, StateError> {
        let deadline = Instant::now() + self.lock_timeout;
        Ok(*lock_until(&self.window, deadline, self.lock_timeout, 0)?)
    }

    /// Number of keys with state
    pub fn len(&self) -> Result<usize, StateError> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut total = 0;
        for (p, partition) in self.partitions.iter().enumerate() {
            total += lock_until(partition, deadline, self.lock_timeout, p)?.len();
        }
        Ok(total)
    }

    /// True if no key has state
    pub fn is_empty(&self) -> Result<bool, StateError> {
        self.len().map(|l| l == 0)
    }

    /// Replace the store's contents, e.g. with state recovered from a checkpoint
    pub fn restore(&self, snapshot: StateSnapshot<K, S>) -> Result<(), StateError> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut last_window = lock_until(&self.window, deadline, self.lock_timeout, 0)?;
        let mut guards = self
            .partitions
            .iter()
            .enumerate()
            .map(|(p, partition)| lock_until(partition, deadline, self.lock_timeout, p))
            .collect::<Result<Vec<_>, _>>()?;
        for guard in guards.iter_mut() {
            guard.clear();
        }
        let partition_count = guards.len();
        for (key, value) in snapshot.state {
            guards[hash_select(&key, partition_count)].insert(key, value);
        }
        *last_window = snapshot.last_window;
        Ok(())
    }
}

impl<K, S> StateStore<K, S>
where
    K: Key,
    S: Clone + Send,
{
    /// Get a copy of the state of one key
    pub fn get(&self, key: &K) -> Result<Option<S>, StateError> {
        let deadline = Instant::now() + self.lock_timeout;
        let p = hash_select(key, self.partitions.len());
        Ok(lock_until(&self.partitions[p], deadline, self.lock_timeout, p)?
            .get(key)
            .cloned())
    }

    /// Copy the whole store. The copy is consistent: no window is applied while it is taken.
    pub fn snapshot(&self) -> Result<StateSnapshot<K, S>, StateError> {
        let deadline = Instant::now() + self.lock_timeout;
        let last_window = lock_until(&self.window, deadline, self.lock_timeout, 0)?;
        let mut state = IndexMap::new();
        for (p, partition) in self.partitions.iter().enumerate() {
            let guard = lock_until(partition, deadline, self.lock_timeout, p)?;
            state.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(StateSnapshot {
            last_window: *last_window,
            state,
        })
    }
}

#[cfg(test)]
impl<K, S> StateStore<K, S> {
    /// Hold a partition's lock, e.g. to make concurrent updates time out
    pub(crate) fn lock_partition(&self, partition: usize) -> MutexGuard<'_, IndexMap<K, S>> {
        self.partitions[partition].lock().unwrap()
    }
}

/// Windows must be applied in order and without gaps
fn check_window(last: Option<WindowIndex>, window: WindowIndex) -> Result<(), StateError> {
    match last {
        None => Ok(()),
        Some(last) if window <= last => Err(StateError::StaleWindow { window, last }),
        Some(last) if window > last + 1 => Err(StateError::WindowGap {
            expected: last + 1,
            got: window,
        }),
        Some(_) => Ok(()),
    }
}

/// Run the update function for one partition
fn apply_partition<K, V, S, R>(
    state: &mut IndexMap<K, S>,
    touched: Vec<TouchedKey<K, V>>,
    scope: UpdateScope,
    update_fn: &(impl UpdateFn<K, V, S, R> + ?Sized),
) -> Vec<KeyResult<K, R>>
where
    K: Key,
{
    let untouched = match scope {
        UpdateScope::TouchedKeys => Vec::new(),
        UpdateScope::AllKeys => {
            let touched_keys: IndexSet<&K> = touched.iter().map(|(_, k, _)| k).collect();
            state
                .keys()
                .filter(|k| !touched_keys.contains(k))
                .cloned()
                .collect_vec()
        }
    };

    let mut results = Vec::with_capacity(touched.len() + untouched.len());
    for (order, key, values) in touched {
        let current = state.swap_remove(&key);
        let (new_state, result) = update_fn.update(&key, Some(values), current);
        state.insert(key.clone(), new_state);
        results.push((Some(order), key, result));
    }
    for key in untouched {
        let current = state.swap_remove(&key);
        let (new_state, result) = update_fn.update(&key, None, current);
        state.insert(key.clone(), new_state);
        results.push((None, key, result));
    }
    results
}

/// Lock a mutex, giving up at the deadline
fn lock_until<T>(
    mutex: &Mutex<T>,
    deadline: Instant,
    timeout: Duration,
    partition: usize,
) -> Result<MutexGuard<'_, T>, StateError> {
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => return Err(StateError::Poisoned(partition)),
            Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                return Err(StateError::LockTimeout(timeout))
            }
            Err(TryLockError::WouldBlock) => thread::sleep(LOCK_POLL),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::testing::{entries, sum_update};

    fn store(partitions: usize) -> StateStore<String, u64> {
        StateStore::new(partitions, Duration::from_secs(5))
    }

    #[test]
    fn cumulative_wordcount() {
        let store = store(4);
        let first = store
            .update(0, entries(&[("a", 1), ("b", 1), ("a", 1)]), &sum_update)
            .unwrap();
        assert_eq!(first, vec![("a".to_string(), 2), ("b".to_string(), 1)]);

        let second = store.update(1, entries(&[("b", 1)]), &sum_update).unwrap();
        assert_eq!(second, vec![("b".to_string(), 2)]);

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.last_window, Some(1));
        assert_eq!(snapshot.state.get("a"), Some(&2));
        assert_eq!(snapshot.state.get("b"), Some(&2));
    }

    #[test]
    fn calls_update_once_per_key() {
        let store = store(2);
        let calls = Mutex::new(Vec::new());
        let counting = |key: &String, incoming: Option<Vec<u64>>, current: Option<u64>| {
            calls.lock().unwrap().push(key.clone());
            sum_update(key, incoming, current)
        };
        store
            .update(0, entries(&[("x", 1), ("y", 1), ("x", 1), ("x", 1)]), &counting)
            .unwrap();
        let mut calls = calls.into_inner().unwrap();
        calls.sort();
        assert_eq!(calls, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn empty_window_advances() {
        let store = store(1);
        let out = store.update(0, Vec::<KeyedEntry<String, u64>>::new(), &sum_update).unwrap();
        assert!(out.is_empty());
        assert_eq!(store.last_window().unwrap(), Some(0));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn rejects_stale_and_gapped_windows() {
        let store = store(1);
        store.update(5, entries(&[("a", 1)]), &sum_update).unwrap();
        assert_eq!(
            store.update(5, entries(&[("a", 1)]), &sum_update),
            Err(StateError::StaleWindow { window: 5, last: 5 })
        );
        assert_eq!(
            store.update(7, entries(&[("a", 1)]), &sum_update),
            Err(StateError::WindowGap {
                expected: 6,
                got: 7
            })
        );
        // rejected windows did not change anything
        assert_eq!(store.get(&"a".to_string()).unwrap(), Some(1));
    }

    #[test]
    fn all_keys_scope_reports_untouched() {
        let store = store(3).with_scope(UpdateScope::AllKeys);
        store
            .update(0, entries(&[("a", 1), ("b", 1)]), &sum_update)
            .unwrap();
        let out: BTreeMap<String, u64> = store
            .update(1, entries(&[("b", 1)]), &sum_update)
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(
            out,
            BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 2)])
        );
    }

    /// A held partition lock makes the update time out without applying anything
    #[test]
    fn lock_timeout_leaves_state_untouched() {
        let store = StateStore::<String, u64>::new(1, Duration::from_millis(50));
        store.update(0, entries(&[("a", 1)]), &sum_update).unwrap();

        let guard = store.lock_partition(0);
        let err = store.update(1, entries(&[("a", 1)]), &sum_update).unwrap_err();
        assert!(err.is_retryable());
        drop(guard);

        assert_eq!(store.last_window().unwrap(), Some(0));
        assert_eq!(store.get(&"a".to_string()).unwrap(), Some(1));
        // the same window applies fine once the lock is free
        store.update(1, entries(&[("a", 1)]), &sum_update).unwrap();
        assert_eq!(store.get(&"a".to_string()).unwrap(), Some(2));
    }

    #[test]
    fn restore_replaces_contents() {
        let store = store(4);
        store.update(0, entries(&[("old", 1)]), &sum_update).unwrap();
        store
            .restore(StateSnapshot {
                last_window: Some(9),
                state: IndexMap::from([("new".to_string(), 5)]),
            })
            .unwrap();
        assert_eq!(store.get(&"old".to_string()).unwrap(), None);
        assert_eq!(store.get(&"new".to_string()).unwrap(), Some(5));
        assert_eq!(store.last_window().unwrap(), Some(9));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn snapshot_survives_serialization() {
        let original = store(3);
        original
            .update(0, entries(&[("a", 1), ("b", 4)]), &sum_update)
            .unwrap();
        let snapshot = original.snapshot().unwrap();
        let bytes = rmp_serde::to_vec(&snapshot).unwrap();
        let decoded: StateSnapshot<String, u64> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, snapshot);

        let restored = store(1);
        restored.restore(decoded).unwrap();
        assert_eq!(restored.get(&"b".to_string()).unwrap(), Some(4));
        assert_eq!(restored.last_window().unwrap(), Some(0));
    }

    proptest! {
        /// Partitioned, parallel application yields the same state and results as a
        /// single partition applying everything sequentially
        #[test]
        fn parallel_equals_sequential(
            windows in prop::collection::vec(
                prop::collection::vec((0u8..20, 1u64..5), 0..30),
                1..8,
            ),
            partitions in 2usize..9,
        ) {
            let sequential = store(1);
            let parallel = store(partitions);
            for (i, window) in windows.iter().enumerate() {
                let window_entries = window
                    .iter()
                    .map(|(k, v)| KeyedEntry::new(format!("k{k}"), *v))
                    .collect_vec();
                let a = sequential.update(i as u64, window_entries.clone(), &sum_update).unwrap();
                let b = parallel.update(i as u64, window_entries, &sum_update).unwrap();
                prop_assert_eq!(a, b);
            }
            prop_assert_eq!(sequential.snapshot().unwrap(), parallel.snapshot().unwrap());
        }
    }
}
