//! Stateless transformations applied to every record of a batch.
//!
//! A [Pipeline] is a chain of pure functions built fluently and finished by choosing a key,
//! which yields a [KeyedPipeline]. Every record runs through the chain on its own; no stage
//! sees more than one record at a time.
use std::{cell::Cell, fmt::Display};

use thiserror::Error;
use tracing::debug;

use crate::types::{Batch, KeyedEntry};

/// A record (or an item derived from it) a fallible stage refused
#[derive(Debug, Error)]
#[error("Stage `{stage}` rejected a record: {reason}")]
pub struct PipelineRecordError {
    pub stage: String,
    pub reason: String,
}

/// Tracks per record failures while a record passes the stages
#[derive(Default)]
struct RecordContext {
    rejected: Cell<usize>,
}

impl RecordContext {
    fn reject(&self, error: PipelineRecordError) {
        debug!(stage = %error.stage, reason = %error.reason, "Dropping record");
        self.rejected.set(self.rejected.get() + 1);
    }
}

type StageFn<I, O> = dyn Fn(I, &mut dyn FnMut(O), &RecordContext) + Send + Sync;

/// A chain of stateless operations turning values of type `I` into values of type `O`
///
/// # Example
///
/// ```rust
/// use batchstream::pipeline::Pipeline;
/// use batchstream::types::Batch;
///
/// let words = Pipeline::new()
///     .flat_map(|line: String| {
///         line.split_whitespace().map(str::to_string).collect::<Vec<_>>()
///     })
///     .key_by(|word| word.clone(), |_| 1);
///
/// let out = words.apply(Batch::from_values(0, ["a b".to_string(), "a".to_string()]));
/// let keys: Vec<_> = out.entries.iter().map(|e| e.key.as_str()).collect();
/// assert_eq!(keys, vec!["a", "b", "a"]);
/// ```
pub struct Pipeline<I, O> {
    stage: Box<StageFn<I, O>>,
}

impl<I: 'static> Default for Pipeline<I, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: 'static> Pipeline<I, I> {
    /// Create a pipeline which passes values through unchanged
    pub fn new() -> Self {
        Self {
            stage: Box::new(|value: I, out: &mut dyn FnMut(I), _ctx: &RecordContext| out(value)),
        }
    }
}

impl<I: 'static, O: 'static> Pipeline<I, O> {
    fn then<P: 'static>(
        self,
        next: impl Fn(O, &mut dyn FnMut(P), &RecordContext) + Send + Sync + 'static,
    ) -> Pipeline<I, P> {
        let prev = self.stage;
        Pipeline {
            stage: Box::new(move |value: I, out: &mut dyn FnMut(P), ctx: &RecordContext| {
                prev(value, &mut |o: O| next(o, &mut *out, ctx), ctx)
            }),
        }
    }

    /// Transform every value
    pub fn map<P: 'static>(self, mapper: impl Fn(O) -> P + Send + Sync + 'static) -> Pipeline<I, P> {
        self.then(move |value, out, _| out(mapper(value)))
    }

    /// Turn every value into any number of values, e.g. split a line into words
    pub fn flat_map<P: 'static, It>(
        self,
        mapper: impl Fn(O) -> It + Send + Sync + 'static,
    ) -> Pipeline<I, P>
    where
        It: IntoIterator<Item = P>,
    {
        self.then(move |value, out, _| {
            for x in mapper(value) {
                out(x)
            }
        })
    }

    /// Only retain values for which the predicate returns true
    pub fn filter(self, predicate: impl Fn(&O) -> bool + Send + Sync + 'static) -> Pipeline<I, O> {
        self.then(move |value, out, _| {
            if predicate(&value) {
                out(value)
            }
        })
    }

    /// Transform values, discarding all for which the mapper returns `None`
    pub fn filter_map<P: 'static>(
        self,
        mapper: impl Fn(O) -> Option<P> + Send + Sync + 'static,
    ) -> Pipeline<I, P> {
        self.then(move |value, out, _| {
            if let Some(x) = mapper(value) {
                out(x)
            }
        })
    }

    /// Transform values with a fallible function.
    /// Values the function fails on are dropped and counted as rejected; a failure never
    /// aborts the batch.
    pub fn try_map<P: 'static, E: Display>(
        self,
        name: &str,
        mapper: impl Fn(O) -> Result<P, E> + Send + Sync + 'static,
    ) -> Pipeline<I, P> {
        let name = name.to_string();
        self.then(move |value, out, ctx| match mapper(value) {
            Ok(x) => out(x),
            Err(e) => ctx.reject(PipelineRecordError {
                stage: name.clone(),
                reason: e.to_string(),
            }),
        })
    }

    /// Finish the pipeline by extracting a key and a value from every item
    pub fn key_by<K: 'static, V: 'static>(
        self,
        key: impl Fn(&O) -> K + Send + Sync + 'static,
        value: impl Fn(O) -> V + Send + Sync + 'static,
    ) -> KeyedPipeline<I, K, V> {
        self.keyed(move |x| (key(&x), value(x)))
    }

    /// Finish the pipeline by splitting every item into a key and a value
    pub fn keyed<K: 'static, V: 'static>(
        self,
        split: impl Fn(O) -> (K, V) + Send + Sync + 'static,
    ) -> KeyedPipeline<I, K, V> {
        KeyedPipeline {
            inner: self.map(move |x| {
                let (k, v) = split(x);
                KeyedEntry::new(k, v)
            }),
        }
    }

    /// Run a single value through the pipeline
    pub fn run(&self, value: I) -> Vec<O> {
        let mut out = Vec::new();
        (self.stage)(value, &mut |o: O| out.push(o), &RecordContext::default());
        out
    }
}

/// Result of running one batch through a [KeyedPipeline]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput<K, V> {
    /// Keyed entries in record order, and in emission order within a record
    pub entries: Vec<KeyedEntry<K, V>>,
    /// Number of records in the batch
    pub records: usize,
    /// Number of items a fallible stage dropped
    pub rejected: usize,
}

/// A [Pipeline] producing keyed entries, ready to feed the state store
pub struct KeyedPipeline<I, K, V> {
    inner: Pipeline<I, KeyedEntry<K, V>>,
}

impl<I: 'static, K: 'static, V: 'static> KeyedPipeline<I, K, V> {
    /// Apply the pipeline to every record of the batch, consuming the batch
    pub fn apply(&self, batch: Batch<I>) -> PipelineOutput<K, V> {
        let records = batch.len();
        let ctx = RecordContext::default();
        let mut entries = Vec::with_capacity(records);
        for record in batch.into_records() {
            (self.inner.stage)(record.value, &mut |e: KeyedEntry<K, V>| entries.push(e), &ctx);
        }
        PipelineOutput {
            entries,
            records,
            rejected: ctx.rejected.get(),
        }
    }
}
