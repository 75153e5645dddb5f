//! Helpers shared by the unit tests
use crate::{
    pipeline::{KeyedPipeline, Pipeline},
    types::KeyedEntry,
};

/// Turn string literals into owned lines
pub fn lines(input: &[&str]) -> Vec<String> {
    input.iter().map(|s| s.to_string()).collect()
}

/// Turn `(key, value)` literals into keyed entries
pub fn entries(input: &[(&str, u64)]) -> Vec<KeyedEntry<String, u64>> {
    input
        .iter()
        .map(|(k, v)| KeyedEntry::new(k.to_string(), *v))
        .collect()
}

/// Splits lines into words and keys every word with a count of one
pub fn wordcount_pipeline() -> KeyedPipeline<String, String, u64> {
    Pipeline::new()
        .flat_map(|line: String| {
            line.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .key_by(|word| word.clone(), |_| 1)
}

/// Adds all incoming values to the running total and reports the new total
pub fn sum_update(_key: &String, incoming: Option<Vec<u64>>, current: Option<u64>) -> (u64, u64) {
    let total = current.unwrap_or_default() + incoming.unwrap_or_default().iter().sum::<u64>();
    (total, total)
}
