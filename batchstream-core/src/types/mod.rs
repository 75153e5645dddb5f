//! Types and traits used across Batchstream
mod data;
mod key;
mod record;

pub use data::Data;
pub use key::Key;
pub use record::{Batch, KeyedEntry, Record, Window};

/// Index of a window. Indices are contiguous and strictly increasing within a run.
pub type WindowIndex = u64;
