//! Batchstream is a micro-batch stream processing engine: a paced source feeds records into
//! fixed-time windows, every window runs through a stateless pipeline and a keyed state store,
//! and the results of each window are handed to a sink. Keyed state survives restarts through
//! checkpoints.
pub mod batcher;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod pipeline;
pub mod sinks;
pub mod sources;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
