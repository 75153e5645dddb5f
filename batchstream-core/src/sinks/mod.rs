//! Sinks receive the results of every processed window
mod channel;
mod log;
mod stdout;
mod vec_sink;

pub use channel::ChannelSink;
pub use log::LogSink;
pub use stdout::StdOutSink;
pub use vec_sink::VecSink;

use crate::types::WindowIndex;

/// The results one window produced: one `(key, result)` pair per updated key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutput<K, R> {
    pub window: WindowIndex,
    pub results: Vec<(K, R)>,
}

impl<K, R> WindowOutput<K, R> {
    pub fn new(window: WindowIndex, results: Vec<(K, R)>) -> Self {
        Self { window, results }
    }
}

/// Receiver of window results. Every committed window is emitted exactly once, in window
/// order, including windows without results.
pub trait Sink<K, R>: 'static {
    fn emit(&mut self, output: WindowOutput<K, R>);

    /// Called once after the last window.
    /// Use this method to flush buffers or clean up any resources like external connections
    /// or file handles
    fn finish(&mut self) {}
}

impl<K, R, F> Sink<K, R> for F
where
    F: FnMut(WindowOutput<K, R>) + 'static,
{
    fn emit(&mut self, output: WindowOutput<K, R>) {
        self(output)
    }
}
