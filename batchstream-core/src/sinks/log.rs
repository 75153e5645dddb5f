use std::fmt::Debug;

use tracing::info;

use super::{Sink, WindowOutput};

/// Logs every window's results as `info` events
pub struct LogSink;

impl<K, R> Sink<K, R> for LogSink
where
    K: Debug,
    R: Debug,
{
    fn emit(&mut self, output: WindowOutput<K, R>) {
        let window = output.window;
        for (key, result) in output.results {
            info!(window, ?key, ?result, "Window result");
        }
    }
}
