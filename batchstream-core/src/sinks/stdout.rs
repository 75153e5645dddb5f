use std::fmt::Debug;

use super::{Sink, WindowOutput};

/// Prints every window's results to stdout
pub struct StdOutSink;

impl<K, R> Sink<K, R> for StdOutSink
where
    K: Debug,
    R: Debug,
{
    fn emit(&mut self, output: WindowOutput<K, R>) {
        println!("-------- window {} --------", output.window);
        for (key, result) in output.results {
            println!("{{ key: {:?}, result: {:?} }}", key, result)
        }
    }
}
