//! Counts words arriving as lines on a TCP socket and reports running totals per window.
//!
//! Start a line server first, e.g. `nc -lk 9999`, then run
//! `cargo run --example socket_wordcount -- 127.0.0.1:9999`.
//! The job ends when the server closes the connection.
use std::time::Duration;

use batchstream::{
    checkpoint::Checkpointer,
    config::DriverConfig,
    driver::Driver,
    pipeline::Pipeline,
    sinks::LogSink,
    sources::TcpLineSource,
};
use eyre::Result;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9999".to_string());

    let config = DriverConfig::builder()
        .batch_interval(Duration::from_secs(2))
        .partitions(4)
        .build();
    let pipeline = Pipeline::new()
        .flat_map(|line: String| {
            line.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .key_by(|word: &String| word.clone(), |_| 1u64);

    let mut driver = Driver::new(
        config,
        pipeline,
        |_word: &String, incoming: Option<Vec<u64>>, current: Option<u64>| {
            let total = current.unwrap_or_default() + incoming.unwrap_or_default().iter().sum::<u64>();
            (total, total)
        },
        LogSink,
        Checkpointer::disabled(),
    )?;
    let summary = driver.run(TcpLineSource::new(addr))?;
    println!("{summary:?}");
    Ok(())
}
