//! Counts words in a text file, one window per batch interval.
//!
//! Usage: `cargo run --example file_wordcount -- <path> [--follow]`
//!
//! Settings are read from `BATCHSTREAM_*` environment variables. Set
//! `BATCHSTREAM_CHECKPOINT_PATH` to keep the counts across runs.
use batchstream::{
    config::EnvConfig,
    driver::Driver,
    pipeline::Pipeline,
    sinks::StdOutSink,
    sources::FileSource,
};
use envconfig::Envconfig;
use eyre::{eyre, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or_else(|| eyre!("usage: file_wordcount <path> [--follow]"))?;
    let follow = args.next().as_deref() == Some("--follow");

    let env = EnvConfig::init_from_env()?;
    let pipeline = Pipeline::new()
        .map(|line: String| line.to_lowercase())
        .flat_map(|line: String| {
            line.split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .key_by(|word: &String| word.clone(), |_| 1u64);

    let mut driver = Driver::new(
        env.driver_config(),
        pipeline,
        |_word: &String, incoming: Option<Vec<u64>>, current: Option<u64>| {
            let total = current.unwrap_or_default() + incoming.unwrap_or_default().len() as u64;
            (total, total)
        },
        StdOutSink,
        env.checkpointer(),
    )?;
    let stop = driver.stop_handle();
    // stop on the first line typed on stdin, useful with --follow
    std::thread::spawn(move || {
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_ok() {
            stop.stop();
        }
    });

    let source = if follow {
        FileSource::follow(path)
    } else {
        FileSource::new(path)
    };
    let summary = driver.run(source)?;
    println!(
        "processed {} records in {} windows, {} words counted",
        summary.records, summary.windows, summary.entries
    );
    Ok(())
}
