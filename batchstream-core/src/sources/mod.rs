//! Sources produce the records a job processes.
//!
//! A source is split in two: the [SourceImpl] knows how to open a feed, the [SourceReader] it
//! opens is polled for values. [PacedSource] runs a reader on its own thread, emitting every
//! value it yields and waiting a fixed pace between values.
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;
use tracing::{debug, info, span, warn, Level};

use crate::batcher::BatchInput;

mod channel;
mod file;
mod iterator;
mod tcp;

pub use channel::ChannelSource;
pub use file::FileSource;
pub use iterator::IteratorSource;
pub use tcp::TcpLineSource;

/// Minimum wait after a reader reported [SourcePoll::Pending]
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Result of polling a [SourceReader]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePoll<V> {
    /// A new value is available
    Ready(V),
    /// No value is available right now, poll again later
    Pending,
    /// The feed has ended, no more values will be produced
    Finished,
}

/// A feed which can be opened for reading
pub trait SourceImpl<V>: Send + 'static {
    /// Reader returned when opening this source
    type Reader: SourceReader<V>;

    /// Open the feed. Returns [SourceError::Unavailable] if the feed can not be opened.
    fn open(&mut self) -> Result<Self::Reader, SourceError>;

    /// Human readable description of the feed, used in logs
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// An opened feed
pub trait SourceReader<V>: Send + 'static {
    /// Poll the feed for the next value
    fn poll(&mut self) -> Result<SourcePoll<V>, SourceError>;

    /// Release any resources like file handles or connections.
    /// Called exactly once when the reader is no longer polled.
    fn close(&mut self) {}
}

/// Receiver of the values a source produces
pub trait Emit<V>: Send + 'static {
    /// Hand over one value
    fn emit(&mut self, value: V);

    /// Called once after the last value
    fn finish(&mut self) {}
}

impl<V> Emit<V> for BatchInput<V>
where
    V: Send + 'static,
{
    fn emit(&mut self, value: V) {
        BatchInput::emit(self, value)
    }

    fn finish(&mut self) {
        BatchInput::finish(self)
    }
}

impl<V, F> Emit<V> for F
where
    F: FnMut(V) + Send + 'static,
{
    fn emit(&mut self, value: V) {
        self(value)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source `{feed}` is unavailable")]
    Unavailable {
        feed: String,
        #[source]
        source: io::Error,
    },
    #[error("Error reading from source")]
    Read(#[source] io::Error),
    #[error("Error spawning source thread")]
    Spawn(#[source] io::Error),
    #[error("Source thread panicked")]
    Panicked,
}

/// Runs a [SourceImpl] on a dedicated thread, waiting `pace` between emitted values
pub struct PacedSource<S> {
    source: S,
    pace: Duration,
}

impl<S> PacedSource<S> {
    pub fn new(source: S, pace: Duration) -> Self {
        Self { source, pace }
    }

    /// Emit values as fast as the feed produces them
    pub fn unpaced(source: S) -> Self {
        Self::new(source, Duration::ZERO)
    }

    /// Open the feed and start emitting on a new thread.
    ///
    /// Opening happens on the calling thread, so a feed which can not be opened is reported
    /// here as [SourceError::Unavailable]. Read errors after that end the stream; they are
    /// logged but never returned.
    pub fn start<V, E>(mut self, emit: E) -> Result<SourceHandle, SourceError>
    where
        S: SourceImpl<V>,
        V: Send + 'static,
        E: Emit<V>,
    {
        let feed = self.source.describe();
        let reader = self.source.open()?;
        info!(feed = %feed, "Opened source");

        let (stop_tx, stop_rx) = flume::bounded(1);
        let finished = Arc::new(AtomicBool::new(false));
        let finished_clone = Arc::clone(&finished);
        let pace = self.pace;
        let thread_feed = feed.clone();
        let thread = thread::Builder::new()
            .name("batchstream-source".to_string())
            .spawn(move || {
                let _span = span!(Level::INFO, "source", feed = %thread_feed);
                let _span_guard = _span.enter();
                let emitted = poll_loop(reader, emit, pace, &stop_rx);
                finished_clone.store(true, Ordering::Release);
                emitted
            })
            .map_err(SourceError::Spawn)?;

        Ok(SourceHandle {
            feed,
            stop: stop_tx,
            thread,
            finished,
        })
    }
}

/// Poll the reader until it finishes, fails or is told to stop. Returns the count of emitted values.
fn poll_loop<V, R, E>(mut reader: R, mut emit: E, pace: Duration, stop: &Receiver<()>) -> u64
where
    R: SourceReader<V>,
    E: Emit<V>,
{
    let mut emitted = 0;
    loop {
        if stop_requested(stop) {
            debug!("Source stop requested");
            break;
        }
        let wait = match reader.poll() {
            Ok(SourcePoll::Ready(value)) => {
                emit.emit(value);
                emitted += 1;
                pace
            }
            Ok(SourcePoll::Pending) => pace.max(IDLE_WAIT),
            Ok(SourcePoll::Finished) => {
                info!(emitted, "Source reached end of stream");
                break;
            }
            Err(e) => {
                warn!(error = %e, emitted, "Source read failed, ending stream");
                break;
            }
        };
        if !wait.is_zero() && wait_or_stop(stop, wait) {
            debug!("Source stop requested");
            break;
        }
    }
    reader.close();
    emit.finish();
    emitted
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    match stop.try_recv() {
        Ok(()) | Err(TryRecvError::Disconnected) => true,
        Err(TryRecvError::Empty) => false,
    }
}

/// Sleep for `wait` unless a stop arrives first. Returns true if stopped.
fn wait_or_stop(stop: &Receiver<()>, wait: Duration) -> bool {
    match stop.recv_timeout(wait) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

/// Counters reported by a source after it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Number of values handed to the emitter
    pub emitted: u64,
}

/// Handle to a running [PacedSource].
/// Dropping the handle also stops the source, but does not wait for it.
pub struct SourceHandle {
    feed: String,
    stop: Sender<()>,
    thread: JoinHandle<u64>,
    finished: Arc<AtomicBool>,
}

impl SourceHandle {
    /// True once the source ended on its own or after a stop
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Stop the source and wait for its thread to exit.
    /// A source waiting out its pace is interrupted immediately.
    pub fn stop(self) -> Result<SourceStats, SourceError> {
        // the receiver is gone if the thread already exited, which is fine
        let _ = self.stop.try_send(());
        let emitted = self.thread.join().map_err(|_| SourceError::Panicked)?;
        info!(feed = %self.feed, emitted, "Source stopped");
        Ok(SourceStats { emitted })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use itertools::Itertools;

    use super::*;
    use crate::batcher::Batcher;

    struct FailingSource;
    struct FailingReader(u32);

    impl SourceImpl<u32> for FailingSource {
        type Reader = FailingReader;

        fn open(&mut self) -> Result<Self::Reader, SourceError> {
            Ok(FailingReader(0))
        }
    }

    impl SourceReader<u32> for FailingReader {
        fn poll(&mut self) -> Result<SourcePoll<u32>, SourceError> {
            self.0 += 1;
            if self.0 > 3 {
                Err(SourceError::Read(io::Error::other("boom")))
            } else {
                Ok(SourcePoll::Ready(self.0))
            }
        }
    }

    fn wait_finished(handle: &SourceHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() {
            assert!(Instant::now() < deadline, "source did not finish in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn emits_into_batcher() {
        let batcher: Batcher<i32> = Batcher::new();
        let handle = PacedSource::unpaced(IteratorSource::new(0..10))
            .start(batcher.input())
            .unwrap();
        wait_finished(&handle);
        let stats = handle.stop().unwrap();

        assert_eq!(stats.emitted, 10);
        assert!(batcher.is_finished());
        let values = batcher
            .cut()
            .into_records()
            .into_iter()
            .map(|r| r.value)
            .collect_vec();
        assert_eq!(values, (0..10).collect_vec());
    }

    /// A read error ends the stream without failing the caller
    #[test]
    fn read_error_ends_stream() {
        let batcher: Batcher<u32> = Batcher::new();
        let handle = PacedSource::unpaced(FailingSource)
            .start(batcher.input())
            .unwrap();
        wait_finished(&handle);
        assert_eq!(handle.stop().unwrap().emitted, 3);
        assert!(batcher.is_finished());
        assert_eq!(batcher.pending(), 3);
    }

    /// Stopping must not wait for the pace to elapse
    #[test]
    fn stop_interrupts_pace() {
        let batcher: Batcher<i32> = Batcher::new();
        let handle = PacedSource::new(IteratorSource::new(0..10), Duration::from_secs(60))
            .start(batcher.input())
            .unwrap();
        // wait for the first value, the source then sleeps for a minute
        let deadline = Instant::now() + Duration::from_secs(5);
        while batcher.pending() == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        let start = Instant::now();
        let stats = handle.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.emitted, 1);
        assert!(batcher.is_finished());
    }

    #[test]
    fn closure_emitter() {
        let (tx, rx) = flume::unbounded();
        let handle = PacedSource::unpaced(IteratorSource::new(["a", "b"]))
            .start(move |x: &'static str| tx.send(x).unwrap())
            .unwrap();
        wait_finished(&handle);
        handle.stop().unwrap();
        assert_eq!(rx.drain().collect_vec(), vec!["a", "b"]);
    }
}
