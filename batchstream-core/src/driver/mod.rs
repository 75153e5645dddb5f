//! The driver owns a job's pipeline, state and sink and moves windows through them.
//!
//! [Driver::run] starts the source, cuts a window every batch interval and processes it before
//! the next tick. Each window runs through the pipeline, is applied to the state store, handed
//! to the sink and may be checkpointed. [Driver::process_batch] exposes the same processing for
//! batches built by the caller.
use std::{sync::Arc, time::Instant};

use backon::{BlockingRetryable, ConstantBuilder};
use flume::{Receiver, RecvTimeoutError, Sender};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, span, warn, Level};

use crate::{
    batcher::Batcher,
    checkpoint::{CheckpointError, Checkpointer},
    config::{DriverConfig, RecoveryMode},
    pipeline::KeyedPipeline,
    sinks::{Sink, WindowOutput},
    sources::{PacedSource, SourceError, SourceImpl},
    state::{StateError, StateStore, UpdateFn},
    types::{Batch, Data, Key, KeyedEntry, WindowIndex},
};

/// Lifecycle of a [Driver]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    /// Constructed but not running. Batches may be processed manually.
    Stopped,
    /// Source started, windows are cut on every tick
    Running,
    /// Source stopped, the final window is being processed
    Draining,
    /// Finished or failed, the driver can not be used again
    Terminated,
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Error applying window to state")]
    State(#[from] StateError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("Driver is {actual:?} but must be {expected:?}")]
    InvalidPhase {
        expected: DriverPhase,
        actual: DriverPhase,
    },
}

/// What [Driver::process_batch] did with a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOutcome<K, R> {
    /// The window was already committed and was not applied again
    Skipped,
    /// The window was applied and emitted with these results
    Committed { results: Vec<(K, R)> },
}

/// Counters of a driver over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Committed windows, including empty ones
    pub windows: u64,
    /// Records in committed windows
    pub records: u64,
    /// Keyed entries the pipeline produced
    pub entries: u64,
    /// Records or items dropped by failing pipeline stages
    pub dropped: u64,
    /// Checkpoints written
    pub checkpoints: u64,
    /// Last committed window
    pub last_window: Option<WindowIndex>,
}

/// Requests a running driver to drain and terminate. Can be cloned and sent to other threads.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    /// Ask the driver to drain and terminate. Does not wait for it.
    pub fn stop(&self) {
        // a full channel means a stop is already pending
        let _ = self.tx.try_send(());
    }
}

/// Runs a job: source, batcher, pipeline, state store, sink and checkpoints
pub struct Driver<I, K, V, S, R> {
    config: DriverConfig,
    pipeline: KeyedPipeline<I, K, V>,
    store: Arc<StateStore<K, S>>,
    update_fn: Box<dyn UpdateFn<K, V, S, R>>,
    sink: Box<dyn Sink<K, R>>,
    checkpointer: Checkpointer,
    phase: DriverPhase,
    /// Last window applied to the store
    committed: Option<WindowIndex>,
    summary: RunSummary,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl<I, K, V, S, R> Driver<I, K, V, S, R>
where
    I: Send + 'static,
    K: Key,
    V: Data,
    S: Data + Serialize + DeserializeOwned,
    R: Data,
{
    /// Create a driver and recover its state from the latest checkpoint, if there is one.
    ///
    /// A checkpoint which can not be decoded is an error unless `config.recovery` is
    /// [RecoveryMode::StartEmpty].
    pub fn new(
        config: DriverConfig,
        pipeline: KeyedPipeline<I, K, V>,
        update_fn: impl UpdateFn<K, V, S, R> + 'static,
        sink: impl Sink<K, R>,
        checkpointer: Checkpointer,
    ) -> Result<Self, DriverError> {
        let store = Arc::new(
            StateStore::new(config.partitions, config.lock_timeout).with_scope(config.update_scope),
        );
        let (stop_tx, stop_rx) = flume::bounded(1);
        let mut driver = Self {
            config,
            pipeline,
            store,
            update_fn: Box::new(update_fn),
            sink: Box::new(sink),
            checkpointer,
            phase: DriverPhase::Stopped,
            committed: None,
            summary: RunSummary::default(),
            stop_tx,
            stop_rx,
        };
        driver.recover()?;
        Ok(driver)
    }

    fn recover(&mut self) -> Result<(), DriverError> {
        match self.checkpointer.recover::<K, S>() {
            Ok(Some(snapshot)) => {
                let keys = snapshot.state.len();
                self.committed = snapshot.last_window;
                self.summary.last_window = snapshot.last_window;
                self.store.restore(snapshot)?;
                info!(
                    last_window = ?self.committed,
                    keys,
                    "Recovered state from checkpoint"
                );
            }
            Ok(None) => info!("No checkpoint found, starting with empty state"),
            Err(CheckpointError::Corruption(e))
                if self.config.recovery == RecoveryMode::StartEmpty =>
            {
                warn!(error = %e, "Discarding corrupted checkpoint, starting with empty state");
            }
            Err(e) => {
                error!(error = %e, "Can not recover from checkpoint");
                self.phase = DriverPhase::Terminated;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    /// Last window applied to the state
    pub fn last_committed(&self) -> Option<WindowIndex> {
        self.committed
    }

    /// Index the next window will get
    pub fn next_window(&self) -> WindowIndex {
        self.committed.map_or(0, |w| w + 1)
    }

    /// The driver's state store
    pub fn state(&self) -> &StateStore<K, S> {
        &self.store
    }

    /// Shared handle to the state store, for reading state from other threads while the
    /// driver runs
    pub fn state_handle(&self) -> Arc<StateStore<K, S>> {
        Arc::clone(&self.store)
    }

    /// Counters over all windows committed so far
    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Handle to request a running driver to stop
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    fn set_phase(&mut self, phase: DriverPhase) {
        info!(from = ?self.phase, to = ?phase, "Driver phase change");
        self.phase = phase;
    }

    /// Run the job until the source ends or a stop is requested.
    ///
    /// The source is opened on the calling thread and then runs on its own thread. Windows are
    /// cut and processed on the calling thread, one per `batch_interval`. On stop or end of
    /// stream the source is stopped, everything it emitted is processed as one final window
    /// and a final checkpoint is written if state changed since the last one.
    pub fn run<Src>(&mut self, source: Src) -> Result<RunSummary, DriverError>
    where
        Src: SourceImpl<I>,
    {
        let _span = span!(Level::INFO, "driver");
        let _span_guard = _span.enter();
        self.expect_phase(DriverPhase::Stopped)?;

        let batcher = Batcher::starting_at(self.next_window());
        let source = match PacedSource::new(source, self.config.source_pace).start(batcher.input())
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Could not start source");
                self.phase = DriverPhase::Terminated;
                return Err(e.into());
            }
        };
        self.set_phase(DriverPhase::Running);

        let interval = self.config.batch_interval;
        let mut next_tick = Instant::now() + interval;
        let running = loop {
            let stop_requested = match self.stop_rx.recv_deadline(next_tick) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            };
            if stop_requested || batcher.is_finished() {
                break Ok(());
            }
            next_tick = (next_tick + interval).max(Instant::now());
            if let Err(e) = self.process_batch(batcher.cut()) {
                break Err(e);
            }
        };

        if running.is_ok() {
            self.set_phase(DriverPhase::Draining);
        }
        let stopped = source.stop();
        let result = running
            .and_then(|()| stopped.map_err(DriverError::from))
            .and_then(|stats| {
                debug!(emitted = stats.emitted, "Source drained");
                self.process_batch(batcher.cut())
            })
            .and_then(|_| {
                if self.checkpointer.on_shutdown(&self.store)? {
                    self.summary.checkpoints += 1;
                }
                Ok(())
            });
        self.sink.finish();
        self.phase = DriverPhase::Terminated;

        match result {
            Ok(()) => {
                info!(
                    windows = self.summary.windows,
                    records = self.summary.records,
                    last_window = ?self.summary.last_window,
                    "Driver terminated"
                );
                Ok(self.summary)
            }
            Err(e) => {
                error!(error = %e, "Driver terminated with error");
                Err(e)
            }
        }
    }

    /// Process one window: run the pipeline, apply the entries to the state store, emit the
    /// results to the sink and checkpoint if the trigger fires.
    ///
    /// Windows at or below the last committed window are skipped, so replaying windows after
    /// recovery is harmless. An error is fatal and terminates the driver.
    pub fn process_batch(&mut self, batch: Batch<I>) -> Result<WindowOutcome<K, R>, DriverError> {
        if self.phase == DriverPhase::Terminated {
            return Err(DriverError::InvalidPhase {
                expected: DriverPhase::Running,
                actual: self.phase,
            });
        }
        let window = batch.index();
        if let Some(last) = self.committed.filter(|last| window <= *last) {
            info!(window, last_committed = last, "Skipping already committed window");
            return Ok(WindowOutcome::Skipped);
        }

        let output = self.pipeline.apply(batch);
        let entry_count = output.entries.len();
        let results = self
            .apply_with_retry(window, output.entries)
            .inspect_err(|e| error!(window, error = %e, "Applying window to state failed"))
            .map_err(|e| self.fatal(e.into()))?;

        self.committed = Some(window);
        self.summary.windows += 1;
        self.summary.records += output.records as u64;
        self.summary.entries += entry_count as u64;
        self.summary.dropped += output.rejected as u64;
        self.summary.last_window = Some(window);
        debug!(
            window,
            records = output.records,
            entries = entry_count,
            dropped = output.rejected,
            results = results.len(),
            "Committed window"
        );

        self.sink.emit(WindowOutput::new(window, results.clone()));
        match self.checkpointer.after_window(window, &self.store) {
            Ok(written) => {
                if written {
                    self.summary.checkpoints += 1;
                }
            }
            Err(e) => {
                error!(window, error = %e, "Writing checkpoint failed");
                return Err(self.fatal(e.into()));
            }
        }
        Ok(WindowOutcome::Committed { results })
    }

    /// Apply entries to the store, retrying once if a partition lock could not be acquired.
    /// A failed attempt leaves the store unchanged, so the retry sees the same state.
    fn apply_with_retry(
        &self,
        window: WindowIndex,
        entries: Vec<KeyedEntry<K, V>>,
    ) -> Result<Vec<(K, R)>, StateError> {
        let attempt = || self.store.update(window, entries.clone(), &*self.update_fn);
        attempt
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.config.retry_backoff)
                    .with_max_times(1),
            )
            .sleep(std::thread::sleep)
            .when(StateError::is_retryable)
            .notify(|e, backoff| warn!(window, error = %e, ?backoff, "Retrying window"))
            .call()
    }

    fn fatal(&mut self, error: DriverError) -> DriverError {
        self.phase = DriverPhase::Terminated;
        error
    }

    fn expect_phase(&self, expected: DriverPhase) -> Result<(), DriverError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(DriverError::InvalidPhase {
                expected,
                actual: self.phase,
            })
        }
    }
}
