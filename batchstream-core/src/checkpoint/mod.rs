//! Checkpoints are durable snapshots of the state store together with the last window applied
//! to it. Restoring a checkpoint lets a job resume after a restart without reapplying or
//! skipping a window.
//!
//! A checkpoint is encoded as an 8 byte magic, a little endian `u32` format version and the
//! MessagePack encoding of the [StateSnapshot].
use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    state::{StateError, StateSnapshot, StateStore},
    types::{Key, WindowIndex},
};

mod file;
mod triggers;

pub use file::FilePersistence;
pub use triggers::{CheckpointTrigger, EveryNWindows, IntervalCheckpoints, NoCheckpoints};

const MAGIC: &[u8; 8] = b"BSCKPT\0\0";
/// Version of the checkpoint encoding written by this build
pub const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = MAGIC.len() + 4;

/// A checkpoint which can not be decoded
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StateCorruption {
    #[error("Checkpoint is truncated ({0} bytes)")]
    Truncated(usize),
    #[error("Checkpoint does not start with the checkpoint magic")]
    BadMagic,
    #[error("Checkpoint format version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("Error decoding checkpoint body")]
    Decode(#[from] rmp_serde::decode::Error),
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error accessing checkpoint")]
    Io(#[from] std::io::Error),
    #[error("Error encoding checkpoint")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Checkpoint is corrupted")]
    Corruption(#[from] StateCorruption),
    #[error("Error reading state for checkpoint")]
    State(#[from] StateError),
}

/// Encode a snapshot in the checkpoint format
pub fn encode<K, S>(snapshot: &StateSnapshot<K, S>) -> Result<Vec<u8>, CheckpointError>
where
    K: Key,
    S: Serialize,
{
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    rmp_serde::encode::write(&mut out, snapshot)?;
    Ok(out)
}

/// Decode a checkpoint written by [encode]
pub fn decode<K, S>(bytes: &[u8]) -> Result<StateSnapshot<K, S>, StateCorruption>
where
    K: Key,
    S: DeserializeOwned,
{
    if bytes.len() < HEADER_LEN {
        return Err(StateCorruption::Truncated(bytes.len()));
    }
    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(StateCorruption::BadMagic);
    }
    let (version, body) = rest.split_at(4);
    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(version);
    let version = u32::from_le_bytes(version_bytes);
    if version != FORMAT_VERSION {
        return Err(StateCorruption::UnsupportedVersion(version));
    }
    Ok(rmp_serde::from_slice(body)?)
}

/// A persistence backend provides durable storage for checkpoints.
/// This may be on a local disk, remote storage, a database or anything really which can reliably
/// store data. Only the latest checkpoint needs to be retained.
pub trait PersistenceBackend: 'static {
    /// Load the latest checkpoint or `None` if none was written yet
    fn load(&self) -> Result<Option<Vec<u8>>, CheckpointError>;
    /// Durably store a checkpoint, replacing the previous one.
    /// Must be atomic: after a crash either the old or the new checkpoint is loaded, never a mix.
    fn persist(&mut self, checkpoint: &[u8]) -> Result<(), CheckpointError>;
}

/// A persistence backend which does not retain any data. This is mostly useful for testing or
/// situations where you always want to restart the job statelessly
#[derive(Clone, Debug, Default)]
pub struct NoPersistence;
impl PersistenceBackend for NoPersistence {
    fn load(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
        Ok(None)
    }

    fn persist(&mut self, _checkpoint: &[u8]) -> Result<(), CheckpointError> {
        Ok(())
    }
}

/// A backend which keeps the latest checkpoint in shared memory.
/// All clones share the same checkpoint, so a clone handed to one driver can be used to
/// recover another.
#[derive(Clone, Debug, Default)]
pub struct MemoryPersistence {
    latest: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend which already holds the given checkpoint bytes
    pub fn with_checkpoint(bytes: Vec<u8>) -> Self {
        Self {
            latest: Arc::new(Mutex::new(Some(bytes))),
        }
    }

    /// Copy of the latest checkpoint
    pub fn latest(&self) -> Option<Vec<u8>> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl PersistenceBackend for MemoryPersistence {
    fn load(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
        Ok(self.latest())
    }

    fn persist(&mut self, checkpoint: &[u8]) -> Result<(), CheckpointError> {
        *self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(checkpoint.to_vec());
        Ok(())
    }
}

/// Writes checkpoints of a [StateStore] to a [PersistenceBackend] whenever its
/// [CheckpointTrigger] fires
pub struct Checkpointer {
    backend: Box<dyn PersistenceBackend>,
    trigger: Box<dyn CheckpointTrigger>,
    last_persisted: Option<WindowIndex>,
    written: u64,
}

impl Checkpointer {
    pub fn new(backend: impl PersistenceBackend, trigger: impl CheckpointTrigger) -> Self {
        Self {
            backend: Box::new(backend),
            trigger: Box::new(trigger),
            last_persisted: None,
            written: 0,
        }
    }

    /// A checkpointer which never loads or writes anything
    pub fn disabled() -> Self {
        Self::new(NoPersistence, NoCheckpoints)
    }

    /// Load and decode the latest checkpoint, if there is one
    pub fn recover<K, S>(&mut self) -> Result<Option<StateSnapshot<K, S>>, CheckpointError>
    where
        K: Key,
        S: DeserializeOwned,
    {
        let Some(bytes) = self.backend.load()? else {
            return Ok(None);
        };
        let snapshot: StateSnapshot<K, S> = decode(&bytes)?;
        self.last_persisted = snapshot.last_window;
        Ok(Some(snapshot))
    }

    /// Consult the trigger after a committed window and checkpoint if it fires.
    /// Returns true if a checkpoint was written.
    pub fn after_window<K, S>(
        &mut self,
        window: WindowIndex,
        store: &StateStore<K, S>,
    ) -> Result<bool, CheckpointError>
    where
        K: Key,
        S: Clone + Send + Serialize,
    {
        if self.trigger.should_checkpoint(window) {
            self.write(store)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Checkpoint state committed since the last checkpoint, unless the trigger opts out of
    /// checkpoints on shutdown. Returns true if a checkpoint was written.
    pub fn on_shutdown<K, S>(&mut self, store: &StateStore<K, S>) -> Result<bool, CheckpointError>
    where
        K: Key,
        S: Clone + Send + Serialize,
    {
        if !self.trigger.on_shutdown() || store.last_window()? == self.last_persisted {
            return Ok(false);
        }
        self.write(store)?;
        Ok(true)
    }

    /// Unconditionally checkpoint the store
    pub fn write<K, S>(&mut self, store: &StateStore<K, S>) -> Result<(), CheckpointError>
    where
        K: Key,
        S: Clone + Send + Serialize,
    {
        let snapshot = store.snapshot()?;
        let bytes = encode(&snapshot)?;
        self.backend.persist(&bytes)?;
        self.last_persisted = snapshot.last_window;
        self.written += 1;
        info!(
            last_window = ?snapshot.last_window,
            keys = snapshot.state.len(),
            bytes = bytes.len(),
            "Wrote checkpoint"
        );
        debug!(written = self.written, "Checkpoint count");
        Ok(())
    }

    /// Last window contained in a checkpoint written or recovered by this checkpointer
    pub fn last_persisted(&self) -> Option<WindowIndex> {
        self.last_persisted
    }

    /// Number of checkpoints written
    pub fn written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indexmap::IndexMap;

    use super::*;
    use crate::testing::{entries, sum_update};

    fn snapshot() -> StateSnapshot<String, u64> {
        StateSnapshot {
            last_window: Some(3),
            state: IndexMap::from([("a".to_string(), 2), ("b".to_string(), 7)]),
        }
    }

    #[test]
    fn encodes_header() {
        let bytes = encode(&snapshot()).unwrap();
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(&bytes[8..12], &FORMAT_VERSION.to_le_bytes());
        let decoded: StateSnapshot<String, u64> = decode(&bytes).unwrap();
        assert_eq!(decoded, snapshot());
    }

    #[test]
    fn detects_corruption() {
        let bytes = encode(&snapshot()).unwrap();

        let truncated = decode::<String, u64>(&bytes[..5]);
        assert!(matches!(truncated, Err(StateCorruption::Truncated(5))));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            decode::<String, u64>(&bad_magic),
            Err(StateCorruption::BadMagic)
        ));

        let mut future = bytes.clone();
        future[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            decode::<String, u64>(&future),
            Err(StateCorruption::UnsupportedVersion(99))
        ));

        let cut_body = &bytes[..bytes.len() - 2];
        assert!(matches!(
            decode::<String, u64>(cut_body),
            Err(StateCorruption::Decode(_))
        ));
    }

    #[test]
    fn checkpoints_when_triggered() {
        let backend = MemoryPersistence::new();
        let mut checkpointer = Checkpointer::new(backend.clone(), EveryNWindows::new(2));
        let store: StateStore<String, u64> = StateStore::new(2, Duration::from_secs(1));

        store.update(0, entries(&[("a", 1)]), &sum_update).unwrap();
        assert!(!checkpointer.after_window(0, &store).unwrap());
        assert!(backend.latest().is_none());

        store.update(1, entries(&[("a", 1)]), &sum_update).unwrap();
        assert!(checkpointer.after_window(1, &store).unwrap());
        assert_eq!(checkpointer.last_persisted(), Some(1));

        let mut other = Checkpointer::new(backend, NoCheckpoints);
        let recovered: StateSnapshot<String, u64> = other.recover().unwrap().unwrap();
        assert_eq!(recovered.last_window, Some(1));
        assert_eq!(recovered.state.get("a"), Some(&2));
    }

    #[test]
    fn shutdown_only_writes_new_state() {
        let backend = MemoryPersistence::new();
        let mut checkpointer = Checkpointer::new(backend.clone(), EveryNWindows::new(1));
        let store: StateStore<String, u64> = StateStore::new(1, Duration::from_secs(1));

        store.update(0, entries(&[("a", 1)]), &sum_update).unwrap();
        checkpointer.after_window(0, &store).unwrap();
        assert!(!checkpointer.on_shutdown(&store).unwrap());

        let mut never = Checkpointer::new(backend, NoCheckpoints);
        store.update(1, entries(&[("a", 1)]), &sum_update).unwrap();
        assert!(!never.on_shutdown(&store).unwrap());
        assert_eq!(checkpointer.written(), 1);
    }

    #[test]
    fn nothing_to_recover() {
        let mut checkpointer = Checkpointer::disabled();
        let recovered: Option<StateSnapshot<String, u64>> = checkpointer.recover().unwrap();
        assert!(recovered.is_none());
    }
}
