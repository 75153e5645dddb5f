use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{CheckpointError, PersistenceBackend};

/// Keeps the latest checkpoint in a single file on the local filesystem.
///
/// A checkpoint is first written to `<path>.tmp`, synced and then renamed over `<path>`, so a
/// crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = OsString::from(self.path.as_os_str());
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

impl PersistenceBackend for FilePersistence {
    fn load(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&mut self, checkpoint: &[u8]) -> Result<(), CheckpointError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = parent.as_ref() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        let mut file = File::create(&tmp)?;
        file.write_all(checkpoint)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;

        // make the rename itself durable
        #[cfg(unix)]
        if let Some(parent) = parent {
            File::open(parent)?.sync_all()?;
        }
        debug!(path = %self.path.display(), "Persisted checkpoint file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilePersistence::new(dir.path().join("state.ckpt"));
        assert!(backend.load().unwrap().is_none());
    }

    #[test]
    fn persists_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FilePersistence::new(dir.path().join("nested").join("state.ckpt"));
        backend.persist(b"first").unwrap();
        backend.persist(b"second").unwrap();
        assert_eq!(backend.load().unwrap(), Some(b"second".to_vec()));
        assert!(!backend.tmp_path().exists());
    }

    /// a temp file left over from a crashed write is ignored
    #[test]
    fn ignores_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FilePersistence::new(dir.path().join("state.ckpt"));
        backend.persist(b"complete").unwrap();
        fs::write(backend.tmp_path(), b"compl").unwrap();
        assert_eq!(backend.load().unwrap(), Some(b"complete".to_vec()));
    }
}
