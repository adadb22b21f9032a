use super::memory::{Snapshot, StoreState};
use super::IncidentStore;
use crate::error::StoreError;
use crate::incident::{AttemptRecord, Incident};
use crate::types::{Fingerprint, IncidentId, IncidentState};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

/// Durable store persisting a JSON snapshot after every write
///
/// Each mutation is applied to a copy of the tables, written to a temp file
/// in the target directory and renamed over the snapshot. The in-memory view
/// only changes once the rename succeeded, so a failed write leaves both
/// disk and memory at the previous version.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: RwLock<StoreState>,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store at `path`, loading the snapshot if it exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                StoreState::from_snapshot(snapshot)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `op` to a copy of the tables, persist it, then publish it
    async fn mutate<F>(&self, op: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<(), StoreError>,
    {
        let _guard = self.write_lock.lock().await;

        let mut next = self.state.read().clone();
        op(&mut next)?;
        let bytes = serde_json::to_vec_pretty(&next.snapshot())?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Unavailable(format!("snapshot writer failed: {e}")))??;

        *self.state.write() = next;
        debug!(path = %self.path.display(), "store snapshot persisted");
        Ok(())
    }
}

fn snapshot_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = snapshot_dir(path);
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl IncidentStore for FileStore {
    /// Write and sync a scratch file next to the snapshot
    async fn ping(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let dir = snapshot_dir(&path);
            std::fs::create_dir_all(dir)?;
            let mut scratch = NamedTempFile::new_in(dir)?;
            scratch.write_all(b"ping")?;
            scratch.as_file().sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store health check failed: {e}")))?
    }

    async fn insert(&self, incident: &Incident) -> Result<(), StoreError> {
        let incident = incident.clone();
        self.mutate(move |state| state.insert(incident)).await
    }

    async fn get(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        Ok(self.state.read().get(id))
    }

    async fn find_active(&self, fingerprint: &Fingerprint) -> Result<Option<Incident>, StoreError> {
        Ok(self.state.read().find_active(fingerprint))
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Incident>, StoreError> {
        Ok(self.state.read().list(|i| &i.fingerprint == fingerprint))
    }

    async fn list_in_state(&self, state: IncidentState) -> Result<Vec<Incident>, StoreError> {
        Ok(self.state.read().list(|i| i.state == state))
    }

    async fn list_all(&self) -> Result<Vec<Incident>, StoreError> {
        Ok(self.state.read().list(|_| true))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        incident: &Incident,
    ) -> Result<(), StoreError> {
        let incident = incident.clone();
        self.mutate(move |state| state.compare_and_swap(expected_version, incident))
            .await
    }

    async fn attempt(
        &self,
        id: IncidentId,
        attempt_number: u32,
    ) -> Result<Option<AttemptRecord>, StoreError> {
        Ok(self.state.read().attempt(id, attempt_number))
    }

    async fn put_attempt(&self, record: &AttemptRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.mutate(move |state| {
            state.put_attempt(record);
            Ok(())
        })
        .await
    }

    async fn attempts(&self, id: IncidentId) -> Result<Vec<AttemptRecord>, StoreError> {
        Ok(self.state.read().attempts(id))
    }
}
