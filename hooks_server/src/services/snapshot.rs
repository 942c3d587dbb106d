//! Snapshot persistence — the whole event store in one JSON file.
//!
//! Each save rewrites the file in full (temp file + rename). Loading is
//! best effort: a missing or unreadable snapshot leaves the store empty.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::models::build_event::BuildEvent;
use crate::services::event_store::EventStore;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    Version(u32),
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    events: Vec<BuildEvent>,
}

pub struct Snapshotter {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Snapshotter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize every event in the store and overwrite the snapshot file.
    pub async fn save(&self, store: &EventStore) -> Result<usize, SnapshotError> {
        let _guard = self.write_lock.lock().await;

        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            events: store.snapshot(),
        };
        let count = file.events.len();
        let bytes = serde_json::to_vec(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(parent, source))?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| self.io_error(&tmp, source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error(&self.path, source))?;

        tracing::debug!(path = %self.path.display(), events = count, "Snapshot saved");
        Ok(count)
    }

    /// Read the snapshot file without touching any store.
    pub async fn read(&self) -> Result<Option<Vec<BuildEvent>>, SnapshotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(&self.path, source)),
        };

        let file: SnapshotFile = serde_json::from_slice(&bytes)?;
        if file.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version(file.version));
        }
        Ok(Some(file.events))
    }

    /// Rehydrate `store` from disk. Never fails: problems are logged and the
    /// store is left as it was.
    pub async fn load(&self, store: &EventStore) -> usize {
        match self.read().await {
            Ok(Some(events)) => {
                let count = events.len();
                if let Err(e) = store.restore(events) {
                    tracing::warn!(path = %self.path.display(), "Ignoring corrupt snapshot: {e}");
                    return 0;
                }
                tracing::info!(
                    path = %self.path.display(),
                    events = count,
                    next_id = store.next_id(),
                    "Snapshot loaded"
                );
                count
            }
            Ok(None) => {
                tracing::info!(path = %self.path.display(), "No snapshot file, starting empty");
                0
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Ignoring unreadable snapshot: {e}");
                0
            }
        }
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build_event::BuildStatus;
    use crate::services::broadcast_hub::BroadcastHub;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn store() -> Arc<EventStore> {
        Arc::new(EventStore::new(Arc::new(BroadcastHub::new(16))))
    }

    #[tokio::test]
    async fn round_trip_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path().join("cache").join("dump.json"));

        let original = store();
        let ok = original.create("stun");
        ok.append_output("cloning\n").unwrap();
        ok.set_status(BuildStatus::Filtering).unwrap();
        ok.set_status(BuildStatus::Syncing).unwrap();
        ok.set_status(BuildStatus::Provisioning).unwrap();
        ok.set_status(BuildStatus::Succeeded).unwrap();
        ok.mark_stopped().unwrap();
        let running = original.create("turn");
        running.set_status(BuildStatus::Filtering).unwrap();

        assert_eq!(snapshotter.save(&original).await.unwrap(), 2);

        let restored = store();
        assert_eq!(snapshotter.load(&restored).await, 2);
        assert_eq!(restored.snapshot(), original.snapshot());
        assert!(restored.next_id() > 1);
        assert_eq!(restored.create("next").id(), 2);
    }

    #[tokio::test]
    async fn save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path().join("dump.json"));

        let first = store();
        for _ in 0..3 {
            first.create("a");
        }
        snapshotter.save(&first).await.unwrap();

        let second = store();
        second.create("b");
        snapshotter.save(&second).await.unwrap();

        let events = snapshotter.read().await.unwrap().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].repository, "b");
    }

    #[tokio::test]
    async fn missing_snapshot_leaves_store_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = Snapshotter::new(dir.path().join("absent.json"));
        let store = store();

        assert_eq!(snapshotter.load(&store).await, 0);
        assert!(store.is_empty());
        assert_eq!(store.next_id(), 0);
    }

    #[tokio::test]
    async fn truncated_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let snapshotter = Snapshotter::new(&path);

        let source = store();
        source.create("stun");
        snapshotter.save(&source).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let store = store();
        assert!(snapshotter.read().await.is_err());
        assert_eq!(snapshotter.load(&store).await, 0);
        assert!(store.is_empty());
        assert_eq!(store.next_id(), 0);
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        std::fs::write(&path, br#"{"version":9,"events":[]}"#).unwrap();

        let snapshotter = Snapshotter::new(&path);
        assert!(matches!(
            snapshotter.read().await,
            Err(SnapshotError::Version(9))
        ));
    }

    #[tokio::test]
    async fn snapshot_with_exhausted_ids_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let crafted = SnapshotFile {
            version: SNAPSHOT_VERSION,
            events: vec![BuildEvent::new(u64::MAX, "crafted")],
        };
        std::fs::write(&path, serde_json::to_vec(&crafted).unwrap()).unwrap();

        let store = store();
        assert_eq!(Snapshotter::new(&path).load(&store).await, 0);
        assert!(store.is_empty());
        assert_eq!(store.create("next").id(), 0);
    }
}
