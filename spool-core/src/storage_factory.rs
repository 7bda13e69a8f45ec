use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SnapshotConfig;
use crate::error::Result;
use crate::storage::slot::{FileSlot, MemorySlot};
use crate::storage::snapshot::SnapshotStore;
use crate::storage::spool::{ChunkSpool, FsChunkSpool, MemChunkSpool};

pub enum StorageBackend {
    /// Snapshot at `<dir>/<storage_key>`, chunk payloads under `<dir>/chunks/`.
    Dir(PathBuf),
    Memory,
}

/// Snapshot slot and chunk spool that live side by side.
pub struct Storage {
    pub snapshots: SnapshotStore,
    pub spool: Arc<dyn ChunkSpool>,
}

pub fn open_storage(backend: StorageBackend, config: &SnapshotConfig) -> Result<Storage> {
    match backend {
        StorageBackend::Dir(dir) => {
            std::fs::create_dir_all(&dir)?;
            let slot = FileSlot::new(dir.join(&config.storage_key));
            let spool = FsChunkSpool::open(&dir.join("chunks"))?;
            Ok(Storage {
                snapshots: SnapshotStore::new(Box::new(slot), config.clone()),
                spool: Arc::new(spool),
            })
        }
        StorageBackend::Memory => Ok(Storage {
            snapshots: SnapshotStore::new(Box::new(MemorySlot::default()), config.clone()),
            spool: Arc::new(MemChunkSpool::default()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::snapshot::PersistedRecordingState;

    #[test]
    fn dir_backend_lays_out_state_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(
            StorageBackend::Dir(dir.path().join("state")),
            &SnapshotConfig::default(),
        )
        .unwrap();

        let state = PersistedRecordingState::new("s1", "t", storage.snapshots.now());
        storage.snapshots.save(&state).unwrap();
        storage.spool.put("s1", 0, b"abc").unwrap();

        assert!(dir.path().join("state/active-session.json").is_file());
        assert!(dir.path().join("state/chunks/s1/0.chunk").is_file());

        // A second handle over the same directory sees the same data.
        let again = open_storage(
            StorageBackend::Dir(dir.path().join("state")),
            &SnapshotConfig::default(),
        )
        .unwrap();
        assert_eq!(again.snapshots.get().unwrap().session_id, "s1");
        assert_eq!(again.spool.indices("s1"), vec![0]);
    }
}
