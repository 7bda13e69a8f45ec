use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock, elapsed_between};
use crate::config::SnapshotConfig;
use crate::domain::RecordingSettings;
use crate::error::Result;
use crate::queue::progress::UploadProgress;
use crate::session::status::RecordingStatus;
use crate::storage::slot::SlotStorage;

/// Everything needed to resume an interrupted session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecordingState {
    pub session_id: String,
    pub title: String,
    pub status: RecordingStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub duration_seconds: u64,
    pub chunk_count: u32,
    pub total_bytes: u64,
    pub last_chunk_index: Option<u32>,
    /// Queue progress at save time; informational only.
    #[serde(default)]
    pub upload_progress: UploadProgress,
    /// Chunks enqueued but not confirmed uploaded.
    #[serde(default)]
    pub pending_chunks: Vec<u32>,
    #[serde(default)]
    pub settings: RecordingSettings,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub persisted_at: OffsetDateTime,
}

impl PersistedRecordingState {
    pub fn new(session_id: &str, title: &str, start_time: OffsetDateTime) -> Self {
        Self {
            session_id: session_id.to_string(),
            title: title.to_string(),
            status: RecordingStatus::Recording,
            start_time,
            duration_seconds: 0,
            chunk_count: 0,
            total_bytes: 0,
            last_chunk_index: None,
            upload_progress: UploadProgress::default(),
            pending_chunks: Vec::new(),
            settings: RecordingSettings::default(),
            metadata: BTreeMap::new(),
            persisted_at: start_time,
        }
    }
}

/// Partial update merged onto the persisted state; `None` leaves a field as is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotPatch {
    pub title: Option<String>,
    pub status: Option<RecordingStatus>,
    pub duration_seconds: Option<u64>,
    pub chunk_count: Option<u32>,
    pub total_bytes: Option<u64>,
    pub last_chunk_index: Option<u32>,
    pub upload_progress: Option<UploadProgress>,
    pub pending_chunks: Option<Vec<u32>>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl SnapshotPatch {
    pub fn status(status: RecordingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(self, s: &mut PersistedRecordingState) {
        if let Some(v) = self.title {
            s.title = v;
        }
        if let Some(v) = self.status {
            s.status = v;
        }
        if let Some(v) = self.duration_seconds {
            s.duration_seconds = v;
        }
        if let Some(v) = self.chunk_count {
            s.chunk_count = v;
        }
        if let Some(v) = self.total_bytes {
            s.total_bytes = v;
        }
        if let Some(v) = self.last_chunk_index {
            s.last_chunk_index = Some(v);
        }
        if let Some(v) = self.upload_progress {
            s.upload_progress = v;
        }
        if let Some(v) = self.pending_chunks {
            s.pending_chunks = v;
        }
        if let Some(v) = self.metadata {
            s.metadata.extend(v);
        }
    }
}

/// A snapshot eligible for recovery.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoverableSession {
    pub state: PersistedRecordingState,
    pub time_elapsed: Duration,
    /// Recent enough to restore without asking the user.
    pub should_auto_recover: bool,
}

/// Single-slot store for the active session. Expired or unreadable contents
/// are cleared on read and reported as absent.
///
/// Every slot access goes through `io`, so a read-modify-write in
/// [`update_with`](Self::update_with) is never interleaved with another writer.
pub struct SnapshotStore {
    slot: Box<dyn SlotStorage>,
    clock: Arc<dyn Clock>,
    config: SnapshotConfig,
    io: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(slot: Box<dyn SlotStorage>, config: SnapshotConfig) -> Self {
        Self {
            slot,
            clock: Arc::new(SystemClock),
            config,
            io: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.io.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite the slot, stamping `persisted_at` with the current time.
    pub fn save(&self, state: &PersistedRecordingState) -> Result<()> {
        let _io = self.guard();
        self.store(state)
    }

    fn store(&self, state: &PersistedRecordingState) -> Result<()> {
        let mut stamped = state.clone();
        stamped.persisted_at = self.clock.now();
        let bytes = serde_json::to_vec(&stamped)?;
        self.slot.write(&bytes)?;
        debug!(session_id = %stamped.session_id, status = %stamped.status, "session snapshot saved");
        Ok(())
    }

    /// Merge `patch` onto the stored state. Returns `false` (and writes
    /// nothing) when there is no session to update.
    pub fn update(&self, patch: SnapshotPatch) -> Result<bool> {
        self.update_with(|state| patch.apply(state))
    }

    /// Like [`update`](Self::update), but the change is computed while the
    /// slot is held, so it sees no stale values from a concurrent writer.
    pub fn update_with(&self, f: impl FnOnce(&mut PersistedRecordingState)) -> Result<bool> {
        let _io = self.guard();
        let Some(mut state) = self.load() else {
            warn!("snapshot update skipped: no persisted session");
            return Ok(false);
        };
        f(&mut state);
        self.store(&state)?;
        Ok(true)
    }

    pub fn get(&self) -> Option<PersistedRecordingState> {
        let _io = self.guard();
        self.load()
    }

    fn load(&self) -> Option<PersistedRecordingState> {
        let raw = match self.slot.read() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "session snapshot unreadable; treating as absent");
                return None;
            }
        };

        let state: PersistedRecordingState = match serde_json::from_slice(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "discarding corrupted session snapshot");
                self.clear_quietly();
                return None;
            }
        };

        let age = elapsed_between(state.persisted_at, self.clock.now());
        if age > self.config.max_age() {
            info!(session_id = %state.session_id, age_secs = age.as_secs(), "session snapshot expired");
            self.clear_quietly();
            return None;
        }
        Some(state)
    }

    pub fn clear(&self) -> Result<()> {
        let _io = self.guard();
        self.slot.remove()
    }

    fn clear_quietly(&self) {
        if let Err(e) = self.slot.remove() {
            warn!(error = %e, "failed to clear session snapshot");
        }
    }

    /// Classify the stored snapshot for recovery. Snapshots whose status is
    /// not resumable are cleared and never surfaced.
    pub fn check_recovery(&self) -> Option<RecoverableSession> {
        let _io = self.guard();
        let state = self.load()?;
        if !state.status.is_resumable() {
            info!(session_id = %state.session_id, status = %state.status, "clearing non-resumable snapshot");
            self.clear_quietly();
            return None;
        }
        let time_elapsed = elapsed_between(state.persisted_at, self.clock.now());
        Some(RecoverableSession {
            should_auto_recover: time_elapsed < self.config.auto_recovery_threshold(),
            time_elapsed,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::slot::MemorySlot;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2026-03-01 09:00 UTC);

    fn store() -> (SnapshotStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = SnapshotStore::new(Box::new(MemorySlot::default()), SnapshotConfig::default())
            .with_clock(clock.clone());
        (store, clock)
    }

    fn state() -> PersistedRecordingState {
        PersistedRecordingState::new("sess-1", "Invoice entry", T0)
    }

    #[test]
    fn save_stamps_persisted_at() {
        let (store, clock) = store();
        clock.advance(Duration::from_secs(30));
        store.save(&state()).unwrap();
        let got = store.get().unwrap();
        assert_eq!(got.persisted_at, T0 + Duration::from_secs(30));
        assert_eq!(got.session_id, "sess-1");
    }

    #[test]
    fn update_merges_onto_existing() {
        let (store, _) = store();
        store.save(&state()).unwrap();
        let updated = store
            .update(SnapshotPatch {
                status: Some(RecordingStatus::Paused),
                chunk_count: Some(3),
                total_bytes: Some(900),
                last_chunk_index: Some(2),
                pending_chunks: Some(vec![2]),
                ..SnapshotPatch::default()
            })
            .unwrap();
        assert!(updated);

        let got = store.get().unwrap();
        assert_eq!(got.status, RecordingStatus::Paused);
        assert_eq!(got.chunk_count, 3);
        assert_eq!(got.last_chunk_index, Some(2));
        assert_eq!(got.pending_chunks, vec![2]);
        assert_eq!(got.title, "Invoice entry");
    }

    #[test]
    fn update_without_session_is_noop() {
        let (store, _) = store();
        assert!(!store.update(SnapshotPatch::status(RecordingStatus::Paused)).unwrap());
        assert!(store.get().is_none());
    }

    #[test]
    fn expired_snapshot_is_never_returned() {
        let (store, clock) = store();
        store.save(&state()).unwrap();
        clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
        assert!(store.get().is_none());
        assert!(store.check_recovery().is_none());

        // and it was cleared, not just hidden
        clock.set(T0);
        assert!(store.get().is_none());
    }

    #[test]
    fn corrupted_snapshot_is_cleared() {
        let slot = MemorySlot::default();
        slot.write(b"{\"sessionId\": ").unwrap();
        let store = SnapshotStore::new(Box::new(slot), SnapshotConfig::default());
        assert!(store.get().is_none());
        assert!(store.slot.read().unwrap().is_none());
    }

    #[test]
    fn unknown_status_counts_as_corruption() {
        let (store, _) = store();
        let mut raw = serde_json::to_value(state()).unwrap();
        raw["status"] = "exploded".into();
        store.slot.write(raw.to_string().as_bytes()).unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn recent_interruption_recovers_automatically() {
        let (store, clock) = store();
        store.save(&state()).unwrap();
        clock.advance(Duration::from_secs(2 * 60));
        let rec = store.check_recovery().unwrap();
        assert!(rec.should_auto_recover);
        assert_eq!(rec.time_elapsed, Duration::from_secs(120));
    }

    #[test]
    fn older_interruption_needs_confirmation() {
        let (store, clock) = store();
        store.save(&state()).unwrap();
        clock.advance(Duration::from_secs(10 * 60));
        let rec = store.check_recovery().unwrap();
        assert!(!rec.should_auto_recover);
    }

    #[test]
    fn terminal_status_is_cleared_by_recovery_check() {
        let (store, _) = store();
        let mut s = state();
        s.status = RecordingStatus::Completed;
        store.save(&s).unwrap();
        assert!(store.check_recovery().is_none());
        assert!(store.get().is_none());
    }

    /// Widens the read-modify-write window so overlapping updates would race.
    #[derive(Default)]
    struct SlowSlot(MemorySlot);

    impl SlotStorage for SlowSlot {
        fn read(&self) -> Result<Option<Vec<u8>>> {
            std::thread::sleep(Duration::from_millis(50));
            self.0.read()
        }

        fn write(&self, bytes: &[u8]) -> Result<()> {
            self.0.write(bytes)
        }

        fn remove(&self) -> Result<()> {
            self.0.remove()
        }
    }

    #[test]
    fn concurrent_updates_both_land() {
        let store = SnapshotStore::new(Box::new(SlowSlot::default()), SnapshotConfig::default());
        store.save(&state()).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                store
                    .update(SnapshotPatch {
                        chunk_count: Some(3),
                        ..SnapshotPatch::default()
                    })
                    .unwrap()
            });
            s.spawn(|| {
                store
                    .update(SnapshotPatch {
                        pending_chunks: Some(vec![1]),
                        ..SnapshotPatch::default()
                    })
                    .unwrap()
            });
        });

        let got = store.get().unwrap();
        assert_eq!(got.chunk_count, 3);
        assert_eq!(got.pending_chunks, vec![1]);
    }

    #[test]
    fn metadata_patch_extends() {
        let (store, _) = store();
        let mut s = state();
        s.metadata.insert("resolution".into(), "1920x1080".into());
        store.save(&s).unwrap();
        let mut extra = BTreeMap::new();
        extra.insert("browser".to_string(), serde_json::Value::from("firefox"));
        store
            .update(SnapshotPatch {
                metadata: Some(extra),
                ..SnapshotPatch::default()
            })
            .unwrap();
        let got = store.get().unwrap();
        assert_eq!(got.metadata.len(), 2);
    }
}
