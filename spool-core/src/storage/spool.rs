use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{Result, SpoolError};
use crate::queue::task::ChunkData;
use crate::storage::slot::write_atomic;

pub const FRAME_MAGIC: [u8; 8] = *b"SPOOLCHK";
const HEADER_LEN: usize = 8 + 32 + 8;

/// Durable chunk payloads kept until their upload is confirmed.
pub trait ChunkSpool: Send + Sync {
    fn put(&self, session_id: &str, chunk_index: u32, data: &[u8]) -> Result<()>;

    /// `None` when the chunk is absent or failed verification.
    fn get(&self, session_id: &str, chunk_index: u32) -> Option<ChunkData>;

    fn remove(&self, session_id: &str, chunk_index: u32) -> Result<()>;

    /// Spooled indices for a session, ascending.
    fn indices(&self, session_id: &str) -> Vec<u32>;

    fn remove_session(&self, session_id: &str) -> Result<()>;
}

pub struct FsChunkSpool {
    root: PathBuf,
}

impl FsChunkSpool {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        let ok = !session_id.is_empty()
            && session_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !ok {
            return Err(SpoolError::Format(format!(
                "session id {session_id:?} is not a valid spool directory name"
            )));
        }
        Ok(self.root.join(session_id))
    }

    fn chunk_path(&self, session_id: &str, chunk_index: u32) -> Result<PathBuf> {
        Ok(self.session_dir(session_id)?.join(format!("{chunk_index}.chunk")))
    }
}

pub(crate) fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + data.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(blake3::hash(data).as_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out
}

pub(crate) fn decode_frame<R: Read>(mut r: R) -> std::io::Result<Vec<u8>> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if magic != FRAME_MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad chunk magic",
        ));
    }
    let mut digest = [0u8; 32];
    r.read_exact(&mut digest)?;
    let mut buf8 = [0u8; 8];
    r.read_exact(&mut buf8)?;
    let len = u64::from_le_bytes(buf8);

    let mut payload = Vec::new();
    r.take(len).read_to_end(&mut payload)?;
    if payload.len() as u64 != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated chunk payload",
        ));
    }
    if blake3::hash(&payload).as_bytes() != &digest {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "chunk digest mismatch",
        ));
    }
    Ok(payload)
}

impl ChunkSpool for FsChunkSpool {
    fn put(&self, session_id: &str, chunk_index: u32, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(session_id, chunk_index)?;
        write_atomic(&path, &encode_frame(data))
    }

    fn get(&self, session_id: &str, chunk_index: u32) -> Option<ChunkData> {
        let path = self.chunk_path(session_id, chunk_index).ok()?;
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "spooled chunk unreadable");
                return None;
            }
        };
        match decode_frame(std::io::BufReader::new(file)) {
            Ok(payload) => Some(Arc::from(payload)),
            Err(e) => {
                warn!(session_id, chunk_index, error = %e, "discarding corrupted spooled chunk");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    fn remove(&self, session_id: &str, chunk_index: u32) -> Result<()> {
        let path = self.chunk_path(session_id, chunk_index)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn indices(&self, session_id: &str) -> Vec<u32> {
        let Ok(dir) = self.session_dir(session_id) else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut out: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                name.strip_suffix(".chunk")?.parse().ok()
            })
            .collect();
        out.sort_unstable();
        out
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        let dir = self.session_dir(session_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemChunkSpool {
    sessions: Mutex<HashMap<String, BTreeMap<u32, ChunkData>>>,
}

impl MemChunkSpool {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<u32, ChunkData>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChunkSpool for MemChunkSpool {
    fn put(&self, session_id: &str, chunk_index: u32, data: &[u8]) -> Result<()> {
        self.lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(chunk_index, Arc::from(data));
        Ok(())
    }

    fn get(&self, session_id: &str, chunk_index: u32) -> Option<ChunkData> {
        self.lock().get(session_id)?.get(&chunk_index).cloned()
    }

    fn remove(&self, session_id: &str, chunk_index: u32) -> Result<()> {
        if let Some(chunks) = self.lock().get_mut(session_id) {
            chunks.remove(&chunk_index);
        }
        Ok(())
    }

    fn indices(&self, session_id: &str) -> Vec<u32> {
        self.lock()
            .get(session_id)
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default()
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        self.lock().remove(session_id);
        Ok(())
    }
}
