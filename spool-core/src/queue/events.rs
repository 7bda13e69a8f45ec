use std::sync::{Arc, Mutex};

use super::progress::UploadProgress;
use super::task::TaskId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueEventKind {
    Progress,
    ChunkCompleted,
    ChunkFailed,
    QueueCompleted,
    QueueFailed,
}

impl QueueEventKind {
    pub const ALL: [QueueEventKind; 5] = [
        QueueEventKind::Progress,
        QueueEventKind::ChunkCompleted,
        QueueEventKind::ChunkFailed,
        QueueEventKind::QueueCompleted,
        QueueEventKind::QueueFailed,
    ];
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    Progress(UploadProgress),
    ChunkCompleted {
        task_id: TaskId,
        session_id: String,
        chunk_index: u32,
        attempts: u32,
    },
    /// Retries exhausted; the chunk stays `failed` until `retry_failed`.
    ChunkFailed {
        task_id: TaskId,
        session_id: String,
        chunk_index: u32,
        retry_count: u32,
        error: String,
    },
    QueueCompleted(UploadProgress),
    QueueFailed {
        failed: Vec<TaskId>,
        progress: UploadProgress,
    },
}

impl QueueEvent {
    pub fn kind(&self) -> QueueEventKind {
        match self {
            QueueEvent::Progress(_) => QueueEventKind::Progress,
            QueueEvent::ChunkCompleted { .. } => QueueEventKind::ChunkCompleted,
            QueueEvent::ChunkFailed { .. } => QueueEventKind::ChunkFailed,
            QueueEvent::QueueCompleted(_) => QueueEventKind::QueueCompleted,
            QueueEvent::QueueFailed { .. } => QueueEventKind::QueueFailed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listeners run synchronously on the emitting task and must not panic or block.
pub type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, QueueEventKind, Listener)>,
}

impl Listeners {
    pub(crate) fn add(&mut self, kind: QueueEventKind, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push((id, kind, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(eid, _, _)| *eid != id);
        self.entries.len() != before
    }

    fn matching(&self, kind: QueueEventKind) -> Vec<Listener> {
        self.entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, l)| Arc::clone(l))
            .collect()
    }
}

/// Call every listener for each event, in order. The registry lock is released
/// before any listener runs so listeners may (un)subscribe or query the queue.
pub(crate) fn dispatch(listeners: &Mutex<Listeners>, events: Vec<QueueEvent>) {
    for ev in events {
        let targets = listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .matching(ev.kind());
        for l in targets {
            l(&ev);
        }
    }
}
