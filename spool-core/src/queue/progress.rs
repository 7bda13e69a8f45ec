use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::task::{ChunkUploadTask, TaskStatus};

/// Aggregate over a set of tasks. Derived on demand, never authoritative.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub uploading_chunks: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// 0.0..=100.0 by bytes; 100 when there is nothing to upload.
    pub percentage: f64,
    /// Bytes per second over the recent completions window.
    pub average_throughput: f64,
    pub estimated_seconds_remaining: Option<f64>,
}

impl UploadProgress {
    pub fn is_settled(&self) -> bool {
        self.completed_chunks + self.failed_chunks == self.total_chunks
    }
}

/// Rolling window of recent upload durations.
#[derive(Debug)]
pub(crate) struct ThroughputWindow {
    samples: VecDeque<(u64, Duration)>,
    capacity: usize,
}

impl ThroughputWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn record(&mut self, bytes: u64, took: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((bytes, took));
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
    }

    /// Bytes per second, or 0 with no usable samples.
    pub(crate) fn bytes_per_sec(&self) -> f64 {
        let (bytes, secs) = self
            .samples
            .iter()
            .fold((0u64, 0f64), |(b, s), (nb, d)| (b + nb, s + d.as_secs_f64()));
        if secs <= f64::EPSILON {
            return 0.0;
        }
        bytes as f64 / secs
    }
}

pub(crate) fn summarize<'a, I>(tasks: I, window: &ThroughputWindow) -> UploadProgress
where
    I: IntoIterator<Item = &'a ChunkUploadTask>,
{
    let mut p = UploadProgress::default();
    for t in tasks {
        p.total_chunks += 1;
        p.total_bytes += t.size();
        match t.status {
            TaskStatus::Completed => {
                p.completed_chunks += 1;
                p.uploaded_bytes += t.size();
            }
            TaskStatus::Failed => p.failed_chunks += 1,
            TaskStatus::Uploading => p.uploading_chunks += 1,
            TaskStatus::Pending => {}
        }
    }

    p.percentage = if p.total_bytes == 0 {
        if p.total_chunks == p.completed_chunks { 100.0 } else { 0.0 }
    } else {
        p.uploaded_bytes as f64 * 100.0 / p.total_bytes as f64
    };

    p.average_throughput = window.bytes_per_sec();
    let remaining = p.total_bytes - p.uploaded_bytes;
    p.estimated_seconds_remaining = if remaining == 0 {
        Some(0.0)
    } else if p.average_throughput > 0.0 {
        Some(remaining as f64 / p.average_throughput)
    } else {
        None
    };
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task(index: u32, len: usize, status: TaskStatus) -> ChunkUploadTask {
        let mut t = ChunkUploadTask::new("s", index, Arc::from(vec![0u8; len]));
        t.status = status;
        t
    }

    #[test]
    fn empty_is_complete() {
        let p = summarize(std::iter::empty(), &ThroughputWindow::new(4));
        assert_eq!(p.total_chunks, 0);
        assert_eq!(p.percentage, 100.0);
        assert!(p.is_settled());
    }

    #[test]
    fn percentage_is_by_bytes() {
        let tasks = vec![
            task(0, 300, TaskStatus::Completed),
            task(1, 100, TaskStatus::Uploading),
            task(2, 600, TaskStatus::Failed),
        ];
        let p = summarize(&tasks, &ThroughputWindow::new(4));
        assert_eq!(p.total_chunks, 3);
        assert_eq!(p.completed_chunks, 1);
        assert_eq!(p.failed_chunks, 1);
        assert_eq!(p.uploading_chunks, 1);
        assert_eq!(p.uploaded_bytes, 300);
        assert_eq!(p.total_bytes, 1000);
        assert!((p.percentage - 30.0).abs() < 1e-9);
        assert!(!p.is_settled());
    }

    #[test]
    fn eta_uses_rolling_throughput() {
        let mut w = ThroughputWindow::new(2);
        w.record(1000, Duration::from_secs(1));
        w.record(3000, Duration::from_secs(1));
        assert!((w.bytes_per_sec() - 2000.0).abs() < 1e-9);
        // oldest sample falls out of the window
        w.record(4000, Duration::from_secs(1));
        assert!((w.bytes_per_sec() - 3500.0).abs() < 1e-9);

        let tasks = vec![
            task(0, 7000, TaskStatus::Pending),
            task(1, 1000, TaskStatus::Completed),
        ];
        let p = summarize(&tasks, &w);
        assert_eq!(p.estimated_seconds_remaining, Some(2.0));
    }

    #[test]
    fn no_samples_means_unknown_eta() {
        let tasks = vec![task(0, 10, TaskStatus::Pending)];
        let p = summarize(&tasks, &ThroughputWindow::new(3));
        assert_eq!(p.average_throughput, 0.0);
        assert_eq!(p.estimated_seconds_remaining, None);
    }
}
