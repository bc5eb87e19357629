//! Per-backup log fan-out.
//!
//! Every backup gets two sinks: a bounded in-memory channel for live SSE
//! viewers and a batched durable queue flushed into the repository. The
//! live channel drops lines under pressure; the durable queue never does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::services::repository::BackupRepository;

/// Live channel capacity. A slow viewer loses lines past this point.
pub const LIVE_CHANNEL_CAPACITY: usize = 100;

/// Queue length that triggers an immediate durable flush.
const FLUSH_BATCH_SIZE: usize = 10;

/// Maximum time a queued line waits before being flushed.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

struct LiveChannel {
    tx: mpsc::Sender<String>,
    // Taken by the first subscriber
    rx: Mutex<Option<mpsc::Receiver<String>>>,
}

type LiveMap = Arc<RwLock<HashMap<Uuid, Arc<LiveChannel>>>>;
type QueueMap = Arc<Mutex<HashMap<Uuid, Vec<String>>>>;

pub struct LogBus {
    repo: Arc<BackupRepository>,
    live: LiveMap,
    queue: QueueMap,
}

impl LogBus {
    pub fn new(repo: Arc<BackupRepository>) -> Arc<Self> {
        Arc::new(Self {
            repo,
            live: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Allocates the live channel for a backup. Must be called before the
    /// run is spawned so early emits are not lost.
    pub fn open_channel(&self, backup_id: Uuid) {
        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        let channel = Arc::new(LiveChannel {
            tx,
            rx: Mutex::new(Some(rx)),
        });
        self.live.write().unwrap().insert(backup_id, channel);
    }

    /// True while the backup still has a live channel.
    pub fn has_channel(&self, backup_id: Uuid) -> bool {
        self.live.read().unwrap().contains_key(&backup_id)
    }

    /// Hands out the live receiver. Only the first subscriber gets it.
    pub fn subscribe(&self, backup_id: Uuid) -> Option<mpsc::Receiver<String>> {
        let channel = self.live.read().unwrap().get(&backup_id).cloned()?;
        let rx = channel.rx.lock().unwrap().take();
        rx
    }

    /// Non-blocking emit: best-effort delivery to the live viewer, always
    /// queued for the durable store.
    pub fn emit(&self, backup_id: Uuid, line: impl Into<String>) {
        let line = line.into();

        if let Some(channel) = self.live.read().unwrap().get(&backup_id).cloned() {
            // Full channel means a slow viewer; the durable copy survives.
            let _ = channel.tx.try_send(line.clone());
        }

        let queue_len = {
            let mut queue = self.queue.lock().unwrap();
            let entries = queue.entry(backup_id).or_default();
            entries.push(line);
            entries.len()
        };

        if queue_len >= FLUSH_BATCH_SIZE {
            let repo = Arc::clone(&self.repo);
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                flush_queue(&repo, &queue, backup_id).await;
            });
        } else if queue_len == 1 {
            // First line in the queue starts the delayed flush timer.
            let repo = Arc::clone(&self.repo);
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                flush_queue(&repo, &queue, backup_id).await;
            });
        }
    }

    /// Writes queued lines into the durable store.
    pub async fn flush(&self, backup_id: Uuid) {
        flush_queue(&self.repo, &self.queue, backup_id).await;
    }

    /// Closes the live channel and flushes whatever is still queued.
    /// Receivers observe end-of-stream after draining buffered lines.
    pub async fn close(&self, backup_id: Uuid) {
        self.live.write().unwrap().remove(&backup_id);
        self.flush(backup_id).await;
    }
}

/// Drains the queue for one backup. Failed batches are re-queued rather
/// than dropped.
async fn flush_queue(repo: &BackupRepository, queue: &Mutex<HashMap<Uuid, Vec<String>>>, backup_id: Uuid) {
    let lines = {
        let mut queue = queue.lock().unwrap();
        match queue.remove(&backup_id) {
            Some(lines) if !lines.is_empty() => lines,
            _ => return,
        }
    };

    if let Err(e) = repo.append_log(backup_id, &lines).await {
        warn!("failed to store logs for backup {}: {}", backup_id, e);
        let mut queue = queue.lock().unwrap();
        let entries = queue.entry(backup_id).or_default();
        let mut restored = lines;
        restored.append(entries);
        *entries = restored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_database::test_utils::TestDatabase;

    async fn bus_with_backup() -> (Arc<LogBus>, Uuid) {
        let test_db = TestDatabase::with_migrations().await.unwrap();
        let db = test_db.connection_arc();
        let backup_id = crate::services::repository::tests::seed_backup(&db).await;
        let repo = Arc::new(BackupRepository::new(db));
        (LogBus::new(repo), backup_id)
    }

    #[tokio::test]
    async fn live_channel_receives_emitted_lines() {
        let (bus, id) = bus_with_backup().await;
        bus.open_channel(id);
        let mut rx = bus.subscribe(id).expect("receiver available");

        bus.emit(id, "line one");
        bus.emit(id, "line two");

        assert_eq!(rx.recv().await.unwrap(), "line one");
        assert_eq!(rx.recv().await.unwrap(), "line two");
    }

    #[tokio::test]
    async fn only_first_subscriber_gets_receiver() {
        let (bus, id) = bus_with_backup().await;
        bus.open_channel(id);

        assert!(bus.subscribe(id).is_some());
        assert!(bus.subscribe(id).is_none());
    }

    #[tokio::test]
    async fn full_channel_drops_live_lines_but_keeps_durable_copy() {
        let (bus, id) = bus_with_backup().await;
        bus.open_channel(id);
        // No subscriber is draining, so the channel fills up.
        for i in 0..(LIVE_CHANNEL_CAPACITY + 20) {
            bus.emit(id, format!("line {}", i));
        }

        bus.flush(id).await;
        let stored = bus.repo.get_backup_logs(id).await.unwrap();
        let count = stored.lines().count();
        assert_eq!(count, LIVE_CHANNEL_CAPACITY + 20);

        // The live side saw at most the channel capacity.
        let mut rx = bus.subscribe(id).unwrap();
        let mut live = 0;
        while rx.try_recv().is_ok() {
            live += 1;
        }
        assert!(live <= LIVE_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn close_flushes_remaining_lines_and_ends_stream() {
        let (bus, id) = bus_with_backup().await;
        bus.open_channel(id);
        let mut rx = bus.subscribe(id).unwrap();

        bus.emit(id, "tail line");
        bus.close(id).await;

        // Buffered line is still delivered, then the stream ends.
        assert_eq!(rx.recv().await.unwrap(), "tail line");
        assert!(rx.recv().await.is_none());

        let stored = bus.repo.get_backup_logs(id).await.unwrap();
        assert!(stored.contains("tail line"));
    }

    #[tokio::test]
    async fn emits_without_channel_still_reach_durable_store() {
        let (bus, id) = bus_with_backup().await;
        // No open_channel: viewer never existed.
        bus.emit(id, "orphan line");
        bus.flush(id).await;

        let stored = bus.repo.get_backup_logs(id).await.unwrap();
        assert!(stored.contains("orphan line"));
    }

    #[tokio::test]
    async fn per_writer_emit_order_is_preserved_durably() {
        let (bus, id) = bus_with_backup().await;
        for i in 0..25 {
            bus.emit(id, format!("writer-a {}", i));
        }
        bus.flush(id).await;

        let stored = bus.repo.get_backup_logs(id).await.unwrap();
        let lines: Vec<&str> = stored.lines().collect();
        let expected: Vec<String> = (0..25).map(|i| format!("writer-a {}", i)).collect();
        assert_eq!(lines, expected);
    }
}
