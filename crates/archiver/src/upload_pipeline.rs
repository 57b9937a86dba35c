//! Upload Pipeline (C2): a bounded worker pool draining an unbounded,
//! multi-producer multi-consumer queue of upload tasks, with bounded retry.
//!
//! Workers hold no reference to the session table (see DESIGN.md) — each
//! `UploadTask` is self-contained, so the uploader never participates in
//! the reconciler's locking.

use crate::metrics;
use crate::model::UploadTask;
use crate::object_store::{ObjectMetadata, ObjectStoreClient};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SETTLE_SLEEP: Duration = Duration::from_secs(2);
const RETRY_BACKOFF: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct UploadQueue {
    tx: async_channel::Sender<UploadTask>,
    rx: async_channel::Receiver<UploadTask>,
    in_flight: Arc<AtomicUsize>,
}

impl UploadQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueue a task. Producers are the segment detector (C4) and the
    /// session-termination tail in the reconciler (C5).
    pub async fn push(&self, task: UploadTask) {
        // An unbounded channel only errors once every receiver has been
        // dropped, which happens only at process exit.
        let _ = self.tx.send(task).await;
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True once the queue has drained and no worker is mid-task — the
    /// condition C6's graceful drain waits for.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Closes the sending side so workers exit their receive loop once the
    /// queue drains, instead of waiting forever for more work.
    pub fn close(&self) {
        self.tx.close();
    }
}

impl Default for UploadQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Construct the object key: `<stream>/<YYYY-MM-DD>/<session>/<filename>`,
/// where the date is the UTC date *at upload dispatch time* — preserved for
/// bucket-layout compatibility even though it means a session recording
/// across midnight scatters across two date prefixes (see DESIGN.md).
pub fn object_key(task: &UploadTask, dispatch_time: chrono::DateTime<Utc>) -> String {
    let filename = task
        .path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();
    format!(
        "{}/{}/{}/{}",
        task.stream,
        dispatch_time.format("%Y-%m-%d"),
        task.session_id,
        filename
    )
}

/// Spawn `worker_count` upload workers draining `queue`. Returns immediately;
/// workers run until `queue`'s sender side is dropped and the queue drains.
pub fn spawn_workers(
    queue: UploadQueue,
    client: Arc<ObjectStoreClient>,
    worker_count: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..worker_count)
        .map(|worker_id| {
            let queue = queue.clone();
            let client = client.clone();
            tokio::spawn(async move { worker_loop(worker_id, queue, client).await })
        })
        .collect()
}

async fn worker_loop(worker_id: usize, queue: UploadQueue, client: Arc<ObjectStoreClient>) {
    while let Ok(task) = queue.rx.recv().await {
        queue.in_flight.fetch_add(1, Ordering::SeqCst);
        process_task(worker_id, task, &queue, &client).await;
        queue.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn process_task(
    worker_id: usize,
    mut task: UploadTask,
    queue: &UploadQueue,
    client: &ObjectStoreClient,
) {
    // Settle sleep: the opaque writer may still be closing the file when
    // the detector enqueued it. See DESIGN.md "settle sleep / idle gate".
    tokio::time::sleep(SETTLE_SLEEP).await;

    if !task.path.exists() {
        warn!(worker_id, path = %task.path.display(), "file vanished before upload, treating as done");
        return;
    }

    let dispatch_time = Utc::now();
    let key = object_key(&task, dispatch_time);
    let metadata = ObjectMetadata {
        stream: task.stream.clone(),
        session: task.session_id.clone(),
        recorded_at: dispatch_time.to_rfc3339(),
    };

    match client.put(&task.path, &key, &metadata).await {
        Ok(()) => {
            info!(worker_id, %key, "uploaded");
            metrics::UPLOADS_SUCCEEDED_TOTAL.inc();
            if let Err(e) = tokio::fs::remove_file(&task.path).await {
                error!(worker_id, path = %task.path.display(), error = %e, "failed to delete local file after successful upload");
            }
        }
        Err(e) => {
            if task.retry_count < MAX_RETRIES {
                task.retry_count += 1;
                warn!(worker_id, %key, attempt = task.retry_count, error = %e, "upload failed, will retry");
                metrics::UPLOAD_RETRIES_TOTAL.inc();
                tokio::time::sleep(RETRY_BACKOFF).await;
                queue.push(task).await;
            } else {
                error!(worker_id, %key, error = %e, "upload failed permanently, segment lost");
                metrics::UPLOADS_FAILED_TOTAL.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UploadTask;
    use std::path::PathBuf;

    #[test]
    fn object_key_has_expected_shape() {
        let task = UploadTask::new(
            PathBuf::from("/data/cam1_20260101_000000/segment_000.mp4"),
            "cam1".into(),
            "20260101_000000".into(),
        );
        let dispatch = "2026-01-02T03:04:05Z".parse::<chrono::DateTime<Utc>>().unwrap();
        let key = object_key(&task, dispatch);
        assert_eq!(key, "cam1/2026-01-02/20260101_000000/segment_000.mp4");
    }

    #[tokio::test]
    async fn vanished_file_is_treated_as_done_without_error() {
        let queue = UploadQueue::new();
        let client_cfg = crate::object_store::ObjectStoreConfig {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            access_key: "k".into(),
            secret_key: "s".into(),
            bucket: "vod".into(),
            tls_enabled: false,
        };
        let client = Arc::new(ObjectStoreClient::new(&client_cfg).await.unwrap());
        let task = UploadTask::new(
            PathBuf::from("/tmp/does-not-exist-archiver-test/segment_000.mp4"),
            "cam1".into(),
            "20260101_000000".into(),
        );
        // Should return without panicking and without touching the object store.
        process_task(0, task, &queue, &client).await;
        assert!(queue.is_empty());
    }
}
