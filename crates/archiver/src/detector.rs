//! Segment Detector (C4): periodically scans each session's output
//! directory, classifies segments as complete, and submits them to the
//! upload pipeline exactly once (I2).
//!
//! The writer is opaque; there is no "segment closed" signal. "Not the
//! last file, plus idle >= 10s" is a conservative stand-in (see
//! DESIGN.md "settle sleep / idle gate").

use crate::metrics;
use crate::model::{CaptureSession, UploadTask};
use crate::upload_pipeline::UploadQueue;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::info;

/// A file must have been untouched for at least this long before the
/// detector treats it as complete.
const IDLE_GATE: Duration = Duration::from_secs(10);

/// List `segment_*.<ext>` files in `output_dir`, sorted lexicographically —
/// which is temporal order given the zero-padded `%03d` index.
pub async fn list_segments(output_dir: &std::path::Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(output_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e),
    };

    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with("segment_") && name.ends_with(&format!(".{extension}")) {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries)
}

/// Scan one session's output directory, dispatching every completed
/// segment exactly once. Mutates `session.dispatched` (owned exclusively by
/// this component per spec §5 shared-resource policy).
pub async fn scan_session(session: &mut CaptureSession, extension: &str, queue: &UploadQueue) {
    let segments = match list_segments(&session.output_dir, extension).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(stream = %session.stream, error = %e, "failed to list segments");
            return;
        }
    };

    if segments.len() <= 2 {
        // Last file is always assumed still being written; with <= 2
        // files there is nothing yet provably complete.
        return;
    }

    // Every file except the last is a candidate.
    for path in &segments[..segments.len() - 1] {
        dispatch_if_eligible(session, path, queue, true).await;
    }
}

/// Session-termination tail (spec §4.4): enqueue every remaining file
/// unconditionally, including what was previously held back, because no
/// further writes will occur.
pub async fn termination_tail(session: &mut CaptureSession, extension: &str, queue: &UploadQueue) {
    let segments = match list_segments(&session.output_dir, extension).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(stream = %session.stream, error = %e, "failed to list segments for termination tail");
            return;
        }
    };

    for path in &segments {
        dispatch_if_eligible(session, path, queue, false).await;
    }
}

async fn dispatch_if_eligible(
    session: &mut CaptureSession,
    path: &std::path::Path,
    queue: &UploadQueue,
    require_idle: bool,
) {
    let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    if session.dispatched.contains(filename) {
        return;
    }

    if require_idle {
        let idle = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
            Err(_) => return,
        };
        if idle < IDLE_GATE {
            return;
        }
    }

    // I2: insert into `dispatched` before the task enters the queue.
    session.dispatched.insert(filename.to_string());
    info!(stream = %session.stream, session_id = %session.session_id, %filename, "segment complete, dispatching");
    metrics::SEGMENTS_DISPATCHED_TOTAL.inc();

    let task = UploadTask::new(path.to_path_buf(), session.stream.clone(), session.session_id.clone());
    queue.push(task).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration as StdDuration, SystemTime};
    use tokio::process::Command;

    async fn fake_session(dir: &std::path::Path) -> CaptureSession {
        // A session needs a live child handle; spawn `sleep` as a stand-in
        // opaque process since this system never inspects the child beyond
        // liveness and PID.
        let child = Command::new("sleep")
            .arg("5")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .expect("spawn sleep");
        CaptureSession {
            stream: "cam1".into(),
            session_id: "20260101_000000".into(),
            started_at: chrono::Utc::now(),
            output_dir: dir.to_path_buf(),
            pid: child.id(),
            child,
            dispatched: Default::default(),
        }
    }

    fn touch_old(path: &std::path::Path) {
        fs::write(path, b"data").unwrap();
        let old = SystemTime::now() - StdDuration::from_secs(30);
        let old = filetime::FileTime::from_system_time(old);
        filetime::set_file_mtime(path, old).unwrap();
    }

    #[tokio::test]
    async fn holds_back_when_two_or_fewer_segments() {
        let dir = tempfile::tempdir().unwrap();
        touch_old(&dir.path().join("segment_000.mp4"));
        touch_old(&dir.path().join("segment_001.mp4"));
        let mut session = fake_session(dir.path()).await;
        let queue = UploadQueue::new();

        scan_session(&mut session, "mp4", &queue).await;

        assert!(session.dispatched.is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dispatches_completed_non_last_segments_once() {
        let dir = tempfile::tempdir().unwrap();
        touch_old(&dir.path().join("segment_000.mp4"));
        touch_old(&dir.path().join("segment_001.mp4"));
        touch_old(&dir.path().join("segment_002.mp4"));
        let mut session = fake_session(dir.path()).await;
        let queue = UploadQueue::new();

        scan_session(&mut session, "mp4", &queue).await;
        assert_eq!(session.dispatched.len(), 2);
        assert_eq!(queue.len(), 2);

        // A second tick must not re-dispatch (I2).
        scan_session(&mut session, "mp4", &queue).await;
        assert_eq!(session.dispatched.len(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn termination_tail_dispatches_last_file_too() {
        let dir = tempfile::tempdir().unwrap();
        touch_old(&dir.path().join("segment_000.mp4"));
        let mut session = fake_session(dir.path()).await;
        let queue = UploadQueue::new();

        termination_tail(&mut session, "mp4", &queue).await;

        assert_eq!(session.dispatched.len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
