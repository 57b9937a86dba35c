use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::process::Child;

/// Opaque identifier reported by the upstream; unique per live stream at any
/// instant (I1).
pub type StreamName = String;

/// `YYYYMMDD_HHMMSS` in UTC, minted when a session starts.
pub fn mint_session_id(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// One actively recorded stream. Process state is mutated only by the
/// capture supervisor (C3); `dispatched` is mutated only by the segment
/// detector (C4) and by the session-termination tail, which runs under the
/// reconciler's lock before the entry is removed (I2, I3).
pub struct CaptureSession {
    pub stream: StreamName,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub child: Child,
    pub pid: Option<u32>,
    pub dispatched: HashSet<String>,
}

impl CaptureSession {
    /// Poll-based liveness probe: has the child exited already?
    ///
    /// `Ok(true)` means still running. Errors surface `try_wait` failures
    /// (e.g. already reaped); treated as "not alive" by callers.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// A unit of work for the upload pipeline (C2). Self-contained: it must not
/// hold a back-reference into the session table, so the uploader never
/// participates in the reconciler's locking.
#[derive(Clone, Debug)]
pub struct UploadTask {
    pub path: PathBuf,
    pub stream: StreamName,
    pub session_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl UploadTask {
    pub fn new(path: PathBuf, stream: StreamName, session_id: String) -> Self {
        Self {
            path,
            stream,
            session_id,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}
