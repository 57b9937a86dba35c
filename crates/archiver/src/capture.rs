//! Capture Supervisor (C3): starts and stops one opaque capture child per
//! stream, and answers liveness probes. The child program itself (its
//! codec handling, muxing, segmenting behavior) is out of scope — this
//! module only knows how to spawn it, feed it a "quit" byte on stdin, and
//! wait for it to die.

use crate::model::CaptureSession;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use common::validation::validate_id;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

/// How long to wait after spawn before probing whether the child is still
/// alive (spec §4.3).
const START_PROBE_DELAY: Duration = Duration::from_secs(2);
/// How long to wait for a polite quit before escalating to kill.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Capture program binary name/path (opaque to this system).
    pub program: String,
    pub rtsp_base: String,
    pub recordings_root: PathBuf,
    pub segment_duration: Duration,
    pub output_extension: String,
}

/// Build the argument list for the opaque segmenting capture program,
/// grounded in the stream-copy/segment-muxer invocation style of the
/// original recorder: no re-encoding, fixed-duration segments, numbered
/// output files.
pub fn build_capture_args(
    input_url: &str,
    segment_duration: Duration,
    extension: &str,
    output_pattern: &str,
) -> Vec<String> {
    vec![
        "-i".into(),
        input_url.into(),
        "-c".into(),
        "copy".into(),
        "-f".into(),
        "segment".into(),
        "-segment_time".into(),
        segment_duration.as_secs().to_string(),
        "-segment_format".into(),
        extension.into(),
        "-reset_timestamps".into(),
        "1".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-loglevel".into(),
        "warning".into(),
        output_pattern.into(),
    ]
}

/// Start a capture session for `stream` with a freshly minted `session_id`.
/// On success the returned session is alive and registered by the caller
/// (the reconciler); on failure nothing is registered (spec §4.3, §7).
pub async fn start(cfg: &CaptureConfig, stream: &str, session_id: &str) -> Result<CaptureSession> {
    // A stream name comes straight from the upstream API response; reject
    // anything that could escape `recordings_root` via the output dir name.
    validate_id(stream, "stream name")?;

    let output_dir = cfg
        .recordings_root
        .join(format!("{stream}_{session_id}"));
    tokio::fs::create_dir_all(&output_dir)
        .await
        .with_context(|| format!("create output dir {}", output_dir.display()))?;

    let input_url = format!("{}/{}", cfg.rtsp_base, stream);
    let output_pattern = output_dir
        .join(format!("segment_%03d.{}", cfg.output_extension))
        .to_string_lossy()
        .to_string();

    let args = build_capture_args(
        &input_url,
        cfg.segment_duration,
        &cfg.output_extension,
        &output_pattern,
    );

    info!(%stream, %session_id, program = %cfg.program, ?args, "starting capture child");

    let mut child = Command::new(&cfg.program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| anyhow!("spawn {} failed: {e}", cfg.program))?;

    let pid = child.id();

    tokio::time::sleep(START_PROBE_DELAY).await;

    if let Ok(Some(status)) = child.try_wait() {
        return Err(anyhow!(
            "capture child for {stream} exited immediately during start probe: {status}"
        ));
    }

    Ok(CaptureSession {
        stream: stream.to_string(),
        session_id: session_id.to_string(),
        started_at: Utc::now(),
        output_dir,
        child,
        pid,
        dispatched: Default::default(),
    })
}

/// Stop a session. Idempotent: if the child already exited, this only
/// reaps it. Polite quit byte on stdin first, kill on timeout (spec §4.3).
pub async fn stop(session: &mut CaptureSession) {
    if matches!(session.child.try_wait(), Ok(Some(_))) {
        return;
    }

    if let Some(mut stdin) = session.child.stdin.take() {
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.flush().await;
    }

    let wait = tokio::time::timeout(STOP_GRACE_PERIOD, session.child.wait()).await;
    match wait {
        Ok(Ok(status)) => {
            info!(stream = %session.stream, session_id = %session.session_id, pid = ?session.pid, %status, "capture child stopped");
        }
        Ok(Err(e)) => {
            warn!(stream = %session.stream, session_id = %session.session_id, error = %e, "error waiting for capture child, killing");
            let _ = session.child.kill().await;
        }
        Err(_) => {
            warn!(stream = %session.stream, session_id = %session.session_id, pid = ?session.pid, "capture child did not quit in time, killing");
            let _ = session.child.kill().await;
            let _ = session.child.wait().await;
        }
    }
}
