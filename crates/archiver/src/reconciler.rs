//! Reconciler (C5): polls the upstream list endpoint and drives the set of
//! live capture sessions toward the reported set. Hosts the process-health
//! sweep.
//!
//! A failed poll must never mutate the session table (spec §4.5 step 1,
//! §9 "poll-failure semantics"): a transient outage must not cascade into
//! stopping every active session.

use crate::capture::{self, CaptureConfig};
use crate::detector;
use crate::metrics;
use crate::model::{mint_session_id, CaptureSession, StreamName};
use crate::upload_pipeline::UploadQueue;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_secs(5);

pub type SessionTable = Arc<Mutex<HashMap<StreamName, CaptureSession>>>;

#[derive(Deserialize)]
struct PathsListResponse {
    #[serde(default)]
    items: Vec<PathItem>,
}

#[derive(Deserialize)]
struct PathItem {
    name: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    source: Option<serde_json::Value>,
}

/// Poll the upstream for the set of "ready, sourced" stream names.
/// `None` means the poll failed (transport, HTTP status, or malformed
/// body) — the caller must not treat this as "no streams live".
pub async fn poll_upstream(client: &reqwest::Client, api_base: &str) -> Option<Vec<StreamName>> {
    let url = format!("{api_base}/v3/paths/list");
    let resp = match client.get(&url).timeout(POLL_TIMEOUT).send().await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "upstream poll transport failure");
            return None;
        }
    };

    if !resp.status().is_success() {
        error!(status = %resp.status(), "upstream poll returned non-200");
        return None;
    }

    let body: PathsListResponse = match resp.json().await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "upstream poll returned malformed body");
            return None;
        }
    };

    Some(
        body.items
            .into_iter()
            .filter(|item| item.ready && item.source.is_some())
            .map(|item| item.name)
            .collect(),
    )
}

pub struct Reconciler {
    http: reqwest::Client,
    api_base: String,
    capture_cfg: CaptureConfig,
    concurrency_cap: usize,
    output_extension: String,
    sessions: SessionTable,
    queue: UploadQueue,
}

impl Reconciler {
    pub fn new(
        api_base: String,
        capture_cfg: CaptureConfig,
        concurrency_cap: usize,
        output_extension: String,
        sessions: SessionTable,
        queue: UploadQueue,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            api_base,
            capture_cfg,
            concurrency_cap,
            output_extension,
            sessions,
            queue,
        }
    }

    pub fn sessions(&self) -> SessionTable {
        self.sessions.clone()
    }

    /// Run one reconciliation tick.
    pub async fn tick(&self) {
        let Some(live) = poll_upstream(&self.http, &self.api_base).await else {
            // P6: a transient poll failure stops nothing.
            return;
        };

        let mut sessions = self.sessions.lock().await;

        self.stop_absent(&mut sessions, &live).await;
        self.start_new(&mut sessions, &live).await;
        self.sweep_dead(&mut sessions).await;
    }

    /// Stops run before starts within a tick so a stream that flaps
    /// off-then-on doesn't get bounded by the cap against its own
    /// previous session (spec §4.5 "Ordering").
    async fn stop_absent(&self, sessions: &mut HashMap<StreamName, CaptureSession>, live: &[StreamName]) {
        let absent: Vec<StreamName> = sessions
            .keys()
            .filter(|name| !live.contains(name))
            .cloned()
            .collect();

        for name in absent {
            if let Some(mut session) = sessions.remove(&name) {
                info!(stream = %name, "stream no longer live, stopping session");
                capture::stop(&mut session).await;
                detector::termination_tail(&mut session, &self.output_extension, &self.queue).await;
                metrics::SESSIONS_ACTIVE.dec();
            }
        }
    }

    async fn start_new(&self, sessions: &mut HashMap<StreamName, CaptureSession>, live: &[StreamName]) {
        for name in live {
            if sessions.contains_key(name) {
                continue;
            }
            if sessions.len() >= self.concurrency_cap {
                warn!(stream = %name, cap = self.concurrency_cap, "concurrency cap reached, skipping start");
                continue;
            }

            let session_id = mint_session_id(Utc::now());
            match capture::start(&self.capture_cfg, name, &session_id).await {
                Ok(session) => {
                    info!(stream = %name, %session_id, pid = ?session.pid, "session started");
                    sessions.insert(name.clone(), session);
                    metrics::SESSIONS_ACTIVE.inc();
                    metrics::SESSIONS_STARTED_TOTAL.inc();
                }
                Err(e) => {
                    warn!(stream = %name, error = %e, "session start failed, will retry next tick");
                }
            }
        }
    }

    /// Process-health sweep: a crashed session is removed now and left for
    /// `start_new` to pick back up on a *subsequent* tick, never inline —
    /// inline restart would tight-loop a repeatedly crashing capture child.
    async fn sweep_dead(&self, sessions: &mut HashMap<StreamName, CaptureSession>) {
        let mut dead = Vec::new();
        for (name, session) in sessions.iter_mut() {
            if !session.is_alive() {
                dead.push(name.clone());
            }
        }

        for name in dead {
            if let Some(mut session) = sessions.remove(&name) {
                warn!(stream = %name, session_id = %session.session_id, pid = ?session.pid, "capture child died, scheduling restart");
                detector::termination_tail(&mut session, &self.output_extension, &self.queue).await;
                metrics::SESSIONS_ACTIVE.dec();
                metrics::SESSIONS_CRASHED_TOTAL.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn spawn_upstream(body: serde_json::Value, status: axum::http::StatusCode) -> String {
        let app = Router::new().route(
            "/v3/paths/list",
            get(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn poll_extracts_ready_and_sourced_streams_only() {
        let base = spawn_upstream(
            json!({
                "items": [
                    {"name": "cam1", "ready": true, "source": {}},
                    {"name": "cam2", "ready": false, "source": {}},
                    {"name": "cam3", "ready": true, "source": null},
                ]
            }),
            axum::http::StatusCode::OK,
        )
        .await;

        let client = reqwest::Client::new();
        let live = poll_upstream(&client, &base).await.unwrap();
        assert_eq!(live, vec!["cam1".to_string()]);
    }

    #[tokio::test]
    async fn poll_failure_on_non_200_returns_none() {
        let base = spawn_upstream(json!({"items": []}), axum::http::StatusCode::INTERNAL_SERVER_ERROR).await;
        let client = reqwest::Client::new();
        assert!(poll_upstream(&client, &base).await.is_none());
    }

    #[tokio::test]
    async fn poll_transport_failure_returns_none() {
        let client = reqwest::Client::new();
        // Nothing listening on this port.
        let result = poll_upstream(&client, "http://127.0.0.1:1").await;
        assert!(result.is_none());
    }
}
