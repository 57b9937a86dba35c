use anyhow::{anyhow, Result};
use common::validation::validate_uri;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration, loaded once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream streaming server, e.g. `http://mediamtx:9997`.
    pub upstream_api_base: String,
    /// RTSP base the capture child reads from, e.g. `rtsp://mediamtx:8554`.
    pub upstream_rtsp_base: String,
    /// Reconciler poll ticker.
    pub poll_interval: Duration,
    /// Segment-detector scan ticker.
    pub scan_interval: Duration,

    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_bucket: String,

    pub concurrency_cap: usize,
    pub segment_duration: Duration,
    pub output_extension: String,
    pub recordings_root: PathBuf,
    pub upload_workers: usize,
}

impl Config {
    /// Load configuration from the environment. Fails if the object-store
    /// endpoint or credentials are missing — startup must abort rather than
    /// run with a client that can never archive anything.
    pub fn from_env() -> Result<Self> {
        let s3_endpoint = require_env("S3_ENDPOINT_URL")?;
        let s3_access_key = require_env("S3_ACCESS_KEY_ID")?;
        let s3_secret_key = require_env("S3_SECRET_ACCESS_KEY")?;
        validate_uri(&s3_endpoint, "S3_ENDPOINT_URL")?;

        let upstream_api_base = env_string("MEDIAMTX_API_URL", "http://mediamtx:9997");
        let upstream_rtsp_base = env_string("MEDIAMTX_RTSP_URL", "rtsp://mediamtx:8554");
        validate_uri(&upstream_api_base, "MEDIAMTX_API_URL")?;
        validate_uri(&upstream_rtsp_base, "MEDIAMTX_RTSP_URL")?;

        Ok(Self {
            upstream_api_base,
            upstream_rtsp_base,
            poll_interval: Duration::from_secs(env_u64("POLLING_INTERVAL", 10)),
            scan_interval: Duration::from_secs(env_u64("SCAN_INTERVAL", 30)),

            s3_endpoint,
            s3_region: env_string("S3_REGION", "us-east-1"),
            s3_access_key,
            s3_secret_key,
            s3_bucket: env_string("S3_BUCKET_NAME", "vod"),

            concurrency_cap: env_u64("MAX_CONCURRENT_RECORDINGS", 10) as usize,
            segment_duration: Duration::from_secs(env_u64("SEGMENT_DURATION", 60)),
            output_extension: env_string("OUTPUT_FORMAT", "mp4"),
            recordings_root: PathBuf::from(env_string("RECORDINGS_DIR", "./recordings")),
            upload_workers: env_u64("UPLOAD_WORKERS", 3) as usize,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| anyhow!("missing required configuration: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_s3_env() {
        for k in ["S3_ENDPOINT_URL", "S3_ACCESS_KEY_ID", "S3_SECRET_ACCESS_KEY"] {
            env::remove_var(k);
        }
    }

    #[test]
    fn missing_credentials_abort_startup() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_s3_env();
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn defaults_applied_when_optional_vars_absent() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_s3_env();
        env::set_var("S3_ENDPOINT_URL", "http://localhost:9000");
        env::set_var("S3_ACCESS_KEY_ID", "key");
        env::set_var("S3_SECRET_ACCESS_KEY", "secret");
        env::remove_var("MAX_CONCURRENT_RECORDINGS");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.concurrency_cap, 10);
        assert_eq!(cfg.segment_duration, Duration::from_secs(60));
        assert_eq!(cfg.output_extension, "mp4");

        clear_s3_env();
    }
}
