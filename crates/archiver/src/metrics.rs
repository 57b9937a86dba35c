//! Metric names below are compile-time constants known to be valid; the
//! `Result` from `prometheus::*::new` can't actually fail here.
#![allow(clippy::unwrap_used)]

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("sessions_active", "Number of active capture sessions").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static SESSIONS_STARTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sessions_started_total", "Total capture sessions started").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSIONS_CRASHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sessions_crashed_total", "Total capture sessions found dead by the health sweep").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SEGMENTS_DISPATCHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("segments_dispatched_total", "Total segments handed to the upload pipeline").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static UPLOADS_SUCCEEDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("uploads_succeeded_total", "Total segments successfully archived").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static UPLOADS_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("uploads_failed_total", "Total segments dropped after exhausting retries").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static UPLOAD_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("upload_retries_total", "Total upload re-enqueues after a transport failure").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let mfs = REGISTRY.gather();
    encoder.encode(&mfs, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
