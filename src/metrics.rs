//! Prometheus metrics for the relay
//!
//! Connection gauge, fan-out and eviction counters, persistence and listener
//! outcomes. Exposed as text on `GET /metrics`.

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static::lazy_static! {
    static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "chat_relay_connections_active",
        "WebSocket connections currently admitted"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref BROADCAST_FRAMES: IntCounter = register_int_counter!(
        "chat_relay_broadcast_frames_total",
        "Frames enqueued onto member outbound queues"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref BACKPRESSURE_EVICTIONS: IntCounter = register_int_counter!(
        "chat_relay_backpressure_evictions_total",
        "Members evicted because their outbound queue was full or closed"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref PERSIST_FAILURES: IntCounterVec = register_int_counter_vec!(
        "chat_relay_persist_failures_total",
        "Inbound messages that were not persisted",
        &["reason"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref NOTIFICATIONS: IntCounterVec = register_int_counter_vec!(
        "chat_relay_notifications_total",
        "Change notifications handled by the listener",
        &["outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub fn connection_opened() {
    CONNECTIONS_ACTIVE.inc();
}

pub fn connection_closed() {
    CONNECTIONS_ACTIVE.dec();
}

pub fn record_broadcast(delivered: usize, evicted: usize) {
    BROADCAST_FRAMES.inc_by(delivered as u64);
    BACKPRESSURE_EVICTIONS.inc_by(evicted as u64);
}

pub fn record_persist_failure(reason: &str) {
    PERSIST_FAILURES.with_label_values(&[reason]).inc();
}

pub fn record_notification(outcome: &str) {
    NOTIFICATIONS.with_label_values(&[outcome]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
