//! Pool gauges and acquisition timing

use deadpool_postgres::{Client, Pool, PoolError};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use std::time::Instant;

lazy_static::lazy_static! {
    static ref POOL_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
        "db_pool_connections",
        "Pooled PostgreSQL connections by state (idle, in_use, max)",
        &["service", "state"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref ACQUIRE_SECONDS: HistogramVec = register_histogram_vec!(
        "db_pool_acquire_seconds",
        "Wait for a pooled connection",
        &["service"],
        vec![0.001, 0.005, 0.025, 0.1, 0.5, 2.5, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref ACQUIRE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "db_pool_acquire_failures_total",
        "Failed attempts to obtain a pooled connection",
        &["service", "kind"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub(crate) fn update_pool_metrics(pool: &Pool, service: &str) {
    let status = pool.status();
    let idle = status.available as i64;
    let in_use = status.size as i64 - idle;

    for (state, value) in [
        ("idle", idle),
        ("in_use", in_use),
        ("max", status.max_size as i64),
    ] {
        POOL_CONNECTIONS
            .with_label_values(&[service, state])
            .set(value);
    }
}

fn failure_kind(err: &PoolError) -> &'static str {
    match err {
        PoolError::Timeout(_) => "timeout",
        PoolError::Backend(_) => "backend",
        PoolError::Closed => "closed",
        _ => "other",
    }
}

/// `pool.get()` that records the wait and any failure
pub async fn acquire_with_metrics(pool: &Pool, service: &str) -> Result<Client, PoolError> {
    let started = Instant::now();
    let result = pool.get().await;

    ACQUIRE_SECONDS
        .with_label_values(&[service])
        .observe(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        ACQUIRE_FAILURES
            .with_label_values(&[service, failure_kind(e)])
            .inc();
    }

    result
}
