use std::net::SocketAddr;

// ── Scheduler metrics ───────────────────────────────────────────

/// Counter: committed transitions. Labels: action, status.
pub const TRANSITIONS_TOTAL: &str = "slotwise_transitions_total";

/// Counter: rejected operations. Labels: action, kind (see `EngineError::kind`).
pub const REJECTIONS_TOTAL: &str = "slotwise_rejections_total";

/// Counter: availability checks that found a conflict. Labels: action.
pub const CONFLICTS_TOTAL: &str = "slotwise_conflicts_total";

/// Counter: authorization denials. Labels: action.
pub const AUTH_DENIALS_TOTAL: &str = "slotwise_auth_denials_total";

/// Counter: notifications that failed to deliver.
pub const NOTIFY_FAILURES_TOTAL: &str = "slotwise_notify_failures_total";

/// Histogram: time spent waiting for resource locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotwise_lock_wait_seconds";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotwise_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
