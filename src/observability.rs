use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: admission decisions. Labels: outcome (confirmed, queued, rejected).
pub const ADMISSIONS_TOTAL: &str = "stallbook_admissions_total";

/// Counter: rejected operations. Labels: op, code.
pub const REJECTIONS_TOTAL: &str = "stallbook_rejections_total";

/// Histogram: time spent in a commit critical section, in seconds. Labels: op.
pub const COMMIT_DURATION_SECONDS: &str = "stallbook_commit_duration_seconds";

/// Counter: same-day races lost (requester queued).
pub const RACES_LOST_TOTAL: &str = "stallbook_races_lost_total";

/// Counter: requests served by the frontend. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "stallbook_requests_total";

/// Counter: notifications dropped or failed after commit.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "stallbook_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active client connections.
pub const CONNECTIONS_ACTIVE: &str = "stallbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "stallbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stallbook_connections_rejected_total";

/// Counter: login failures.
pub const AUTH_FAILURES_TOTAL: &str = "stallbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stallbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stallbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
