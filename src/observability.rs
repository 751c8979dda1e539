use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings created (manual and auto-generated).
pub const BOOKINGS_CREATED_TOTAL: &str = "studiobook_bookings_created_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "studiobook_bookings_cancelled_total";

/// Counter: fixed assignments created.
pub const ASSIGNMENTS_CREATED_TOTAL: &str = "studiobook_assignments_created_total";

/// Counter: schedule changes committed.
pub const SCHEDULE_CHANGES_TOTAL: &str = "studiobook_schedule_changes_total";

/// Counter: operations rejected because a slot-date was at capacity.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "studiobook_capacity_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "studiobook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "studiobook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
