use std::net::SocketAddr;

// ── Reservation metrics ─────────────────────────────────────────

/// Counter: reserve attempts. Labels: outcome (held, denied, timeout).
pub const RESERVATIONS_TOTAL: &str = "allot_reservations_total";

/// Histogram: time spent waiting for a resource lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "allot_lock_wait_seconds";

/// Counter: holds reverted to available by the reaper or lazily.
pub const HOLDS_EXPIRED_TOTAL: &str = "allot_holds_expired_total";

/// Counter: group booking attempts. Labels: outcome.
pub const GROUP_BOOKINGS_TOTAL: &str = "allot_group_bookings_total";

/// Gauge: registered resources.
pub const RESOURCES: &str = "allot_resources";

/// Gauge: pending entries in the expiry queue (including stale ones).
pub const EXPIRY_QUEUE_DEPTH: &str = "allot_expiry_queue_depth";

/// Counter: locker deposits. Labels: outcome (assigned, full).
pub const LOCKER_DEPOSITS_TOTAL: &str = "allot_locker_deposits_total";

// ── Admission metrics ───────────────────────────────────────────

/// Counter: admission decisions. Labels: endpoint, decision.
pub const ADMISSIONS_TOTAL: &str = "allot_admissions_total";

// ── Balancer metrics ────────────────────────────────────────────

/// Counter: routed requests. Labels: strategy.
pub const ROUTES_TOTAL: &str = "allot_routes_total";

/// Counter: requests that found no healthy server.
pub const ROUTES_UNAVAILABLE_TOTAL: &str = "allot_routes_unavailable_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install a fmt subscriber for binaries and benches embedding the library.
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}
