use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::CoreError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: inbound core operations. Labels: op, outcome.
pub const OPERATIONS_TOTAL: &str = "courtside_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "courtside_operation_duration_seconds";

// ── Reservation lifecycle ───────────────────────────────────────

/// Counter: slot reservations lost to a concurrent taker or an occupied slot.
pub const SLOT_RACES_LOST_TOTAL: &str = "courtside_slot_races_lost_total";

/// Counter: holds released by the expiry sweep or lazily on access.
pub const HOLDS_EXPIRED_TOTAL: &str = "courtside_holds_expired_total";

/// Counter: compensating releases after a failed checkout-session request.
pub const COMPENSATIONS_TOTAL: &str = "courtside_compensations_total";

/// Counter: refunds the gateway refused or timed out on.
pub const REFUNDS_FAILED_TOTAL: &str = "courtside_refunds_failed_total";

/// Counter: optimistic game commits that hit a version mismatch and were re-decided.
pub const GAME_CAS_RETRIES_TOTAL: &str = "courtside_game_cas_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: games that are open or full.
pub const GAMES_ACTIVE: &str = "courtside_games_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record one finished operation: outcome counter plus latency histogram.
pub fn record<T>(op: &'static str, started: Instant, result: &Result<T, CoreError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}

/// Run an operation future and record its outcome under `op`.
pub async fn timed<T>(
    op: &'static str,
    fut: impl Future<Output = Result<T, CoreError>>,
) -> Result<T, CoreError> {
    let started = Instant::now();
    let result = fut.await;
    record(op, started, &result);
    result
}
