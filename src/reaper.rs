use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{CoreError, Engine};

/// Background task that periodically releases expired holds.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let expired = engine.expire_stale_holds().await;
        if expired > 0 {
            debug!(expired, "sweep finished");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` events were appended since the last
/// compaction. A zero threshold disables compaction.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, CoreError> {
    if threshold == 0 {
        return Ok(false);
    }
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    info!(appends, threshold, "compacting WAL");
    engine.compact_wal().await?;
    Ok(true)
}
