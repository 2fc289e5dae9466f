use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the WAL once enough appends have piled up
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = maybe_compact(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

/// Compact if more than `threshold` events were appended since the last
/// compaction. Returns whether it compacted.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends <= threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "WAL compacted");
    Ok(true)
}
