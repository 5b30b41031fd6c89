use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites a room's WAL once enough appends piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        maybe_compact(&engine, threshold).await;
    }
}

/// Compact if at least `threshold` events were appended since the last
/// compaction. Returns the number of events in the rewritten log.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> Option<usize> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return None;
    }
    match engine.compact_wal().await {
        Ok(kept) => {
            info!("WAL compacted: {appends} appends folded into {kept} events");
            Some(kept)
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            None
        }
    }
}
