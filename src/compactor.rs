use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once enough appends have piled up since the last rewrite.
/// Returns the event count written, or `None` if below threshold.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Option<usize> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return None;
    }
    match engine.compact_wal().await {
        Ok(events) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!(appends, events, "compacted WAL");
            Some(events)
        }
        Err(e) => {
            warn!(error = %e, "WAL compaction failed");
            None
        }
    }
}

/// Background task that keeps the log from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await.is_none() {
            debug!("compaction not due");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BookingRules;
    use crate::directory::{StaticDirectory, StaticEntitlements};
    use crate::engine::now_ms;
    use crate::model::SessionRequest;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gymbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::open(
            &path,
            BookingRules::default(),
            Arc::new(StaticDirectory::permissive()),
            Arc::new(StaticEntitlements::unlimited()),
        )
        .await
        .unwrap();

        let trainer = Ulid::new();
        let base = (now_ms() / 3_600_000 + 72) * 3_600_000;
        for i in 0..3 {
            engine
                .book_session(SessionRequest {
                    id: Ulid::new(),
                    user_id: Ulid::new(),
                    trainer_id: trainer,
                    start: base + i * 3_600_000,
                    end: base + (i + 1) * 3_600_000,
                    notes: None,
                })
                .await
                .unwrap();
        }

        assert_eq!(compact_if_due(&engine, 10).await, None);
        assert_eq!(compact_if_due(&engine, 3).await, Some(3));
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.bookings_for_trainer(trainer, None).await.len(), 3);
    }
}
