use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Compact one company's WAL whenever enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One check of the compaction loop. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("company {}: {appends} WAL appends, below threshold", engine.company());
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("company {}: compacted WAL after {appends} appends", engine.company());
            true
        }
        Err(e) => {
            warn!("company {}: WAL compaction failed: {e}", engine.company());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::NaiveDate;
    use ulid::Ulid;

    use super::*;
    use crate::engine::NewSchedule;
    use crate::model::*;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("crewplan_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Arc::new(Engine::new("acme", path.clone()).unwrap());
        let scope = Scope::new("acme", "planner");

        let id = Ulid::new();
        engine
            .create_schedule(
                &scope,
                NewSchedule {
                    id,
                    project_id: Ulid::new(),
                    name: "Main".into(),
                    start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                    end: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
                    status: None,
                },
            )
            .await
            .unwrap();
        for i in 0..4 {
            engine
                .update_schedule(
                    &scope,
                    id,
                    crate::engine::SchedulePatch {
                        name: Some(format!("Main v{i}")),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        assert!(!compact_if_due(&engine, 100).await);
        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let reopened = Engine::new("acme", path).unwrap();
        let schedule = reopened.schedule(&scope, id, false).await.unwrap();
        assert_eq!(schedule.name, "Main v3");
    }
}
