use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL with just the events needed to recreate current state.
    /// Records travel whole, so deleted flags and baseline windows survive.
    ///
    /// The write gate is held exclusively from the snapshot until the new
    /// log is in place: no mutation can land in the old log after its
    /// aggregate was copied.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.clone().write_owned().await;
        let mut events = Vec::new();

        let schedules: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        for ss in schedules {
            let guard = ss.read().await;
            events.push(Event::ScheduleCreated(guard.schedule.clone()));
            events.extend(guard.baselines.iter().cloned().map(Event::BaselineCaptured));
            let mut items: Vec<&ScheduleItem> = guard.items.values().collect();
            items.sort_by_key(|i| i.id);
            events.extend(items.into_iter().cloned().map(Event::ItemCreated));
            let mut deps: Vec<&ScheduleDependency> = guard.dependencies.values().collect();
            deps.sort_by_key(|d| d.id);
            events.extend(deps.into_iter().cloned().map(Event::DependencyAdded));
        }

        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated(guard.resource.clone()));
            events.extend(guard.blackouts.iter().cloned().map(Event::AvailabilityAdded));
            events.extend(guard.allocations.iter().cloned().map(Event::AllocationCommitted));
            events.extend(guard.utilization.iter().cloned().map(Event::UtilizationRecorded));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
