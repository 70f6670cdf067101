use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_name, validate_note, validate_window};
use super::{Engine, EngineError, IdClaim};

#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub id: Ulid,
    pub project_id: Ulid,
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub status: Option<ScheduleStatus>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePatch {
    pub name: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub status: Option<ScheduleStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBaseline {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub name: String,
    pub description: Option<String>,
}

impl Engine {
    pub async fn create_schedule(&self, scope: &Scope, new: NewSchedule) -> Result<Schedule, EngineError> {
        self.authorize(scope)?;
        validate_name(&new.name)?;
        let window = validate_window(new.start, new.end)?;
        if self.schedules.len() >= MAX_SCHEDULES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many schedules"));
        }

        let now = now_ms();
        let schedule = Schedule {
            id: new.id,
            project_id: new.project_id,
            name: new.name,
            window,
            baseline_window: None,
            status: new.status.unwrap_or(ScheduleStatus::Draft),
            created_by: scope.actor.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.persist_new_schedule(schedule.clone()).await?;
        info!("schedule {} created for project {}", schedule.id, schedule.project_id);
        Ok(schedule)
    }

    pub async fn update_schedule(
        &self,
        scope: &Scope,
        id: Ulid,
        patch: SchedulePatch,
    ) -> Result<Schedule, EngineError> {
        self.authorize(scope)?;
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        let mut guard = self.live_schedule_write(&id).await?;

        let mut schedule = guard.schedule.clone();
        schedule.window = validate_window(
            patch.start.unwrap_or(schedule.window.start),
            patch.end.unwrap_or(schedule.window.end),
        )?;
        if let Some(name) = patch.name {
            schedule.name = name;
        }
        if let Some(status) = patch.status {
            schedule.status = status;
        }
        schedule.updated_at = now_ms();

        self.persist_schedule(&mut guard, &Event::ScheduleUpdated(schedule.clone()))
            .await?;
        Ok(schedule)
    }

    /// Logical delete of the schedule and every item in it.
    pub async fn delete_schedule(&self, scope: &Scope, id: Ulid) -> Result<(), EngineError> {
        self.authorize(scope)?;
        let mut guard = self.live_schedule_write(&id).await?;
        let event = Event::ScheduleDeleted {
            id,
            deleted_at: now_ms(),
        };
        self.persist_schedule(&mut guard, &event).await?;
        info!("schedule {id} deleted");
        Ok(())
    }

    pub async fn schedule(
        &self,
        scope: &Scope,
        id: Ulid,
        include_deleted: bool,
    ) -> Result<Schedule, EngineError> {
        self.authorize(scope)?;
        let guard = self.schedule_read(&id, include_deleted).await?;
        Ok(guard.schedule.clone())
    }

    /// Schedules in creation order, optionally narrowed to one project.
    pub async fn list_schedules(
        &self,
        scope: &Scope,
        project_id: Option<Ulid>,
        include_deleted: bool,
    ) -> Result<Vec<Schedule>, EngineError> {
        self.authorize(scope)?;
        let shared: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::new();
        for ss in shared {
            let guard = ss.read().await;
            let schedule = &guard.schedule;
            if project_id.is_some_and(|p| p != schedule.project_id) {
                continue;
            }
            if schedule.is_deleted() && !include_deleted {
                continue;
            }
            result.push(schedule.clone());
        }
        result.sort_by_key(|s| s.id);
        Ok(result)
    }

    // ── Baselines ─────────────────────────────────────────────

    /// Snapshot every active item and move the schedule's baseline window,
    /// as one event under the schedule lock.
    pub async fn capture_baseline(
        &self,
        scope: &Scope,
        new: NewBaseline,
    ) -> Result<ScheduleBaseline, EngineError> {
        self.authorize(scope)?;
        validate_name(&new.name)?;
        validate_note(new.description.as_deref())?;
        let claim = IdClaim::take(&self.entity_to_schedule, new.id, new.schedule_id)?;
        let mut guard = self.live_schedule_write(&new.schedule_id).await?;
        if guard.baselines.len() >= MAX_BASELINES_PER_SCHEDULE {
            return Err(EngineError::LimitExceeded("too many baselines on schedule"));
        }

        let mut items: Vec<&ScheduleItem> = guard.active_items().collect();
        items.sort_by_key(|i| (i.start, i.sort_order, i.id));
        let items = items
            .into_iter()
            .map(|i| BaselineItem {
                item_id: i.id,
                parent_id: i.parent_id,
                name: i.name.clone(),
                kind: i.kind,
                start: i.start,
                end: i.end,
                duration: i.duration,
            })
            .collect();

        let baseline = ScheduleBaseline {
            id: new.id,
            schedule_id: new.schedule_id,
            name: new.name,
            description: new.description,
            window: guard.schedule.window,
            items,
            created_by: scope.actor.clone(),
            created_at: now_ms(),
        };
        self.persist_schedule(&mut guard, &Event::BaselineCaptured(baseline.clone()))
            .await?;
        claim.applied();
        info!(
            "baseline {} captured on schedule {} ({} items)",
            baseline.id,
            baseline.schedule_id,
            baseline.items.len()
        );
        Ok(baseline)
    }

    /// Copy a baseline's dates into the baseline fields of items that still
    /// exist. Returns how many items were touched.
    pub async fn restore_baseline(&self, scope: &Scope, baseline_id: Ulid) -> Result<usize, EngineError> {
        self.authorize(scope)?;
        let mut guard = self.resolve_schedule_entity(&baseline_id).await?;
        let baseline = guard
            .baseline(&baseline_id)
            .ok_or(EngineError::NotFound(baseline_id))?;
        let restored = baseline
            .items
            .iter()
            .filter(|snap| guard.active_item(&snap.item_id).is_some())
            .count();

        let event = Event::BaselineRestored {
            id: baseline_id,
            schedule_id: guard.schedule.id,
        };
        self.persist_schedule(&mut guard, &event).await?;
        debug!("baseline {baseline_id} restored onto {restored} items");
        Ok(restored)
    }

    pub async fn list_baselines(
        &self,
        scope: &Scope,
        schedule_id: Ulid,
        include_deleted: bool,
    ) -> Result<Vec<ScheduleBaseline>, EngineError> {
        self.authorize(scope)?;
        let guard = self.schedule_read(&schedule_id, include_deleted).await?;
        Ok(guard.baselines.clone())
    }

    pub async fn baseline(
        &self,
        scope: &Scope,
        baseline_id: Ulid,
        include_deleted: bool,
    ) -> Result<ScheduleBaseline, EngineError> {
        self.authorize(scope)?;
        let guard = self.baseline_owner_read(&baseline_id, include_deleted).await?;
        guard
            .baseline(&baseline_id)
            .cloned()
            .ok_or(EngineError::NotFound(baseline_id))
    }

    /// Baseline against current plan. Snapshot items come first in snapshot
    /// order, then items added since, by start date.
    pub async fn baseline_variance(
        &self,
        scope: &Scope,
        baseline_id: Ulid,
    ) -> Result<Vec<VarianceRow>, EngineError> {
        self.authorize(scope)?;
        let guard = self.baseline_owner_read(&baseline_id, false).await?;
        let baseline = guard
            .baseline(&baseline_id)
            .ok_or(EngineError::NotFound(baseline_id))?;

        let mut rows: Vec<VarianceRow> = baseline
            .items
            .iter()
            .map(|snap| {
                let current = guard.active_item(&snap.item_id);
                VarianceRow {
                    item_id: snap.item_id,
                    name: current.map_or_else(|| snap.name.clone(), |c| c.name.clone()),
                    baseline_start: Some(snap.start),
                    baseline_end: Some(snap.end),
                    current_start: current.map(|c| c.start),
                    current_end: current.map(|c| c.end),
                    start_variance_days: current.map(|c| (c.start - snap.start).num_days()),
                    finish_variance_days: current.map(|c| (c.end - snap.end).num_days()),
                }
            })
            .collect();

        let mut added: Vec<&ScheduleItem> = guard
            .active_items()
            .filter(|item| !baseline.items.iter().any(|snap| snap.item_id == item.id))
            .collect();
        added.sort_by_key(|i| (i.start, i.id));
        rows.extend(added.into_iter().map(|item| VarianceRow {
            item_id: item.id,
            name: item.name.clone(),
            baseline_start: None,
            baseline_end: None,
            current_start: Some(item.start),
            current_end: Some(item.end),
            start_variance_days: None,
            finish_variance_days: None,
        }));
        Ok(rows)
    }

    async fn baseline_owner_read(
        &self,
        baseline_id: &Ulid,
        include_deleted: bool,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<ScheduleState>, EngineError> {
        let schedule_id = self
            .entity_to_schedule
            .get(baseline_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*baseline_id))?;
        self.schedule_read(&schedule_id, include_deleted)
            .await
            .map_err(|_| EngineError::NotFound(*baseline_id))
    }
}
