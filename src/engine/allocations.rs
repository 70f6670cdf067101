use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::ALLOCATION_CONFLICTS_TOTAL;

use super::conflict::{check_allocation, now_ms, validate_note, validate_window};
use super::{Engine, EngineError, IdClaim};

#[derive(Debug, Clone, PartialEq)]
pub struct NewAllocation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub project_id: Ulid,
    pub task_id: Option<Ulid>,
    pub schedule_item_id: Option<Ulid>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Defaults to 1.
    pub quantity: Option<f64>,
    /// Defaults to 100.
    pub utilization: Option<u8>,
    pub status: Option<AllocationStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationPatch {
    pub task_id: Option<Option<Ulid>>,
    pub schedule_item_id: Option<Option<Ulid>>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub quantity: Option<f64>,
    pub utilization: Option<u8>,
    pub status: Option<AllocationStatus>,
    pub notes: Option<Option<String>>,
}

fn validate_amounts(quantity: f64, utilization: u8) -> Result<(), EngineError> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(EngineError::Validation(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    if utilization > 100 {
        return Err(EngineError::Validation(format!(
            "utilization must be 0-100, got {utilization}"
        )));
    }
    Ok(())
}

fn count_conflict(err: EngineError) -> EngineError {
    let reason = match &err {
        EngineError::BlackoutOverlap { .. } => "blackout",
        EngineError::CapacityExceeded { .. } => "capacity",
        _ => return err,
    };
    metrics::counter!(ALLOCATION_CONFLICTS_TOTAL, "reason" => reason).increment(1);
    debug!("allocation rejected: {err}");
    err
}

/// Field checks that need no state.
fn validate_new(new: &NewAllocation) -> Result<DateWindow, EngineError> {
    let window = validate_window(new.start, new.end)?;
    validate_amounts(new.quantity.unwrap_or(1.0), new.utilization.unwrap_or(100))?;
    validate_note(new.notes.as_deref())?;
    Ok(window)
}

/// Build the allocation and run the conflict check against `rs`.
fn admit(rs: &ResourceState, new: NewAllocation, actor: &str, now: Ms) -> Result<Allocation, EngineError> {
    let window = validate_new(&new)?;
    if rs.record_count() >= MAX_RECORDS_PER_RESOURCE {
        return Err(EngineError::LimitExceeded("too many records on resource"));
    }
    let allocation = Allocation {
        id: new.id,
        resource_id: new.resource_id,
        project_id: new.project_id,
        task_id: new.task_id,
        schedule_item_id: new.schedule_item_id,
        window,
        quantity: new.quantity.unwrap_or(1.0),
        utilization: new.utilization.unwrap_or(100),
        status: new.status.unwrap_or(AllocationStatus::Planned),
        notes: new.notes,
        created_by: actor.to_string(),
        created_at: now,
        updated_at: now,
    };
    if allocation.is_active() {
        let load = allocation.load(rs.resource.kind());
        check_allocation(rs, &window, load, None).map_err(count_conflict)?;
    }
    Ok(allocation)
}

impl Engine {
    /// The id must name a live item: dependency and baseline ids share the
    /// index but are not items.
    async fn check_schedule_item(&self, item_id: Option<Ulid>) -> Result<(), EngineError> {
        let Some(id) = item_id else {
            return Ok(());
        };
        let schedule_id = self
            .entity_to_schedule
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let guard = self
            .schedule_read(&schedule_id, false)
            .await
            .map_err(|_| EngineError::NotFound(id))?;
        match guard.active_item(&id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(id)),
        }
    }

    /// Check-then-insert under the resource's write lock: at most one
    /// allocation decision per resource is in flight.
    pub async fn commit_allocation(
        &self,
        scope: &Scope,
        new: NewAllocation,
    ) -> Result<Allocation, EngineError> {
        self.authorize(scope)?;
        validate_new(&new)?;
        self.check_schedule_item(new.schedule_item_id).await?;
        let claim = IdClaim::take(&self.entity_to_resource, new.id, new.resource_id)?;

        let mut guard = self.live_resource_write(&new.resource_id).await?;
        let allocation = admit(&guard, new, &scope.actor, now_ms())?;
        self.persist_resource(&mut guard, &Event::AllocationCommitted(allocation.clone()))
            .await?;
        claim.applied();
        Ok(allocation)
    }

    /// All rows commit or none do. Every touched resource is write-locked in
    /// id order, and each row is checked against the resource plus the rows
    /// before it.
    pub async fn commit_allocations(
        &self,
        scope: &Scope,
        rows: Vec<NewAllocation>,
    ) -> Result<Vec<Allocation>, EngineError> {
        self.authorize(scope)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        if rows.len() > MAX_BATCH_IDS {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for new in &rows {
            validate_new(new)?;
            self.check_schedule_item(new.schedule_item_id).await?;
        }
        let mut claims = Vec::with_capacity(rows.len());
        for new in &rows {
            claims.push(IdClaim::take(&self.entity_to_resource, new.id, new.resource_id)?);
        }

        let gate = self.gate().await;
        let resource_ids = rows.iter().map(|r| r.resource_id).collect();
        let mut guards = self.lock_resources(&gate, resource_ids).await?;

        // Rows are staged into the locked state so later rows see them;
        // nothing else can observe it before the WAL answers.
        let now = now_ms();
        let mut staged: Vec<Allocation> = Vec::with_capacity(rows.len());
        let mut outcome = Ok(());
        for new in rows {
            let Some(rs) = guards.get_mut(&new.resource_id) else {
                outcome = Err(EngineError::NotFound(new.resource_id));
                break;
            };
            match admit(rs, new, &scope.actor, now) {
                Ok(allocation) => {
                    rs.insert_allocation(allocation.clone());
                    staged.push(allocation);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if outcome.is_ok() {
            let events = staged.iter().cloned().map(Event::AllocationCommitted).collect();
            outcome = self.wal_append_all(events).await;
        }
        if let Err(e) = outcome {
            for allocation in &staged {
                if let Some(rs) = guards.get_mut(&allocation.resource_id) {
                    rs.remove_allocation(allocation.id);
                }
            }
            return Err(e);
        }

        claims.into_iter().for_each(IdClaim::applied);
        Ok(staged)
    }

    /// Any change re-runs the full check against everything else on the
    /// resource, including blackouts added after the allocation.
    pub async fn update_allocation(
        &self,
        scope: &Scope,
        id: Ulid,
        patch: AllocationPatch,
    ) -> Result<Allocation, EngineError> {
        self.authorize(scope)?;
        if let Some(Some(notes)) = &patch.notes {
            validate_note(Some(notes))?;
        }
        if let Some(item) = patch.schedule_item_id {
            self.check_schedule_item(item).await?;
        }
        let mut guard = self.resolve_resource_entity(&id).await?;
        if guard.resource.is_deleted() {
            return Err(EngineError::NotFound(guard.resource.id));
        }
        let mut allocation = guard
            .allocation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        allocation.window = validate_window(
            patch.start.unwrap_or(allocation.window.start),
            patch.end.unwrap_or(allocation.window.end),
        )?;
        if let Some(quantity) = patch.quantity {
            allocation.quantity = quantity;
        }
        if let Some(utilization) = patch.utilization {
            allocation.utilization = utilization;
        }
        validate_amounts(allocation.quantity, allocation.utilization)?;
        if let Some(status) = patch.status {
            allocation.status = status;
        }
        if let Some(task_id) = patch.task_id {
            allocation.task_id = task_id;
        }
        if let Some(item) = patch.schedule_item_id {
            allocation.schedule_item_id = item;
        }
        if let Some(notes) = patch.notes {
            allocation.notes = notes;
        }
        allocation.updated_at = now_ms();

        if allocation.is_active() {
            let load = allocation.load(guard.resource.kind());
            check_allocation(&guard, &allocation.window, load, Some(id)).map_err(count_conflict)?;
        }

        self.persist_resource(&mut guard, &Event::AllocationUpdated(allocation.clone()))
            .await?;
        Ok(allocation)
    }

    /// Returns the owning resource id.
    pub async fn remove_allocation(&self, scope: &Scope, id: Ulid) -> Result<Ulid, EngineError> {
        self.authorize(scope)?;
        let mut guard = self.resolve_resource_entity(&id).await?;
        if guard.allocation(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let resource_id = guard.resource.id;
        let event = Event::AllocationRemoved { id, resource_id };
        self.persist_resource(&mut guard, &event).await?;
        Ok(resource_id)
    }

    pub async fn allocation(&self, scope: &Scope, id: Ulid) -> Result<Allocation, EngineError> {
        self.authorize(scope)?;
        let resource_id = self
            .entity_to_resource
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.resource_read(&resource_id, true).await?;
        guard.allocation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Allocations by start date. Records of deleted resources are still
    /// returned when the resource is named explicitly.
    pub async fn list_allocations(
        &self,
        scope: &Scope,
        resource_id: Option<Ulid>,
        project_id: Option<Ulid>,
        window: Option<DateWindow>,
    ) -> Result<Vec<Allocation>, EngineError> {
        self.authorize(scope)?;
        let shared = match resource_id {
            Some(rid) => vec![self.get_resource(&rid).ok_or(EngineError::NotFound(rid))?],
            None => self.resources.iter().map(|e| e.value().clone()).collect(),
        };

        let mut result = Vec::new();
        for rs in shared {
            let guard = rs.read().await;
            if resource_id.is_none() && guard.resource.is_deleted() {
                continue;
            }
            let matching = guard
                .allocations
                .iter()
                .filter(|a| project_id.is_none_or(|p| p == a.project_id))
                .filter(|a| window.is_none_or(|w| w.overlaps(&a.window)));
            result.extend(matching.cloned());
        }
        result.sort_by_key(|a| (a.window.start, a.id));
        Ok(result)
    }
}
