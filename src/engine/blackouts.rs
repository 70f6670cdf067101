use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_windows;
use super::conflict::{grandfathered_allocations, now_ms, validate_note, validate_window};
use super::{Engine, EngineError, IdClaim};

/// A stored blackout plus the active allocations it overlaps. Those
/// allocations stay committed; they are reported so the caller can act.
#[derive(Debug, Clone, PartialEq)]
pub struct BlackoutOutcome {
    pub blackout: AvailabilityWindow,
    pub grandfathered: Vec<Ulid>,
}

fn validate_reason(reason: &str) -> Result<(), EngineError> {
    if reason.trim().is_empty() {
        return Err(EngineError::Validation("reason is required".into()));
    }
    validate_note(Some(reason))
}

impl Engine {
    pub async fn add_availability(
        &self,
        scope: &Scope,
        id: Ulid,
        resource_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        reason: String,
    ) -> Result<BlackoutOutcome, EngineError> {
        self.authorize(scope)?;
        let window = validate_window(start, end)?;
        validate_reason(&reason)?;
        let claim = IdClaim::take(&self.entity_to_resource, id, resource_id)?;
        let mut guard = self.live_resource_write(&resource_id).await?;
        if guard.record_count() >= MAX_RECORDS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many records on resource"));
        }

        let grandfathered = grandfathered_allocations(&guard, &window);
        let blackout = AvailabilityWindow {
            id,
            resource_id,
            window,
            reason,
            created_by: scope.actor.clone(),
            created_at: now_ms(),
        };
        self.persist_resource(&mut guard, &Event::AvailabilityAdded(blackout.clone()))
            .await?;
        claim.applied();
        if !grandfathered.is_empty() {
            debug!(
                "blackout {id} on {resource_id} overlaps {} existing allocations",
                grandfathered.len()
            );
        }
        Ok(BlackoutOutcome {
            blackout,
            grandfathered,
        })
    }

    pub async fn update_availability(
        &self,
        scope: &Scope,
        id: Ulid,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        reason: Option<String>,
    ) -> Result<BlackoutOutcome, EngineError> {
        self.authorize(scope)?;
        if let Some(reason) = &reason {
            validate_reason(reason)?;
        }
        let mut guard = self.resolve_resource_entity(&id).await?;
        if guard.resource.is_deleted() {
            return Err(EngineError::NotFound(guard.resource.id));
        }
        let mut blackout = guard
            .blackout(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        blackout.window = validate_window(
            start.unwrap_or(blackout.window.start),
            end.unwrap_or(blackout.window.end),
        )?;
        if let Some(reason) = reason {
            blackout.reason = reason;
        }

        let grandfathered = grandfathered_allocations(&guard, &blackout.window);
        self.persist_resource(&mut guard, &Event::AvailabilityUpdated(blackout.clone()))
            .await?;
        Ok(BlackoutOutcome {
            blackout,
            grandfathered,
        })
    }

    /// Returns the owning resource id.
    pub async fn remove_availability(&self, scope: &Scope, id: Ulid) -> Result<Ulid, EngineError> {
        self.authorize(scope)?;
        let mut guard = self.resolve_resource_entity(&id).await?;
        if guard.blackout(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let resource_id = guard.resource.id;
        let event = Event::AvailabilityRemoved { id, resource_id };
        self.persist_resource(&mut guard, &event).await?;
        Ok(resource_id)
    }

    /// Blackouts of a resource by start date, optionally only those
    /// overlapping `window`.
    pub async fn list_availability(
        &self,
        scope: &Scope,
        resource_id: Ulid,
        window: Option<DateWindow>,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        self.authorize(scope)?;
        let guard = self.resource_read(&resource_id, true).await?;
        Ok(match window {
            Some(w) => guard.overlapping_blackouts(&w).cloned().collect(),
            None => guard.blackouts.clone(),
        })
    }

    /// Sub-windows of `[start, end]` free of blackouts.
    pub async fn free_windows(
        &self,
        scope: &Scope,
        resource_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DateWindow>, EngineError> {
        self.authorize(scope)?;
        let query = validate_window(start, end)?;
        if query.days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let guard = self.resource_read(&resource_id, false).await?;
        let blackouts: Vec<DateWindow> = guard
            .overlapping_blackouts(&query)
            .map(|b| b.window)
            .collect();
        Ok(free_windows(&query, &blackouts))
    }
}
