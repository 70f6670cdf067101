use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_date, validate_note, validate_window};
use super::{Engine, EngineError, IdClaim};

#[derive(Debug, Clone, PartialEq)]
pub struct NewUtilization {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub project_id: Option<Ulid>,
    pub task_id: Option<Ulid>,
    pub date: NaiveDate,
    pub hours: Option<f64>,
    pub quantity: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationPatch {
    pub project_id: Option<Option<Ulid>>,
    pub task_id: Option<Option<Ulid>>,
    pub date: Option<NaiveDate>,
    pub hours: Option<f64>,
    pub quantity: Option<f64>,
    pub notes: Option<Option<String>>,
}

/// Every field narrows the result; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationFilter {
    pub resource_id: Option<Ulid>,
    pub project_id: Option<Ulid>,
    pub task_id: Option<Ulid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl UtilizationFilter {
    fn validate(&self) -> Result<(), EngineError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            let window = validate_window(from, to)?;
            if window.days() > MAX_QUERY_WINDOW_DAYS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }
        Ok(())
    }

    fn matches(&self, record: &UtilizationRecord) -> bool {
        self.project_id.is_none_or(|p| record.project_id == Some(p))
            && self.task_id.is_none_or(|t| record.task_id == Some(t))
            && self.from.is_none_or(|from| record.date >= from)
            && self.to.is_none_or(|to| record.date <= to)
    }
}

/// Hours for labor and equipment, quantity for material. The other field
/// must be empty.
fn validate_amount(kind: ResourceKind, hours: Option<f64>, quantity: Option<f64>) -> Result<(), EngineError> {
    match kind {
        ResourceKind::Labor | ResourceKind::Equipment => {
            let Some(hours) = hours else {
                return Err(EngineError::Validation(format!("hours are required for {kind} resources")));
            };
            if !(hours > 0.0 && hours <= MAX_DAILY_HOURS) {
                return Err(EngineError::Validation(format!(
                    "hours must be in (0, {MAX_DAILY_HOURS}], got {hours}"
                )));
            }
            if quantity.is_some() {
                return Err(EngineError::Validation(format!("quantity does not apply to {kind} resources")));
            }
        }
        ResourceKind::Material => {
            let Some(quantity) = quantity else {
                return Err(EngineError::Validation("quantity is required for material resources".into()));
            };
            if !quantity.is_finite() || quantity <= 0.0 {
                return Err(EngineError::Validation(format!("quantity must be positive, got {quantity}")));
            }
            if hours.is_some() {
                return Err(EngineError::Validation("hours do not apply to material resources".into()));
            }
        }
    }
    Ok(())
}

impl Engine {
    /// Append a consumption record. No capacity checks: this is history.
    pub async fn record_utilization(
        &self,
        scope: &Scope,
        new: NewUtilization,
    ) -> Result<UtilizationRecord, EngineError> {
        self.authorize(scope)?;
        validate_date(new.date)?;
        validate_note(new.notes.as_deref())?;
        let claim = IdClaim::take(&self.entity_to_resource, new.id, new.resource_id)?;
        let mut guard = self.live_resource_write(&new.resource_id).await?;
        validate_amount(guard.resource.kind(), new.hours, new.quantity)?;
        if guard.record_count() >= MAX_RECORDS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many records on resource"));
        }

        let record = UtilizationRecord {
            id: new.id,
            resource_id: new.resource_id,
            project_id: new.project_id,
            task_id: new.task_id,
            date: new.date,
            hours: new.hours,
            quantity: new.quantity,
            notes: new.notes,
            created_by: scope.actor.clone(),
            created_at: now_ms(),
        };
        self.persist_resource(&mut guard, &Event::UtilizationRecorded(record.clone()))
            .await?;
        claim.applied();
        Ok(record)
    }

    pub async fn update_utilization(
        &self,
        scope: &Scope,
        id: Ulid,
        patch: UtilizationPatch,
    ) -> Result<UtilizationRecord, EngineError> {
        self.authorize(scope)?;
        if let Some(date) = patch.date {
            validate_date(date)?;
        }
        if let Some(Some(notes)) = &patch.notes {
            validate_note(Some(notes))?;
        }
        let mut guard = self.resolve_resource_entity(&id).await?;
        if guard.resource.is_deleted() {
            return Err(EngineError::NotFound(guard.resource.id));
        }
        let mut record = guard
            .utilization_record(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if let Some(date) = patch.date {
            record.date = date;
        }
        if patch.hours.is_some() {
            record.hours = patch.hours;
        }
        if patch.quantity.is_some() {
            record.quantity = patch.quantity;
        }
        validate_amount(guard.resource.kind(), record.hours, record.quantity)?;
        if let Some(project_id) = patch.project_id {
            record.project_id = project_id;
        }
        if let Some(task_id) = patch.task_id {
            record.task_id = task_id;
        }
        if let Some(notes) = patch.notes {
            record.notes = notes;
        }

        self.persist_resource(&mut guard, &Event::UtilizationUpdated(record.clone()))
            .await?;
        Ok(record)
    }

    /// Returns the owning resource id.
    pub async fn remove_utilization(&self, scope: &Scope, id: Ulid) -> Result<Ulid, EngineError> {
        self.authorize(scope)?;
        let mut guard = self.resolve_resource_entity(&id).await?;
        if guard.utilization_record(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let resource_id = guard.resource.id;
        let event = Event::UtilizationRemoved { id, resource_id };
        self.persist_resource(&mut guard, &event).await?;
        Ok(resource_id)
    }

    async fn utilization_sources(
        &self,
        filter: &UtilizationFilter,
    ) -> Result<Vec<super::SharedResourceState>, EngineError> {
        filter.validate()?;
        Ok(match filter.resource_id {
            Some(rid) => vec![self.get_resource(&rid).ok_or(EngineError::NotFound(rid))?],
            None => self.resources.iter().map(|e| e.value().clone()).collect(),
        })
    }

    /// Records by date, then id.
    pub async fn list_utilization(
        &self,
        scope: &Scope,
        filter: &UtilizationFilter,
    ) -> Result<Vec<UtilizationRecord>, EngineError> {
        self.authorize(scope)?;
        let mut result = Vec::new();
        for rs in self.utilization_sources(filter).await? {
            let guard = rs.read().await;
            result.extend(guard.utilization.iter().filter(|r| filter.matches(r)).cloned());
        }
        result.sort_by_key(|r| (r.date, r.id));
        Ok(result)
    }

    /// Totals per resource with at least one matching record. Cost is the
    /// summed amount times the resource's cost rate, when it has one.
    pub async fn utilization_summary(
        &self,
        scope: &Scope,
        filter: &UtilizationFilter,
    ) -> Result<Vec<UtilizationTotals>, EngineError> {
        self.authorize(scope)?;
        let mut result = Vec::new();
        for rs in self.utilization_sources(filter).await? {
            let guard = rs.read().await;
            let resource = &guard.resource;
            let mut totals = UtilizationTotals {
                resource_id: resource.id,
                resource_kind: resource.kind(),
                records: 0,
                hours: 0.0,
                quantity: 0.0,
                cost: None,
            };
            for record in guard.utilization.iter().filter(|r| filter.matches(r)) {
                totals.records += 1;
                totals.hours += record.hours.unwrap_or(0.0);
                totals.quantity += record.quantity.unwrap_or(0.0);
            }
            if totals.records == 0 {
                continue;
            }
            let amount = match totals.resource_kind {
                ResourceKind::Material => totals.quantity,
                ResourceKind::Labor | ResourceKind::Equipment => totals.hours,
            };
            totals.cost = resource.cost_rate.map(|rate| rate * amount);
            result.push(totals);
        }
        result.sort_by_key(|t| t.resource_id);
        Ok(result)
    }
}
