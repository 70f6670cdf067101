use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::peak_load;
use super::conflict::{now_ms, validate_name};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq)]
pub struct NewResource {
    pub id: Ulid,
    pub name: String,
    pub details: ResourceDetails,
    pub status: Option<ResourceStatus>,
    pub cost_rate: Option<f64>,
    pub cost_unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    /// Only accepted when it matches the current kind.
    pub kind: Option<ResourceKind>,
    pub details: DetailsPatch,
    pub status: Option<ResourceStatus>,
    pub cost_rate: Option<Option<f64>>,
    pub cost_unit: Option<Option<String>>,
}

/// Kind-specific fields to change. Setting a field that does not belong to
/// the resource's kind is a validation error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailsPatch {
    pub role: Option<Option<String>>,
    pub skills: Option<Vec<String>>,
    pub max_hours_per_day: Option<Option<f64>>,
    pub condition: Option<Option<String>>,
    pub last_maintenance: Option<Option<NaiveDate>>,
    pub next_maintenance: Option<Option<NaiveDate>>,
    pub unit: Option<Option<String>>,
    pub quantity_on_hand: Option<f64>,
    pub reorder_point: Option<Option<f64>>,
}

impl DetailsPatch {
    fn foreign_field(&self, kind: ResourceKind) -> Option<&'static str> {
        let labor = [
            ("role", self.role.is_some()),
            ("skills", self.skills.is_some()),
            ("max_hours_per_day", self.max_hours_per_day.is_some()),
        ];
        let equipment = [
            ("condition", self.condition.is_some()),
            ("last_maintenance", self.last_maintenance.is_some()),
            ("next_maintenance", self.next_maintenance.is_some()),
        ];
        let material = [
            ("unit", self.unit.is_some()),
            ("quantity_on_hand", self.quantity_on_hand.is_some()),
            ("reorder_point", self.reorder_point.is_some()),
        ];
        let foreign: Vec<&[(&'static str, bool)]> = match kind {
            ResourceKind::Labor => vec![&equipment, &material],
            ResourceKind::Equipment => vec![&labor, &material],
            ResourceKind::Material => vec![&labor, &equipment],
        };
        foreign
            .into_iter()
            .flatten()
            .find(|(_, set)| *set)
            .map(|(name, _)| *name)
    }

    pub(crate) fn apply(self, details: &ResourceDetails) -> Result<ResourceDetails, EngineError> {
        if let Some(field) = self.foreign_field(details.kind()) {
            return Err(EngineError::Validation(format!(
                "{field} does not apply to {} resources",
                details.kind()
            )));
        }
        let mut details = details.clone();
        match &mut details {
            ResourceDetails::Labor {
                role,
                skills,
                max_hours_per_day,
            } => {
                if let Some(v) = self.role {
                    *role = v;
                }
                if let Some(v) = self.skills {
                    *skills = v;
                }
                if let Some(v) = self.max_hours_per_day {
                    *max_hours_per_day = v;
                }
            }
            ResourceDetails::Equipment {
                condition,
                last_maintenance,
                next_maintenance,
            } => {
                if let Some(v) = self.condition {
                    *condition = v;
                }
                if let Some(v) = self.last_maintenance {
                    *last_maintenance = v;
                }
                if let Some(v) = self.next_maintenance {
                    *next_maintenance = v;
                }
            }
            ResourceDetails::Material {
                unit,
                quantity_on_hand,
                reorder_point,
            } => {
                if let Some(v) = self.unit {
                    *unit = v;
                }
                if let Some(v) = self.quantity_on_hand {
                    *quantity_on_hand = v;
                }
                if let Some(v) = self.reorder_point {
                    *reorder_point = v;
                }
            }
        }
        Ok(details)
    }
}

fn non_negative(field: &str, value: f64) -> Result<(), EngineError> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::Validation(format!(
            "{field} must be a non-negative number, got {value}"
        )));
    }
    Ok(())
}

fn validate_details(details: &ResourceDetails) -> Result<(), EngineError> {
    match details {
        ResourceDetails::Labor {
            role,
            skills,
            max_hours_per_day,
        } => {
            if role.as_ref().is_some_and(|r| r.len() > MAX_NAME_LEN)
                || skills.iter().any(|s| s.len() > MAX_NAME_LEN)
            {
                return Err(EngineError::LimitExceeded("labor field too long"));
            }
            if let Some(hours) = max_hours_per_day
                && !(*hours > 0.0 && *hours <= MAX_DAILY_HOURS)
            {
                return Err(EngineError::Validation(format!(
                    "max_hours_per_day must be in (0, {MAX_DAILY_HOURS}], got {hours}"
                )));
            }
        }
        ResourceDetails::Equipment {
            condition,
            last_maintenance,
            next_maintenance,
        } => {
            if condition.as_ref().is_some_and(|c| c.len() > MAX_NAME_LEN) {
                return Err(EngineError::LimitExceeded("condition too long"));
            }
            if let (Some(last), Some(next)) = (last_maintenance, next_maintenance)
                && next < last
            {
                return Err(EngineError::Validation(format!(
                    "next_maintenance {next} is before last_maintenance {last}"
                )));
            }
        }
        ResourceDetails::Material {
            unit,
            quantity_on_hand,
            reorder_point,
        } => {
            if unit.as_ref().is_some_and(|u| u.len() > MAX_NAME_LEN) {
                return Err(EngineError::LimitExceeded("unit too long"));
            }
            non_negative("quantity_on_hand", *quantity_on_hand)?;
            if let Some(point) = reorder_point {
                non_negative("reorder_point", *point)?;
            }
        }
    }
    Ok(())
}

impl Engine {
    pub async fn create_resource(&self, scope: &Scope, new: NewResource) -> Result<Resource, EngineError> {
        self.authorize(scope)?;
        validate_name(&new.name)?;
        validate_details(&new.details)?;
        if let Some(rate) = new.cost_rate {
            non_negative("cost_rate", rate)?;
        }
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let now = now_ms();
        let resource = Resource {
            id: new.id,
            name: new.name,
            details: new.details,
            status: new.status.unwrap_or(ResourceStatus::Available),
            cost_rate: new.cost_rate,
            cost_unit: new.cost_unit,
            created_by: scope.actor.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.persist_new_resource(resource.clone()).await?;
        info!("{} resource {} created", resource.kind(), resource.id);
        Ok(resource)
    }

    pub async fn update_resource(
        &self,
        scope: &Scope,
        id: Ulid,
        patch: ResourcePatch,
    ) -> Result<Resource, EngineError> {
        self.authorize(scope)?;
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(Some(rate)) = patch.cost_rate {
            non_negative("cost_rate", rate)?;
        }
        let mut guard = self.live_resource_write(&id).await?;
        let mut resource = guard.resource.clone();

        if let Some(kind) = patch.kind
            && kind != resource.kind()
        {
            return Err(EngineError::Validation(format!(
                "resource kind cannot change from {} to {kind}",
                resource.kind()
            )));
        }
        let details = patch.details.apply(&resource.details)?;
        validate_details(&details)?;
        resource.details = details;

        // Shrinking stock below what is already reserved would break the
        // capacity invariant for existing allocations.
        let kind = resource.kind();
        let loads: Vec<(Span, f64)> = guard
            .allocations
            .iter()
            .filter(|a| a.is_active())
            .map(|a| (a.window.to_span(), a.load(kind)))
            .collect();
        let peak = peak_load(&loads);
        if peak > resource.capacity() + 1e-9 {
            return Err(EngineError::CapacityExceeded {
                resource_id: id,
                capacity: resource.capacity(),
                peak,
                colliding: guard
                    .allocations
                    .iter()
                    .filter(|a| a.is_active())
                    .map(|a| a.id)
                    .collect(),
            });
        }

        if let Some(name) = patch.name {
            resource.name = name;
        }
        if let Some(status) = patch.status {
            resource.status = status;
        }
        if let Some(rate) = patch.cost_rate {
            resource.cost_rate = rate;
        }
        if let Some(unit) = patch.cost_unit {
            resource.cost_unit = unit;
        }
        resource.updated_at = now_ms();

        self.persist_resource(&mut guard, &Event::ResourceUpdated(resource.clone()))
            .await?;
        Ok(resource)
    }

    /// Logical delete. Allocations, blackouts and utilization stay queryable.
    pub async fn delete_resource(&self, scope: &Scope, id: Ulid) -> Result<(), EngineError> {
        self.authorize(scope)?;
        let mut guard = self.live_resource_write(&id).await?;
        let event = Event::ResourceDeleted {
            id,
            deleted_at: now_ms(),
        };
        self.persist_resource(&mut guard, &event).await?;
        info!("resource {id} deleted");
        Ok(())
    }

    pub async fn resource(&self, scope: &Scope, id: Ulid, include_deleted: bool) -> Result<Resource, EngineError> {
        self.authorize(scope)?;
        let guard = self.resource_read(&id, include_deleted).await?;
        Ok(guard.resource.clone())
    }

    pub async fn list_resources(
        &self,
        scope: &Scope,
        kind: Option<ResourceKind>,
        include_deleted: bool,
    ) -> Result<Vec<Resource>, EngineError> {
        self.authorize(scope)?;
        let shared: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::new();
        for rs in shared {
            let guard = rs.read().await;
            let resource = &guard.resource;
            if kind.is_some_and(|k| k != resource.kind()) {
                continue;
            }
            if resource.is_deleted() && !include_deleted {
                continue;
            }
            result.push(resource.clone());
        }
        result.sort_by_key(|r| r.id);
        Ok(result)
    }
}
