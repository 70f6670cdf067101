use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::DEPENDENCY_REJECTIONS_TOTAL;

use super::conflict::now_ms;
use super::{Engine, EngineError, IdClaim};

#[derive(Debug, Clone, PartialEq)]
pub struct NewDependency {
    pub id: Ulid,
    pub predecessor_id: Ulid,
    pub successor_id: Ulid,
    pub dependency_type: Option<DependencyType>,
    pub lag: Option<i32>,
}

fn rejected(reason: &'static str, err: EngineError) -> EngineError {
    metrics::counter!(DEPENDENCY_REJECTIONS_TOTAL, "reason" => reason).increment(1);
    debug!("dependency rejected ({reason}): {err}");
    err
}

/// Field checks that need no state. Returns the lag with its default.
fn validate_new(new: &NewDependency) -> Result<i32, EngineError> {
    if new.predecessor_id == new.successor_id {
        return Err(rejected("self_loop", EngineError::SelfDependency(new.predecessor_id)));
    }
    let lag = new.lag.unwrap_or(0);
    if lag.abs() > MAX_LAG_DAYS {
        return Err(EngineError::LimitExceeded("lag out of range"));
    }
    Ok(lag)
}

/// Build the edge and check it against the current graph of `ss`.
fn admit(
    ss: &ScheduleState,
    new: NewDependency,
    actor: &str,
    now: Ms,
) -> Result<ScheduleDependency, EngineError> {
    let lag = validate_new(&new)?;
    let NewDependency {
        id,
        predecessor_id,
        successor_id,
        dependency_type,
        ..
    } = new;
    for item in [predecessor_id, successor_id] {
        if ss.active_item(&item).is_none() {
            return Err(EngineError::NotFound(item));
        }
    }
    if ss.dependencies.len() >= MAX_DEPENDENCIES_PER_SCHEDULE {
        return Err(EngineError::LimitExceeded("too many dependencies on schedule"));
    }
    if let Some(existing) = ss.dependency_between(predecessor_id, successor_id) {
        return Err(rejected(
            "duplicate",
            EngineError::DuplicateDependency {
                existing: existing.id,
            },
        ));
    }
    if ss.reaches(successor_id, predecessor_id) {
        return Err(rejected(
            "cycle",
            EngineError::CycleDetected {
                predecessor: predecessor_id,
                successor: successor_id,
            },
        ));
    }
    Ok(ScheduleDependency {
        id,
        schedule_id: ss.schedule.id,
        predecessor_id,
        successor_id,
        dependency_type: dependency_type.unwrap_or(DependencyType::FinishToStart),
        lag,
        created_by: actor.to_string(),
        created_at: now,
    })
}

impl Engine {
    /// Both ends must sit in one schedule.
    fn schedule_of_edge(&self, new: &NewDependency) -> Result<Ulid, EngineError> {
        let schedule_of = |item: Ulid| {
            self.entity_to_schedule
                .get(&item)
                .map(|e| *e.value())
                .ok_or(EngineError::NotFound(item))
        };
        let schedule_id = schedule_of(new.predecessor_id)?;
        if schedule_of(new.successor_id)? != schedule_id {
            return Err(rejected(
                "cross_schedule",
                EngineError::Validation(format!(
                    "items {} and {} belong to different schedules",
                    new.predecessor_id, new.successor_id
                )),
            ));
        }
        Ok(schedule_id)
    }

    /// Insert an edge. The whole read-check-write runs under the schedule's
    /// write lock, so two concurrent inserts cannot jointly close a cycle.
    pub async fn add_dependency(
        &self,
        scope: &Scope,
        new: NewDependency,
    ) -> Result<ScheduleDependency, EngineError> {
        self.authorize(scope)?;
        validate_new(&new)?;
        let schedule_id = self.schedule_of_edge(&new)?;
        let claim = IdClaim::take(&self.entity_to_schedule, new.id, schedule_id)?;

        let mut guard = self.live_schedule_write(&schedule_id).await?;
        let dependency = admit(&guard, new, &scope.actor, now_ms())?;
        self.persist_schedule(&mut guard, &Event::DependencyAdded(dependency.clone()))
            .await?;
        claim.applied();
        Ok(dependency)
    }

    /// All edges are added or none are. Each is checked against the graph
    /// with the earlier edges of the batch already in it, so a batch cannot
    /// close a cycle between its own rows.
    pub async fn add_dependencies(
        &self,
        scope: &Scope,
        rows: Vec<NewDependency>,
    ) -> Result<Vec<ScheduleDependency>, EngineError> {
        self.authorize(scope)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        if rows.len() > MAX_BATCH_IDS {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut targets = Vec::with_capacity(rows.len());
        for new in &rows {
            validate_new(new)?;
            targets.push(self.schedule_of_edge(new)?);
        }
        let mut claims = Vec::with_capacity(rows.len());
        for (new, schedule_id) in rows.iter().zip(&targets) {
            claims.push(IdClaim::take(&self.entity_to_schedule, new.id, *schedule_id)?);
        }

        let gate = self.gate().await;
        let mut guards = self.lock_schedules(&gate, targets.clone()).await?;

        let now = now_ms();
        let mut staged: Vec<ScheduleDependency> = Vec::with_capacity(rows.len());
        let mut outcome = Ok(());
        for (new, schedule_id) in rows.into_iter().zip(targets) {
            let Some(ss) = guards.get_mut(&schedule_id) else {
                outcome = Err(EngineError::NotFound(schedule_id));
                break;
            };
            match admit(ss, new, &scope.actor, now) {
                Ok(dependency) => {
                    ss.insert_dependency(dependency.clone());
                    staged.push(dependency);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if outcome.is_ok() {
            let events = staged.iter().cloned().map(Event::DependencyAdded).collect();
            outcome = self.wal_append_all(events).await;
        }
        if let Err(e) = outcome {
            for dependency in &staged {
                if let Some(ss) = guards.get_mut(&dependency.schedule_id) {
                    ss.remove_dependency(&dependency.id);
                }
            }
            return Err(e);
        }

        claims.into_iter().for_each(IdClaim::applied);
        Ok(staged)
    }

    pub async fn remove_dependency(&self, scope: &Scope, id: Ulid) -> Result<(), EngineError> {
        self.authorize(scope)?;
        let mut guard = self.resolve_schedule_entity(&id).await?;
        if !guard.dependencies.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::DependencyRemoved {
            id,
            schedule_id: guard.schedule.id,
        };
        self.persist_schedule(&mut guard, &event).await
    }

    /// Edges touching `item_id` in either direction.
    pub async fn item_dependencies(
        &self,
        scope: &Scope,
        item_id: Ulid,
        include_deleted: bool,
    ) -> Result<Vec<ScheduleDependency>, EngineError> {
        self.authorize(scope)?;
        let schedule_id = self
            .entity_to_schedule
            .get(&item_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(item_id))?;
        let guard = self
            .schedule_read(&schedule_id, include_deleted)
            .await
            .map_err(|_| EngineError::NotFound(item_id))?;
        if !include_deleted && guard.active_item(&item_id).is_none() {
            return Err(EngineError::NotFound(item_id));
        }
        Ok(guard
            .incident_dependencies(&item_id)
            .iter()
            .filter_map(|id| guard.dependencies.get(id).cloned())
            .collect())
    }

    pub async fn schedule_dependencies(
        &self,
        scope: &Scope,
        schedule_id: Ulid,
        include_deleted: bool,
    ) -> Result<Vec<ScheduleDependency>, EngineError> {
        self.authorize(scope)?;
        let guard = self.schedule_read(&schedule_id, include_deleted).await?;
        let mut deps: Vec<ScheduleDependency> = guard.dependencies.values().cloned().collect();
        deps.sort_by_key(|d| d.id);
        Ok(deps)
    }
}
