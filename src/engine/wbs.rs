use chrono::{Duration, NaiveDate};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_name, validate_window};
use super::{Engine, EngineError, IdClaim};

#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub parent_id: Option<Ulid>,
    pub task_id: Option<Ulid>,
    pub name: String,
    pub kind: Option<ItemKind>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub duration: Option<i64>,
    pub percent_complete: Option<u8>,
    pub status: Option<ItemStatus>,
    pub sort_order: Option<i32>,
}

/// Outer `Option` means "leave as is"; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub kind: Option<ItemKind>,
    pub parent_id: Option<Option<Ulid>>,
    pub task_id: Option<Option<Ulid>>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub duration: Option<i64>,
    pub percent_complete: Option<u8>,
    pub status: Option<ItemStatus>,
    pub sort_order: Option<i32>,
}

/// Fill in whichever of start / end is missing from the other plus `duration`.
/// When all three are given they must agree.
pub(crate) fn resolve_dates(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    duration: Option<i64>,
) -> Result<(NaiveDate, NaiveDate), EngineError> {
    if let Some(d) = duration
        && !(1..=MAX_WINDOW_DAYS).contains(&d)
    {
        return Err(EngineError::Validation(format!(
            "duration must be between 1 and {MAX_WINDOW_DAYS} days, got {d}"
        )));
    }
    let (start, end) = match (start, end, duration) {
        (Some(s), Some(e), _) => (s, e),
        (Some(s), None, Some(d)) => (s, s + Duration::days(d - 1)),
        (None, Some(e), Some(d)) => (e - Duration::days(d - 1), e),
        _ => {
            return Err(EngineError::Validation(
                "start_date and end_date are required (or one of them plus duration)".into(),
            ));
        }
    };
    let window = validate_window(start, end)?;
    if let Some(d) = duration
        && d != window.days()
    {
        return Err(EngineError::Validation(format!(
            "duration {d} disagrees with {start}..{end} ({} days)",
            window.days()
        )));
    }
    Ok((start, end))
}

fn validate_percent(percent: u8) -> Result<(), EngineError> {
    if percent > 100 {
        return Err(EngineError::Validation(format!(
            "percent_complete must be 0-100, got {percent}"
        )));
    }
    Ok(())
}

/// Levels from `root` down to its deepest active descendant, `root` included.
fn subtree_height(ss: &ScheduleState, root: Ulid) -> usize {
    let root_depth = ss.depth_of(root);
    ss.active_items()
        .filter(|item| ss.is_ancestor(root, item.id))
        .map(|item| ss.depth_of(item.id))
        .max()
        .map_or(1, |deepest| deepest + 1 - root_depth)
}

fn check_parent(ss: &ScheduleState, parent_id: Ulid, levels: usize) -> Result<(), EngineError> {
    if ss.active_item(&parent_id).is_none() {
        return Err(EngineError::NotFound(parent_id));
    }
    if ss.depth_of(parent_id) + levels > MAX_WBS_DEPTH {
        return Err(EngineError::LimitExceeded("WBS tree too deep"));
    }
    Ok(())
}

fn check_sibling_order(
    ss: &ScheduleState,
    parent_id: Option<Ulid>,
    sort_order: i32,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(existing) = ss.sibling_with_order(parent_id, sort_order)
        && Some(existing.id) != exclude
    {
        debug!("sort order {sort_order} already taken by {}", existing.id);
        return Err(EngineError::SiblingOrderTaken {
            sort_order,
            existing: existing.id,
        });
    }
    Ok(())
}

/// Field checks that need no state. Returns the resolved dates.
fn validate_new(new: &NewItem) -> Result<(NaiveDate, NaiveDate), EngineError> {
    validate_name(&new.name)?;
    let dates = resolve_dates(new.start, new.end, new.duration)?;
    if let Some(p) = new.percent_complete {
        validate_percent(p)?;
    }
    Ok(dates)
}

/// Build the item and place it in the tree of `ss`.
fn admit(ss: &ScheduleState, new: NewItem, actor: &str, now: Ms) -> Result<ScheduleItem, EngineError> {
    let (start, end) = validate_new(&new)?;
    if ss.items.len() >= MAX_ITEMS_PER_SCHEDULE {
        return Err(EngineError::LimitExceeded("too many items on schedule"));
    }
    if let Some(parent_id) = new.parent_id {
        check_parent(ss, parent_id, 1)?;
    }
    let sort_order = match new.sort_order {
        Some(order) => {
            check_sibling_order(ss, new.parent_id, order, None)?;
            order
        }
        None => ss.next_sort_order(new.parent_id),
    };
    Ok(ScheduleItem {
        id: new.id,
        schedule_id: new.schedule_id,
        parent_id: new.parent_id,
        task_id: new.task_id,
        name: new.name,
        kind: new.kind.unwrap_or(ItemKind::Task),
        start,
        end,
        duration: duration_days(start, end),
        percent_complete: new.percent_complete.unwrap_or(0),
        status: new.status.unwrap_or(ItemStatus::NotStarted),
        sort_order,
        baseline_start: None,
        baseline_end: None,
        created_by: actor.to_string(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    })
}

impl Engine {
    pub async fn create_item(&self, scope: &Scope, new: NewItem) -> Result<ScheduleItem, EngineError> {
        self.authorize(scope)?;
        validate_new(&new)?;
        let claim = IdClaim::take(&self.entity_to_schedule, new.id, new.schedule_id)?;

        let mut guard = self.live_schedule_write(&new.schedule_id).await?;
        let item = admit(&guard, new, &scope.actor, now_ms())?;
        self.persist_schedule(&mut guard, &Event::ItemCreated(item.clone()))
            .await?;
        claim.applied();
        Ok(item)
    }

    /// All items are created or none are. A row may name an earlier row of
    /// the same batch as its parent.
    pub async fn create_items(
        &self,
        scope: &Scope,
        rows: Vec<NewItem>,
    ) -> Result<Vec<ScheduleItem>, EngineError> {
        self.authorize(scope)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        if rows.len() > MAX_BATCH_IDS {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut claims = Vec::with_capacity(rows.len());
        for new in &rows {
            validate_new(new)?;
            claims.push(IdClaim::take(&self.entity_to_schedule, new.id, new.schedule_id)?);
        }

        let gate = self.gate().await;
        let schedule_ids = rows.iter().map(|r| r.schedule_id).collect();
        let mut guards = self.lock_schedules(&gate, schedule_ids).await?;

        let now = now_ms();
        let mut staged: Vec<ScheduleItem> = Vec::with_capacity(rows.len());
        let mut outcome = Ok(());
        for new in rows {
            let Some(ss) = guards.get_mut(&new.schedule_id) else {
                outcome = Err(EngineError::NotFound(new.schedule_id));
                break;
            };
            match admit(ss, new, &scope.actor, now) {
                Ok(item) => {
                    ss.items.insert(item.id, item.clone());
                    staged.push(item);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if outcome.is_ok() {
            let events = staged.iter().cloned().map(Event::ItemCreated).collect();
            outcome = self.wal_append_all(events).await;
        }
        if let Err(e) = outcome {
            for item in &staged {
                if let Some(ss) = guards.get_mut(&item.schedule_id) {
                    ss.items.remove(&item.id);
                }
            }
            return Err(e);
        }

        claims.into_iter().for_each(IdClaim::applied);
        Ok(staged)
    }

    pub async fn update_item(
        &self,
        scope: &Scope,
        id: Ulid,
        patch: ItemPatch,
    ) -> Result<ScheduleItem, EngineError> {
        self.authorize(scope)?;
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(p) = patch.percent_complete {
            validate_percent(p)?;
        }
        let mut guard = self.resolve_schedule_entity(&id).await?;
        let mut item = guard
            .active_item(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let (start, end) = match (patch.start, patch.end, patch.duration) {
            (None, None, None) => (item.start, item.end),
            (start, None, Some(d)) => resolve_dates(Some(start.unwrap_or(item.start)), None, Some(d))?,
            (None, Some(end), Some(d)) => resolve_dates(None, Some(end), Some(d))?,
            (start, end, duration) => resolve_dates(
                Some(start.unwrap_or(item.start)),
                Some(end.unwrap_or(item.end)),
                duration,
            )?,
        };
        item.start = start;
        item.end = end;
        item.duration = duration_days(start, end);

        let parent_changed = patch.parent_id.is_some_and(|p| p != item.parent_id);
        if let Some(parent_id) = patch.parent_id {
            if let Some(pid) = parent_id
                && parent_changed
            {
                if guard.is_ancestor(id, pid) {
                    return Err(EngineError::Validation(format!(
                        "item {id} cannot be moved under its own descendant {pid}"
                    )));
                }
                check_parent(&guard, pid, subtree_height(&guard, id))?;
            }
            item.parent_id = parent_id;
        }

        match patch.sort_order {
            Some(order) if order != item.sort_order || parent_changed => {
                check_sibling_order(&guard, item.parent_id, order, Some(id))?;
                item.sort_order = order;
            }
            Some(_) => {}
            None if parent_changed => item.sort_order = guard.next_sort_order(item.parent_id),
            None => {}
        }

        if let Some(name) = patch.name {
            item.name = name;
        }
        if let Some(kind) = patch.kind {
            item.kind = kind;
        }
        if let Some(task_id) = patch.task_id {
            item.task_id = task_id;
        }
        if let Some(p) = patch.percent_complete {
            item.percent_complete = p;
        }
        if let Some(status) = patch.status {
            item.status = status;
        }
        item.updated_at = now_ms();

        self.persist_schedule(&mut guard, &Event::ItemUpdated(item.clone()))
            .await?;
        Ok(item)
    }

    /// Logical delete. Children keep their parent link; the item's dependency
    /// edges are dropped and their ids returned.
    pub async fn delete_item(&self, scope: &Scope, id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        self.authorize(scope)?;
        let mut guard = self.resolve_schedule_entity(&id).await?;
        if guard.active_item(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let dropped = guard.incident_dependencies(&id);
        let event = Event::ItemDeleted {
            id,
            schedule_id: guard.schedule.id,
            deleted_at: now_ms(),
        };
        self.persist_schedule(&mut guard, &event).await?;
        debug!("item {id} deleted, {} dependencies dropped", dropped.len());
        Ok(dropped)
    }

    pub async fn item(&self, scope: &Scope, id: Ulid, include_deleted: bool) -> Result<ScheduleItem, EngineError> {
        self.authorize(scope)?;
        let schedule_id = self
            .entity_to_schedule
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let guard = self
            .schedule_read(&schedule_id, include_deleted)
            .await
            .map_err(|_| EngineError::NotFound(id))?;
        guard
            .items
            .get(&id)
            .filter(|item| include_deleted || !item.is_deleted())
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Items ordered by (parent, sort order); roots first.
    pub async fn list_items(
        &self,
        scope: &Scope,
        schedule_id: Ulid,
        include_deleted: bool,
    ) -> Result<Vec<ScheduleItem>, EngineError> {
        self.authorize(scope)?;
        let guard = self.schedule_read(&schedule_id, include_deleted).await?;
        let mut items: Vec<ScheduleItem> = guard
            .items
            .values()
            .filter(|item| include_deleted || !item.is_deleted())
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.parent_id, i.sort_order, i.id));
        Ok(items)
    }

    /// Renumber the active children of `parent_id` as 1..n in the given order.
    /// `ordered_ids` must be exactly those children.
    pub async fn reorder_items(
        &self,
        scope: &Scope,
        schedule_id: Ulid,
        parent_id: Option<Ulid>,
        ordered_ids: Vec<Ulid>,
    ) -> Result<Vec<ScheduleItem>, EngineError> {
        self.authorize(scope)?;
        if ordered_ids.len() > MAX_BATCH_IDS {
            return Err(EngineError::LimitExceeded("too many ids in reorder"));
        }
        let mut guard = self.live_schedule_write(&schedule_id).await?;
        if let Some(pid) = parent_id
            && guard.active_item(&pid).is_none()
        {
            return Err(EngineError::NotFound(pid));
        }

        let mut expected: Vec<Ulid> = guard.siblings(parent_id).map(|i| i.id).collect();
        let mut given = ordered_ids.clone();
        expected.sort();
        given.sort();
        if given.windows(2).any(|w| w[0] == w[1]) {
            return Err(EngineError::Validation("reorder lists an item twice".into()));
        }
        if expected != given {
            return Err(EngineError::Validation(format!(
                "reorder must list exactly the {} active children of the parent",
                expected.len()
            )));
        }

        let orders: Vec<(Ulid, i32)> = ordered_ids
            .iter()
            .zip(1..)
            .map(|(id, order)| (*id, order))
            .collect();
        let event = Event::ItemsReordered {
            schedule_id,
            orders,
        };
        self.persist_schedule(&mut guard, &event).await?;

        Ok(ordered_ids
            .iter()
            .filter_map(|id| guard.items.get(id).cloned())
            .collect())
    }
}
