use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit stamps only.
pub type Ms = i64;

/// Whole-day ordinal (days since 0001-01-01). Scheduling arithmetic happens here.
pub type Day = i64;

/// Opaque actor id handed to us by the auth collaborator.
pub type UserId = String;

pub fn day_number(date: NaiveDate) -> Day {
    date.num_days_from_ce() as Day
}

pub fn date_from_day(day: Day) -> Option<NaiveDate> {
    i32::try_from(day)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
}

/// Inclusive day count of `[start, end]`.
pub fn duration_days(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days() + 1
}

// ── Time windows ─────────────────────────────────────────────────

/// Half-open interval `[start, end)` over day ordinals. Used by the sweep-line code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Day,
    pub end: Day,
}

impl Span {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Back to an inclusive calendar window.
    pub fn to_window(&self) -> Option<DateWindow> {
        Some(DateWindow::new(
            date_from_day(self.start)?,
            date_from_day(self.end - 1)?,
        ))
    }
}

/// Inclusive whole-day window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateWindow start must not be after end");
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        duration_days(self.start, self.end)
    }

    /// `[s1,e1]` and `[s2,e2]` overlap iff `s1 <= e2 && s2 <= e1`.
    pub fn overlaps(&self, other: &DateWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn intersection(&self, other: &DateWindow) -> Option<DateWindow> {
        if !self.overlaps(other) {
            return None;
        }
        Some(DateWindow::new(
            self.start.max(other.start),
            self.end.min(other.end),
        ))
    }

    pub fn to_span(&self) -> Span {
        Span::new(day_number(self.start), day_number(self.end) + 1)
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// Closed enum with a stable lowercase wire spelling plus accepted aliases.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal {
        $($variant:ident => $text:literal $(| $alias:literal)*),+ $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lowered = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
                match lowered.as_str() {
                    $($text $(| $alias)* => Ok($name::$variant),)+
                    _ => Err(format!("invalid {}: {s}", $label)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(ScheduleStatus, "schedule status" {
    Draft => "draft",
    Active => "active",
    Archived => "archived",
});

text_enum!(ItemKind, "item kind" {
    Milestone => "milestone",
    Task => "task",
    Phase => "phase",
    Summary => "summary",
});

text_enum!(ItemStatus, "item status" {
    NotStarted => "not_started",
    InProgress => "in_progress",
    Completed => "completed",
    OnHold => "on_hold",
    Delayed => "delayed",
});

text_enum!(
    /// Precedence relation between a predecessor and a successor event.
    DependencyType, "dependency type" {
    FinishToStart => "finish_to_start" | "fs",
    StartToStart => "start_to_start" | "ss",
    FinishToFinish => "finish_to_finish" | "ff",
    StartToFinish => "start_to_finish" | "sf",
});

text_enum!(ResourceKind, "resource kind" {
    Labor => "labor",
    Equipment => "equipment",
    Material => "material",
});

text_enum!(ResourceStatus, "resource status" {
    Available => "available",
    Allocated => "allocated",
    Unavailable => "unavailable",
    Maintenance => "maintenance",
});

text_enum!(AllocationStatus, "allocation status" {
    Planned => "planned",
    Confirmed => "confirmed",
    InUse => "in_use",
    Completed => "completed",
    Cancelled => "cancelled" | "canceled",
});

impl AllocationStatus {
    /// Statuses that still hold capacity.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Planned | AllocationStatus::Confirmed | AllocationStatus::InUse
        )
    }
}

// ── Request scope ────────────────────────────────────────────────

/// Tenant and actor of a request, supplied by the auth collaborator and passed
/// explicitly into every engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub company: String,
    pub actor: UserId,
}

impl Scope {
    pub fn new(company: impl Into<String>, actor: impl Into<UserId>) -> Self {
        Self {
            company: company.into(),
            actor: actor.into(),
        }
    }
}

// ── Schedule side ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub project_id: Ulid,
    pub name: String,
    pub window: DateWindow,
    /// Plan-of-record window, captured by the latest baseline.
    pub baseline_window: Option<DateWindow>,
    pub status: ScheduleStatus,
    pub created_by: UserId,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub deleted_at: Option<Ms>,
}

impl Schedule {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub parent_id: Option<Ulid>,
    pub task_id: Option<Ulid>,
    pub name: String,
    pub kind: ItemKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Always `end - start + 1`.
    pub duration: i64,
    pub percent_complete: u8,
    pub status: ItemStatus,
    pub sort_order: i32,
    pub baseline_start: Option<NaiveDate>,
    pub baseline_end: Option<NaiveDate>,
    pub created_by: UserId,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub deleted_at: Option<Ms>,
}

impl ScheduleItem {
    pub fn window(&self) -> DateWindow {
        DateWindow::new(self.start, self.end)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDependency {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub predecessor_id: Ulid,
    pub successor_id: Ulid,
    pub dependency_type: DependencyType,
    /// Signed days; negative is lead time.
    pub lag: i32,
    pub created_by: UserId,
    pub created_at: Ms,
}

/// One item as it looked when a baseline was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineItem {
    pub item_id: Ulid,
    pub parent_id: Option<Ulid>,
    pub name: String,
    pub kind: ItemKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub duration: i64,
}

/// Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBaseline {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// Schedule window at capture time.
    pub window: DateWindow,
    pub items: Vec<BaselineItem>,
    pub created_by: UserId,
    pub created_at: Ms,
}

/// Everything owned by one schedule. Guarded by a single lock so that
/// dependency insertion and baseline capture are serialized per schedule.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub schedule: Schedule,
    pub items: HashMap<Ulid, ScheduleItem>,
    pub dependencies: HashMap<Ulid, ScheduleDependency>,
    /// item id → ids of dependencies where the item is the predecessor.
    pub outgoing: HashMap<Ulid, Vec<Ulid>>,
    /// item id → ids of dependencies where the item is the successor.
    pub incoming: HashMap<Ulid, Vec<Ulid>>,
    /// In creation order.
    pub baselines: Vec<ScheduleBaseline>,
}

impl ScheduleState {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            items: HashMap::new(),
            dependencies: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            baselines: Vec::new(),
        }
    }

    pub fn active_item(&self, id: &Ulid) -> Option<&ScheduleItem> {
        self.items.get(id).filter(|item| !item.is_deleted())
    }

    pub fn active_items(&self) -> impl Iterator<Item = &ScheduleItem> {
        self.items.values().filter(|item| !item.is_deleted())
    }

    pub fn active_item_count(&self) -> usize {
        self.active_items().count()
    }

    pub fn siblings(&self, parent_id: Option<Ulid>) -> impl Iterator<Item = &ScheduleItem> {
        self.active_items()
            .filter(move |item| item.parent_id == parent_id)
    }

    pub fn next_sort_order(&self, parent_id: Option<Ulid>) -> i32 {
        self.siblings(parent_id)
            .map(|item| item.sort_order)
            .max()
            .map_or(1, |max| max + 1)
    }

    pub fn sibling_with_order(
        &self,
        parent_id: Option<Ulid>,
        sort_order: i32,
    ) -> Option<&ScheduleItem> {
        self.siblings(parent_id)
            .find(|item| item.sort_order == sort_order)
    }

    /// Depth of `item_id` in the tree (roots are depth 1).
    pub fn depth_of(&self, item_id: Ulid) -> usize {
        let mut depth = 0;
        let mut cur = Some(item_id);
        while let Some(id) = cur {
            depth += 1;
            if depth > self.items.len() {
                break;
            }
            cur = self.items.get(&id).and_then(|item| item.parent_id);
        }
        depth
    }

    /// True when `ancestor` appears on the parent chain of `item_id` (or is it).
    pub fn is_ancestor(&self, ancestor: Ulid, item_id: Ulid) -> bool {
        let mut cur = Some(item_id);
        let mut steps = 0;
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.items.len() {
                return false;
            }
            cur = self.items.get(&id).and_then(|item| item.parent_id);
        }
        false
    }

    pub fn insert_dependency(&mut self, dep: ScheduleDependency) {
        self.outgoing
            .entry(dep.predecessor_id)
            .or_default()
            .push(dep.id);
        self.incoming
            .entry(dep.successor_id)
            .or_default()
            .push(dep.id);
        self.dependencies.insert(dep.id, dep);
    }

    pub fn remove_dependency(&mut self, id: &Ulid) -> Option<ScheduleDependency> {
        let dep = self.dependencies.remove(id)?;
        if let Some(ids) = self.outgoing.get_mut(&dep.predecessor_id) {
            ids.retain(|d| d != id);
        }
        if let Some(ids) = self.incoming.get_mut(&dep.successor_id) {
            ids.retain(|d| d != id);
        }
        Some(dep)
    }

    pub fn dependency_between(&self, predecessor: Ulid, successor: Ulid) -> Option<&ScheduleDependency> {
        self.outgoing
            .get(&predecessor)?
            .iter()
            .filter_map(|id| self.dependencies.get(id))
            .find(|dep| dep.successor_id == successor)
    }

    /// Dependency ids touching `item_id` in either direction.
    pub fn incident_dependencies(&self, item_id: &Ulid) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = Vec::new();
        for map in [&self.outgoing, &self.incoming] {
            if let Some(list) = map.get(item_id) {
                ids.extend(list.iter().copied());
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Successor item ids of `item_id`.
    pub fn successors_of(&self, item_id: &Ulid) -> impl Iterator<Item = Ulid> + '_ {
        self.outgoing
            .get(item_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.dependencies.get(id))
            .map(|dep| dep.successor_id)
    }

    /// Iterative DFS along outgoing edges: is `target` reachable from `from`?
    pub fn reaches(&self, from: Ulid, target: Ulid) -> bool {
        let mut stack = vec![from];
        let mut seen = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            stack.extend(self.successors_of(&node));
        }
        false
    }

    pub fn baseline(&self, id: &Ulid) -> Option<&ScheduleBaseline> {
        self.baselines.iter().find(|b| b.id == *id)
    }
}

// ── Resource side ────────────────────────────────────────────────

/// Kind-specific payload of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceDetails {
    Labor {
        role: Option<String>,
        skills: Vec<String>,
        max_hours_per_day: Option<f64>,
    },
    Equipment {
        condition: Option<String>,
        last_maintenance: Option<NaiveDate>,
        next_maintenance: Option<NaiveDate>,
    },
    Material {
        unit: Option<String>,
        quantity_on_hand: f64,
        reorder_point: Option<f64>,
    },
}

impl ResourceDetails {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceDetails::Labor { .. } => ResourceKind::Labor,
            ResourceDetails::Equipment { .. } => ResourceKind::Equipment,
            ResourceDetails::Material { .. } => ResourceKind::Material,
        }
    }
}

/// Full utilization, the capacity of every labor and equipment resource.
pub const FULL_UTILIZATION: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub details: ResourceDetails,
    pub status: ResourceStatus,
    pub cost_rate: Option<f64>,
    pub cost_unit: Option<String>,
    pub created_by: UserId,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub deleted_at: Option<Ms>,
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        self.details.kind()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Maximum simultaneous commitment: percent for labor/equipment,
    /// quantity on hand for material.
    pub fn capacity(&self) -> f64 {
        match &self.details {
            ResourceDetails::Labor { .. } | ResourceDetails::Equipment { .. } => FULL_UTILIZATION,
            ResourceDetails::Material {
                quantity_on_hand, ..
            } => *quantity_on_hand,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub project_id: Ulid,
    pub task_id: Option<Ulid>,
    pub schedule_item_id: Option<Ulid>,
    pub window: DateWindow,
    /// Material count reserved.
    pub quantity: f64,
    /// Percent of a labor/equipment resource, 0..=100.
    pub utilization: u8,
    pub status: AllocationStatus,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Load this allocation puts on a resource of the given kind.
    pub fn load(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Material => self.quantity,
            ResourceKind::Labor | ResourceKind::Equipment => f64::from(self.utilization),
        }
    }
}

/// Blackout window: the resource cannot be allocated inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub window: DateWindow,
    pub reason: String,
    pub created_by: UserId,
    pub created_at: Ms,
}

/// Actual consumption; hours for labor/equipment, quantity for material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationRecord {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub project_id: Option<Ulid>,
    pub task_id: Option<Ulid>,
    pub date: NaiveDate,
    pub hours: Option<f64>,
    pub quantity: Option<f64>,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub created_at: Ms,
}

/// A resource plus every record keyed by it. Guarded by one lock so that
/// allocation commits are serialized per resource.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Sorted by `window.start`.
    pub allocations: Vec<Allocation>,
    /// Sorted by `window.start`.
    pub blackouts: Vec<AvailabilityWindow>,
    /// Sorted by `date`.
    pub utilization: Vec<UtilizationRecord>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            allocations: Vec::new(),
            blackouts: Vec::new(),
            utilization: Vec::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.allocations.len() + self.blackouts.len() + self.utilization.len()
    }

    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .partition_point(|a| a.window.start <= allocation.window.start);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.id == id)?;
        Some(self.allocations.remove(pos))
    }

    pub fn allocation(&self, id: &Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == *id)
    }

    /// Allocations (any status) whose window overlaps `query`.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping_allocations(&self, query: &DateWindow) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.window.start <= query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.window.end >= query.start)
    }

    pub fn insert_blackout(&mut self, blackout: AvailabilityWindow) {
        let pos = self
            .blackouts
            .partition_point(|b| b.window.start <= blackout.window.start);
        self.blackouts.insert(pos, blackout);
    }

    pub fn remove_blackout(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.blackouts.iter().position(|b| b.id == id)?;
        Some(self.blackouts.remove(pos))
    }

    pub fn blackout(&self, id: &Ulid) -> Option<&AvailabilityWindow> {
        self.blackouts.iter().find(|b| b.id == *id)
    }

    pub fn overlapping_blackouts(&self, query: &DateWindow) -> impl Iterator<Item = &AvailabilityWindow> {
        let right_bound = self
            .blackouts
            .partition_point(|b| b.window.start <= query.end);
        self.blackouts[..right_bound]
            .iter()
            .filter(move |b| b.window.end >= query.start)
    }

    pub fn insert_utilization(&mut self, record: UtilizationRecord) {
        let pos = self
            .utilization
            .partition_point(|r| r.date <= record.date);
        self.utilization.insert(pos, record);
    }

    pub fn remove_utilization(&mut self, id: Ulid) -> Option<UtilizationRecord> {
        let pos = self.utilization.iter().position(|r| r.id == id)?;
        Some(self.utilization.remove(pos))
    }

    pub fn utilization_record(&self, id: &Ulid) -> Option<&UtilizationRecord> {
        self.utilization.iter().find(|r| r.id == *id)
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Every state change, as written to the WAL. Records travel whole so that
/// replay is a plain upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ScheduleCreated(Schedule),
    ScheduleUpdated(Schedule),
    ScheduleDeleted {
        id: Ulid,
        deleted_at: Ms,
    },
    ItemCreated(ScheduleItem),
    ItemUpdated(ScheduleItem),
    /// Also drops the item's incident dependency edges.
    ItemDeleted {
        id: Ulid,
        schedule_id: Ulid,
        deleted_at: Ms,
    },
    ItemsReordered {
        schedule_id: Ulid,
        orders: Vec<(Ulid, i32)>,
    },
    DependencyAdded(ScheduleDependency),
    DependencyRemoved {
        id: Ulid,
        schedule_id: Ulid,
    },
    /// Stores the snapshot and moves the schedule's baseline window.
    BaselineCaptured(ScheduleBaseline),
    /// Copies snapshot dates into the items' baseline fields.
    BaselineRestored {
        id: Ulid,
        schedule_id: Ulid,
    },
    ResourceCreated(Resource),
    ResourceUpdated(Resource),
    ResourceDeleted {
        id: Ulid,
        deleted_at: Ms,
    },
    AllocationCommitted(Allocation),
    AllocationUpdated(Allocation),
    AllocationRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    AvailabilityAdded(AvailabilityWindow),
    AvailabilityUpdated(AvailabilityWindow),
    AvailabilityRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    UtilizationRecorded(UtilizationRecord),
    UtilizationUpdated(UtilizationRecord),
    UtilizationRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Rows of one multi-row statement. Replayed together or not at all.
    Batch(Vec<Event>),
}

// ── Query result types ───────────────────────────────────────────

/// Per-item output of the critical path pass. Dates are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub item_id: Ulid,
    pub expected_start: NaiveDate,
    pub expected_finish: NaiveDate,
    pub late_start: NaiveDate,
    pub late_finish: NaiveDate,
    pub float: i64,
    pub is_critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalPathReport {
    pub schedule_id: Ulid,
    pub entries: Vec<ScheduleEntry>,
    /// Zero-float chain from a root to the latest-finishing terminal.
    pub critical_chain: Vec<Ulid>,
    pub project_start: Option<NaiveDate>,
    pub project_finish: Option<NaiveDate>,
}

impl CriticalPathReport {
    pub fn entry(&self, item_id: &Ulid) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|e| e.item_id == *item_id)
    }
}

/// Baseline vs current plan for one item. Either side is empty when the item
/// did not exist (or is deleted) on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarianceRow {
    pub item_id: Ulid,
    pub name: String,
    pub baseline_start: Option<NaiveDate>,
    pub baseline_end: Option<NaiveDate>,
    pub current_start: Option<NaiveDate>,
    pub current_end: Option<NaiveDate>,
    /// Positive means the current plan is later than the baseline.
    pub start_variance_days: Option<i64>,
    pub finish_variance_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationTotals {
    pub resource_id: Ulid,
    pub resource_kind: ResourceKind,
    pub records: usize,
    pub hours: f64,
    pub quantity: f64,
    pub cost: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn schedule() -> Schedule {
        Schedule {
            id: Ulid::new(),
            project_id: Ulid::new(),
            name: "Tower A".into(),
            window: DateWindow::new(d(2025, 1, 1), d(2025, 12, 31)),
            baseline_window: None,
            status: ScheduleStatus::Draft,
            created_by: "u1".into(),
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    fn item(ss: &ScheduleState, parent_id: Option<Ulid>, sort_order: i32) -> ScheduleItem {
        ScheduleItem {
            id: Ulid::new(),
            schedule_id: ss.schedule.id,
            parent_id,
            task_id: None,
            name: "item".into(),
            kind: ItemKind::Task,
            start: d(2025, 1, 1),
            end: d(2025, 1, 3),
            duration: 3,
            percent_complete: 0,
            status: ItemStatus::NotStarted,
            sort_order,
            baseline_start: None,
            baseline_end: None,
            created_by: "u1".into(),
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    fn dep(ss: &ScheduleState, predecessor_id: Ulid, successor_id: Ulid) -> ScheduleDependency {
        ScheduleDependency {
            id: Ulid::new(),
            schedule_id: ss.schedule.id,
            predecessor_id,
            successor_id,
            dependency_type: DependencyType::FinishToStart,
            lag: 0,
            created_by: "u1".into(),
            created_at: 0,
        }
    }

    fn allocation(start: NaiveDate, end: NaiveDate) -> Allocation {
        Allocation {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            project_id: Ulid::new(),
            task_id: None,
            schedule_item_id: None,
            window: DateWindow::new(start, end),
            quantity: 1.0,
            utilization: 50,
            status: AllocationStatus::Planned,
            notes: None,
            created_by: "u1".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn resource_state() -> ResourceState {
        ResourceState::new(Resource {
            id: Ulid::new(),
            name: "Crane".into(),
            details: ResourceDetails::Equipment {
                condition: None,
                last_maintenance: None,
                next_maintenance: None,
            },
            status: ResourceStatus::Available,
            cost_rate: None,
            cost_unit: None,
            created_by: "u1".into(),
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        })
    }

    #[test]
    fn window_overlap_is_inclusive() {
        let a = DateWindow::new(d(2025, 1, 1), d(2025, 1, 5));
        let b = DateWindow::new(d(2025, 1, 5), d(2025, 1, 9));
        let c = DateWindow::new(d(2025, 1, 6), d(2025, 1, 9));
        assert!(a.overlaps(&b)); // share day 5
        assert!(!a.overlaps(&c));
        assert_eq!(a.days(), 5);
        assert_eq!(
            a.intersection(&b),
            Some(DateWindow::new(d(2025, 1, 5), d(2025, 1, 5)))
        );
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn window_span_roundtrip() {
        let w = DateWindow::new(d(2024, 2, 28), d(2024, 3, 1));
        let span = w.to_span();
        assert_eq!(span.days(), 3); // leap day included
        assert_eq!(span.to_window(), Some(w));
    }

    #[test]
    fn enum_parsing_accepts_aliases() {
        assert_eq!("FS".parse::<DependencyType>(), Ok(DependencyType::FinishToStart));
        assert_eq!(
            "Start-to-Finish".parse::<DependencyType>(),
            Ok(DependencyType::StartToFinish)
        );
        assert_eq!("In Progress".parse::<ItemStatus>(), Ok(ItemStatus::InProgress));
        assert_eq!("canceled".parse::<AllocationStatus>(), Ok(AllocationStatus::Cancelled));
        assert!("sideways".parse::<ItemKind>().is_err());
        assert_eq!(ResourceKind::Material.to_string(), "material");
    }

    #[test]
    fn active_statuses_hold_capacity() {
        assert!(AllocationStatus::Planned.is_active());
        assert!(AllocationStatus::InUse.is_active());
        assert!(!AllocationStatus::Completed.is_active());
        assert!(!AllocationStatus::Cancelled.is_active());
    }

    #[test]
    fn next_sort_order_per_parent() {
        let mut ss = ScheduleState::new(schedule());
        assert_eq!(ss.next_sort_order(None), 1);
        let root = item(&ss, None, 4);
        let root_id = root.id;
        ss.items.insert(root.id, root);
        assert_eq!(ss.next_sort_order(None), 5);
        assert_eq!(ss.next_sort_order(Some(root_id)), 1);

        let mut gone = item(&ss, None, 9);
        gone.deleted_at = Some(1);
        ss.items.insert(gone.id, gone);
        assert_eq!(ss.next_sort_order(None), 5); // deleted siblings ignored
    }

    #[test]
    fn ancestry_walk() {
        let mut ss = ScheduleState::new(schedule());
        let a = item(&ss, None, 1);
        let b = item(&ss, Some(a.id), 1);
        let c = item(&ss, Some(b.id), 1);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        for i in [a, b, c] {
            ss.items.insert(i.id, i);
        }
        assert!(ss.is_ancestor(a_id, c_id));
        assert!(!ss.is_ancestor(c_id, a_id));
        assert_eq!(ss.depth_of(c_id), 3);
    }

    #[test]
    fn dependency_indices_and_reachability() {
        let mut ss = ScheduleState::new(schedule());
        let a = item(&ss, None, 1);
        let b = item(&ss, None, 2);
        let c = item(&ss, None, 3);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        for i in [a, b, c] {
            ss.items.insert(i.id, i);
        }
        let ab = dep(&ss, a_id, b_id);
        let ab_id = ab.id;
        ss.insert_dependency(ab);
        ss.insert_dependency(dep(&ss, b_id, c_id));

        assert!(ss.reaches(a_id, c_id));
        assert!(!ss.reaches(c_id, a_id));
        assert!(ss.dependency_between(a_id, b_id).is_some());
        assert!(ss.dependency_between(b_id, a_id).is_none());
        assert_eq!(ss.incident_dependencies(&b_id).len(), 2);

        ss.remove_dependency(&ab_id);
        assert!(!ss.reaches(a_id, c_id));
        assert!(ss.incident_dependencies(&a_id).is_empty());
    }

    #[test]
    fn allocations_kept_sorted_and_overlap_filtered() {
        let mut rs = resource_state();
        rs.insert_allocation(allocation(d(2025, 3, 1), d(2025, 3, 10)));
        rs.insert_allocation(allocation(d(2025, 1, 1), d(2025, 1, 10)));
        rs.insert_allocation(allocation(d(2025, 2, 1), d(2025, 2, 10)));
        assert_eq!(rs.allocations[0].window.start, d(2025, 1, 1));
        assert_eq!(rs.allocations[2].window.start, d(2025, 3, 1));

        let query = DateWindow::new(d(2025, 1, 10), d(2025, 2, 1));
        let hits: Vec<_> = rs.overlapping_allocations(&query).collect();
        assert_eq!(hits.len(), 2); // touching both end and start days

        let query = DateWindow::new(d(2025, 1, 11), d(2025, 1, 31));
        assert_eq!(rs.overlapping_allocations(&query).count(), 0);
    }

    #[test]
    fn remove_missing_allocation_is_none() {
        let mut rs = resource_state();
        rs.insert_allocation(allocation(d(2025, 1, 1), d(2025, 1, 2)));
        assert!(rs.remove_allocation(Ulid::new()).is_none());
        assert_eq!(rs.allocations.len(), 1);
    }

    #[test]
    fn allocation_load_depends_on_kind() {
        let mut a = allocation(d(2025, 1, 1), d(2025, 1, 2));
        a.quantity = 12.0;
        a.utilization = 40;
        assert_eq!(a.load(ResourceKind::Material), 12.0);
        assert_eq!(a.load(ResourceKind::Labor), 40.0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ScheduleCreated(schedule());
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
