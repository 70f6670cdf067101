mod allocations;
mod availability;
mod blackouts;
mod compaction;
mod conflict;
mod critical_path;
mod dependencies;
mod error;
mod resources;
mod schedules;
mod utilization;
mod wbs;

pub use allocations::{AllocationPatch, NewAllocation};
pub use availability::{free_windows, merge_overlapping, overloaded_spans, peak_load, subtract_intervals};
pub use blackouts::BlackoutOutcome;
pub use critical_path::compute_critical_path;
pub use dependencies::NewDependency;
pub use error::EngineError;
pub use resources::{DetailsPatch, NewResource, ResourcePatch};
pub use schedules::{NewBaseline, NewSchedule, SchedulePatch};
pub use utilization::{NewUtilization, UtilizationFilter, UtilizationPatch};
pub use wbs::{ItemPatch, NewItem};

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedScheduleState = Arc<RwLock<ScheduleState>>;
pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it without syncing.
/// 3. Drain every Append already queued.
/// 4. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Event application ────────────────────────────────────

/// Which aggregate an event belongs to. Batches span several.
enum Target {
    Schedule(Ulid),
    Resource(Ulid),
}

fn event_target(event: &Event) -> Option<Target> {
    let target = match event {
        Event::Batch(_) => return None,
        Event::ScheduleCreated(s) | Event::ScheduleUpdated(s) => Target::Schedule(s.id),
        Event::ScheduleDeleted { id, .. } => Target::Schedule(*id),
        Event::ItemCreated(item) | Event::ItemUpdated(item) => Target::Schedule(item.schedule_id),
        Event::ItemDeleted { schedule_id, .. }
        | Event::ItemsReordered { schedule_id, .. }
        | Event::DependencyRemoved { schedule_id, .. }
        | Event::BaselineRestored { schedule_id, .. } => Target::Schedule(*schedule_id),
        Event::DependencyAdded(dep) => Target::Schedule(dep.schedule_id),
        Event::BaselineCaptured(b) => Target::Schedule(b.schedule_id),
        Event::ResourceCreated(r) | Event::ResourceUpdated(r) => Target::Resource(r.id),
        Event::ResourceDeleted { id, .. } => Target::Resource(*id),
        Event::AllocationCommitted(a) | Event::AllocationUpdated(a) => Target::Resource(a.resource_id),
        Event::AvailabilityAdded(b) | Event::AvailabilityUpdated(b) => Target::Resource(b.resource_id),
        Event::UtilizationRecorded(r) | Event::UtilizationUpdated(r) => Target::Resource(r.resource_id),
        Event::AllocationRemoved { resource_id, .. }
        | Event::AvailabilityRemoved { resource_id, .. }
        | Event::UtilizationRemoved { resource_id, .. } => Target::Resource(*resource_id),
    };
    Some(target)
}

/// Owned state being rebuilt from the log, before any locks exist.
#[derive(Default)]
struct Replay {
    schedules: HashMap<Ulid, ScheduleState>,
    resources: HashMap<Ulid, ResourceState>,
    entity_to_schedule: DashMap<Ulid, Ulid>,
    entity_to_resource: DashMap<Ulid, Ulid>,
}

impl Replay {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::Batch(events) => {
                for inner in events {
                    self.apply(inner);
                }
            }
            Event::ScheduleCreated(schedule) => {
                self.schedules.insert(schedule.id, ScheduleState::new(schedule.clone()));
            }
            Event::ResourceCreated(resource) => {
                self.resources.insert(resource.id, ResourceState::new(resource.clone()));
            }
            other => match event_target(other) {
                Some(Target::Schedule(id)) => {
                    if let Some(ss) = self.schedules.get_mut(&id) {
                        apply_to_schedule(ss, other, &self.entity_to_schedule);
                    }
                }
                Some(Target::Resource(id)) => {
                    if let Some(rs) = self.resources.get_mut(&id) {
                        apply_to_resource(rs, other, &self.entity_to_resource);
                    }
                }
                None => {}
            },
        }
    }
}

/// Apply an event to a ScheduleState. The caller holds the write lock.
fn apply_to_schedule(ss: &mut ScheduleState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    let schedule_id = ss.schedule.id;
    match event {
        Event::ScheduleUpdated(schedule) => ss.schedule = schedule.clone(),
        Event::ScheduleDeleted { deleted_at, .. } => {
            ss.schedule.deleted_at = Some(*deleted_at);
            ss.schedule.updated_at = *deleted_at;
            for item in ss.items.values_mut().filter(|i| !i.is_deleted()) {
                item.deleted_at = Some(*deleted_at);
            }
        }
        Event::ItemCreated(item) | Event::ItemUpdated(item) => {
            entity_map.insert(item.id, schedule_id);
            ss.items.insert(item.id, item.clone());
        }
        Event::ItemDeleted { id, deleted_at, .. } => {
            if let Some(item) = ss.items.get_mut(id) {
                item.deleted_at = Some(*deleted_at);
                item.updated_at = *deleted_at;
            }
            for dep_id in ss.incident_dependencies(id) {
                ss.remove_dependency(&dep_id);
                entity_map.remove(&dep_id);
            }
        }
        Event::ItemsReordered { orders, .. } => {
            for (item_id, sort_order) in orders {
                if let Some(item) = ss.items.get_mut(item_id) {
                    item.sort_order = *sort_order;
                }
            }
        }
        Event::DependencyAdded(dep) => {
            entity_map.insert(dep.id, schedule_id);
            ss.insert_dependency(dep.clone());
        }
        Event::DependencyRemoved { id, .. } => {
            ss.remove_dependency(id);
            entity_map.remove(id);
        }
        Event::BaselineCaptured(baseline) => {
            entity_map.insert(baseline.id, schedule_id);
            ss.schedule.baseline_window = Some(baseline.window);
            ss.baselines.push(baseline.clone());
        }
        Event::BaselineRestored { id, .. } => {
            if let Some(baseline) = ss.baselines.iter().find(|b| b.id == *id) {
                for snap in &baseline.items {
                    if let Some(item) = ss.items.get_mut(&snap.item_id) {
                        item.baseline_start = Some(snap.start);
                        item.baseline_end = Some(snap.end);
                    }
                }
            }
        }
        // Creation is handled at the DashMap level; resource events never route here.
        _ => {}
    }
}

/// Apply an event to a ResourceState. The caller holds the write lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    let resource_id = rs.resource.id;
    match event {
        Event::ResourceUpdated(resource) => rs.resource = resource.clone(),
        Event::ResourceDeleted { deleted_at, .. } => {
            rs.resource.deleted_at = Some(*deleted_at);
            rs.resource.updated_at = *deleted_at;
        }
        Event::AllocationCommitted(a) | Event::AllocationUpdated(a) => {
            rs.remove_allocation(a.id);
            rs.insert_allocation(a.clone());
            entity_map.insert(a.id, resource_id);
        }
        Event::AllocationRemoved { id, .. } => {
            rs.remove_allocation(*id);
            entity_map.remove(id);
        }
        Event::AvailabilityAdded(b) | Event::AvailabilityUpdated(b) => {
            rs.remove_blackout(b.id);
            rs.insert_blackout(b.clone());
            entity_map.insert(b.id, resource_id);
        }
        Event::AvailabilityRemoved { id, .. } => {
            rs.remove_blackout(*id);
            entity_map.remove(id);
        }
        Event::UtilizationRecorded(r) | Event::UtilizationUpdated(r) => {
            rs.remove_utilization(r.id);
            rs.insert_utilization(r.clone());
            entity_map.insert(r.id, resource_id);
        }
        Event::UtilizationRemoved { id, .. } => {
            rs.remove_utilization(*id);
            entity_map.remove(id);
        }
        _ => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// All scheduling and allocation state of one company.
pub struct Engine {
    company: String,
    pub(super) schedules: DashMap<Ulid, SharedScheduleState>,
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    /// item / dependency / baseline id → schedule id
    pub(super) entity_to_schedule: DashMap<Ulid, Ulid>,
    /// allocation / blackout / utilization id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared from before their first lock until their
    /// event is applied; compaction holds it exclusively.
    pub(super) write_gate: Arc<RwLock<()>>,
}

/// Write access to one aggregate, with the compaction gate held.
pub(super) struct Locked<T> {
    guard: OwnedRwLockWriteGuard<T>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl<T> Deref for Locked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Locked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// An id reserved in an entity index before its creation event is written.
/// Released on drop unless marked applied.
pub(super) struct IdClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    applied: bool,
}

impl<'a> IdClaim<'a> {
    pub(super) fn take(index: &'a DashMap<Ulid, Ulid>, id: Ulid, owner: Ulid) -> Result<Self, EngineError> {
        match index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(Self {
                    index,
                    id,
                    applied: false,
                })
            }
        }
    }

    pub(super) fn applied(mut self) {
        self.applied = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.applied {
            self.index.remove(&self.id);
        }
    }
}

impl Engine {
    pub fn new(company: impl Into<String>, wal_path: PathBuf) -> io::Result<Self> {
        let company = company.into();
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replay = Replay::default();
        for event in &events {
            replay.apply(event);
        }
        let Replay {
            schedules,
            resources,
            entity_to_schedule,
            entity_to_resource,
        } = replay;

        if !events.is_empty() {
            tracing::info!(
                "company {company}: replayed {} events ({} schedules, {} resources)",
                events.len(),
                schedules.len(),
                resources.len()
            );
        }

        Ok(Self {
            company,
            schedules: schedules
                .into_iter()
                .map(|(id, ss)| (id, Arc::new(RwLock::new(ss))))
                .collect(),
            resources: resources
                .into_iter()
                .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
                .collect(),
            entity_to_schedule,
            entity_to_resource,
            wal_tx,
            write_gate: Arc::new(RwLock::new(())),
        })
    }

    pub fn company(&self) -> &str {
        &self.company
    }

    /// Every operation starts here: the scope must name this engine's company
    /// and carry an actor.
    pub(super) fn authorize(&self, scope: &Scope) -> Result<(), EngineError> {
        if scope.company != self.company {
            return Err(EngineError::OutOfScope(scope.company.clone()));
        }
        if scope.actor.trim().is_empty() {
            return Err(EngineError::Validation("actor is required".into()));
        }
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_schedule(&self, id: &Ulid) -> Option<SharedScheduleState> {
        self.schedules.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub(super) async fn gate(&self) -> OwnedRwLockReadGuard<()> {
        self.write_gate.clone().read_owned().await
    }

    /// Write lock on a schedule that exists and is not deleted.
    pub(super) async fn live_schedule_write(&self, id: &Ulid) -> Result<Locked<ScheduleState>, EngineError> {
        let gate = self.gate().await;
        let ss = self.get_schedule(id).ok_or(EngineError::NotFound(*id))?;
        let guard = ss.write_owned().await;
        if guard.schedule.is_deleted() {
            return Err(EngineError::NotFound(*id));
        }
        Ok(Locked { guard, _gate: gate })
    }

    pub(super) async fn schedule_read(
        &self,
        id: &Ulid,
        include_deleted: bool,
    ) -> Result<OwnedRwLockReadGuard<ScheduleState>, EngineError> {
        let ss = self.get_schedule(id).ok_or(EngineError::NotFound(*id))?;
        let guard = ss.read_owned().await;
        if guard.schedule.is_deleted() && !include_deleted {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    /// Write lock on a resource that exists and is not deleted.
    pub(super) async fn live_resource_write(&self, id: &Ulid) -> Result<Locked<ResourceState>, EngineError> {
        let gate = self.gate().await;
        let rs = self.get_resource(id).ok_or(EngineError::NotFound(*id))?;
        let guard = rs.write_owned().await;
        if guard.resource.is_deleted() {
            return Err(EngineError::NotFound(*id));
        }
        Ok(Locked { guard, _gate: gate })
    }

    pub(super) async fn resource_read(
        &self,
        id: &Ulid,
        include_deleted: bool,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(id).ok_or(EngineError::NotFound(*id))?;
        let guard = rs.read_owned().await;
        if guard.resource.is_deleted() && !include_deleted {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    /// Lookup entity → schedule, then take the live schedule's write lock.
    pub(super) async fn resolve_schedule_entity(&self, entity_id: &Ulid) -> Result<Locked<ScheduleState>, EngineError> {
        let schedule_id = self
            .entity_to_schedule
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.live_schedule_write(&schedule_id)
            .await
            .map_err(|_| EngineError::NotFound(*entity_id))
    }

    /// Lookup entity → resource, then take the resource's write lock.
    /// Records of a deleted resource stay editable only through removal.
    pub(super) async fn resolve_resource_entity(&self, entity_id: &Ulid) -> Result<Locked<ResourceState>, EngineError> {
        let gate = self.gate().await;
        let resource_id = self
            .entity_to_resource
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = rs.write_owned().await;
        Ok(Locked { guard, _gate: gate })
    }

    /// Write locks on several aggregates under one gate hold, taken in id
    /// order. Missing or deleted aggregates are NotFound.
    pub(super) async fn lock_schedules(
        &self,
        _gate: &OwnedRwLockReadGuard<()>,
        mut ids: Vec<Ulid>,
    ) -> Result<HashMap<Ulid, OwnedRwLockWriteGuard<ScheduleState>>, EngineError> {
        ids.sort();
        ids.dedup();
        let mut guards = HashMap::with_capacity(ids.len());
        for id in ids {
            let ss = self.get_schedule(&id).ok_or(EngineError::NotFound(id))?;
            let guard = ss.write_owned().await;
            if guard.schedule.is_deleted() {
                return Err(EngineError::NotFound(id));
            }
            guards.insert(id, guard);
        }
        Ok(guards)
    }

    pub(super) async fn lock_resources(
        &self,
        _gate: &OwnedRwLockReadGuard<()>,
        mut ids: Vec<Ulid>,
    ) -> Result<HashMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>, EngineError> {
        ids.sort();
        ids.dedup();
        let mut guards = HashMap::with_capacity(ids.len());
        for id in ids {
            let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
            let guard = rs.write_owned().await;
            if guard.resource.is_deleted() {
                return Err(EngineError::NotFound(id));
            }
            guards.insert(id, guard);
        }
        Ok(guards)
    }

    /// One WAL frame for every row of a multi-row statement, so a crash
    /// keeps all of them or none.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        match <[Event; 1]>::try_from(events) {
            Ok([single]) => self.wal_append(&single).await,
            Err(events) => self.wal_append(&Event::Batch(events)).await,
        }
    }

    /// WAL-append, then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_schedule(
        &self,
        ss: &mut ScheduleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_schedule(ss, event, &self.entity_to_schedule);
        Ok(())
    }

    pub(super) async fn persist_resource(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.entity_to_resource);
        Ok(())
    }

    /// The new aggregate enters the map write-locked, so nothing reads it
    /// before its creation event is durable. A failed append marks it
    /// deleted for any reader that already holds it, then drops it.
    pub(super) async fn persist_new_schedule(&self, schedule: Schedule) -> Result<(), EngineError> {
        let _gate = self.gate().await;
        let id = schedule.id;
        let shared = Arc::new(RwLock::new(ScheduleState::new(schedule.clone())));
        let mut guard = shared.clone().write_owned().await;
        match self.schedules.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }
        if let Err(e) = self.wal_append(&Event::ScheduleCreated(schedule)).await {
            guard.schedule.deleted_at = Some(conflict::now_ms());
            self.schedules.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    pub(super) async fn persist_new_resource(&self, resource: Resource) -> Result<(), EngineError> {
        let _gate = self.gate().await;
        let id = resource.id;
        let shared = Arc::new(RwLock::new(ResourceState::new(resource.clone())));
        let mut guard = shared.clone().write_owned().await;
        match self.resources.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }
        if let Err(e) = self.wal_append(&Event::ResourceCreated(resource)).await {
            guard.resource.deleted_at = Some(conflict::now_ms());
            self.resources.remove(&id);
            return Err(e);
        }
        Ok(())
    }
}
