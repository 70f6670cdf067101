use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::CrewPlanAuthSource;
use crate::engine::{BlackoutOutcome, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct CrewPlanHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CrewPlanQueryParser>,
}

impl CrewPlanHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CrewPlanQueryParser),
        }
    }

    /// The connection's database is the company, its user the actor.
    fn resolve_scope<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, Scope)> {
        let metadata = client.metadata();
        let company = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let actor = metadata.get("user").cloned().unwrap_or_default();
        let engine = self.tenant_manager.get_or_create(&company).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })?;
        Ok((engine, Scope::new(company, actor)))
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, scope: &Scope, query: &str) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "parse", "status" => "error").increment(1);
                debug!("rejected statement: {e}");
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let result = self.execute_one(engine, scope, cmd).await.map(|r| vec![r]);
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_one(&self, engine: &Engine, scope: &Scope, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            // ── Schedules ─────────────────────────────────────
            Command::InsertSchedule(new) => {
                engine.create_schedule(scope, new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateSchedule { id, patch } => {
                engine.update_schedule(scope, id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteSchedule { id } => {
                engine.delete_schedule(scope, id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectSchedules {
                id,
                project_id,
                include_deleted,
            } => {
                let schedules = match id {
                    Some(id) => vec![engine.schedule(scope, id, include_deleted).await.map_err(engine_err)?],
                    None => engine
                        .list_schedules(scope, project_id, include_deleted)
                        .await
                        .map_err(engine_err)?,
                };
                let schedules: Vec<Schedule> = schedules
                    .into_iter()
                    .filter(|s| project_id.is_none_or(|p| p == s.project_id))
                    .collect();
                query_rows(schedule_schema(), &schedules, encode_schedule)
            }

            // ── Baselines ─────────────────────────────────────
            Command::InsertBaseline(new) => {
                engine.capture_baseline(scope, new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::RestoreBaseline { baseline_id } => {
                let restored = engine.restore_baseline(scope, baseline_id).await.map_err(engine_err)?;
                Ok(updated(restored))
            }
            Command::SelectBaselines {
                id,
                schedule_id,
                include_deleted,
            } => {
                let baselines = match id {
                    Some(id) => vec![engine.baseline(scope, id, include_deleted).await.map_err(engine_err)?],
                    None => match schedule_id {
                        Some(sid) => engine
                            .list_baselines(scope, sid, include_deleted)
                            .await
                            .map_err(engine_err)?,
                        None => Vec::new(),
                    },
                };
                let baselines: Vec<ScheduleBaseline> = baselines
                    .into_iter()
                    .filter(|b| schedule_id.is_none_or(|s| s == b.schedule_id))
                    .collect();
                query_rows(baseline_schema(), &baselines, encode_baseline)
            }
            Command::SelectBaselineItems {
                baseline_id,
                include_deleted,
            } => {
                let baseline = engine
                    .baseline(scope, baseline_id, include_deleted)
                    .await
                    .map_err(engine_err)?;
                let rows: Vec<(Ulid, BaselineItem)> =
                    baseline.items.into_iter().map(|item| (baseline.id, item)).collect();
                query_rows(baseline_item_schema(), &rows, encode_baseline_item)
            }
            Command::SelectBaselineVariance { baseline_id } => {
                let rows = engine
                    .baseline_variance(scope, baseline_id)
                    .await
                    .map_err(engine_err)?;
                query_rows(variance_schema(), &rows, encode_variance)
            }

            // ── Items ─────────────────────────────────────────
            Command::InsertItem(new) => {
                engine.create_item(scope, new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertItems(rows) => {
                let items = engine.create_items(scope, rows).await.map_err(engine_err)?;
                Ok(inserted(items.len()))
            }
            Command::UpdateItem { id, patch } => {
                engine.update_item(scope, id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteItem { id } => {
                let dropped = engine.delete_item(scope, id).await.map_err(engine_err)?;
                if !dropped.is_empty() {
                    debug!("item {id} deleted with {} dependency edges", dropped.len());
                }
                Ok(deleted(1))
            }
            Command::SelectItems {
                id,
                schedule_id,
                include_deleted,
            } => {
                let items = match id {
                    Some(id) => vec![engine.item(scope, id, include_deleted).await.map_err(engine_err)?],
                    None => match schedule_id {
                        Some(sid) => engine.list_items(scope, sid, include_deleted).await.map_err(engine_err)?,
                        None => Vec::new(),
                    },
                };
                let items: Vec<ScheduleItem> = items
                    .into_iter()
                    .filter(|i| schedule_id.is_none_or(|s| s == i.schedule_id))
                    .collect();
                query_rows(item_schema(), &items, encode_item)
            }
            Command::ReorderItems {
                schedule_id,
                parent_id,
                item_ids,
            } => {
                let items = engine
                    .reorder_items(scope, schedule_id, parent_id, item_ids)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(items.len()))
            }

            // ── Dependencies ──────────────────────────────────
            Command::InsertDependency(new) => {
                engine.add_dependency(scope, new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertDependencies(rows) => {
                let deps = engine.add_dependencies(scope, rows).await.map_err(engine_err)?;
                Ok(inserted(deps.len()))
            }
            Command::DeleteDependency { id } => {
                engine.remove_dependency(scope, id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectDependencies {
                item_id,
                schedule_id,
                include_deleted,
            } => {
                let deps = match (item_id, schedule_id) {
                    (Some(item_id), _) => engine
                        .item_dependencies(scope, item_id, include_deleted)
                        .await
                        .map_err(engine_err)?,
                    (None, Some(sid)) => engine
                        .schedule_dependencies(scope, sid, include_deleted)
                        .await
                        .map_err(engine_err)?,
                    (None, None) => Vec::new(),
                };
                let deps: Vec<ScheduleDependency> = deps
                    .into_iter()
                    .filter(|d| schedule_id.is_none_or(|s| s == d.schedule_id))
                    .collect();
                query_rows(dependency_schema(), &deps, encode_dependency)
            }
            Command::SelectCriticalPath { schedule_id } => {
                let report = engine.critical_path(scope, schedule_id).await.map_err(engine_err)?;
                let rows: Vec<(ScheduleEntry, Option<i32>)> = report
                    .entries
                    .iter()
                    .map(|entry| {
                        let position = report
                            .critical_chain
                            .iter()
                            .position(|id| *id == entry.item_id)
                            .and_then(|p| i32::try_from(p + 1).ok());
                        (entry.clone(), position)
                    })
                    .collect();
                query_rows(critical_path_schema(), &rows, encode_entry)
            }

            // ── Resources ─────────────────────────────────────
            Command::InsertResource(new) => {
                engine.create_resource(scope, new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateResource { id, patch } => {
                engine.update_resource(scope, id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(scope, id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectResources {
                id,
                kind,
                include_deleted,
            } => {
                let resources = match id {
                    Some(id) => vec![engine.resource(scope, id, include_deleted).await.map_err(engine_err)?],
                    None => engine
                        .list_resources(scope, kind, include_deleted)
                        .await
                        .map_err(engine_err)?,
                };
                let resources: Vec<Resource> = resources
                    .into_iter()
                    .filter(|r| kind.is_none_or(|k| k == r.kind()))
                    .collect();
                query_rows(resource_schema(), &resources, encode_resource)
            }

            // ── Allocations ───────────────────────────────────
            Command::InsertAllocation(new) => {
                engine.commit_allocation(scope, new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertAllocations(rows) => {
                let allocations = engine.commit_allocations(scope, rows).await.map_err(engine_err)?;
                Ok(inserted(allocations.len()))
            }
            Command::UpdateAllocation { id, patch } => {
                engine.update_allocation(scope, id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteAllocation { id } => {
                engine.remove_allocation(scope, id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectAllocations {
                id,
                resource_id,
                project_id,
                window,
            } => {
                let allocations = match id {
                    Some(id) => vec![engine.allocation(scope, id).await.map_err(engine_err)?],
                    None => engine
                        .list_allocations(scope, resource_id, project_id, window)
                        .await
                        .map_err(engine_err)?,
                };
                let allocations: Vec<Allocation> = allocations
                    .into_iter()
                    .filter(|a| resource_id.is_none_or(|r| r == a.resource_id))
                    .filter(|a| project_id.is_none_or(|p| p == a.project_id))
                    .filter(|a| window.is_none_or(|w| w.overlaps(&a.window)))
                    .collect();
                query_rows(allocation_schema(), &allocations, encode_allocation)
            }

            // ── Availability ──────────────────────────────────
            Command::InsertAvailability {
                id,
                resource_id,
                start,
                end,
                reason,
            } => {
                let outcome = engine
                    .add_availability(scope, id, resource_id, start, end, reason)
                    .await
                    .map_err(engine_err)?;
                blackout_outcome(outcome)
            }
            Command::UpdateAvailability { id, start, end, reason } => {
                let outcome = engine
                    .update_availability(scope, id, start, end, reason)
                    .await
                    .map_err(engine_err)?;
                blackout_outcome(outcome)
            }
            Command::DeleteAvailability { id } => {
                engine.remove_availability(scope, id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectAvailability { resource_id, window } => {
                let blackouts = engine
                    .list_availability(scope, resource_id, window)
                    .await
                    .map_err(engine_err)?;
                let rows: Vec<BlackoutOutcome> = blackouts
                    .into_iter()
                    .map(|blackout| BlackoutOutcome {
                        blackout,
                        grandfathered: Vec::new(),
                    })
                    .collect();
                query_rows(availability_schema(), &rows, encode_blackout)
            }
            Command::SelectFreeWindows { resource_id, start, end } => {
                let windows = engine
                    .free_windows(scope, resource_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let rows: Vec<(Ulid, DateWindow)> = windows.into_iter().map(|w| (resource_id, w)).collect();
                query_rows(free_window_schema(), &rows, encode_free_window)
            }

            // ── Utilization ───────────────────────────────────
            Command::InsertUtilization(new) => {
                engine.record_utilization(scope, new).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateUtilization { id, patch } => {
                engine.update_utilization(scope, id, patch).await.map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::DeleteUtilization { id } => {
                engine.remove_utilization(scope, id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SelectUtilization(filter) => {
                let records = engine.list_utilization(scope, &filter).await.map_err(engine_err)?;
                query_rows(utilization_schema(), &records, encode_utilization)
            }
            Command::SelectUtilizationSummary(filter) => {
                let totals = engine.utilization_summary(scope, &filter).await.map_err(engine_err)?;
                query_rows(utilization_summary_schema(), &totals, encode_totals)
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn updated(rows: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

/// Blackout writes answer like `RETURNING *`, so the caller sees which
/// allocations were left standing inside the new window.
fn blackout_outcome(outcome: BlackoutOutcome) -> PgWireResult<Response> {
    if !outcome.grandfathered.is_empty() {
        warn!(
            "blackout {} overlaps {} committed allocations",
            outcome.blackout.id,
            outcome.grandfathered.len()
        );
    }
    query_rows(availability_schema(), &[outcome], encode_blackout)
}

fn query_rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Dates travel as `YYYY-MM-DD` text.
fn text_fields(names: &[&str]) -> Vec<FieldInfo> {
    names.iter().map(|n| field(n, Type::VARCHAR)).collect()
}

fn schedule_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&[
        "id",
        "project_id",
        "name",
        "start_date",
        "end_date",
        "baseline_start_date",
        "baseline_end_date",
        "status",
        "created_by",
    ]);
    fields.push(field("created_at", Type::INT8));
    fields.push(field("updated_at", Type::INT8));
    fields.push(field("deleted_at", Type::INT8));
    fields
}

fn item_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&[
        "id",
        "schedule_id",
        "parent_id",
        "task_id",
        "name",
        "kind",
        "start_date",
        "end_date",
    ]);
    fields.push(field("duration", Type::INT8));
    fields.push(field("percent_complete", Type::INT4));
    fields.push(field("status", Type::VARCHAR));
    fields.push(field("sort_order", Type::INT4));
    fields.extend(text_fields(&["baseline_start", "baseline_end", "created_by"]));
    fields.push(field("created_at", Type::INT8));
    fields.push(field("updated_at", Type::INT8));
    fields.push(field("deleted_at", Type::INT8));
    fields
}

fn dependency_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["id", "schedule_id", "predecessor_id", "successor_id", "dependency_type"]);
    fields.push(field("lag", Type::INT4));
    fields.push(field("created_by", Type::VARCHAR));
    fields.push(field("created_at", Type::INT8));
    fields
}

fn baseline_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["id", "schedule_id", "name", "description", "start_date", "end_date"]);
    fields.push(field("item_count", Type::INT8));
    fields.push(field("created_by", Type::VARCHAR));
    fields.push(field("created_at", Type::INT8));
    fields
}

fn baseline_item_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["baseline_id", "item_id", "parent_id", "name", "kind", "start_date", "end_date"]);
    fields.push(field("duration", Type::INT8));
    fields
}

fn variance_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&[
        "item_id",
        "name",
        "baseline_start",
        "baseline_end",
        "current_start",
        "current_end",
    ]);
    fields.push(field("start_variance_days", Type::INT8));
    fields.push(field("finish_variance_days", Type::INT8));
    fields
}

fn critical_path_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&[
        "item_id",
        "expected_start",
        "expected_finish",
        "late_start",
        "late_finish",
    ]);
    fields.push(field("float", Type::INT8));
    fields.push(field("is_critical", Type::BOOL));
    fields.push(field("chain_position", Type::INT4));
    fields
}

fn resource_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["id", "name", "kind", "status"]);
    fields.push(field("cost_rate", Type::FLOAT8));
    fields.extend(text_fields(&["cost_unit", "role", "skills"]));
    fields.push(field("max_hours_per_day", Type::FLOAT8));
    fields.extend(text_fields(&["condition", "last_maintenance", "next_maintenance", "unit"]));
    fields.push(field("quantity_on_hand", Type::FLOAT8));
    fields.push(field("reorder_point", Type::FLOAT8));
    fields.push(field("capacity", Type::FLOAT8));
    fields.push(field("created_by", Type::VARCHAR));
    fields.push(field("created_at", Type::INT8));
    fields.push(field("updated_at", Type::INT8));
    fields.push(field("deleted_at", Type::INT8));
    fields
}

fn allocation_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&[
        "id",
        "resource_id",
        "project_id",
        "task_id",
        "schedule_item_id",
        "start_date",
        "end_date",
    ]);
    fields.push(field("quantity", Type::FLOAT8));
    fields.push(field("utilization", Type::INT4));
    fields.extend(text_fields(&["status", "notes", "created_by"]));
    fields.push(field("created_at", Type::INT8));
    fields.push(field("updated_at", Type::INT8));
    fields
}

fn availability_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&[
        "id",
        "resource_id",
        "start_date",
        "end_date",
        "reason",
        "grandfathered_allocations",
        "created_by",
    ]);
    fields.push(field("created_at", Type::INT8));
    fields
}

fn free_window_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["resource_id", "start_date", "end_date"]);
    fields.push(field("days", Type::INT8));
    fields
}

fn utilization_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["id", "resource_id", "project_id", "task_id", "date"]);
    fields.push(field("hours", Type::FLOAT8));
    fields.push(field("quantity", Type::FLOAT8));
    fields.extend(text_fields(&["notes", "created_by"]));
    fields.push(field("created_at", Type::INT8));
    fields
}

fn utilization_summary_schema() -> Vec<FieldInfo> {
    let mut fields = text_fields(&["resource_id", "resource_kind"]);
    fields.push(field("records", Type::INT8));
    fields.push(field("hours", Type::FLOAT8));
    fields.push(field("quantity", Type::FLOAT8));
    fields.push(field("cost", Type::FLOAT8));
    fields
}

/// Schema a statement will produce, from the table it names. Used for
/// Describe before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lowered = sql.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let Some(verb) = words.first() else {
        return vec![];
    };
    let table_after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|p| words.get(p + 1))
            .map(|t| t.trim_matches('"'))
    };
    match *verb {
        "select" => match table_after("from") {
            Some("schedules") => schedule_schema(),
            Some("schedule_items") => item_schema(),
            Some("schedule_dependencies") => dependency_schema(),
            Some("schedule_baselines") => baseline_schema(),
            Some("baseline_items") => baseline_item_schema(),
            Some("baseline_variance") => variance_schema(),
            Some("critical_path") => critical_path_schema(),
            Some("resources") => resource_schema(),
            Some("allocations") => allocation_schema(),
            Some("availability") => availability_schema(),
            Some("free_windows") => free_window_schema(),
            Some("utilization") => utilization_schema(),
            Some("utilization_summary") => utilization_summary_schema(),
            _ => vec![],
        },
        "insert" if table_after("into") == Some("availability") => availability_schema(),
        "update" if table_after("update") == Some("availability") => availability_schema(),
        _ => vec![],
    }
}

// ── Row encoders ─────────────────────────────────────────────────

fn opt_id(id: Option<Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn opt_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.to_string())
}

fn ids_json(ids: &[Ulid]) -> PgWireResult<String> {
    let ids: Vec<String> = ids.iter().map(Ulid::to_string).collect();
    serde_json::to_string(&ids).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

fn encode_schedule(e: &mut DataRowEncoder, s: &Schedule) -> PgWireResult<()> {
    e.encode_field(&s.id.to_string())?;
    e.encode_field(&s.project_id.to_string())?;
    e.encode_field(&s.name)?;
    e.encode_field(&s.window.start.to_string())?;
    e.encode_field(&s.window.end.to_string())?;
    e.encode_field(&opt_date(s.baseline_window.map(|w| w.start)))?;
    e.encode_field(&opt_date(s.baseline_window.map(|w| w.end)))?;
    e.encode_field(&s.status.as_str())?;
    e.encode_field(&s.created_by)?;
    e.encode_field(&s.created_at)?;
    e.encode_field(&s.updated_at)?;
    e.encode_field(&s.deleted_at)
}

fn encode_item(e: &mut DataRowEncoder, i: &ScheduleItem) -> PgWireResult<()> {
    e.encode_field(&i.id.to_string())?;
    e.encode_field(&i.schedule_id.to_string())?;
    e.encode_field(&opt_id(i.parent_id))?;
    e.encode_field(&opt_id(i.task_id))?;
    e.encode_field(&i.name)?;
    e.encode_field(&i.kind.as_str())?;
    e.encode_field(&i.start.to_string())?;
    e.encode_field(&i.end.to_string())?;
    e.encode_field(&i.duration)?;
    e.encode_field(&i32::from(i.percent_complete))?;
    e.encode_field(&i.status.as_str())?;
    e.encode_field(&i.sort_order)?;
    e.encode_field(&opt_date(i.baseline_start))?;
    e.encode_field(&opt_date(i.baseline_end))?;
    e.encode_field(&i.created_by)?;
    e.encode_field(&i.created_at)?;
    e.encode_field(&i.updated_at)?;
    e.encode_field(&i.deleted_at)
}

fn encode_dependency(e: &mut DataRowEncoder, d: &ScheduleDependency) -> PgWireResult<()> {
    e.encode_field(&d.id.to_string())?;
    e.encode_field(&d.schedule_id.to_string())?;
    e.encode_field(&d.predecessor_id.to_string())?;
    e.encode_field(&d.successor_id.to_string())?;
    e.encode_field(&d.dependency_type.as_str())?;
    e.encode_field(&d.lag)?;
    e.encode_field(&d.created_by)?;
    e.encode_field(&d.created_at)
}

fn encode_baseline(e: &mut DataRowEncoder, b: &ScheduleBaseline) -> PgWireResult<()> {
    e.encode_field(&b.id.to_string())?;
    e.encode_field(&b.schedule_id.to_string())?;
    e.encode_field(&b.name)?;
    e.encode_field(&b.description)?;
    e.encode_field(&b.window.start.to_string())?;
    e.encode_field(&b.window.end.to_string())?;
    e.encode_field(&(b.items.len() as i64))?;
    e.encode_field(&b.created_by)?;
    e.encode_field(&b.created_at)
}

fn encode_baseline_item(e: &mut DataRowEncoder, (baseline_id, item): &(Ulid, BaselineItem)) -> PgWireResult<()> {
    e.encode_field(&baseline_id.to_string())?;
    e.encode_field(&item.item_id.to_string())?;
    e.encode_field(&opt_id(item.parent_id))?;
    e.encode_field(&item.name)?;
    e.encode_field(&item.kind.as_str())?;
    e.encode_field(&item.start.to_string())?;
    e.encode_field(&item.end.to_string())?;
    e.encode_field(&item.duration)
}

fn encode_variance(e: &mut DataRowEncoder, v: &VarianceRow) -> PgWireResult<()> {
    e.encode_field(&v.item_id.to_string())?;
    e.encode_field(&v.name)?;
    e.encode_field(&opt_date(v.baseline_start))?;
    e.encode_field(&opt_date(v.baseline_end))?;
    e.encode_field(&opt_date(v.current_start))?;
    e.encode_field(&opt_date(v.current_end))?;
    e.encode_field(&v.start_variance_days)?;
    e.encode_field(&v.finish_variance_days)
}

fn encode_entry(e: &mut DataRowEncoder, (entry, position): &(ScheduleEntry, Option<i32>)) -> PgWireResult<()> {
    e.encode_field(&entry.item_id.to_string())?;
    e.encode_field(&entry.expected_start.to_string())?;
    e.encode_field(&entry.expected_finish.to_string())?;
    e.encode_field(&entry.late_start.to_string())?;
    e.encode_field(&entry.late_finish.to_string())?;
    e.encode_field(&entry.float)?;
    e.encode_field(&entry.is_critical)?;
    e.encode_field(position)
}

fn encode_resource(e: &mut DataRowEncoder, r: &Resource) -> PgWireResult<()> {
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.name)?;
    e.encode_field(&r.kind().as_str())?;
    e.encode_field(&r.status.as_str())?;
    e.encode_field(&r.cost_rate)?;
    e.encode_field(&r.cost_unit)?;

    let (mut role, mut skills, mut max_hours) = (None, None, None);
    let (mut condition, mut last_maintenance, mut next_maintenance) = (None, None, None);
    let (mut unit, mut on_hand, mut reorder_point) = (None, None, None);
    match &r.details {
        ResourceDetails::Labor {
            role: labor_role,
            skills: labor_skills,
            max_hours_per_day,
        } => {
            role = labor_role.clone();
            skills = Some(serde_json::to_string(labor_skills).map_err(|err| PgWireError::ApiError(Box::new(err)))?);
            max_hours = *max_hours_per_day;
        }
        ResourceDetails::Equipment {
            condition: equipment_condition,
            last_maintenance: last,
            next_maintenance: next,
        } => {
            condition = equipment_condition.clone();
            last_maintenance = opt_date(*last);
            next_maintenance = opt_date(*next);
        }
        ResourceDetails::Material {
            unit: material_unit,
            quantity_on_hand,
            reorder_point: point,
        } => {
            unit = material_unit.clone();
            on_hand = Some(*quantity_on_hand);
            reorder_point = *point;
        }
    }
    e.encode_field(&role)?;
    e.encode_field(&skills)?;
    e.encode_field(&max_hours)?;
    e.encode_field(&condition)?;
    e.encode_field(&last_maintenance)?;
    e.encode_field(&next_maintenance)?;
    e.encode_field(&unit)?;
    e.encode_field(&on_hand)?;
    e.encode_field(&reorder_point)?;
    e.encode_field(&r.capacity())?;
    e.encode_field(&r.created_by)?;
    e.encode_field(&r.created_at)?;
    e.encode_field(&r.updated_at)?;
    e.encode_field(&r.deleted_at)
}

fn encode_allocation(e: &mut DataRowEncoder, a: &Allocation) -> PgWireResult<()> {
    e.encode_field(&a.id.to_string())?;
    e.encode_field(&a.resource_id.to_string())?;
    e.encode_field(&a.project_id.to_string())?;
    e.encode_field(&opt_id(a.task_id))?;
    e.encode_field(&opt_id(a.schedule_item_id))?;
    e.encode_field(&a.window.start.to_string())?;
    e.encode_field(&a.window.end.to_string())?;
    e.encode_field(&a.quantity)?;
    e.encode_field(&i32::from(a.utilization))?;
    e.encode_field(&a.status.as_str())?;
    e.encode_field(&a.notes)?;
    e.encode_field(&a.created_by)?;
    e.encode_field(&a.created_at)?;
    e.encode_field(&a.updated_at)
}

fn encode_blackout(e: &mut DataRowEncoder, o: &BlackoutOutcome) -> PgWireResult<()> {
    let b = &o.blackout;
    e.encode_field(&b.id.to_string())?;
    e.encode_field(&b.resource_id.to_string())?;
    e.encode_field(&b.window.start.to_string())?;
    e.encode_field(&b.window.end.to_string())?;
    e.encode_field(&b.reason)?;
    e.encode_field(&ids_json(&o.grandfathered)?)?;
    e.encode_field(&b.created_by)?;
    e.encode_field(&b.created_at)
}

fn encode_free_window(e: &mut DataRowEncoder, (resource_id, w): &(Ulid, DateWindow)) -> PgWireResult<()> {
    e.encode_field(&resource_id.to_string())?;
    e.encode_field(&w.start.to_string())?;
    e.encode_field(&w.end.to_string())?;
    e.encode_field(&w.days())
}

fn encode_utilization(e: &mut DataRowEncoder, u: &UtilizationRecord) -> PgWireResult<()> {
    e.encode_field(&u.id.to_string())?;
    e.encode_field(&u.resource_id.to_string())?;
    e.encode_field(&opt_id(u.project_id))?;
    e.encode_field(&opt_id(u.task_id))?;
    e.encode_field(&u.date.to_string())?;
    e.encode_field(&u.hours)?;
    e.encode_field(&u.quantity)?;
    e.encode_field(&u.notes)?;
    e.encode_field(&u.created_by)?;
    e.encode_field(&u.created_at)
}

fn encode_totals(e: &mut DataRowEncoder, t: &UtilizationTotals) -> PgWireResult<()> {
    e.encode_field(&t.resource_id.to_string())?;
    e.encode_field(&t.resource_kind.as_str())?;
    e.encode_field(&(t.records as i64))?;
    e.encode_field(&t.hours)?;
    e.encode_field(&t.quantity)?;
    e.encode_field(&t.cost)
}

#[async_trait]
impl SimpleQueryHandler for CrewPlanHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, scope) = self.resolve_scope(client)?;
        self.run(&engine, &scope, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CrewPlanQueryParser;

#[async_trait]
impl QueryParser for CrewPlanQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CrewPlanHandler {
    type Statement = String;
    type QueryParser = CrewPlanQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, scope) = self.resolve_scope(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, &scope, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format). One left-to-right pass over the statement: placeholders inside
/// quoted literals stay as written, and bound text is never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((at, c)) = chars.next() {
        if c == '\'' {
            // '' inside a literal toggles out and straight back in.
            in_literal = !in_literal;
            result.push(c);
            continue;
        }
        if c != '$' || in_literal {
            result.push(c);
            continue;
        }
        let digits_start = at + 1;
        let mut digits_end = digits_start;
        while let Some(&(i, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = i + 1;
            chars.next();
        }
        let bound = sql[digits_start..digits_end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&sql[at..digits_end]),
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CrewPlanFactory {
    handler: Arc<CrewPlanHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<CrewPlanAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CrewPlanFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = CrewPlanAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CrewPlanHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CrewPlanFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one accepted socket until the client disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CrewPlanFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e.kind() {
        "validation" => "22023",
        "not_found" => "P0002",
        "conflict" => "23P01",
        "computation" => "XX000",
        "limit" => "54000",
        _ => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_text_is_not_rescanned() {
        let sql = "UPDATE schedule_items SET name = $2 WHERE id = $1";
        let bound = bind_params(sql, &[Some("01ARZ3NDEKTSV4RRFFQ69G5FAV"), Some("Pour $1 slab")]);
        assert_eq!(
            bound,
            "UPDATE schedule_items SET name = 'Pour $1 slab' WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"
        );
    }

    #[test]
    fn placeholders_in_literals_and_double_digits() {
        let params: Vec<Option<&str>> = (1..=10).map(|n| Some(if n == 10 { "ten" } else { "x" })).collect();
        assert_eq!(bind_params("SELECT '$1', $10", &params), "SELECT '$1', 'ten'");
        assert_eq!(bind_params("SELECT 'it''s $1', $1", &params), "SELECT 'it''s $1', 'x'");
        assert_eq!(bind_params("SELECT $1", &[None::<&str>]), "SELECT NULL");
        assert_eq!(bind_params("SELECT $3", &[Some("x")]), "SELECT $3");
    }

    #[test]
    fn sqlstate_per_error_kind() {
        assert_eq!(engine_sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(engine_sqlstate(&EngineError::NotFound(Ulid::new())), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::OutOfScope("acme".into())), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::SelfDependency(Ulid::new())), "23P01");
        assert_eq!(engine_sqlstate(&EngineError::Computation("x".into())), "XX000");
        assert_eq!(engine_sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(engine_sqlstate(&EngineError::WalError("disk".into())), "58030");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM schedules"), 0);
        assert_eq!(count_params("SELECT * FROM allocations WHERE resource_id = $1 AND start_date >= $3"), 3);
        assert_eq!(count_params("UPDATE schedule_items SET name = $12 WHERE id = $2"), 12);
    }

    #[test]
    fn result_schema_follows_table() {
        let names = |sql: &str| -> Vec<String> { result_schema(sql).iter().map(|f| f.name().to_string()).collect() };
        assert_eq!(names("SELECT * FROM free_windows WHERE resource_id = $1")[3], "days");
        assert!(names("select * from critical_path where schedule_id = $1").contains(&"is_critical".to_string()));
        assert!(names("INSERT INTO availability (id) VALUES ($1)").contains(&"grandfathered_allocations".to_string()));
        assert!(names("INSERT INTO allocations (id) VALUES ($1)").is_empty());
        assert!(names("").is_empty());
    }
}
