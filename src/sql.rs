use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{
    AllocationPatch, DetailsPatch, ItemPatch, NewAllocation, NewBaseline, NewDependency, NewItem, NewResource,
    NewSchedule, NewUtilization, ResourcePatch, SchedulePatch, UtilizationFilter, UtilizationPatch,
};
use crate::limits::MAX_BATCH_IDS;
use crate::model::*;

/// One parsed statement against the virtual tables.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Multi-row INSERTs. Each commits all of its rows or none.
    InsertItems(Vec<NewItem>),
    InsertDependencies(Vec<NewDependency>),
    InsertAllocations(Vec<NewAllocation>),

    InsertSchedule(NewSchedule),
    UpdateSchedule {
        id: Ulid,
        patch: SchedulePatch,
    },
    DeleteSchedule {
        id: Ulid,
    },
    SelectSchedules {
        id: Option<Ulid>,
        project_id: Option<Ulid>,
        include_deleted: bool,
    },

    InsertBaseline(NewBaseline),
    RestoreBaseline {
        baseline_id: Ulid,
    },
    SelectBaselines {
        id: Option<Ulid>,
        schedule_id: Option<Ulid>,
        include_deleted: bool,
    },
    SelectBaselineItems {
        baseline_id: Ulid,
        include_deleted: bool,
    },
    SelectBaselineVariance {
        baseline_id: Ulid,
    },

    InsertItem(NewItem),
    UpdateItem {
        id: Ulid,
        patch: ItemPatch,
    },
    DeleteItem {
        id: Ulid,
    },
    SelectItems {
        id: Option<Ulid>,
        schedule_id: Option<Ulid>,
        include_deleted: bool,
    },
    ReorderItems {
        schedule_id: Ulid,
        parent_id: Option<Ulid>,
        item_ids: Vec<Ulid>,
    },

    InsertDependency(NewDependency),
    DeleteDependency {
        id: Ulid,
    },
    SelectDependencies {
        item_id: Option<Ulid>,
        schedule_id: Option<Ulid>,
        include_deleted: bool,
    },
    SelectCriticalPath {
        schedule_id: Ulid,
    },

    InsertResource(NewResource),
    UpdateResource {
        id: Ulid,
        patch: ResourcePatch,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources {
        id: Option<Ulid>,
        kind: Option<ResourceKind>,
        include_deleted: bool,
    },

    InsertAllocation(NewAllocation),
    UpdateAllocation {
        id: Ulid,
        patch: AllocationPatch,
    },
    DeleteAllocation {
        id: Ulid,
    },
    SelectAllocations {
        id: Option<Ulid>,
        resource_id: Option<Ulid>,
        project_id: Option<Ulid>,
        window: Option<DateWindow>,
    },

    InsertAvailability {
        id: Ulid,
        resource_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        reason: String,
    },
    UpdateAvailability {
        id: Ulid,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        reason: Option<String>,
    },
    DeleteAvailability {
        id: Ulid,
    },
    SelectAvailability {
        resource_id: Ulid,
        window: Option<DateWindow>,
    },
    SelectFreeWindows {
        resource_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },

    InsertUtilization(NewUtilization),
    UpdateUtilization {
        id: Ulid,
        patch: UtilizationPatch,
    },
    DeleteUtilization {
        id: Ulid,
    },
    SelectUtilization(UtilizationFilter),
    SelectUtilizationSummary(UtilizationFilter),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements in one query".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const SCHEDULE_COLUMNS: &[&str] = &["id", "project_id", "name", "start_date", "end_date", "status"];
const BASELINE_COLUMNS: &[&str] = &["id", "schedule_id", "name", "description"];
const ITEM_COLUMNS: &[&str] = &[
    "id",
    "schedule_id",
    "parent_id",
    "task_id",
    "name",
    "kind",
    "start_date",
    "end_date",
    "duration",
    "percent_complete",
    "status",
    "sort_order",
];
const DEPENDENCY_COLUMNS: &[&str] = &["id", "predecessor_id", "successor_id", "dependency_type", "lag"];
const LABOR_COLUMNS: &[&str] = &["role", "skills", "max_hours_per_day"];
const EQUIPMENT_COLUMNS: &[&str] = &["condition", "last_maintenance", "next_maintenance"];
const MATERIAL_COLUMNS: &[&str] = &["unit", "quantity_on_hand", "reorder_point"];
const RESOURCE_COLUMNS: &[&str] = &[
    "id",
    "name",
    "kind",
    "status",
    "cost_rate",
    "cost_unit",
    "role",
    "skills",
    "max_hours_per_day",
    "condition",
    "last_maintenance",
    "next_maintenance",
    "unit",
    "quantity_on_hand",
    "reorder_point",
];
const ALLOCATION_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "project_id",
    "task_id",
    "schedule_item_id",
    "start_date",
    "end_date",
    "quantity",
    "utilization",
    "status",
    "notes",
];
const AVAILABILITY_COLUMNS: &[&str] = &["id", "resource_id", "start_date", "end_date", "reason"];
const UTILIZATION_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "project_id",
    "task_id",
    "date",
    "hours",
    "quantity",
    "notes",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs an explicit column list")));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let rows = extract_all_insert_rows(insert)?;
    if rows.len() > MAX_BATCH_IDS {
        return Err(SqlError::Unsupported(format!("more than {MAX_BATCH_IDS} rows in one INSERT")));
    }

    let mut commands = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() != columns.len() {
            return Err(SqlError::WrongArity(table.clone(), columns.len(), row.len()));
        }
        let mut values = HashMap::with_capacity(columns.len());
        for (column, expr) in columns.iter().zip(&row) {
            let lit = literal(expr).map_err(|reason| SqlError::BadValue {
                column: column.clone(),
                reason,
            })?;
            if values.insert(column.clone(), lit).is_some() {
                return Err(SqlError::Parse(format!("column {column} given twice")));
            }
        }
        commands.push(insert_row(&table, &Fields { values })?);
    }

    if commands.len() == 1 {
        Ok(commands.remove(0))
    } else {
        batch(&table, commands)
    }
}

/// Collect single-row commands into the all-or-nothing form for `table`.
fn batch(table: &str, commands: Vec<Command>) -> Result<Command, SqlError> {
    fn rows<T>(commands: Vec<Command>, pick: impl Fn(Command) -> Option<T>) -> Vec<T> {
        commands.into_iter().filter_map(pick).collect()
    }
    match table {
        "schedule_items" => Ok(Command::InsertItems(rows(commands, |c| match c {
            Command::InsertItem(new) => Some(new),
            _ => None,
        }))),
        "schedule_dependencies" => Ok(Command::InsertDependencies(rows(commands, |c| match c {
            Command::InsertDependency(new) => Some(new),
            _ => None,
        }))),
        "allocations" => Ok(Command::InsertAllocations(rows(commands, |c| match c {
            Command::InsertAllocation(new) => Some(new),
            _ => None,
        }))),
        _ => Err(SqlError::Unsupported(format!(
            "multi-row INSERT INTO {table}; send one row per statement"
        ))),
    }
}

fn insert_row(table: &str, f: &Fields) -> Result<Command, SqlError> {
    match table {
        "schedules" => {
            f.allow(SCHEDULE_COLUMNS)?;
            Ok(Command::InsertSchedule(NewSchedule {
                id: f.required("id", as_ulid)?,
                project_id: f.required("project_id", as_ulid)?,
                name: f.required("name", as_text)?,
                start: f.required("start_date", as_date)?,
                end: f.required("end_date", as_date)?,
                status: f.optional("status", as_enum)?,
            }))
        }
        "schedule_baselines" => {
            f.allow(BASELINE_COLUMNS)?;
            Ok(Command::InsertBaseline(NewBaseline {
                id: f.required("id", as_ulid)?,
                schedule_id: f.required("schedule_id", as_ulid)?,
                name: f.required("name", as_text)?,
                description: f.optional("description", as_text)?,
            }))
        }
        "baseline_restores" => {
            f.allow(&["baseline_id"])?;
            Ok(Command::RestoreBaseline {
                baseline_id: f.required("baseline_id", as_ulid)?,
            })
        }
        "schedule_items" => {
            f.allow(ITEM_COLUMNS)?;
            Ok(Command::InsertItem(NewItem {
                id: f.required("id", as_ulid)?,
                schedule_id: f.required("schedule_id", as_ulid)?,
                parent_id: f.optional("parent_id", as_ulid)?,
                task_id: f.optional("task_id", as_ulid)?,
                name: f.required("name", as_text)?,
                kind: f.optional("kind", as_enum)?,
                start: f.optional("start_date", as_date)?,
                end: f.optional("end_date", as_date)?,
                duration: f.optional("duration", as_i64)?,
                percent_complete: f.optional("percent_complete", as_u8)?,
                status: f.optional("status", as_enum)?,
                sort_order: f.optional("sort_order", as_i32)?,
            }))
        }
        "item_reorders" => {
            f.allow(&["schedule_id", "parent_id", "item_ids"])?;
            Ok(Command::ReorderItems {
                schedule_id: f.required("schedule_id", as_ulid)?,
                parent_id: f.optional("parent_id", as_ulid)?,
                item_ids: f.required("item_ids", as_ulid_list)?,
            })
        }
        "schedule_dependencies" => {
            f.allow(DEPENDENCY_COLUMNS)?;
            Ok(Command::InsertDependency(NewDependency {
                id: f.required("id", as_ulid)?,
                predecessor_id: f.required("predecessor_id", as_ulid)?,
                successor_id: f.required("successor_id", as_ulid)?,
                dependency_type: f.optional("dependency_type", as_enum)?,
                lag: f.optional("lag", as_i32)?,
            }))
        }
        "resources" => {
            f.allow(RESOURCE_COLUMNS)?;
            let kind: ResourceKind = f.required("kind", as_enum)?;
            Ok(Command::InsertResource(NewResource {
                id: f.required("id", as_ulid)?,
                name: f.required("name", as_text)?,
                details: resource_details(kind, f)?,
                status: f.optional("status", as_enum)?,
                cost_rate: f.optional("cost_rate", as_f64)?,
                cost_unit: f.optional("cost_unit", as_text)?,
            }))
        }
        "allocations" => {
            f.allow(ALLOCATION_COLUMNS)?;
            Ok(Command::InsertAllocation(NewAllocation {
                id: f.required("id", as_ulid)?,
                resource_id: f.required("resource_id", as_ulid)?,
                project_id: f.required("project_id", as_ulid)?,
                task_id: f.optional("task_id", as_ulid)?,
                schedule_item_id: f.optional("schedule_item_id", as_ulid)?,
                start: f.required("start_date", as_date)?,
                end: f.required("end_date", as_date)?,
                quantity: f.optional("quantity", as_f64)?,
                utilization: f.optional("utilization", as_u8)?,
                status: f.optional("status", as_enum)?,
                notes: f.optional("notes", as_text)?,
            }))
        }
        "availability" => {
            f.allow(AVAILABILITY_COLUMNS)?;
            Ok(Command::InsertAvailability {
                id: f.required("id", as_ulid)?,
                resource_id: f.required("resource_id", as_ulid)?,
                start: f.required("start_date", as_date)?,
                end: f.required("end_date", as_date)?,
                reason: f.required("reason", as_text)?,
            })
        }
        "utilization" => {
            f.allow(UTILIZATION_COLUMNS)?;
            Ok(Command::InsertUtilization(NewUtilization {
                id: f.required("id", as_ulid)?,
                resource_id: f.required("resource_id", as_ulid)?,
                project_id: f.optional("project_id", as_ulid)?,
                task_id: f.optional("task_id", as_ulid)?,
                date: f.required("date", as_date)?,
                hours: f.optional("hours", as_f64)?,
                quantity: f.optional("quantity", as_f64)?,
                notes: f.optional("notes", as_text)?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn resource_details(kind: ResourceKind, f: &Fields) -> Result<ResourceDetails, SqlError> {
    let own = match kind {
        ResourceKind::Labor => LABOR_COLUMNS,
        ResourceKind::Equipment => EQUIPMENT_COLUMNS,
        ResourceKind::Material => MATERIAL_COLUMNS,
    };
    for column in [LABOR_COLUMNS, EQUIPMENT_COLUMNS, MATERIAL_COLUMNS].concat() {
        if f.has(column) && !own.contains(&column) {
            return Err(SqlError::BadValue {
                column: column.to_string(),
                reason: format!("does not apply to {kind} resources"),
            });
        }
    }
    Ok(match kind {
        ResourceKind::Labor => ResourceDetails::Labor {
            role: f.optional("role", as_text)?,
            skills: f.optional("skills", as_text_list)?.unwrap_or_default(),
            max_hours_per_day: f.optional("max_hours_per_day", as_f64)?,
        },
        ResourceKind::Equipment => ResourceDetails::Equipment {
            condition: f.optional("condition", as_text)?,
            last_maintenance: f.optional("last_maintenance", as_date)?,
            next_maintenance: f.optional("next_maintenance", as_date)?,
        },
        ResourceKind::Material => ResourceDetails::Material {
            unit: f.optional("unit", as_text)?,
            quantity_on_hand: f.optional("quantity_on_hand", as_f64)?.unwrap_or(0.0),
            reorder_point: f.optional("reorder_point", as_f64)?,
        },
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut values = HashMap::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let lit = literal(&assignment.value).map_err(|reason| SqlError::BadValue {
            column: column.clone(),
            reason,
        })?;
        if values.insert(column.clone(), lit).is_some() {
            return Err(SqlError::Parse(format!("column {column} assigned twice")));
        }
    }
    let f = Fields { values };
    if f.has("id") {
        return Err(SqlError::BadValue {
            column: "id".into(),
            reason: "ids are immutable".into(),
        });
    }
    let id = Filters::from_selection(selection)?.key("id")?;

    match table.as_str() {
        "schedules" => {
            f.allow(SCHEDULE_COLUMNS)?;
            f.deny(&["project_id"])?;
            Ok(Command::UpdateSchedule {
                id,
                patch: SchedulePatch {
                    name: f.set("name", as_text)?,
                    start: f.set("start_date", as_date)?,
                    end: f.set("end_date", as_date)?,
                    status: f.set("status", as_enum)?,
                },
            })
        }
        "schedule_items" => {
            f.allow(ITEM_COLUMNS)?;
            f.deny(&["schedule_id"])?;
            Ok(Command::UpdateItem {
                id,
                patch: ItemPatch {
                    name: f.set("name", as_text)?,
                    kind: f.set("kind", as_enum)?,
                    parent_id: f.patch("parent_id", as_ulid)?,
                    task_id: f.patch("task_id", as_ulid)?,
                    start: f.set("start_date", as_date)?,
                    end: f.set("end_date", as_date)?,
                    duration: f.set("duration", as_i64)?,
                    percent_complete: f.set("percent_complete", as_u8)?,
                    status: f.set("status", as_enum)?,
                    sort_order: f.set("sort_order", as_i32)?,
                },
            })
        }
        "resources" => {
            f.allow(RESOURCE_COLUMNS)?;
            Ok(Command::UpdateResource {
                id,
                patch: ResourcePatch {
                    name: f.set("name", as_text)?,
                    kind: f.set("kind", as_enum)?,
                    details: DetailsPatch {
                        role: f.patch("role", as_text)?,
                        skills: f.patch("skills", as_text_list)?.map(Option::unwrap_or_default),
                        max_hours_per_day: f.patch("max_hours_per_day", as_f64)?,
                        condition: f.patch("condition", as_text)?,
                        last_maintenance: f.patch("last_maintenance", as_date)?,
                        next_maintenance: f.patch("next_maintenance", as_date)?,
                        unit: f.patch("unit", as_text)?,
                        quantity_on_hand: f.set("quantity_on_hand", as_f64)?,
                        reorder_point: f.patch("reorder_point", as_f64)?,
                    },
                    status: f.set("status", as_enum)?,
                    cost_rate: f.patch("cost_rate", as_f64)?,
                    cost_unit: f.patch("cost_unit", as_text)?,
                },
            })
        }
        "allocations" => {
            f.allow(ALLOCATION_COLUMNS)?;
            f.deny(&["resource_id", "project_id"])?;
            Ok(Command::UpdateAllocation {
                id,
                patch: AllocationPatch {
                    task_id: f.patch("task_id", as_ulid)?,
                    schedule_item_id: f.patch("schedule_item_id", as_ulid)?,
                    start: f.set("start_date", as_date)?,
                    end: f.set("end_date", as_date)?,
                    quantity: f.set("quantity", as_f64)?,
                    utilization: f.set("utilization", as_u8)?,
                    status: f.set("status", as_enum)?,
                    notes: f.patch("notes", as_text)?,
                },
            })
        }
        "availability" => {
            f.allow(AVAILABILITY_COLUMNS)?;
            f.deny(&["resource_id"])?;
            Ok(Command::UpdateAvailability {
                id,
                start: f.set("start_date", as_date)?,
                end: f.set("end_date", as_date)?,
                reason: f.set("reason", as_text)?,
            })
        }
        "utilization" => {
            f.allow(UTILIZATION_COLUMNS)?;
            f.deny(&["resource_id"])?;
            Ok(Command::UpdateUtilization {
                id,
                patch: UtilizationPatch {
                    project_id: f.patch("project_id", as_ulid)?,
                    task_id: f.patch("task_id", as_ulid)?,
                    date: f.set("date", as_date)?,
                    hours: f.set("hours", as_f64)?,
                    quantity: f.set("quantity", as_f64)?,
                    notes: f.patch("notes", as_text)?,
                },
            })
        }
        "schedule_dependencies" | "schedule_baselines" | "baseline_items" => Err(SqlError::Unsupported(format!(
            "{table} rows are immutable"
        ))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = Filters::from_selection(delete.selection.as_ref())?.key("id")?;

    match table.as_str() {
        "schedules" => Ok(Command::DeleteSchedule { id }),
        "schedule_items" => Ok(Command::DeleteItem { id }),
        "schedule_dependencies" => Ok(Command::DeleteDependency { id }),
        "resources" => Ok(Command::DeleteResource { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
        "availability" => Ok(Command::DeleteAvailability { id }),
        "utilization" => Ok(Command::DeleteUtilization { id }),
        "schedule_baselines" | "baseline_items" => Err(SqlError::Unsupported(format!("{table} rows are immutable"))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    if select.from.len() > 1 || !select.from[0].joins.is_empty() {
        return Err(SqlError::Unsupported("joins".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let w = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "schedules" => {
            w.allow(&["id", "project_id", "include_deleted"])?;
            Ok(Command::SelectSchedules {
                id: w.eq("id", as_ulid)?,
                project_id: w.eq("project_id", as_ulid)?,
                include_deleted: w.include_deleted()?,
            })
        }
        "schedule_baselines" => {
            w.allow(&["id", "schedule_id", "include_deleted"])?;
            let id = w.eq("id", as_ulid)?;
            let schedule_id = w.eq("schedule_id", as_ulid)?;
            if id.is_none() && schedule_id.is_none() {
                return Err(SqlError::MissingFilter("schedule_id"));
            }
            Ok(Command::SelectBaselines {
                id,
                schedule_id,
                include_deleted: w.include_deleted()?,
            })
        }
        "baseline_items" => {
            w.allow(&["baseline_id", "include_deleted"])?;
            Ok(Command::SelectBaselineItems {
                baseline_id: w.key("baseline_id")?,
                include_deleted: w.include_deleted()?,
            })
        }
        "baseline_variance" => {
            w.allow(&["baseline_id"])?;
            Ok(Command::SelectBaselineVariance {
                baseline_id: w.key("baseline_id")?,
            })
        }
        "schedule_items" => {
            w.allow(&["id", "schedule_id", "include_deleted"])?;
            let id = w.eq("id", as_ulid)?;
            let schedule_id = w.eq("schedule_id", as_ulid)?;
            if id.is_none() && schedule_id.is_none() {
                return Err(SqlError::MissingFilter("schedule_id"));
            }
            Ok(Command::SelectItems {
                id,
                schedule_id,
                include_deleted: w.include_deleted()?,
            })
        }
        "schedule_dependencies" => {
            w.allow(&["item_id", "schedule_id", "include_deleted"])?;
            let item_id = w.eq("item_id", as_ulid)?;
            let schedule_id = w.eq("schedule_id", as_ulid)?;
            if item_id.is_none() && schedule_id.is_none() {
                return Err(SqlError::MissingFilter("item_id"));
            }
            Ok(Command::SelectDependencies {
                item_id,
                schedule_id,
                include_deleted: w.include_deleted()?,
            })
        }
        "critical_path" => {
            w.allow(&["schedule_id"])?;
            Ok(Command::SelectCriticalPath {
                schedule_id: w.key("schedule_id")?,
            })
        }
        "resources" => {
            w.allow(&["id", "kind", "include_deleted"])?;
            Ok(Command::SelectResources {
                id: w.eq("id", as_ulid)?,
                kind: w.eq("kind", as_enum)?,
                include_deleted: w.include_deleted()?,
            })
        }
        "allocations" => {
            w.allow(&["id", "resource_id", "project_id", "start_date", "end_date"])?;
            Ok(Command::SelectAllocations {
                id: w.eq("id", as_ulid)?,
                resource_id: w.eq("resource_id", as_ulid)?,
                project_id: w.eq("project_id", as_ulid)?,
                window: w.window("start_date", "end_date")?,
            })
        }
        "availability" => {
            w.allow(&["resource_id", "start_date", "end_date"])?;
            Ok(Command::SelectAvailability {
                resource_id: w.key("resource_id")?,
                window: w.window("start_date", "end_date")?,
            })
        }
        "free_windows" => {
            w.allow(&["resource_id", "start_date", "end_date"])?;
            let window = w
                .window("start_date", "end_date")?
                .ok_or(SqlError::MissingFilter("start_date"))?;
            Ok(Command::SelectFreeWindows {
                resource_id: w.key("resource_id")?,
                start: window.start,
                end: window.end,
            })
        }
        "utilization" | "utilization_summary" => {
            w.allow(&["resource_id", "project_id", "task_id", "date"])?;
            let filter = UtilizationFilter {
                resource_id: w.eq("resource_id", as_ulid)?,
                project_id: w.eq("project_id", as_ulid)?,
                task_id: w.eq("task_id", as_ulid)?,
                from: w.ge("date", as_date)?,
                to: w.le("date", as_date)?,
            };
            if table == "utilization" {
                Ok(Command::SelectUtilization(filter))
            } else {
                Ok(Command::SelectUtilizationSummary(filter))
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Values ────────────────────────────────────────────────────

/// A constant as written in the statement, before it is given a type.
#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Null,
    Text(String),
    Number(String),
    Bool(bool),
    List(Vec<Literal>),
}

fn literal(expr: &Expr) -> Result<Literal, String> {
    if let Some(value) = extract_value(expr) {
        return match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::Number(n, _) => Ok(Literal::Number(n.clone())),
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(Literal::Text(s.clone())),
            other => Err(format!("unsupported value {other}")),
        };
    }
    match expr {
        Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => literal(inner),
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Literal::Number(n) => Ok(Literal::Number(format!("-{n}"))),
            other => Err(format!("cannot negate {other:?}")),
        },
        Expr::Array(array) => array.elem.iter().map(literal).collect::<Result<_, _>>().map(Literal::List),
        other => Err(format!("expected a constant, got {other}")),
    }
}

fn as_text(lit: &Literal) -> Result<String, String> {
    match lit {
        Literal::Text(s) => Ok(s.clone()),
        other => Err(format!("expected text, got {other:?}")),
    }
}

fn as_ulid(lit: &Literal) -> Result<Ulid, String> {
    match lit {
        Literal::Text(s) => Ulid::from_string(s.trim()).map_err(|e| format!("bad ULID {s:?}: {e}")),
        other => Err(format!("expected ULID text, got {other:?}")),
    }
}

fn as_date(lit: &Literal) -> Result<NaiveDate, String> {
    match lit {
        Literal::Text(s) => {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("bad date {s:?} (want YYYY-MM-DD): {e}"))
        }
        other => Err(format!("expected date text, got {other:?}")),
    }
}

fn as_i64(lit: &Literal) -> Result<i64, String> {
    match lit {
        Literal::Number(s) | Literal::Text(s) => s.trim().parse().map_err(|e| format!("bad integer {s:?}: {e}")),
        other => Err(format!("expected integer, got {other:?}")),
    }
}

fn as_i32(lit: &Literal) -> Result<i32, String> {
    let v = as_i64(lit)?;
    i32::try_from(v).map_err(|_| format!("{v} out of range"))
}

fn as_u8(lit: &Literal) -> Result<u8, String> {
    let v = as_i64(lit)?;
    u8::try_from(v).map_err(|_| format!("{v} out of range"))
}

fn as_f64(lit: &Literal) -> Result<f64, String> {
    let v: f64 = match lit {
        Literal::Number(s) | Literal::Text(s) => s.trim().parse().map_err(|e| format!("bad number {s:?}: {e}"))?,
        other => return Err(format!("expected number, got {other:?}")),
    };
    if !v.is_finite() {
        return Err(format!("{v} is not a finite number"));
    }
    Ok(v)
}

fn as_bool(lit: &Literal) -> Result<bool, String> {
    match lit {
        Literal::Bool(b) => Ok(*b),
        Literal::Text(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(format!("bad bool: {s}")),
        },
        Literal::Number(n) => Ok(n != "0"),
        other => Err(format!("expected bool, got {other:?}")),
    }
}

fn as_enum<T: FromStr<Err = String>>(lit: &Literal) -> Result<T, String> {
    as_text(lit)?.parse()
}

/// `ARRAY['a','b']` or a comma-separated string.
fn as_text_list(lit: &Literal) -> Result<Vec<String>, String> {
    match lit {
        Literal::List(items) => items.iter().map(as_text).collect(),
        Literal::Text(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(String::from)
            .collect()),
        other => Err(format!("expected a list, got {other:?}")),
    }
}

fn as_ulid_list(lit: &Literal) -> Result<Vec<Ulid>, String> {
    let ids = as_text_list(lit)?;
    if ids.len() > MAX_BATCH_IDS {
        return Err(format!("more than {MAX_BATCH_IDS} ids"));
    }
    ids.iter().map(|s| as_ulid(&Literal::Text(s.clone()))).collect()
}

/// Named column values of one INSERT row or one UPDATE's SET list.
struct Fields {
    values: HashMap<String, Literal>,
}

impl Fields {
    fn has(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    fn allow(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.values.keys().find(|c| !allowed.contains(&c.as_str())) {
            Some(column) => Err(SqlError::UnknownColumn(column.clone())),
            None => Ok(()),
        }
    }

    fn deny(&self, fixed: &[&str]) -> Result<(), SqlError> {
        match fixed.iter().find(|c| self.has(c)) {
            Some(column) => Err(SqlError::BadValue {
                column: column.to_string(),
                reason: "cannot be changed".into(),
            }),
            None => Ok(()),
        }
    }

    /// `None` when absent, `Some(None)` when NULL.
    fn patch<T>(
        &self,
        column: &'static str,
        conv: impl Fn(&Literal) -> Result<T, String>,
    ) -> Result<Option<Option<T>>, SqlError> {
        match self.values.get(column) {
            None => Ok(None),
            Some(Literal::Null) => Ok(Some(None)),
            Some(lit) => conv(lit).map(|v| Some(Some(v))).map_err(|reason| SqlError::BadValue {
                column: column.to_string(),
                reason,
            }),
        }
    }

    fn optional<T>(
        &self,
        column: &'static str,
        conv: impl Fn(&Literal) -> Result<T, String>,
    ) -> Result<Option<T>, SqlError> {
        Ok(self.patch(column, conv)?.flatten())
    }

    fn required<T>(&self, column: &'static str, conv: impl Fn(&Literal) -> Result<T, String>) -> Result<T, SqlError> {
        self.optional(column, conv)?.ok_or(SqlError::MissingColumn(column))
    }

    /// A non-nullable column in an UPDATE.
    fn set<T>(&self, column: &'static str, conv: impl Fn(&Literal) -> Result<T, String>) -> Result<Option<T>, SqlError> {
        match self.patch(column, conv)? {
            Some(None) => Err(SqlError::BadValue {
                column: column.to_string(),
                reason: "cannot be NULL".into(),
            }),
            other => Ok(other.flatten()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

/// A WHERE clause flattened into `column op constant` conjuncts.
struct Filters {
    conds: Vec<(String, Cmp, Literal)>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut conds = Vec::new();
        if let Some(expr) = selection {
            collect_conds(expr, &mut conds)?;
        }
        Ok(Self { conds })
    }

    fn allow(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.conds.iter().find(|(c, _, _)| !allowed.contains(&c.as_str())) {
            Some((column, _, _)) => Err(SqlError::Unsupported(format!("filter on {column}"))),
            None => Ok(()),
        }
    }

    fn find<T>(
        &self,
        column: &'static str,
        cmp: Cmp,
        conv: impl Fn(&Literal) -> Result<T, String>,
    ) -> Result<Option<T>, SqlError> {
        let mut found = self.conds.iter().filter(|(c, op, _)| c == column && *op == cmp);
        let Some((_, _, lit)) = found.next() else {
            return Ok(None);
        };
        if found.next().is_some() {
            return Err(SqlError::Unsupported(format!("repeated filter on {column}")));
        }
        conv(lit).map(Some).map_err(|reason| SqlError::BadValue {
            column: column.to_string(),
            reason,
        })
    }

    fn eq<T>(&self, column: &'static str, conv: impl Fn(&Literal) -> Result<T, String>) -> Result<Option<T>, SqlError> {
        self.find(column, Cmp::Eq, conv)
    }

    fn ge<T>(&self, column: &'static str, conv: impl Fn(&Literal) -> Result<T, String>) -> Result<Option<T>, SqlError> {
        self.find(column, Cmp::GtEq, conv)
    }

    fn le<T>(&self, column: &'static str, conv: impl Fn(&Literal) -> Result<T, String>) -> Result<Option<T>, SqlError> {
        self.find(column, Cmp::LtEq, conv)
    }

    /// Required `column = '<ulid>'`.
    fn key(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.eq(column, as_ulid)?.ok_or(SqlError::MissingFilter(column))
    }

    fn include_deleted(&self) -> Result<bool, SqlError> {
        Ok(self.eq("include_deleted", as_bool)?.unwrap_or(false))
    }

    /// `start_col >= a AND end_col <= b`, both or neither.
    fn window(&self, start_col: &'static str, end_col: &'static str) -> Result<Option<DateWindow>, SqlError> {
        match (self.ge(start_col, as_date)?, self.le(end_col, as_date)?) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) if start <= end => Ok(Some(DateWindow::new(start, end))),
            (Some(start), Some(end)) => Err(SqlError::BadValue {
                column: end_col.to_string(),
                reason: format!("{end} is before {start}"),
            }),
            (Some(_), None) => Err(SqlError::MissingFilter(end_col)),
            (None, Some(_)) => Err(SqlError::MissingFilter(start_col)),
        }
    }
}

fn collect_conds(expr: &Expr, conds: &mut Vec<(String, Cmp, Literal)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conds(inner, conds),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_conds(left, conds)?;
                    return collect_conds(right, conds);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("left side of {op} must be a column")))?;
            let value = literal(right).map_err(|reason| SqlError::BadValue {
                column: column.clone(),
                reason,
            })?;
            conds.push((column, cmp, value));
            Ok(())
        }
        Expr::IsNull(inner) => {
            let column =
                expr_column_name(inner).ok_or_else(|| SqlError::Unsupported("IS NULL on an expression".into()))?;
            conds.push((column, Cmp::Eq, Literal::Null));
            Ok(())
        }
        // Bare boolean column, e.g. `WHERE include_deleted`.
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            if let Some(column) = expr_column_name(expr) {
                conds.push((column, Cmp::Eq, Literal::Bool(true)));
            }
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(String, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    BadValue { column: String, reason: String },
}

impl SqlError {
    /// Statement shape problems are syntax errors; bad constants are invalid
    /// parameters, same as the engine's validation errors.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::BadValue { .. } | SqlError::MissingColumn(_) | SqlError::MissingFilter(_) => "22023",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::Unsupported(_) => "0A000",
            SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue { column, reason } => write!(f, "invalid value for {column}: {reason}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const C: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";
    const D: &str = "01BX5ZZKBKACTAV9WEVGEMMVS1";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn insert_schedule() {
        let sql = format!(
            "INSERT INTO schedules (id, project_id, name, start_date, end_date) \
             VALUES ('{A}', '{B}', 'Tower A', '2025-01-01', '2025-12-31')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertSchedule(NewSchedule {
                id: ulid(A),
                project_id: ulid(B),
                name: "Tower A".into(),
                start: d(2025, 1, 1),
                end: d(2025, 12, 31),
                status: None,
            })
        );
    }

    #[test]
    fn insert_item_with_duration_and_null_parent() {
        let sql = format!(
            "INSERT INTO schedule_items (id, schedule_id, parent_id, name, kind, start_date, duration, sort_order) \
             VALUES ('{A}', '{B}', NULL, 'Excavate', 'task', '2025-03-01', 5, 2)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertItem(item) => {
                assert_eq!(item.parent_id, None);
                assert_eq!(item.kind, Some(ItemKind::Task));
                assert_eq!(item.start, Some(d(2025, 3, 1)));
                assert_eq!(item.end, None);
                assert_eq!(item.duration, Some(5));
                assert_eq!(item.sort_order, Some(2));
            }
            cmd => panic!("expected InsertItem, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_dependency_with_negative_lag() {
        let sql = format!(
            "INSERT INTO schedule_dependencies (id, predecessor_id, successor_id, dependency_type, lag) \
             VALUES ('{A}', '{B}', '{C}', 'SS', -2)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertDependency(dep) => {
                assert_eq!(dep.dependency_type, Some(DependencyType::StartToStart));
                assert_eq!(dep.lag, Some(-2));
            }
            cmd => panic!("expected InsertDependency, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_labor_resource_with_skills() {
        let sql = format!(
            "INSERT INTO resources (id, name, kind, role, skills, cost_rate) \
             VALUES ('{A}', 'Ana', 'labor', 'welder', 'tig, mig', 45.5)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertResource(r) => {
                assert_eq!(
                    r.details,
                    ResourceDetails::Labor {
                        role: Some("welder".into()),
                        skills: vec!["tig".into(), "mig".into()],
                        max_hours_per_day: None,
                    }
                );
                assert_eq!(r.cost_rate, Some(45.5));
            }
            cmd => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_resource_rejects_foreign_kind_column() {
        let sql = format!("INSERT INTO resources (id, name, kind, quantity_on_hand) VALUES ('{A}', 'Crane', 'equipment', 3)");
        let err = parse_sql(&sql).unwrap_err();
        assert!(matches!(err, SqlError::BadValue { ref column, .. } if column == "quantity_on_hand"));
    }

    #[test]
    fn insert_reorder_accepts_array() {
        let sql = format!("INSERT INTO item_reorders (schedule_id, item_ids) VALUES ('{A}', ARRAY['{C}', '{B}'])");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ReorderItems {
                schedule_id: ulid(A),
                parent_id: None,
                item_ids: vec![ulid(C), ulid(B)],
            }
        );
    }

    #[test]
    fn multi_row_insert_is_a_batch() {
        let sql = format!(
            "INSERT INTO allocations (id, resource_id, project_id, start_date, end_date, utilization) VALUES \
             ('{A}', '{C}', '{D}', '2025-01-01', '2025-01-02', 40), \
             ('{B}', '{C}', '{D}', '2025-02-01', '2025-02-02', 60)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAllocations(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].id, ulid(A));
                assert_eq!(rows[1].utilization, Some(60));
            }
            cmd => panic!("expected InsertAllocations, got {cmd:?}"),
        }
    }

    #[test]
    fn multi_row_insert_elsewhere_is_unsupported() {
        let sql = format!(
            "INSERT INTO availability (id, resource_id, start_date, end_date, reason) VALUES \
             ('{A}', '{C}', '2025-01-01', '2025-01-02', 'holiday'), \
             ('{B}', '{C}', '2025-02-01', '2025-02-02', 'service')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn insert_requires_columns() {
        let sql = format!("INSERT INTO schedules VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
        let sql = format!("INSERT INTO schedules (id, name) VALUES ('{A}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("project_id"))));
    }

    #[test]
    fn insert_unknown_column_errors() {
        let sql = format!("INSERT INTO allocations (id, colour) VALUES ('{A}', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "colour"));
    }

    #[test]
    fn bad_date_is_bad_value() {
        let sql = format!(
            "INSERT INTO schedules (id, project_id, name, start_date, end_date) \
             VALUES ('{A}', '{B}', 'x', '2025-13-01', '2025-12-31')"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(matches!(err, SqlError::BadValue { ref column, .. } if column == "start_date"));
        assert_eq!(err.sqlstate(), "22023");
    }

    #[test]
    fn update_item_clears_parent() {
        let sql = format!("UPDATE schedule_items SET parent_id = NULL, percent_complete = 40 WHERE id = '{A}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateItem { id, patch } => {
                assert_eq!(id, ulid(A));
                assert_eq!(patch.parent_id, Some(None));
                assert_eq!(patch.percent_complete, Some(40));
                assert_eq!(patch.name, None);
            }
            cmd => panic!("expected UpdateItem, got {cmd:?}"),
        }
    }

    #[test]
    fn update_rejects_null_on_required_column() {
        let sql = format!("UPDATE schedules SET name = NULL WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::BadValue { .. })));
    }

    #[test]
    fn update_requires_id_filter() {
        assert!(matches!(
            parse_sql("UPDATE allocations SET quantity = 2"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn update_resource_details_patch() {
        let sql = format!("UPDATE resources SET quantity_on_hand = 40, reorder_point = NULL WHERE id = '{A}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateResource { patch, .. } => {
                assert_eq!(patch.details.quantity_on_hand, Some(40.0));
                assert_eq!(patch.details.reorder_point, Some(None));
                assert_eq!(patch.details.role, None);
            }
            cmd => panic!("expected UpdateResource, got {cmd:?}"),
        }
    }

    #[test]
    fn update_cannot_move_allocation_between_resources() {
        let sql = format!("UPDATE allocations SET resource_id = '{B}' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::BadValue { .. })));
    }

    #[test]
    fn delete_by_id() {
        let sql = format!("DELETE FROM schedule_dependencies WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteDependency { id: ulid(A) });
        assert!(matches!(
            parse_sql(&format!("DELETE FROM schedule_baselines WHERE id = '{A}'")),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn select_schedules_by_project() {
        let sql = format!("SELECT * FROM schedules WHERE project_id = '{B}' AND include_deleted = true");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSchedules {
                id: None,
                project_id: Some(ulid(B)),
                include_deleted: true,
            }
        );
    }

    #[test]
    fn select_items_needs_a_key() {
        assert!(matches!(
            parse_sql("SELECT * FROM schedule_items"),
            Err(SqlError::MissingFilter("schedule_id"))
        ));
    }

    #[test]
    fn select_free_windows() {
        let sql = format!(
            "SELECT * FROM free_windows WHERE resource_id = '{A}' \
             AND start_date >= '2025-01-01' AND end_date <= '2025-01-31'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectFreeWindows {
                resource_id: ulid(A),
                start: d(2025, 1, 1),
                end: d(2025, 1, 31),
            }
        );
    }

    #[test]
    fn select_allocations_window_needs_both_bounds() {
        let sql = format!("SELECT * FROM allocations WHERE resource_id = '{A}' AND start_date >= '2025-01-01'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end_date"))));

        let sql = "SELECT * FROM allocations WHERE start_date >= '2025-02-01' AND end_date <= '2025-01-01'";
        assert!(matches!(parse_sql(sql), Err(SqlError::BadValue { .. })));
    }

    #[test]
    fn select_utilization_summary_filter() {
        let sql = format!(
            "SELECT * FROM utilization_summary WHERE project_id = '{B}' \
             AND date >= '2025-01-01' AND date <= '2025-03-31'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectUtilizationSummary(UtilizationFilter {
                resource_id: None,
                project_id: Some(ulid(B)),
                task_id: None,
                from: Some(d(2025, 1, 1)),
                to: Some(d(2025, 3, 31)),
            })
        );
    }

    #[test]
    fn select_critical_path() {
        let sql = format!("SELECT * FROM critical_path WHERE schedule_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectCriticalPath { schedule_id: ulid(A) }
        );
    }

    #[test]
    fn or_in_where_is_unsupported() {
        let sql = format!("SELECT * FROM schedules WHERE id = '{A}' OR id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        let err = parse_sql(&sql).unwrap_err();
        assert!(matches!(err, SqlError::UnknownTable(_)));
        assert_eq!(err.sqlstate(), "42P01");
    }

    #[test]
    fn empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
