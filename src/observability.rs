use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "crewplan_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "crewplan_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "crewplan_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "crewplan_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "crewplan_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "crewplan_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "crewplan_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "crewplan_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: allocations refused. Labels: reason (blackout, capacity).
pub const ALLOCATION_CONFLICTS_TOTAL: &str = "crewplan_allocation_conflicts_total";

/// Counter: dependency inserts refused. Labels: reason
/// (self_loop, cross_schedule, duplicate, cycle).
pub const DEPENDENCY_REJECTIONS_TOTAL: &str = "crewplan_dependency_rejections_total";

/// Histogram: forward/backward pass wall time in seconds.
pub const CRITICAL_PATH_DURATION_SECONDS: &str = "crewplan_critical_path_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSchedule(_) => "insert_schedule",
        Command::UpdateSchedule { .. } => "update_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::InsertBaseline(_) => "capture_baseline",
        Command::RestoreBaseline { .. } => "restore_baseline",
        Command::SelectBaselines { .. } => "select_baselines",
        Command::SelectBaselineItems { .. } => "select_baseline_items",
        Command::SelectBaselineVariance { .. } => "select_baseline_variance",
        Command::InsertItem(_) => "insert_item",
        Command::InsertItems(_) => "insert_items",
        Command::UpdateItem { .. } => "update_item",
        Command::DeleteItem { .. } => "delete_item",
        Command::SelectItems { .. } => "select_items",
        Command::ReorderItems { .. } => "reorder_items",
        Command::InsertDependency(_) => "insert_dependency",
        Command::InsertDependencies(_) => "insert_dependencies",
        Command::DeleteDependency { .. } => "delete_dependency",
        Command::SelectDependencies { .. } => "select_dependencies",
        Command::SelectCriticalPath { .. } => "select_critical_path",
        Command::InsertResource(_) => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::SelectResources { .. } => "select_resources",
        Command::InsertAllocation(_) => "insert_allocation",
        Command::InsertAllocations(_) => "insert_allocations",
        Command::UpdateAllocation { .. } => "update_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::UpdateAvailability { .. } => "update_availability",
        Command::DeleteAvailability { .. } => "delete_availability",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeWindows { .. } => "select_free_windows",
        Command::InsertUtilization(_) => "insert_utilization",
        Command::UpdateUtilization { .. } => "update_utilization",
        Command::DeleteUtilization { .. } => "delete_utilization",
        Command::SelectUtilization(_) => "select_utilization",
        Command::SelectUtilizationSummary(_) => "select_utilization_summary",
    }
}
