//! Critical Path Method over one schedule's items and dependencies.
//!
//! Pure and stateless: the engine clones the active items and edges under a
//! read lock and calls [`compute_critical_path`] on every query. Nothing is
//! cached, so mutations never leave stale results behind.
//!
//! Day arithmetic uses exclusive finishes internally (`finish = start + duration`);
//! reported finishes are inclusive (`start + duration - 1`). With that convention
//! the relation rules read:
//!
//! | type | successor constraint |
//! |------|----------------------|
//! | FS   | `start ≥ pred.finish + lag` |
//! | SS   | `start ≥ pred.start + lag` |
//! | FF   | `finish ≥ pred.finish + lag` |
//! | SF   | `finish ≥ pred.start + lag` |

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Edge weight: relation type and lag in days.
type Link = (DependencyType, i64);

pub struct ScheduleDag {
    pub graph: DiGraph<Ulid, Link>,
    pub index: HashMap<Ulid, NodeIndex>,
    durations: Vec<i64>,
    starts: Vec<Day>,
}

impl ScheduleDag {
    pub fn build(
        items: &[ScheduleItem],
        dependencies: &[ScheduleDependency],
    ) -> Result<Self, EngineError> {
        let mut graph: DiGraph<Ulid, Link> = DiGraph::with_capacity(items.len(), dependencies.len());
        let mut index = HashMap::with_capacity(items.len());
        let mut durations = Vec::with_capacity(items.len());
        let mut starts = Vec::with_capacity(items.len());

        for item in items {
            if item.duration < 1 {
                return Err(EngineError::Computation(format!(
                    "item {} has non-positive duration {}",
                    item.id, item.duration
                )));
            }
            let node = graph.add_node(item.id);
            index.insert(item.id, node);
            durations.push(item.duration);
            starts.push(day_number(item.start));
        }

        for dep in dependencies {
            let lookup = |id: &Ulid| {
                index.get(id).copied().ok_or_else(|| {
                    EngineError::Computation(format!(
                        "dependency {} references unknown item {id}",
                        dep.id
                    ))
                })
            };
            let from = lookup(&dep.predecessor_id)?;
            let to = lookup(&dep.successor_id)?;
            if from == to {
                return Err(EngineError::Computation(format!(
                    "dependency {} is a self-loop",
                    dep.id
                )));
            }
            graph.add_edge(from, to, (dep.dependency_type, i64::from(dep.lag)));
        }

        Ok(Self {
            graph,
            index,
            durations,
            starts,
        })
    }

    fn duration(&self, node: NodeIndex) -> i64 {
        self.durations[node.index()]
    }
}

/// Earliest start of a successor implied by one incoming edge.
fn forward_constraint(link: &Link, pred_start: Day, pred_finish: Day, duration: i64) -> Day {
    let (kind, lag) = *link;
    match kind {
        DependencyType::FinishToStart => pred_finish + lag,
        DependencyType::StartToStart => pred_start + lag,
        DependencyType::FinishToFinish => pred_finish + lag - duration,
        DependencyType::StartToFinish => pred_start + lag - duration,
    }
}

/// Latest (exclusive) finish of a predecessor implied by one outgoing edge.
fn backward_constraint(link: &Link, succ_late_start: Day, succ_late_finish: Day, duration: i64) -> Day {
    let (kind, lag) = *link;
    match kind {
        DependencyType::FinishToStart => succ_late_start - lag,
        DependencyType::StartToStart => succ_late_start - lag + duration,
        DependencyType::FinishToFinish => succ_late_finish - lag,
        DependencyType::StartToFinish => succ_late_finish - lag + duration,
    }
}

fn to_date(day: Day) -> Result<chrono::NaiveDate, EngineError> {
    date_from_day(day)
        .ok_or_else(|| EngineError::Computation(format!("day ordinal {day} out of calendar range")))
}

pub fn compute_critical_path(
    schedule_id: Ulid,
    items: &[ScheduleItem],
    dependencies: &[ScheduleDependency],
) -> Result<CriticalPathReport, EngineError> {
    let dag = ScheduleDag::build(items, dependencies)?;
    let graph = &dag.graph;

    let order = toposort(graph, None).map_err(|cycle| {
        EngineError::Computation(format!(
            "dependency cycle through item {}",
            graph[cycle.node_id()]
        ))
    })?;

    let n = graph.node_count();
    let mut early_start: Vec<Day> = vec![0; n];

    // Forward pass.
    for &node in &order {
        let duration = dag.duration(node);
        let driven = graph
            .edges_directed(node, Direction::Incoming)
            .map(|edge| {
                let pred = edge.source();
                let pred_start = early_start[pred.index()];
                let pred_finish = pred_start + dag.duration(pred);
                forward_constraint(edge.weight(), pred_start, pred_finish, duration)
            })
            .max();
        early_start[node.index()] = driven.unwrap_or(dag.starts[node.index()]);
    }

    let early_finish: Vec<Day> = (0..n)
        .map(|i| early_start[i] + dag.durations[i])
        .collect();
    let project_start = early_start.iter().min().copied();
    let project_finish = early_finish.iter().max().copied();

    // Backward pass. Every late finish is capped at the project finish.
    let mut late_start: Vec<Day> = vec![0; n];
    let mut late_finish: Vec<Day> = vec![0; n];
    if let Some(finish) = project_finish {
        for &node in order.iter().rev() {
            let duration = dag.duration(node);
            let lf = graph
                .edges_directed(node, Direction::Outgoing)
                .map(|edge| {
                    let succ = edge.target().index();
                    backward_constraint(edge.weight(), late_start[succ], late_finish[succ], duration)
                })
                .fold(finish, Day::min);
            late_finish[node.index()] = lf;
            late_start[node.index()] = lf - duration;
        }
    }

    let float: Vec<i64> = (0..n).map(|i| late_start[i] - early_start[i]).collect();

    let mut entries = Vec::with_capacity(n);
    for node in graph.node_indices() {
        let i = node.index();
        entries.push(ScheduleEntry {
            item_id: graph[node],
            expected_start: to_date(early_start[i])?,
            expected_finish: to_date(early_finish[i] - 1)?,
            late_start: to_date(late_start[i])?,
            late_finish: to_date(late_finish[i] - 1)?,
            float: float[i],
            is_critical: float[i] == 0,
        });
    }

    let critical_chain = trace_critical_chain(&dag, &early_start, &float);

    Ok(CriticalPathReport {
        schedule_id,
        entries,
        critical_chain,
        project_start: project_start.map(to_date).transpose()?,
        project_finish: project_finish.map(|f| to_date(f - 1)).transpose()?,
    })
}

/// Walk back from the latest-finishing zero-float item through zero-float
/// driving predecessors. Returned root first.
fn trace_critical_chain(dag: &ScheduleDag, early_start: &[Day], float: &[i64]) -> Vec<Ulid> {
    let graph = &dag.graph;
    let finish = |node: NodeIndex| early_start[node.index()] + dag.duration(node);

    let Some(mut current) = graph
        .node_indices()
        .filter(|node| float[node.index()] == 0)
        .max_by(|a, b| finish(*a).cmp(&finish(*b)).then(graph[*b].cmp(&graph[*a])))
    else {
        return Vec::new();
    };

    let mut chain = vec![graph[current]];
    while chain.len() <= graph.node_count() {
        let duration = dag.duration(current);
        let driver = graph
            .edges_directed(current, Direction::Incoming)
            .filter(|edge| float[edge.source().index()] == 0)
            .find(|edge| {
                let pred = edge.source();
                let pred_start = early_start[pred.index()];
                forward_constraint(edge.weight(), pred_start, finish(pred), duration)
                    == early_start[current.index()]
            })
            .map(|edge| edge.source());
        match driver {
            Some(pred) => {
                chain.push(graph[pred]);
                current = pred;
            }
            None => break,
        }
    }
    chain.reverse();
    chain
}

impl super::Engine {
    /// Recompute on read: clone active items and edges under the read lock,
    /// then run the pass outside it.
    pub async fn critical_path(
        &self,
        scope: &Scope,
        schedule_id: Ulid,
    ) -> Result<CriticalPathReport, EngineError> {
        self.authorize(scope)?;
        let (mut items, mut dependencies) = {
            let guard = self.schedule_read(&schedule_id, false).await?;
            let items: Vec<ScheduleItem> = guard.active_items().cloned().collect();
            let dependencies: Vec<ScheduleDependency> =
                guard.dependencies.values().cloned().collect();
            (items, dependencies)
        };
        items.sort_by_key(|i| (i.start, i.parent_id, i.sort_order, i.id));
        dependencies.sort_by_key(|d| d.id);

        let started = std::time::Instant::now();
        let result = compute_critical_path(schedule_id, &items, &dependencies);
        metrics::histogram!(crate::observability::CRITICAL_PATH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            tracing::error!("critical path failed for schedule {schedule_id}: {e}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};

    use super::*;

    /// Day 1 is 2025-03-03.
    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 3).unwrap() + Duration::days(n - 1)
    }

    fn item(start_day: i64, duration: i64) -> ScheduleItem {
        let start = day(start_day);
        ScheduleItem {
            id: Ulid::new(),
            schedule_id: Ulid::nil(),
            parent_id: None,
            task_id: None,
            name: format!("item@{start_day}"),
            kind: ItemKind::Task,
            start,
            end: start + Duration::days(duration - 1),
            duration,
            percent_complete: 0,
            status: ItemStatus::NotStarted,
            sort_order: 1,
            baseline_start: None,
            baseline_end: None,
            created_by: "planner".into(),
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    fn link(a: &ScheduleItem, b: &ScheduleItem, kind: DependencyType, lag: i32) -> ScheduleDependency {
        ScheduleDependency {
            id: Ulid::new(),
            schedule_id: Ulid::nil(),
            predecessor_id: a.id,
            successor_id: b.id,
            dependency_type: kind,
            lag,
            created_by: "planner".into(),
            created_at: 0,
        }
    }

    fn fs(a: &ScheduleItem, b: &ScheduleItem) -> ScheduleDependency {
        link(a, b, DependencyType::FinishToStart, 0)
    }

    fn run(items: &[ScheduleItem], deps: &[ScheduleDependency]) -> CriticalPathReport {
        compute_critical_path(Ulid::nil(), items, deps).unwrap()
    }

    #[test]
    fn finish_to_start_chain_is_critical() {
        let a = item(1, 3);
        let b = item(4, 3);
        let report = run(&[a.clone(), b.clone()], &[fs(&a, &b)]);

        let ea = report.entry(&a.id).unwrap();
        let eb = report.entry(&b.id).unwrap();
        assert_eq!(ea.expected_finish, day(3));
        assert_eq!(eb.expected_start, day(4));
        assert_eq!(eb.expected_finish, day(6));
        assert_eq!(ea.float, 0);
        assert_eq!(eb.float, 0);
        assert!(ea.is_critical && eb.is_critical);
        assert_eq!(report.critical_chain, vec![a.id, b.id]);
        assert_eq!(report.project_start, Some(day(1)));
        assert_eq!(report.project_finish, Some(day(6)));
    }

    #[test]
    fn successor_start_is_driven_not_stored() {
        // B is stored on day 10 but only needs A to finish.
        let a = item(1, 2);
        let b = item(10, 2);
        let report = run(&[a.clone(), b.clone()], &[fs(&a, &b)]);
        assert_eq!(report.entry(&b.id).unwrap().expected_start, day(3));
    }

    #[test]
    fn positive_and_negative_lag() {
        let a = item(1, 3);
        let b = item(1, 2);
        let c = item(1, 2);
        let report = run(
            &[a.clone(), b.clone(), c.clone()],
            &[
                link(&a, &b, DependencyType::FinishToStart, 2),
                link(&a, &c, DependencyType::FinishToStart, -1),
            ],
        );
        assert_eq!(report.entry(&b.id).unwrap().expected_start, day(6));
        assert_eq!(report.entry(&c.id).unwrap().expected_start, day(3));
    }

    #[test]
    fn start_to_start_with_lag() {
        let a = item(1, 3);
        let b = item(1, 2);
        let report = run(
            &[a.clone(), b.clone()],
            &[link(&a, &b, DependencyType::StartToStart, 1)],
        );
        let eb = report.entry(&b.id).unwrap();
        assert_eq!(eb.expected_start, day(2));
        assert_eq!(eb.expected_finish, day(3));
        assert_eq!(report.entry(&a.id).unwrap().float, 0);
        assert_eq!(eb.float, 0);
    }

    #[test]
    fn finish_to_finish_aligns_finishes() {
        let a = item(1, 3);
        let b = item(1, 2);
        let report = run(
            &[a.clone(), b.clone()],
            &[link(&a, &b, DependencyType::FinishToFinish, 0)],
        );
        let eb = report.entry(&b.id).unwrap();
        assert_eq!(eb.expected_start, day(2));
        assert_eq!(eb.expected_finish, report.entry(&a.id).unwrap().expected_finish);
    }

    #[test]
    fn start_to_finish_ends_before_predecessor_starts() {
        let a = item(5, 2);
        let b = item(1, 3);
        let report = run(
            &[a.clone(), b.clone()],
            &[link(&a, &b, DependencyType::StartToFinish, 0)],
        );
        let eb = report.entry(&b.id).unwrap();
        assert_eq!(eb.expected_start, day(2));
        assert_eq!(eb.expected_finish, day(4));
    }

    #[test]
    fn parallel_branch_gets_float() {
        let a = item(1, 3);
        let b = item(1, 1);
        let c = item(4, 2);
        let report = run(
            &[a.clone(), b.clone(), c.clone()],
            &[fs(&a, &c), fs(&b, &c)],
        );
        assert_eq!(report.entry(&a.id).unwrap().float, 0);
        assert_eq!(report.entry(&c.id).unwrap().float, 0);
        let eb = report.entry(&b.id).unwrap();
        assert_eq!(eb.float, 2);
        assert!(!eb.is_critical);
        assert_eq!(eb.late_start, day(3));
        assert_eq!(eb.late_finish, day(3));
        assert_eq!(report.critical_chain, vec![a.id, c.id]);
    }

    #[test]
    fn unlinked_short_item_has_float_to_project_finish() {
        let a = item(1, 10);
        let b = item(1, 4);
        let report = run(&[a.clone(), b.clone()], &[]);
        assert_eq!(report.entry(&a.id).unwrap().float, 0);
        assert_eq!(report.entry(&b.id).unwrap().float, 6);
    }

    #[test]
    fn cycle_is_a_computation_error() {
        let a = item(1, 1);
        let b = item(2, 1);
        let err = compute_critical_path(Ulid::nil(), &[a.clone(), b.clone()], &[fs(&a, &b), fs(&b, &a)])
            .unwrap_err();
        assert_eq!(err.kind(), "computation");
    }

    #[test]
    fn dangling_edge_is_a_computation_error() {
        let a = item(1, 1);
        let ghost = item(2, 1);
        let err = compute_critical_path(Ulid::nil(), &[a.clone()], &[fs(&a, &ghost)]).unwrap_err();
        assert!(matches!(err, EngineError::Computation(_)));
    }

    #[test]
    fn empty_schedule() {
        let report = run(&[], &[]);
        assert!(report.entries.is_empty());
        assert!(report.critical_chain.is_empty());
        assert_eq!(report.project_finish, None);
    }

    /// Tiny deterministic generator so the graph test needs no extra crates.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    #[test]
    fn zero_float_chain_connects_root_to_terminal() {
        let kinds = [
            DependencyType::FinishToStart,
            DependencyType::StartToStart,
            DependencyType::FinishToFinish,
            DependencyType::StartToFinish,
        ];
        for seed in 1..20u64 {
            let mut rng = Lcg(seed);
            let items: Vec<ScheduleItem> = (0..25)
                .map(|_| item(1 + rng.next(20) as i64, 1 + rng.next(8) as i64))
                .collect();
            let mut deps = Vec::new();
            for j in 1..items.len() {
                for _ in 0..rng.next(3) {
                    let i = rng.next(j as u64) as usize;
                    if deps.iter().any(|d: &ScheduleDependency| {
                        d.predecessor_id == items[i].id && d.successor_id == items[j].id
                    }) {
                        continue;
                    }
                    let kind = kinds[rng.next(4) as usize];
                    let lag = rng.next(5) as i32 - 2;
                    deps.push(link(&items[i], &items[j], kind, lag));
                }
            }

            let report = run(&items, &deps);
            assert!(report.entries.iter().all(|e| e.float >= 0), "seed {seed}");
            assert!(report.entries.iter().all(|e| e.expected_finish >= e.expected_start));

            let chain = &report.critical_chain;
            assert!(!chain.is_empty(), "seed {seed}");
            for id in chain {
                assert_eq!(report.entry(id).unwrap().float, 0, "seed {seed}");
            }
            for pair in chain.windows(2) {
                assert!(
                    deps.iter().any(|d| d.predecessor_id == pair[0] && d.successor_id == pair[1]),
                    "seed {seed}: chain step is not an edge"
                );
            }
            let root = chain[0];
            assert!(deps.iter().all(|d| d.successor_id != root), "seed {seed}: chain must start at a root");
            let last = report.entry(chain.last().unwrap()).unwrap();
            assert_eq!(Some(last.expected_finish), report.project_finish, "seed {seed}");
        }
    }
}
