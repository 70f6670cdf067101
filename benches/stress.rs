use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date")
}

fn day(offset: i64) -> NaiveDate {
    base_date() + Days::days(offset)
}

async fn connect(host: &str, port: u16, company: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(company)
        .user("bench")
        .password("crewplan");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_company() -> String {
    format!("bench_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn create_crew(client: &tokio_postgres::Client) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, kind, role) VALUES ('{rid}', 'Framing crew', 'labor', 'carpenter')"
        ))
        .await
        .unwrap();
    rid
}

fn allocation_sql(rid: Ulid, start: NaiveDate, end: NaiveDate, utilization: u8) -> String {
    format!(
        "INSERT INTO allocations (id, resource_id, project_id, start_date, end_date, utilization) \
         VALUES ('{}', '{rid}', '{}', '{start}', '{end}', {utilization})",
        Ulid::new(),
        Ulid::new()
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_company()).await;
    let rid = create_crew(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n as i64 {
        let t = Instant::now();
        client
            .batch_execute(&allocation_sql(rid, day(i), day(i), 100))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} allocations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("commit latency", &mut latencies);
}

/// Many clients race for the same crew over the same fortnight. The
/// committed total must never pass 100%.
async fn phase2_contention(host: &str, port: u16) {
    let company = fresh_company();
    let setup = connect(host, port, &company).await;
    let rid = create_crew(&setup).await;

    let n_tasks = 20;
    let attempts_per_task = 20;
    let committed = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let company = company.clone();
        let committed = committed.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &company).await;
            for _ in 0..attempts_per_task {
                match client.batch_execute(&allocation_sql(rid, day(0), day(13), 5)).await {
                    Ok(()) => committed.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let ok = committed.load(Ordering::Relaxed);
    let refused = rejected.load(Ordering::Relaxed);
    println!(
        "  {} attempts in {:.2}s: {ok} committed ({}%), {refused} refused",
        n_tasks * attempts_per_task,
        elapsed.as_secs_f64(),
        ok * 5
    );
    assert!(ok * 5 <= 100, "crew overbooked: {}%", ok * 5);
}

/// Critical path recomputation on a long finish-to-start chain while
/// writers keep adding allocations to other tenants.
async fn phase3_critical_path(host: &str, port: u16) {
    let client = connect(host, port, &fresh_company()).await;
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO schedules (id, project_id, name, start_date, end_date) \
             VALUES ('{sid}', '{}', 'High-rise', '2025-01-01', '2030-12-31')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let n_items = 500i64;
    let mut previous: Option<Ulid> = None;
    for i in 0..n_items {
        let id = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO schedule_items (id, schedule_id, name, start_date, duration) \
                 VALUES ('{id}', '{sid}', 'Floor {i}', '{}', 3)",
                day(i * 3)
            ))
            .await
            .unwrap();
        if let Some(prev) = previous {
            client
                .batch_execute(&format!(
                    "INSERT INTO schedule_dependencies (id, predecessor_id, successor_id) \
                     VALUES ('{}', '{prev}', '{id}')",
                    Ulid::new()
                ))
                .await
                .unwrap();
        }
        previous = Some(id);
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..4 {
        let host = host.to_string();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_company()).await;
            let rid = create_crew(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&allocation_sql(rid, day(i), day(i), 100)).await;
                i += 1;
            }
        }));
    }

    let mut latencies = Vec::with_capacity(200);
    for _ in 0..200 {
        let t = Instant::now();
        client
            .simple_query(&format!("SELECT * FROM critical_path WHERE schedule_id = '{sid}'"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency(&format!("critical path ({n_items} items)"), &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_company()).await;
            let rid = create_crew(&client).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&allocation_sql(rid, day(i), day(i), 50))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("CREWPLAN_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("CREWPLAN_PORT")
        .unwrap_or_else(|_| "5434".into())
        .parse()
        .expect("invalid CREWPLAN_PORT");

    println!("=== crewplan stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential allocation throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended allocations on one crew");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] critical path latency under write load");
    phase3_critical_path(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
