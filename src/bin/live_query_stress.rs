//! Live Query Stress Test Binary
//!
//! Executes many live queries concurrently while events are being appended
//! and checks the engine's guarantees afterwards.
//! Run with: `cargo run --bin live_query_stress -- [OPTIONS]`
//!
//! This is separate from the regular test suite because:
//! 1. It can take a long time to run
//! 2. It's configurable via command-line arguments
//! 3. It reports detailed metrics
//!
//! # Examples
//!
//! ```bash
//! # Default test: 8 partitions, 32 queries each, 2000 events
//! cargo run --release --bin live_query_stress
//!
//! # Many queries racing for few partitions
//! cargo run --release --bin live_query_stress -- --partitions 2 --queries 500 --events 10000
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spitedb_live::{
    Event, InMemoryEventStore, LiveResult, Model, PartitionId, PartitionKey, Projection, Query, QueryEngine,
    QueryOptions,
};

/// Stress test configuration
struct Config {
    /// Number of keyed partitions
    num_partitions: usize,
    /// Live queries executed per partition
    queries_per_partition: usize,
    /// Total number of events to append
    num_events: usize,
    /// Seconds to wait for live queries to converge
    settle_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_partitions: 8,
            queries_per_partition: 32,
            num_events: 2000,
            settle_secs: 10,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--partitions" | "-p" => {
                i += 1;
                config.num_partitions = args[i].parse().expect("Invalid --partitions value");
            }
            "--queries" | "-q" => {
                i += 1;
                config.queries_per_partition = args[i].parse().expect("Invalid --queries value");
            }
            "--events" | "-e" => {
                i += 1;
                config.num_events = args[i].parse().expect("Invalid --events value");
            }
            "--settle" => {
                i += 1;
                config.settle_secs = args[i].parse().expect("Invalid --settle value");
            }
            "--help" | "-h" => {
                println!(
                    r#"Live Query Stress Test

Usage: live_query_stress [OPTIONS]

Options:
  -p, --partitions <N>  Number of keyed partitions (default: 8)
  -q, --queries <N>     Live queries per partition (default: 32)
  -e, --events <N>      Total events to append (default: 2000)
  --settle <SECS>       Time allowed for results to converge (default: 10)
  -h, --help            Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

// =============================================================================
// Model
// =============================================================================

#[derive(Default)]
struct Tally {
    ticks: HashMap<PartitionKey, u64>,
}

impl Model for Tally {}

#[derive(Debug)]
struct Ticked {
    partition: PartitionKey,
}

impl Event for Ticked {
    const NAME: &'static str = "Ticked";
}

/// Tick count of one partition; `observer` makes every query value distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TickCount {
    partition: PartitionKey,
    observer: usize,
}

impl Query for TickCount {
    type Model = Tally;
    type Result = u64;
}

#[tokio::main]
async fn main() {
    let config = parse_args();

    println!("Live Query Stress Test");
    println!("======================");
    println!("Partitions:  {}", config.num_partitions);
    println!("Queries:     {} per partition", config.queries_per_partition);
    println!("Events:      {}", config.num_events);
    println!();

    let store = Arc::new(InMemoryEventStore::new());
    let engine = QueryEngine::<Tally>::builder(store.clone())
        .projection(
            Projection::builder("tally")
                .on::<Ticked, _>(|model: &mut Tally, _meta, ev| {
                    *model.ticks.entry(ev.partition).or_default() += 1;
                })
                .build(),
        )
        .query::<TickCount, _>(|model, query| Ok(model.ticks.get(&query.partition).copied().unwrap_or(0)))
        .partitioner::<TickCount, _>(|_, query| Some(query.partition))
        .build()
        .unwrap();

    let partitions: Vec<PartitionKey> = (0..config.num_partitions).map(|_| PartitionKey::new()).collect();

    println!("Starting stress test...");
    let start = Instant::now();

    // Writer appends while queries are being executed
    let writer = {
        let store = store.clone();
        let schema = engine.schema().clone();
        let partitions = partitions.clone();
        let num_events = config.num_events;
        tokio::spawn(async move {
            for i in 0..num_events {
                let partition = partitions[i % partitions.len()];
                store.append(&schema, PartitionId::Keyed(partition), Ticked { partition });
                if i % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let mut handles = Vec::new();
    for observer in 0..config.queries_per_partition {
        for &partition in &partitions {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .execute(TickCount { partition, observer }, QueryOptions::default())
                    .await
            }));
        }
    }

    let mut live: Vec<LiveResult<TickCount>> = Vec::new();
    let mut errors = 0usize;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => live.push(result),
            Err(_) => errors += 1,
        }
    }
    writer.await.unwrap();
    let executed = start.elapsed();

    // Let the last batches drain
    let mut expected: HashMap<PartitionKey, u64> = HashMap::new();
    for i in 0..config.num_events {
        *expected.entry(partitions[i % partitions.len()]).or_default() += 1;
    }

    let deadline = Instant::now() + Duration::from_secs(config.settle_secs);
    let converged = loop {
        let lagging = live
            .iter()
            .filter(|l| l.result() != Some(expected.get(&l.query().partition).copied().unwrap_or(0)))
            .count();
        if lagging == 0 {
            break true;
        }
        if Instant::now() > deadline {
            println!("  {} live queries did not converge", lagging);
            break false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let elapsed = start.elapsed();

    let updates: u64 = live.iter().map(|l| l.version().saturating_sub(1)).sum();

    println!();
    println!("Results");
    println!("-------");
    println!("Live queries:    {}", live.len());
    println!("Errors:          {}", errors);
    println!("Updates pushed:  {}", updates);
    println!("Execute phase:   {:?}", executed);
    println!("Total duration:  {:?}", elapsed);
    println!(
        "Throughput:      {:.2} updates/sec",
        updates as f64 / elapsed.as_secs_f64()
    );
    println!();

    // Verify invariants
    println!("Verifying invariants...");

    assert_eq!(errors, 0, "{} executes failed", errors);
    assert_eq!(
        store.subscription_count(),
        config.num_partitions,
        "Subscription count mismatch: {} opened for {} partitions",
        store.subscription_count(),
        config.num_partitions
    );
    println!("  Subscribe-once:    {} subscriptions ✓", store.subscription_count());

    assert_eq!(engine.live_query_count(), live.len());
    println!("  Live index:        {} live queries ✓", engine.live_query_count());

    assert!(converged, "live queries did not converge");
    println!("  No missed events:  every result matches the log ✓");

    engine.shutdown();
    assert_eq!(engine.live_query_count(), 0);
    println!("  Shutdown:          all live queries disposed ✓");

    println!();
    println!("Stress test PASSED ✓");
}
