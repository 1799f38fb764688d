//! Stress tests for relgraph.
//!
//! These runs drive many persist calls against one store, sequentially and
//! from competing threads, and report how many succeeded and how many were
//! turned away by a concurrency conflict.

use crate::fixtures::TestStore;
use relgraph_core::{CoreError, PersistRequest};
use relgraph_store::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total persist calls.
    pub total_ops: usize,
    /// Successful persist calls.
    pub successful_ops: usize,
    /// Calls rejected by a concurrency conflict.
    pub conflicts: usize,
    /// Calls that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Persist calls per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, conflicts: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + conflicts + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            conflicts,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total persists: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Conflicts: {}", self.conflicts);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} persists/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Persist calls per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct customer rows.
    pub entity_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            entity_count: 16,
        }
    }
}

#[derive(Default)]
struct Tally {
    successful: AtomicUsize,
    conflicts: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: Result<(), CoreError>) {
        let counter = match outcome {
            Ok(()) => &self.successful,
            Err(err) if err.is_concurrency_conflict() => &self.conflicts,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn result(&self, duration: Duration) -> StressTestResult {
        StressTestResult::new(
            self.successful.load(Ordering::Relaxed),
            self.conflicts.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            duration,
        )
    }
}

fn seed_customers(store: &TestStore, config: &StressConfig) {
    for key in 1..=config.entity_count as i64 {
        store.seed_customer(key, "initial", 1);
    }
}

fn rename(store: &TestStore, key: i64, name: String) -> Result<(), CoreError> {
    let mut context = store.context();
    let customer = context.get_or_create("Customer", Value::Integer(key))?;
    context.set_value(customer, "name", Value::Text(name))?;
    context.persist(&PersistRequest::new().save(customer))?;
    Ok(())
}

fn insert_order(store: &TestStore, i: usize) -> Result<(), CoreError> {
    let mut context = store.context();
    let order = context.new_model("Order")?.id();
    context.set_value(order, "number", Value::Text(format!("G-{i}")))?;
    for quantity in 0..3 {
        let line = context.new_model("OrderLine")?.id();
        context.set_value(line, "quantity", Value::Integer(quantity))?;
        context.collection_add(order, "lines", line)?;
    }
    context.persist(&PersistRequest::new().save(order))?;
    Ok(())
}

/// Renames customers one after another, each in a fresh context.
pub fn stress_sequential_updates(store: &TestStore, config: &StressConfig) -> StressTestResult {
    seed_customers(store, config);
    let tally = Tally::default();
    let start = Instant::now();

    for i in 0..config.operations {
        let key = (i % config.entity_count) as i64 + 1;
        tally.record(rename(store, key, format!("seq-{i}")));
    }

    tally.result(start.elapsed())
}

/// Creates orders with lines, one graph per persist call.
pub fn stress_graph_inserts(store: &TestStore, config: &StressConfig) -> StressTestResult {
    let tally = Tally::default();
    let start = Instant::now();

    for i in 0..config.operations {
        tally.record(insert_order(store, i));
    }

    tally.result(start.elapsed())
}

/// Renames the same few customers from competing threads.
///
/// Every thread works on its own connection. Lost updates are impossible:
/// each successful call advances exactly one lock token.
pub fn stress_concurrent_updates(store: &TestStore, config: &StressConfig) -> StressTestResult {
    seed_customers(store, config);
    let tally = Arc::new(Tally::default());
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let store = store.clone();
            let tally = Arc::clone(&tally);
            let operations = config.operations;
            let entity_count = config.entity_count;

            thread::spawn(move || {
                for i in 0..operations {
                    let key = ((t + i) % entity_count) as i64 + 1;
                    tally.record(rename(&store, key, format!("t{t}-{i}")));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    tally.result(start.elapsed())
}

/// Sum of the lock tokens advanced past their seeded value.
pub fn lock_advances(store: &TestStore, config: &StressConfig) -> usize {
    (1..=config.entity_count as i64)
        .filter_map(|key| store.column("customers", key, "version"))
        .filter_map(|version| version.as_integer())
        .map(|version| (version - 1) as usize)
        .sum()
}
