//! # Pool Benchmark Harness
//!
//! Purpose: Measure acquire/release throughput of the connection pool under
//! a skewed endpoint mix.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Prebuilt Endpoints**: Hostnames are formatted before timing starts.
//! 3. **Eviction Pressure**: The capacity argument below the endpoint count
//!    forces the LRU path on every miss.
//!
//! Usage: `bench_pool [endpoints] [ops] [capacity]`. Set `RUST_LOG=debug` to
//! see pool diagnostics.

use std::env;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use psl_pool::{ConnectionPool, PoolConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ENDPOINT_COUNT: usize = 1 << 10;
const DEFAULT_OP_COUNT: usize = 1_000_000;
const DEFAULT_CAPACITY: usize = 256;

struct BenchConfig {
    endpoint_count: usize,
    endpoint_mask: usize,
    op_count: usize,
    capacity: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let endpoint_count = parse_usize(args.next(), DEFAULT_ENDPOINT_COUNT)
            .max(1)
            .next_power_of_two();
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let capacity = parse_usize(args.next(), DEFAULT_CAPACITY);

        BenchConfig {
            endpoint_count,
            endpoint_mask: endpoint_count - 1,
            op_count,
            capacity,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    // Minimum of two draws skews traffic towards low indices.
    #[inline]
    fn next_skewed(&mut self, mask: usize) -> usize {
        let a = (self.next_u64() as usize) & mask;
        let b = (self.next_u64() as usize) & mask;
        a.min(b)
    }
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("bench_pool failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args();
    let hosts: Vec<String> = (0..config.endpoint_count)
        .map(|i| format!("node-{i:04}.bench"))
        .collect();

    let disposed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disposed);
    let pool: ConnectionPool<u64> = ConnectionPool::new(
        PoolConfig {
            type_name: "bench".to_string(),
            table_size: config.endpoint_count,
            capacity: config.capacity,
        },
        move |payload| {
            black_box(payload);
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        },
    );

    info!(
        endpoints = config.endpoint_count,
        ops = config.op_count,
        capacity = config.capacity,
        "starting pool benchmark"
    );

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let mut created = 0usize;
    let start = Instant::now();
    for _ in 0..config.op_count {
        let host = &hosts[rng.next_skewed(config.endpoint_mask)];
        let (conn, fresh) = pool
            .acquire(host, 600, "bench")
            .with_context(|| format!("acquire {host}"))?;
        created += usize::from(fresh);
        black_box(*conn);
    }
    report("ACQUIRE+RELEASE", config.op_count, start.elapsed());

    let stats = pool.stats();
    println!(
        "created={created}, disposed={}, cached={}, free={}",
        disposed.load(Ordering::Relaxed),
        stats.cached,
        stats.free
    );

    let start = Instant::now();
    let drained = pool.shutdown();
    report("SHUTDOWN", drained.max(1), start.elapsed());
    Ok(())
}
