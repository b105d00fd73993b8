//! # Pool Benchmark Harness
//!
//! Purpose: Drive a live broker through the pooled client so put/reserve/
//! delete throughput can be compared across pool sizes over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Bodies come from a fixed-seed PRNG.
//! 2. **Allocation Control**: Bodies are built before the clock starts.
//! 3. **Shared Pool**: Every worker checks connections out of one pool, so
//!    contention on the slot queue is part of the measurement.
//!
//! Usage: `tubeq-bench [workers] [jobs_per_worker] [body_size] [--json]`.
//! The broker address and pool settings come from `TUBEQ_*` variables.

use std::env;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tubeq_client::{ConnectionPool, PoolConfig};

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_JOBS_PER_WORKER: usize = 10_000;
const DEFAULT_BODY_SIZE: usize = 128;
const BENCH_TUBE: &str = "tubeq-bench";
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const TTR: Duration = Duration::from_secs(60);

struct BenchConfig {
    workers: usize,
    jobs_per_worker: usize,
    body_size: usize,
    json: bool,
}

impl BenchConfig {
    fn from_args() -> Self {
        let (flags, positional): (Vec<String>, Vec<String>) =
            env::args().skip(1).partition(|arg| arg.starts_with("--"));
        let mut args = positional.into_iter();
        BenchConfig {
            workers: parse_usize(args.next(), DEFAULT_WORKERS).max(1),
            jobs_per_worker: parse_usize(args.next(), DEFAULT_JOBS_PER_WORKER),
            body_size: parse_usize(args.next(), DEFAULT_BODY_SIZE),
            json: flags.iter().any(|flag| flag == "--json"),
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG for body contents.
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
}

fn build_bodies(count: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = XorShift64::new(seed);
    (0..count)
        .map(|_| {
            let mut body = vec![0u8; size];
            for chunk in body.chunks_mut(8) {
                let bytes = rng.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
            body
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct PhaseReport {
    phase: &'static str,
    ops: usize,
    seconds: f64,
    ops_per_sec: f64,
    micros_per_op: f64,
}

#[derive(Debug, Serialize)]
struct Summary {
    addr: String,
    capacity: usize,
    workers: usize,
    jobs_per_worker: usize,
    body_size: usize,
    phases: Vec<PhaseReport>,
}

fn report(phase: &'static str, ops: usize, elapsed: Duration) -> PhaseReport {
    let seconds = elapsed.as_secs_f64();
    let ops_per_sec = if seconds > 0.0 { ops as f64 / seconds } else { 0.0 };
    let micros_per_op = if ops > 0 { seconds * 1e6 / ops as f64 } else { 0.0 };
    PhaseReport {
        phase,
        ops,
        seconds,
        ops_per_sec,
        micros_per_op,
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("tubeq-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let bench = BenchConfig::from_args();
    let pool_config = PoolConfig::from_env();
    let addr = pool_config.addr.clone();
    if pool_config.capacity == 0 {
        bail!("TUBEQ_POOL_CAPACITY must be at least 1");
    }
    let pool = ConnectionPool::with_config(pool_config);

    tracing::info!(
        %addr,
        capacity = pool.capacity(),
        workers = bench.workers,
        jobs_per_worker = bench.jobs_per_worker,
        body_size = bench.body_size,
        "starting benchmark"
    );

    let total = bench.workers * bench.jobs_per_worker;
    let mut phases = Vec::with_capacity(2);

    let start = Instant::now();
    let handles: Vec<_> = (0..bench.workers)
        .map(|worker| {
            let pool = pool.clone();
            let bodies = build_bodies(bench.jobs_per_worker, bench.body_size, 0xA5A5_0000 ^ worker as u64);
            thread::spawn(move || -> Result<()> {
                for body in &bodies {
                    let mut conn = pool.acquire(ACQUIRE_TIMEOUT)?;
                    conn.put(BENCH_TUBE, body, 1024, Duration::ZERO, TTR)
                        .context("put")?;
                }
                Ok(())
            })
        })
        .collect();
    join_workers(handles)?;
    phases.push(report("PUT", total, start.elapsed()));

    let start = Instant::now();
    let handles: Vec<_> = (0..bench.workers)
        .map(|_| {
            let pool = pool.clone();
            let jobs = bench.jobs_per_worker;
            thread::spawn(move || -> Result<()> {
                for _ in 0..jobs {
                    // Watch lists are per connection and the pool may hand out any of them.
                    let mut conn = pool.acquire(ACQUIRE_TIMEOUT)?;
                    conn.watch(BENCH_TUBE).context("watch")?;
                    let job = conn.reserve_with_timeout(Duration::from_secs(1)).context("reserve")?;
                    conn.delete(job.id).context("delete")?;
                }
                Ok(())
            })
        })
        .collect();
    join_workers(handles)?;
    phases.push(report("WATCH+RESERVE+DELETE", total, start.elapsed()));

    let summary = Summary {
        addr,
        capacity: pool.capacity(),
        workers: bench.workers,
        jobs_per_worker: bench.jobs_per_worker,
        body_size: bench.body_size,
        phases,
    };
    if bench.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for phase in &summary.phases {
            println!(
                "{}: {} ops in {:.3}s ({:.0} ops/s, {:.1} us/op)",
                phase.phase, phase.ops, phase.seconds, phase.ops_per_sec, phase.micros_per_op
            );
        }
        println!("pool: {}", pool.stat());
    }

    pool.shutdown();
    Ok(())
}

fn join_workers(handles: Vec<thread::JoinHandle<Result<()>>>) -> Result<()> {
    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("worker thread panicked"),
        }
    }
    Ok(())
}
