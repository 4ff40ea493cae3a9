//! # Multiplexer Load Driver
//!
//! Purpose: Push many concurrent callers through one multiplexed connection
//! and report throughput alongside the completion counters.
//!
//! Usage: `hkv-bench [addr] [callers] [ops-per-caller]`
//!
//! ## Design Principles
//! 1. **One Connection**: Every caller shares a single `Multiplexer`.
//! 2. **Both Wait Styles**: One phase suspends tasks, one blocks threads.
//! 3. **Self-Checking**: Every echoed payload is compared with what was sent.

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use hkv_client::{ClientConfig, Multiplexer, RespValue};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_CALLERS: usize = 64;
const DEFAULT_OPS_PER_CALLER: usize = 10_000;

struct BenchConfig {
    addr: String,
    callers: usize,
    ops_per_caller: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let callers = parse_usize(args.next(), DEFAULT_CALLERS).max(1);
        let ops_per_caller = parse_usize(args.next(), DEFAULT_OPS_PER_CALLER).max(1);
        BenchConfig {
            addr,
            callers,
            ops_per_caller,
        }
    }

    fn total_ops(&self) -> usize {
        self.callers * self.ops_per_caller
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.2} us/op)");
}

fn check_echo(reply: RespValue, payload: &[u8]) -> anyhow::Result<()> {
    match reply {
        RespValue::Bulk(Some(data)) if data == payload => Ok(()),
        other => bail!("unexpected PING reply: {other:?}"),
    }
}

async fn run_async(mux: &Arc<Multiplexer>, config: &BenchConfig) -> anyhow::Result<()> {
    let mut tasks = Vec::with_capacity(config.callers);
    for caller in 0..config.callers {
        let mux = Arc::clone(mux);
        let ops = config.ops_per_caller;
        tasks.push(tokio::spawn(async move {
            let payload = format!("async-{caller}");
            for _ in 0..ops {
                let reply = mux.execute(&[b"PING", payload.as_bytes()]).await?;
                check_echo(reply, payload.as_bytes())?;
            }
            anyhow::Ok(())
        }));
    }
    for task in tasks {
        task.await.context("async caller panicked")??;
    }
    Ok(())
}

async fn run_blocking(mux: &Arc<Multiplexer>, config: &BenchConfig) -> anyhow::Result<()> {
    let mut threads = Vec::with_capacity(config.callers);
    for caller in 0..config.callers {
        let mux = Arc::clone(mux);
        let ops = config.ops_per_caller;
        threads.push(tokio::task::spawn_blocking(move || {
            let payload = format!("blocking-{caller}");
            for _ in 0..ops {
                let reply = mux.execute_blocking(&[b"PING", payload.as_bytes()])?;
                check_echo(reply, payload.as_bytes())?;
            }
            anyhow::Ok(())
        }));
    }
    for thread in threads {
        thread.await.context("blocking caller panicked")??;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = BenchConfig::from_args();
    let client_config = ClientConfig {
        addr: config.addr.clone(),
        connect_timeout: Some(Duration::from_secs(3)),
        ..ClientConfig::default()
    };
    let mux = Arc::new(
        Multiplexer::connect(client_config)
            .await
            .with_context(|| format!("connecting to {}", config.addr))?,
    );
    tracing::info!(peer = %mux.peer_addr(), callers = config.callers, "connected");

    println!(
        "addr={}, callers={}, ops_per_caller={}",
        config.addr, config.callers, config.ops_per_caller
    );

    let start = Instant::now();
    run_async(&mux, &config).await?;
    report("PING (async)", config.total_ops(), start.elapsed());

    let start = Instant::now();
    run_blocking(&mux, &config).await?;
    report("PING (blocking)", config.total_ops(), start.elapsed());

    let stats = mux.stats();
    println!(
        "completions: sync={}, async={}, failed_async={}, write_generation={}",
        stats.completions.completed_sync,
        stats.completions.completed_async,
        stats.completions.failed_async,
        stats.write_generation
    );
    mux.close();
    Ok(())
}
