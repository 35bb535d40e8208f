use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, ensure};
use clap::Parser;
use coalesce::{CancellationToken, ComputationCache, Driver, GetError};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::Semaphore;

/// Hammers a single-flight cache with concurrent, randomly cancelled lookups.
///
/// Keys rotate through a fresh window every few computation latencies, so the
/// run keeps exercising misses, coalescing, owner cancellation and restarts
/// rather than settling into pure cache hits.
#[derive(Parser)]
struct Cli {
    /// Duration of the stresstest.
    #[arg(long, short = 'd', default_value = "10s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Number of lookups kept in flight at once.
    #[arg(long, short = 'c', default_value_t = 256)]
    concurrency: usize,

    /// Number of distinct keys per window.
    #[arg(long, short = 'k', default_value_t = 32)]
    keys: u64,

    /// Simulated computation latency.
    #[arg(long, default_value = "25ms", value_parser = humantime::parse_duration)]
    latency: Duration,

    /// Probability that a lookup cancels before the latency elapses.
    #[arg(long, default_value_t = 0.2)]
    cancel_probability: f64,
}

struct SlowDriver {
    latency: Duration,
    computations: Arc<AtomicUsize>,
}

impl Driver for SlowDriver {
    type Key = u64;
    type Value = u64;
    type Error = Infallible;

    fn compute(
        &self,
        key: u64,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<u64, Infallible>> {
        self.computations.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency;
        Box::pin(async move {
            tokio::time::sleep(latency).await;
            Ok(key.wrapping_mul(2))
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt::init();

    let computations = Arc::new(AtomicUsize::new(0));
    let cache = ComputationCache::new(SlowDriver {
        latency: cli.latency,
        computations: Arc::clone(&computations),
    });

    // warmup: touch every key of the first window once so the steady state
    // starts with a populated entry map
    {
        let start = Instant::now();

        let lookups = (0..cli.keys).map(|key| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(key, CancellationToken::new()).await })
        });
        let _results = futures::future::join_all(lookups).await;

        println!("Warmup: {:?}", start.elapsed());
    }
    println!();

    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + cli.duration);
    let semaphore = Arc::new(Semaphore::new(cli.concurrency));
    let served = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));

    // Keys move to a fresh window every few latencies.
    let window = (cli.latency.as_millis() as u64 * 4).max(1);

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => {
                let cache = cache.clone();
                let served = Arc::clone(&served);
                let cancelled = Arc::clone(&cancelled);

                let mut rng = rand::rng();
                let key = (start.elapsed().as_millis() as u64 / window) * cli.keys
                    + rng.random_range(0..cli.keys);

                let cancel = CancellationToken::new();
                if rng.random_bool(cli.cancel_probability) {
                    let cancel = cancel.clone();
                    let fuse = rng.random_range(0..cli.latency.as_millis().max(1) as u64);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(fuse)).await;
                        cancel.cancel();
                    });
                }

                tokio::spawn(async move {
                    match cache.get(key, cancel).await {
                        Ok(_) => {
                            served.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(GetError::Cancelled) => {
                            cancelled.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => panic!("unexpected lookup failure: {err}"),
                    }

                    drop(permit);
                });
            }
            _ = &mut sleep => {
                break;
            }
        }
    }

    // by acquiring *all* the semaphores, we essentially wait for all outstanding lookups to finish
    let _permits = semaphore
        .acquire_many(cli.concurrency as u32)
        .await
        .expect("semaphore closed");

    let served = served.load(Ordering::Relaxed);
    let cancelled = cancelled.load(Ordering::Relaxed);
    let computations = computations.load(Ordering::Relaxed);
    let lookups = served + cancelled;
    let ops_ps = lookups as f32 / cli.duration.as_secs_f32();

    println!("{lookups} lookups ({served} served, {cancelled} cancelled), {ops_ps:.2} ops/s");
    println!("{computations} driver computations");

    // Every computation must be attributable to at least one lookup; a
    // violation means the cache ran duplicate work.
    ensure!(
        computations <= lookups + cli.keys as usize,
        "more computations ({computations}) than lookups ({lookups})"
    );

    Ok(())
}
