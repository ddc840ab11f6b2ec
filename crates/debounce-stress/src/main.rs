//! Exercises a [`Debouncer`] with a stream of staggered requests against a
//! slow simulated origin, and reports how many requests actually hit the
//! origin versus being debounced or served from the cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use debounce_cache::{CacheResult, Debouncer, OriginSource};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// A workload of staggered cache requests.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct Workload {
    /// Total number of requests to issue.
    requests: usize,
    /// Number of distinct keys the requests are spread over.
    keys: u32,
    /// Pause between consecutive request arrivals.
    #[serde(with = "humantime_serde")]
    arrival_interval: Duration,
    /// Simulated latency of one origin fetch.
    #[serde(with = "humantime_serde")]
    fetch_latency: Duration,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            requests: 100,
            keys: 2,
            arrival_interval: Duration::from_millis(50),
            fetch_latency: Duration::from_millis(1000),
        }
    }
}

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to a workload definition file (YAML).
    #[arg(long = "workload", short = 'w', value_name = "FILE")]
    workload: Option<PathBuf>,
}

/// An origin that sleeps for the configured latency and counts fetches.
struct SimulatedOrigin {
    fetch_latency: Duration,
    fetches: Arc<AtomicUsize>,
}

impl OriginSource for SimulatedOrigin {
    type Key = u32;
    type Value = String;

    fn fetch(&self, key: &u32) -> BoxFuture<'_, CacheResult<String>> {
        let key = *key;
        async move {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.fetch_latency).await;
            Ok(format!("data for key {key}"))
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let workload: Workload = match cli.workload {
        Some(path) => {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("failed to open workload file {}", path.display()))?;
            serde_yaml::from_reader(file).context("failed to parse workload YAML")?
        }
        None => Workload::default(),
    };
    tracing::info!(?workload, "starting workload");

    let fetches = Arc::new(AtomicUsize::new(0));
    let debouncer = Debouncer::new(SimulatedOrigin {
        fetch_latency: workload.fetch_latency,
        fetches: Arc::clone(&fetches),
    });

    let start = Instant::now();
    let mut requests = Vec::with_capacity(workload.requests);
    for i in 0..workload.requests {
        // Requests arrive some interval apart rather than all at once.
        tokio::time::sleep(workload.arrival_interval).await;

        let debouncer = debouncer.clone();
        let key = i as u32 % workload.keys + 1;
        requests.push(tokio::spawn(async move { debouncer.get(key).await }));
    }

    let mut failed = 0;
    for request in requests {
        if request.await?.is_err() {
            failed += 1;
        }
    }

    let fetched = fetches.load(Ordering::Relaxed);
    println!("Requests issued:     {}", workload.requests);
    println!("Fetched from origin: {fetched}");
    println!("Debounced or cached: {}", workload.requests - failed - fetched);
    if failed > 0 {
        println!("Failed:              {failed}");
    }
    println!("Time taken:          {:.2?}", start.elapsed());

    Ok(())
}
