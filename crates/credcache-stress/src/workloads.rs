use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use credcache::{BoxError, CacheError, GetOptions, Token, TokenCache};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let config: Self =
            serde_yaml::from_reader(reader).context("failed to parse workloads YAML")?;
        for (i, workload) in config.workloads.iter().enumerate() {
            workload
                .validate()
                .with_context(|| format!("invalid workload {i}"))?;
        }
        Ok(config)
    }
}

/// A set of lookups running against the cache with a fixed concurrency.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    /// Number of lookups in flight at any time.
    pub concurrency: usize,
    /// Number of distinct keys, every lookup picks one at random.
    pub keys: usize,
    /// How long producing a token takes.
    #[serde(with = "humantime_serde")]
    pub producer_latency: Duration,
    /// The lifetime of produced tokens.
    #[serde(with = "humantime_serde")]
    pub token_lifetime: Duration,
    /// The fraction of token productions that fail.
    #[serde(default)]
    pub failure_rate: f64,
}

impl Workload {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.concurrency > 0, "concurrency must be positive");
        anyhow::ensure!(self.keys > 0, "keys must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.failure_rate),
            "failure_rate must be between 0 and 1"
        );
        Ok(())
    }
}

/// A token without any payload, expiring after its lifetime.
#[derive(Debug, Clone)]
pub struct StressToken {
    expires_at: Instant,
}

impl Token for StressToken {
    fn duration(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Counts calls of the token producer, across all lookups of one workload.
#[derive(Debug, Default)]
pub struct ProducerStats {
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl ProducerStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Performs a single lookup of a random key of `workload`.
///
/// Returns whether the token was served from the cache.
pub async fn process_workload(
    cache: &TokenCache<StressToken>,
    index: usize,
    workload: &Workload,
    stats: &Arc<ProducerStats>,
) -> Result<bool, CacheError> {
    let key = rand::rng().random_range(0..workload.keys);
    let key = format!("workload-{index}/key-{key}");

    let Workload {
        producer_latency,
        token_lifetime,
        failure_rate,
        ..
    } = *workload;
    let stats = Arc::clone(stats);
    let produce = move |cancel: CancellationToken| async move {
        stats.calls.fetch_add(1, Ordering::Relaxed);
        let fail = rand::rng().random_bool(failure_rate);

        tokio::select! {
            _ = cancel.cancelled() => return Err::<_, BoxError>("cancelled".into()),
            _ = tokio::time::sleep(producer_latency) => {}
        }

        if fail {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            return Err("simulated failure".into());
        }
        Ok(StressToken {
            expires_at: Instant::now() + token_lifetime,
        })
    };

    let cancel = CancellationToken::new();
    let (_token, from_cache) = cache
        .get_or_set(&cancel, &key, produce, &GetOptions::default())
        .await?;
    Ok(from_cache)
}
