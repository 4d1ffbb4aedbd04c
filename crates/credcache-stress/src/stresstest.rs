use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use credcache::TokenCache;
use credcache::config::Config;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{ProducerStats, StressToken, WorkloadsConfig, process_workload};

#[derive(Default)]
struct WorkloadResults {
    durations: Mutex<DDSketch>,
    hits: AtomicUsize,
    errors: AtomicUsize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache: TokenCache<StressToken> =
        TokenCache::new(&config.cache).context("failed to create token cache")?;

    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| (Arc::new(workload), Arc::new(ProducerStats::default())))
        .collect();
    tracing::info!(workloads = workloads.len(), ?duration, "Starting stresstest");

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().enumerate().map(|(i, (workload, stats))| {
            let cache = cache.clone();
            let workload = Arc::clone(workload);
            let stats = Arc::clone(stats);
            tokio::spawn(async move { process_workload(&cache, i, &workload, &stats).await })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (i, (workload, stats)) in workloads.into_iter().enumerate() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = cache.clone();

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let results = Arc::new(WorkloadResults::default());
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let cache = cache.clone();
                        let workload = Arc::clone(&workload);
                        let stats = Arc::clone(&stats);
                        let results = Arc::clone(&results);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let future = async move {
                            match process_workload(&cache, i, &workload, &stats).await {
                                Ok(true) => {
                                    results.hits.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(false) => {}
                                Err(_) => {
                                    results.errors.fetch_add(1, Ordering::Relaxed);
                                }
                            }

                            results
                                .durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };

                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            (workload, stats, results)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, stats, results) = task.context("workload task panicked")?;
        let concurrency = workload.concurrency;

        let durations = results
            .durations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        let hits = results.hits.load(Ordering::Relaxed);
        let errors = results.errors.load(Ordering::Relaxed);
        let calls = stats.calls();
        let failures = stats.failures();
        println!(
            "  cache hits: {hits}; errors: {errors}; producer calls: {calls} ({failures} failed)"
        );

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    cache.shutdown();

    Ok(())
}
