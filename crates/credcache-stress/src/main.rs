use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use credcache::config::Config;
use humantime::parse_duration;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Hammers a token cache with concurrent lookups and reports throughput and latency.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable tracing, with all output discarded.
    #[arg(long)]
    tracing: bool,

    /// Send metrics to a local UDP sink, unless a statsd server is configured.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads = WorkloadsConfig::from_reader(workloads_file)?;
    let config = Config::get(cli.config.as_deref())?;

    // logging needs to be set up while still single-threaded
    let mut logging = logging::init(logging::Config {
        logging: config.logging.clone(),
        metrics: config.metrics.clone(),
        sentry_dsn: config.sentry_dsn.clone(),
        tracing: cli.tracing,
        local_metrics: cli.metrics,
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let udp_sink = logging.udp_sink.take();
    let result = runtime.block_on(async move {
        if let Some(udp_sink) = udp_sink {
            tokio::spawn(udp_sink);
        }

        let result = perform_stresstest(config, workloads, cli.duration).await;
        if let Err(ref error) = result {
            credcache::logging::ensure_log_error(error);
        }
        result
    });

    // flushes pending error reports
    drop(logging);
    result
}
