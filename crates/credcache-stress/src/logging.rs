use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use credcache::config::Metrics;
use credcache::{logging, metrics};
use sentry::types::Dsn;

#[derive(Debug, Default)]
pub struct Config {
    pub logging: credcache::config::Logging,
    pub metrics: Metrics,
    pub sentry_dsn: Option<Dsn>,
    pub tracing: bool,
    /// Send metrics to a local UDP sink if no statsd server is configured.
    pub local_metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up error reporting, logging and metrics.
///
/// With `tracing`, all logs are formatted the way a production deployment would, and discarded.
///
/// Must be called before any threads are spawned.
pub fn init(config: Config) -> Result<Guard> {
    let mut guard = Guard::default();

    if let Some(dsn) = config.sentry_dsn {
        guard.sentry = Some(sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        )));
    }

    if config.tracing {
        if config.logging.enable_backtraces {
            // SAFETY: no other threads exist yet.
            unsafe { env::set_var("RUST_BACKTRACE", "1") };
        }
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        logging::init_json_logging("INFO,credcache=DEBUG", || NoopWriter);
    } else {
        // SAFETY: no other threads exist yet.
        unsafe { logging::init_logging(&config.logging) };
    }

    let Metrics {
        statsd,
        prefix,
        custom_tags,
    } = config.metrics;

    if let Some(statsd) = statsd {
        metrics::configure_statsd(&prefix, statsd.as_str(), custom_tags)
            .context("failed to configure metrics")?;
    } else if config.local_metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(Box::pin(async move {
            let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                return;
            };
            let mut buf = Vec::with_capacity(1024);
            loop {
                buf.clear();
                if listener.recv_buf(&mut buf).await.is_err() {
                    break;
                }
            }
        }));

        let host = format!("127.0.0.1:{}", socket.port());

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::from([
            ("host".to_owned(), "stresstest".to_owned()),
            ("env".to_owned(), "stresstest".to_owned()),
        ]);
        tags.extend(custom_tags);

        metrics::configure_statsd(&prefix, host, tags).context("failed to configure metrics")?;
    }

    Ok(guard)
}

struct NoopWriter;

impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
