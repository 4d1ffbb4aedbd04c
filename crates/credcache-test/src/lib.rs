//! Helpers for testing the credential caches.
//!
//! This crate does not depend on the caches themselves, so that it can be used from the test
//! suites of every crate in the workspace.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::NamedTempFile;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the credential cache crates and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("credcache=trace,credcache_auth=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Writes `contents` into a temporary file, which is deleted when dropped.
pub fn tempfile(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// A gate that blocks producers until it is opened.
///
/// Clones share the same gate. Once opened, the gate stays open.
#[derive(Debug, Clone)]
pub struct Gate {
    sender: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Opens the gate, releasing all current and future waiters.
    pub fn open(&self) {
        self.sender.send_replace(true);
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender is kept alive by `self`, so this can not fail.
        let _ = receiver.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts invocations of a producer.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    /// Records a call, returning the number of calls before this one.
    pub fn incr(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
