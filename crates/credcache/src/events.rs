//! Observability events emitted by the [`TokenCache`](crate::TokenCache).
//!
//! Events are purely informational. A recorder that fails never fails the cache lookup that
//! triggered it, the error is logged and dropped.

use std::fmt;

use crate::BoxError;

/// What happened to a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    /// A live token was served from the store.
    Hit,
    /// No live token was stored, the caller went on to produce or wait for one.
    Miss,
    /// A fresh token was produced and stored.
    Produced,
}

impl CacheEventKind {
    /// A short, static name of the event, used in logs and metrics tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Produced => "produced",
        }
    }
}

impl fmt::Display for CacheEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The logical object on whose behalf credentials are requested.
///
/// This is typically a reference to a Kubernetes resource. It only annotates events and never
/// influences cache keys or eviction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvolvedObject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl InvolvedObject {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for InvolvedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A single cache event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEvent<'a> {
    pub kind: CacheEventKind,
    /// The cache key that was looked up.
    pub key: &'a str,
    pub involved_object: Option<&'a InvolvedObject>,
    /// Whether the token was produced by a computation triggered by another caller.
    ///
    /// Always `false` for [`CacheEventKind::Hit`] and [`CacheEventKind::Miss`].
    pub shared: bool,
}

/// A sink for [`CacheEvent`]s.
pub trait EventRecorder: Send + Sync {
    /// Records the event.
    ///
    /// Errors are logged by the cache and otherwise ignored.
    fn record(&self, event: &CacheEvent<'_>) -> Result<(), BoxError>;
}

impl<F> EventRecorder for F
where
    F: Fn(&CacheEvent<'_>) -> Result<(), BoxError> + Send + Sync,
{
    fn record(&self, event: &CacheEvent<'_>) -> Result<(), BoxError> {
        self(event)
    }
}

/// Records events as `tracing` log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: &CacheEvent<'_>) -> Result<(), BoxError> {
        match event.involved_object {
            Some(object) => tracing::info!(
                event = event.kind.as_str(),
                key = event.key,
                shared = event.shared,
                object.kind = object.kind.as_str(),
                object.name = object.name.as_str(),
                object.namespace = object.namespace.as_str(),
                "Credential cache {}",
                event.kind,
            ),
            None => tracing::info!(
                event = event.kind.as_str(),
                key = event.key,
                shared = event.shared,
                "Credential cache {}",
                event.kind,
            ),
        }
        Ok(())
    }
}

/// Records events as statsd counters.
///
/// Every event increments `caches.token.events`, tagged with the `event` and the `object_kind`
/// of the involved object, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl EventRecorder for MetricsRecorder {
    fn record(&self, event: &CacheEvent<'_>) -> Result<(), BoxError> {
        let object_kind = event
            .involved_object
            .map(|object| object.kind.as_str())
            .unwrap_or("none");
        metric!(
            counter("caches.token.events") += 1,
            "event" => event.kind.as_str(),
            "object_kind" => object_kind,
            "shared" => if event.shared { "true" } else { "false" },
        );
        Ok(())
    }
}
