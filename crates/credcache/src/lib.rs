//! # Expiring credential caches
//!
//! Exchanging workload identities for cloud credentials is slow and rate limited, so consumers
//! that need Git, OCI registry or Kubernetes cluster credentials go through the caches in this
//! crate instead of calling their provider on every reconciliation.
//!
//! The crate is layered, leaf-first:
//!
//! - [`ExpiringStore`] is a bounded key/value map where every entry may carry an absolute
//!   expiration time. Expired entries are never returned, they are swept in the background and
//!   the least-recently-used entry is evicted once the store is full.
//! - [`Coalescer`] deduplicates concurrent computations for the same key, so that at most one
//!   producer runs for a key at any point in time.
//! - [`TokenCache`] ties both together into a `get_or_set` contract for anything implementing
//!   [`Token`], and reports hits, misses and fresh productions to an [`EventRecorder`].
//!
//! ## Cache keys
//!
//! Building the key is the job of the caller. Identical logical requests must produce identical
//! keys, and requests that differ in any way that influences the resulting credentials (provider,
//! scopes, audience, proxy, target registry or cluster, workload identity…) **must** produce
//! different keys, otherwise wrong credentials are served from the cache.
//! [`CacheKeyBuilder`] helps with writing stable, human readable metadata that is then hashed.
//!
//! ## Metrics
//!
//! All metrics go through the [`metric!`] macro and are only sent when statsd was configured via
//! [`metrics::configure_statsd`]:
//!
//! - `caches.token.access`: all `get_or_set` calls.
//! - `caches.token.hit` / `caches.token.miss`: lookups served or not served by the store.
//! - `caches.token.produced`: actual producer invocations.
//! - `caches.token.coalesced`: callers that attached to an in-flight producer.
//! - `caches.token.failed`: producer failures, tagged with the failure `reason`.
//! - `caches.token.events`: events seen by the [`MetricsRecorder`](events::MetricsRecorder),
//!   tagged with the `event` and the `object_kind` of the involved object.
//! - `caches.store.evicted`: evicted entries, tagged with `reason` (`expired` or `capacity`).
//! - `caches.store.items`: gauge of stored entries, updated by the background sweep.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod events;
pub mod logging;
pub mod singleflight;
pub mod store;
pub mod token;
pub mod utils;

mod cache_key;
mod error;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use error::{BoxError, CacheError};
pub use events::{CacheEvent, CacheEventKind, EventRecorder, InvolvedObject};
pub use singleflight::Coalescer;
pub use store::{ExpiringStore, StoreConfig};
pub use token::{GetOptions, Token, TokenCache};
