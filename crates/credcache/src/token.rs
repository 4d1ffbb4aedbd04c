//! A cache for expiring credentials.
//!
//! [`TokenCache::get_or_set`] either serves a live token from the [`ExpiringStore`], or produces
//! a fresh one through the [`Coalescer`], so that concurrent requests for the same key share a
//! single exchange with the credential provider.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::events::{CacheEvent, CacheEventKind, EventRecorder, InvolvedObject};
use crate::{BoxError, CacheError, Coalescer, ExpiringStore};

/// A credential that expires.
pub trait Token {
    /// Returns the time remaining until this token expires.
    ///
    /// A token that has already expired returns [`Duration::ZERO`].
    fn duration(&self) -> Duration;
}

impl<T: Token + ?Sized> Token for Arc<T> {
    fn duration(&self) -> Duration {
        (**self).duration()
    }
}

impl<T: Token + ?Sized> Token for Box<T> {
    fn duration(&self) -> Duration {
        (**self).duration()
    }
}

/// Returns how long `token` may be served from the cache.
///
/// That is 80% of its remaining lifetime, so that callers never receive a token that is about to
/// expire while they use it, capped at `max_duration`.
fn cache_duration(token: &impl Token, max_duration: Duration) -> Duration {
    token
        .duration()
        .checked_mul(4)
        .map_or(max_duration, |lifetime| lifetime / 5)
        .min(max_duration)
}

/// Where a token handed out by a coalesced computation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Another computation stored the token just before this one started.
    Cached,
    /// The token was freshly produced.
    Produced,
}

/// Options for a single [`TokenCache::get_or_set`] call.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// The object on whose behalf the token is requested, attached to all emitted events.
    pub involved_object: Option<InvolvedObject>,
}

impl GetOptions {
    pub fn with_involved_object(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            involved_object: Some(InvolvedObject::new(kind, name, namespace)),
        }
    }
}

/// A cache for [`Token`]s.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct TokenCache<T> {
    store: ExpiringStore<T>,
    coalescer: Coalescer<(T, Origin)>,
    max_duration: Duration,
    recorder: Option<Arc<dyn EventRecorder>>,
}

impl<T> Clone for TokenCache<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            coalescer: self.coalescer.clone(),
            max_duration: self.max_duration,
            recorder: self.recorder.clone(),
        }
    }
}

impl<T> fmt::Debug for TokenCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("store", &self.store)
            .field("coalescer", &self.coalescer)
            .field("max_duration", &self.max_duration)
            .field("recorder", &self.recorder.is_some())
            .finish()
    }
}

impl<T> TokenCache<T>
where
    T: Token + Clone + Send + Sync + 'static,
{
    /// Creates a new cache.
    ///
    /// This should be called from within a tokio runtime, which runs the background sweep of the
    /// underlying store. Outside of a runtime, a warning is logged and expired tokens are only
    /// removed when they are looked up or when room is needed for a new key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] if the store can not be created with the given
    /// configuration, or if the maximum token duration is zero.
    pub fn new(config: &StoreConfig) -> Result<Self, CacheError> {
        if config.max_token_duration.is_zero() {
            return Err(CacheError::InvalidConfig(
                "max token duration must be greater than zero".into(),
            ));
        }

        Ok(Self {
            store: ExpiringStore::new(config)?,
            coalescer: Coalescer::new(),
            max_duration: config.max_token_duration,
            recorder: None,
        })
    }

    /// Reports hits, misses and produced tokens to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Returns the token for `key`, producing and caching it if necessary.
    ///
    /// A live token from the cache is returned along with `true`. Otherwise, `produce` is called
    /// to create a fresh token, unless a token for the same key is already being produced, in
    /// which case this waits for that one. In both cases, the token is returned along with
    /// `false`. A token that another caller stored while this one was looking up the cache
    /// still counts as coming from the cache.
    ///
    /// A fresh token is cached for 80% of its lifetime, but no longer than the configured maximum
    /// token duration. It is stored before any caller receives it. Tokens without any remaining
    /// lifetime are returned, but never cached. Failures are never cached.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Producer`] with the error of `produce`,
    /// - [`CacheError::ProducerPanicked`] if `produce` panicked,
    /// - [`CacheError::Cancelled`] if `cancel` fired before a token was available. The
    ///   production itself is only cancelled once all callers waiting for it have given up.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        produce: F,
        options: &GetOptions,
    ) -> Result<(T, bool), CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        metric!(counter("caches.token.access") += 1);
        let involved_object = options.involved_object.as_ref();

        if let Some(token) = self.store.get(key) {
            self.record_hit(key, involved_object, false);
            return Ok((token, true));
        }

        metric!(counter("caches.token.miss") += 1);
        self.record(CacheEventKind::Miss, key, involved_object, false);

        let store = self.store.clone();
        let max_duration = self.max_duration;
        let owned_key = key.to_owned();
        let produce_and_store = move |producer_cancel: CancellationToken| async move {
            // A computation that finished just before this one started may have stored a token.
            if let Some(token) = store.get(&owned_key) {
                return Ok((token, Origin::Cached));
            }

            let start = Instant::now();
            let token = match produce(producer_cancel).await {
                Ok(token) => token,
                Err(err) => return Err::<_, BoxError>(err.into()),
            };
            metric!(timer("caches.token.produce_duration") = start.elapsed());
            metric!(counter("caches.token.produced") += 1);

            let lifetime = cache_duration(&token, max_duration);
            if lifetime.is_zero() {
                tracing::debug!(key = owned_key.as_str(), "Not caching token without lifetime");
            } else {
                metric!(histogram("caches.token.cache_duration") = lifetime);
                store.set_with_expiration(owned_key, token.clone(), Instant::now() + lifetime);
            }
            Ok((token, Origin::Produced))
        };

        match self.coalescer.run(key, cancel, produce_and_store).await {
            Ok(((token, origin), shared)) => {
                if shared {
                    metric!(counter("caches.token.coalesced") += 1);
                }
                match origin {
                    Origin::Cached => {
                        self.record_hit(key, involved_object, shared);
                        Ok((token, true))
                    }
                    Origin::Produced => {
                        self.record(CacheEventKind::Produced, key, involved_object, shared);
                        Ok((token, false))
                    }
                }
            }
            Err(err) => {
                if err != CacheError::Cancelled {
                    tracing::debug!(key, error = %err, "Failed to produce token");
                    metric!(counter("caches.token.failed") += 1, "reason" => err.metrics_tag());
                }
                Err(err)
            }
        }
    }

    fn record_hit(&self, key: &str, involved_object: Option<&InvolvedObject>, shared: bool) {
        metric!(counter("caches.token.hit") += 1);
        self.record(CacheEventKind::Hit, key, involved_object, shared);
    }

    fn record(
        &self,
        kind: CacheEventKind,
        key: &str,
        involved_object: Option<&InvolvedObject>,
        shared: bool,
    ) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let event = CacheEvent {
            kind,
            key,
            involved_object,
            shared,
        };
        if let Err(err) = recorder.record(&event) {
            tracing::debug!(key, event = kind.as_str(), error = %err, "Failed to record cache event");
        }
    }

    /// Returns the live token for `key`, without producing one.
    pub fn get(&self, key: &str) -> Option<T> {
        self.store.get(key)
    }

    /// Removes the token for `key`, so that the next request produces a fresh one.
    ///
    /// This is used when a cached token was rejected by its consumer.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] if no live token is cached for `key`.
    pub fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.store.delete(key)
    }

    /// Returns the keys of all live tokens, in sorted order.
    pub fn list_keys(&self) -> Vec<String> {
        self.store.list_keys()
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &ExpiringStore<T> {
        &self.store
    }

    /// Stops the background sweep of the underlying store.
    pub fn shutdown(&self) {
        self.store.shutdown();
    }
}
