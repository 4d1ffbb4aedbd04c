//! Deduplication of concurrent computations.
//!
//! The [`Coalescer`] makes sure that at most one producer runs for a given key at any point in
//! time. Callers that arrive while a computation is in flight attach to it and receive a clone of
//! its result. Nothing is retained after the computation finishes: the next call for the same key
//! starts a new computation.
//!
//! Computations are not spawned. The producer is driven by whichever attached callers are
//! currently awaiting it, and is dropped once all of them gave up.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use sentry::{Hub, SentryFutureExt};
use tokio_util::sync::CancellationToken;

use crate::utils::defer;
use crate::{BoxError, CacheError};

type InFlight<V> = BoxFuture<'static, Result<V, CacheError>>;

struct Call<V> {
    /// Distinguishes this call from later calls for the same key.
    generation: u64,
    /// The map never keeps a computation alive on its own.
    future: WeakShared<InFlight<V>>,
}

struct State<V> {
    calls: HashMap<String, Call<V>>,
    next_generation: u64,
}

/// Deduplicates concurrent computations by key.
///
/// Cloning is cheap and yields a handle to the same set of in-flight computations.
pub struct Coalescer<V> {
    state: Arc<Mutex<State<V>>>,
}

impl<V> Clone for Coalescer<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V> Default for Coalescer<V> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                calls: HashMap::new(),
                next_generation: 0,
            })),
        }
    }
}

impl<V> fmt::Debug for Coalescer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let calls = self
            .state
            .try_lock()
            .map(|state| state.calls.len())
            .unwrap_or_default();
        f.debug_struct("Coalescer").field("calls", &calls).finish()
    }
}

fn lock<V>(state: &Mutex<State<V>>) -> MutexGuard<'_, State<V>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V> Coalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `producer` for `key`, unless a computation for `key` is already in flight.
    ///
    /// Returns the computed value, along with whether it was computed by a call that another
    /// caller triggered. Every caller attached to the same computation gets the same result,
    /// including producer errors and panics, which surface as [`CacheError::ProducerPanicked`].
    ///
    /// When `cancel` fires, this caller stops waiting with [`CacheError::Cancelled`]. The
    /// computation itself keeps running for the remaining callers. The producer receives its own
    /// [`CancellationToken`], which is cancelled once every caller has stopped waiting.
    pub async fn run<F, Fut, E>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        producer: F,
    ) -> Result<(V, bool), CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let (call, shared) = self.attach_or_start(key, producer);
        if shared {
            tracing::debug!(key, "Attaching to in-flight computation");
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(key, "Stopped waiting for computation");
                Err(CacheError::Cancelled)
            }
            result = call => result.map(|value| (value, shared)),
        }
    }

    fn attach_or_start<F, Fut, E>(&self, key: &str, producer: F) -> (Shared<InFlight<V>>, bool)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut state = lock(&self.state);

        if let Some(call) = state.calls.get(key)
            && let Some(future) = call.future.upgrade()
        {
            return (future, true);
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let remove_call = {
            let state = Arc::clone(&self.state);
            let key = key.to_owned();
            defer(move || {
                let mut state = lock(&state);
                if state
                    .calls
                    .get(&key)
                    .is_some_and(|call| call.generation == generation)
                {
                    state.calls.remove(&key);
                }
            })
        };

        let producer_cancel = CancellationToken::new();
        let cancel_when_abandoned = producer_cancel.clone().drop_guard();

        let future = async move {
            let result = AssertUnwindSafe(producer(producer_cancel))
                .catch_unwind()
                .await;
            let _ = cancel_when_abandoned.disarm();
            // Whatever the producer did with the result is visible before the call is forgotten,
            // and the call is forgotten before any caller is released.
            drop(remove_call);

            match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(CacheError::producer(err)),
                Err(_panic) => {
                    tracing::error!("Credential producer panicked");
                    Err(CacheError::ProducerPanicked)
                }
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()))
        .boxed()
        .shared();

        // A freshly created `Shared` can not have completed yet.
        if let Some(weak) = future.downgrade() {
            state.calls.insert(
                key.to_owned(),
                Call {
                    generation,
                    future: weak,
                },
            );
        }

        (future, false)
    }

    /// Returns the number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        let live: Vec<_> = {
            let state = lock(&self.state);
            state
                .calls
                .values()
                .filter_map(|call| call.future.upgrade())
                .collect()
        };
        // The upgraded handles may be the last ones, so they are dropped outside of the lock.
        live.len()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use credcache_test::{CallCounter, Gate};

    use super::*;

    fn gated_producer(
        calls: &CallCounter,
        gate: &Gate,
        value: &'static str,
    ) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, Result<String, Infallible>>
    + Send
    + 'static {
        let calls = calls.clone();
        let gate = gate.clone();
        move |_cancel| {
            async move {
                calls.incr();
                gate.wait().await;
                Ok(value.to_owned())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_coalesces_concurrent_calls() {
        credcache_test::setup();

        let coalescer = Coalescer::new();
        let cancel = CancellationToken::new();
        let calls = CallCounter::default();
        let gate = Gate::new();

        let (a, b, ()) = tokio::join!(
            coalescer.run("x", &cancel, gated_producer(&calls, &gate, "token-1")),
            coalescer.run("x", &cancel, gated_producer(&calls, &gate, "token-2")),
            async {
                tokio::task::yield_now().await;
                assert_eq!(coalescer.in_flight(), 1);
                gate.open();
            },
        );

        assert_eq!(calls.get(), 1);
        assert_eq!(a.unwrap(), ("token-1".to_owned(), false));
        assert_eq!(b.unwrap(), ("token-1".to_owned(), true));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let coalescer = Coalescer::new();
        let cancel = CancellationToken::new();
        let calls = CallCounter::default();
        let gate = Gate::new();

        let (a, b, ()) = tokio::join!(
            coalescer.run("x", &cancel, gated_producer(&calls, &gate, "x")),
            coalescer.run("y", &cancel, gated_producer(&calls, &gate, "y")),
            async {
                tokio::task::yield_now().await;
                assert_eq!(coalescer.in_flight(), 2);
                gate.open();
            },
        );

        assert_eq!(calls.get(), 2);
        assert_eq!(a.unwrap(), ("x".to_owned(), false));
        assert_eq!(b.unwrap(), ("y".to_owned(), false));
    }

    #[tokio::test]
    async fn test_sequential_calls_produce_anew() {
        let coalescer = Coalescer::new();
        let cancel = CancellationToken::new();
        let calls = CallCounter::default();
        let gate = Gate::new();
        gate.open();

        for _ in 0..3 {
            let (value, shared) = coalescer
                .run("x", &cancel, gated_producer(&calls, &gate, "token"))
                .await
                .unwrap();
            assert_eq!(value, "token");
            assert!(!shared);
        }
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_errors_are_shared_but_not_retained() {
        let coalescer = Coalescer::<String>::new();
        let cancel = CancellationToken::new();
        let calls = CallCounter::default();
        let gate = Gate::new();

        let failing = || {
            let calls = calls.clone();
            let gate = gate.clone();
            move |_cancel: CancellationToken| async move {
                calls.incr();
                gate.wait().await;
                Err::<String, _>("permission denied")
            }
        };

        let (a, b, ()) = tokio::join!(
            coalescer.run("x", &cancel, failing()),
            coalescer.run("x", &cancel, failing()),
            async {
                tokio::task::yield_now().await;
                gate.open();
            },
        );

        assert_eq!(calls.get(), 1);
        let a = a.unwrap_err();
        assert_eq!(a.to_string(), "permission denied");
        assert_eq!(b.unwrap_err(), a);

        let c = coalescer.run("x", &cancel, failing()).await.unwrap_err();
        assert_eq!(c.to_string(), "permission denied");
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_panicking_producer() {
        let coalescer = Coalescer::<String>::new();
        let cancel = CancellationToken::new();
        let gate = Gate::new();

        let panicking = || {
            let gate = gate.clone();
            move |_cancel: CancellationToken| async move {
                gate.wait().await;
                if true {
                    panic!("token endpoint exploded");
                }
                Ok::<_, Infallible>(String::new())
            }
        };

        let (a, b, ()) = tokio::join!(
            coalescer.run("x", &cancel, panicking()),
            coalescer.run("x", &cancel, panicking()),
            async {
                tokio::task::yield_now().await;
                gate.open();
            },
        );

        assert_eq!(a.unwrap_err(), CacheError::ProducerPanicked);
        assert_eq!(b.unwrap_err(), CacheError::ProducerPanicked);
        assert_eq!(coalescer.in_flight(), 0);

        let result = coalescer
            .run("x", &cancel, |_| async { Ok::<_, Infallible>("ok".to_owned()) })
            .await;
        assert_eq!(result.unwrap(), ("ok".to_owned(), false));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_affect_others() {
        let coalescer = Coalescer::new();
        let calls = CallCounter::default();
        let gate = Gate::new();

        let leader_cancel = CancellationToken::new();
        let waiter_cancel = CancellationToken::new();

        let (a, b, ()) = tokio::join!(
            coalescer.run("x", &leader_cancel, gated_producer(&calls, &gate, "token")),
            coalescer.run("x", &waiter_cancel, gated_producer(&calls, &gate, "other")),
            async {
                tokio::task::yield_now().await;
                waiter_cancel.cancel();
                tokio::task::yield_now().await;
                gate.open();
            },
        );

        assert_eq!(a.unwrap(), ("token".to_owned(), false));
        assert_eq!(b.unwrap_err(), CacheError::Cancelled);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let coalescer = Coalescer::new();
        let calls = CallCounter::default();
        let gate = Gate::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = coalescer
            .run("x", &cancel, gated_producer(&calls, &gate, "token"))
            .await;
        assert_eq!(result.unwrap_err(), CacheError::Cancelled);
        assert_eq!(calls.get(), 0);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_computation_is_cancelled() {
        let coalescer = Coalescer::<String>::new();
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let producer = move |producer_cancel: CancellationToken| async move {
            // work outliving the producer future observes the cancellation
            tokio::spawn(async move {
                producer_cancel.cancelled().await;
                let _ = tx.send(());
            });
            futures::future::pending::<Result<String, Infallible>>().await
        };

        let (result, ()) = tokio::join!(coalescer.run("x", &cancel, producer), async {
            tokio::task::yield_now().await;
            cancel.cancel();
        });

        assert_eq!(result.unwrap_err(), CacheError::Cancelled);
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_callers() {
        let coalescer = Coalescer::new();
        let calls = CallCounter::default();
        let gate = Gate::new();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let coalescer = coalescer.clone();
                let producer = gated_producer(&calls, &gate, "token");
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    coalescer.run("x", &cancel, producer).await
                })
            })
            .collect();

        // wait until every task attached to the single computation
        while coalescer.in_flight() == 0 || calls.get() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.open();

        let mut shared = 0;
        for task in tasks {
            let (value, was_shared) = task.await.unwrap().unwrap();
            assert_eq!(value, "token");
            shared += was_shared as usize;
        }
        assert_eq!(calls.get(), 1);
        assert_eq!(shared, 15);
    }
}
