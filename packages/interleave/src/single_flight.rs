//! Per-key memoization with deduplication of concurrent cold misses.

use std::cell::RefCell;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::hash::Hash;

use foldhash::HashMap;
use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared};

/// A memoizing cache where at most one producer is ever in flight per key.
///
/// The first caller for a key starts the producer; callers arriving while it is still in flight
/// await that same producer instead of starting a duplicate, so only one underlying access
/// occurs. Once the producer completes, its value is stored permanently and returned to every
/// caller, present and future. Entries never expire: the model assumes the cached fact is
/// immutable for the process lifetime.
///
/// Values are cloned out of the cache, so `V` must be `Clone`. Fallible producers cache their
/// `Result`, which makes concurrent cold-miss behavior deterministic for failures too.
///
/// # Example
///
/// ```
/// use interleave::{SingleFlight, run_blocking};
///
/// let cache: SingleFlight<u32, String> = SingleFlight::new();
///
/// let value = run_blocking(cache.get_or_compute(4, async || { "probed".to_string() }));
///
/// assert_eq!(value, "probed");
/// ```
pub struct SingleFlight<K, V> {
    entries: RefCell<HashMap<K, Entry<V>>>,
}

enum Entry<V> {
    Ready(V),
    InFlight(Shared<LocalBoxFuture<'static, V>>),
}

impl<K, V> SingleFlight<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(HashMap::default()),
        }
    }

    /// Returns the value for `key`, invoking `producer` only if no value exists and no producer
    /// for the key is currently in flight.
    pub async fn get_or_compute<P, F>(&self, key: K, producer: P) -> V
    where
        P: FnOnce() -> F,
        F: Future<Output = V> + 'static,
    {
        let in_flight = match self.entries.borrow().get(&key) {
            Some(Entry::Ready(value)) => return value.clone(),
            Some(Entry::InFlight(shared)) => Some(shared.clone()),
            None => None,
        };

        let shared = match in_flight {
            Some(shared) => shared,
            None => {
                // No suspension point since the lookup above, so we are still the first caller.
                let shared = producer().boxed_local().shared();
                self.entries
                    .borrow_mut()
                    .insert(key.clone(), Entry::InFlight(shared.clone()));
                shared
            }
        };

        let value = shared.await;

        // Every awaiter attempts the promotion; it is idempotent.
        self.entries
            .borrow_mut()
            .insert(key, Entry::Ready(value.clone()));

        value
    }

    /// Returns the already-computed value for `key`, if any.
    ///
    /// An in-flight producer does not count; this never suspends.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        match self.entries.borrow().get(key) {
            Some(Entry::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Number of keys with a stored or in-flight value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether the cache has no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("entries", &self.entries.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use futures::channel::oneshot;
    use futures::join;

    use super::*;
    use crate::{Scheduler, run_blocking};

    #[test]
    fn warm_hit_does_not_invoke_producer() {
        let cache: SingleFlight<&str, u32> = SingleFlight::new();
        let invocations = Cell::new(0_u32);

        let (first, second) = run_blocking(async {
            let first = cache
                .get_or_compute("key", || {
                    invocations.set(invocations.get() + 1);
                    async { 1 }
                })
                .await;

            let second = cache
                .get_or_compute("key", || {
                    invocations.set(invocations.get() + 1);
                    async { 2 }
                })
                .await;

            (first, second)
        });

        assert_eq!((first, second), (1, 1));
        assert_eq!(invocations.get(), 1);
    }

    #[test]
    fn concurrent_cold_misses_share_one_producer() {
        let cache: Rc<SingleFlight<&str, u32>> = Rc::new(SingleFlight::new());
        let invocations = Rc::new(Cell::new(0_u32));
        let (release, gate) = oneshot::channel::<()>();

        let scheduler = Scheduler::new();

        let first = scheduler.spawn({
            let cache = Rc::clone(&cache);
            let invocations = Rc::clone(&invocations);
            async move {
                cache
                    .get_or_compute("key", move || {
                        invocations.set(invocations.get() + 1);
                        async move {
                            // Stay in flight until the test releases the gate.
                            gate.await.expect("gate sender dropped");
                            7
                        }
                    })
                    .await
            }
        });

        let second = scheduler.spawn({
            let cache = Rc::clone(&cache);
            let invocations = Rc::clone(&invocations);
            async move {
                cache
                    .get_or_compute("key", move || {
                        invocations.set(invocations.get() + 1);
                        async move { 13 }
                    })
                    .await
            }
        });

        let (first, second) = scheduler.run_blocking(async move {
            release.send(()).expect("first task is awaiting the gate");
            join!(first, second)
        });

        assert_eq!((first, second), (7, 7));
        assert_eq!(invocations.get(), 1);
    }

    #[test]
    fn distinct_keys_compute_independently() {
        let cache: SingleFlight<u32, u32> = SingleFlight::new();

        let (a, b) = run_blocking(async {
            join!(
                cache.get_or_compute(1, async || { 10 }),
                cache.get_or_compute(2, async || { 20 }),
            )
        });

        assert_eq!((a, b), (10, 20));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cached_failures_are_returned_as_is() {
        let cache: SingleFlight<&str, Result<u32, String>> = SingleFlight::new();

        let first = run_blocking(
            cache.get_or_compute("key", async || { Err("device unreachable".to_string()) }),
        );
        let second = run_blocking(cache.get_or_compute("key", async || { Ok(1) }));

        assert_eq!(first, Err("device unreachable".to_string()));
        assert_eq!(second, first);
    }

    #[test]
    fn get_reports_only_completed_values() {
        let cache: SingleFlight<&str, u32> = SingleFlight::new();

        assert_eq!(cache.get(&"key"), None);
        assert!(cache.is_empty());

        run_blocking(cache.get_or_compute("key", async || { 3 }));

        assert_eq!(cache.get(&"key"), Some(3));
    }
}
