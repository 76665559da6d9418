//! Ordered fan-out/fan-in over collections of tasks.

use std::future::Future;
use std::hash::Hash;

use foldhash::HashMap;
use futures::StreamExt;
use futures::stream::FuturesUnordered;

/// Runs every task in `tasks` with interleaved suspension and returns their outputs in input
/// order once all have completed.
///
/// Completion order does not matter: each output lands in the slot matching its task's position
/// in the input. If any task fails, the remaining unfinished tasks are cancelled (dropped, which
/// on a cooperative scheduler can only happen between suspension points) and that first failure
/// is returned once the cancellations are complete.
///
/// No upper bound on simultaneous tasks is imposed here; callers that need backpressure must
/// batch their inputs externally.
///
/// # Example
///
/// ```
/// use interleave::{concurrently, run_blocking};
///
/// let texts = ["4", "8", "15"];
///
/// let parsed = run_blocking(concurrently(
///     texts.iter().map(async |text| { text.parse::<u32>() }),
/// ))
/// .unwrap();
///
/// assert_eq!(parsed, vec![4, 8, 15]);
/// ```
pub async fn concurrently<I, T, E>(tasks: I) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T, E>>,
{
    let mut pending: FuturesUnordered<_> = tasks
        .into_iter()
        .enumerate()
        .map(async move |(index, task)| { (index, task.await) })
        .collect();

    let mut slots: Vec<Option<T>> = Vec::new();
    slots.resize_with(pending.len(), || None);

    while let Some((index, result)) = pending.next().await {
        match result {
            Ok(output) => {
                let slot = slots
                    .get_mut(index)
                    .expect("task index is always within the initial task count");
                *slot = Some(output);
            }
            Err(error) => {
                // First failure wins; dropping the set cancels every unfinished task.
                drop(pending);
                return Err(error);
            }
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| slot.expect("every task completed exactly once"))
        .collect())
}

/// Applies `op` to every key concurrently and returns a key-to-output mapping.
///
/// The key set of the returned mapping is exactly the set of input keys. Failure semantics are
/// identical to [`concurrently`]: the first failure cancels the remaining tasks and is returned
/// instead of a mapping.
///
/// # Example
///
/// ```
/// use interleave::{map_concurrently, run_blocking};
///
/// let squares = run_blocking(map_concurrently(
///     async |n: u32| { Ok::<_, std::convert::Infallible>(n * n) },
///     [1, 2, 3],
/// ))
/// .unwrap();
///
/// assert_eq!(squares[&3], 9);
/// ```
pub async fn map_concurrently<K, T, E, Op, F, I>(mut op: Op, keys: I) -> Result<HashMap<K, T>, E>
where
    K: Clone + Eq + Hash,
    Op: FnMut(K) -> F,
    F: Future<Output = Result<T, E>>,
    I: IntoIterator<Item = K>,
{
    let mut pending: FuturesUnordered<_> = keys
        .into_iter()
        .map(|key| {
            let task = op(key.clone());
            async move { (key, task.await) }
        })
        .collect();

    let mut outputs = HashMap::default();

    while let Some((key, result)) = pending.next().await {
        match result {
            Ok(output) => {
                outputs.insert(key, output);
            }
            Err(error) => {
                drop(pending);
                return Err(error);
            }
        }
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeSet;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;
    use crate::run_blocking;

    /// Suspends `rounds` times before resolving, so tests can force completion orders.
    struct YieldRounds {
        remaining: usize,
    }

    impl Future for YieldRounds {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.remaining == 0 {
                Poll::Ready(())
            } else {
                self.remaining -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    fn yield_rounds(rounds: usize) -> YieldRounds {
        YieldRounds { remaining: rounds }
    }

    #[test]
    fn outputs_follow_input_order_not_completion_order() {
        // Task 0 completes last, task 3 first.
        let outputs = run_blocking(concurrently((0..4_usize).map(async move |index| {
            yield_rounds(4 - index).await;
            Ok::<_, ()>(index)
        })))
        .unwrap();

        assert_eq!(outputs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let outputs: Vec<u32> = run_blocking(concurrently(
            std::iter::empty::<std::future::Ready<Result<u32, ()>>>(),
        ))
        .unwrap();

        assert!(outputs.is_empty());
    }

    #[test]
    fn first_failure_cancels_unfinished_tasks() {
        let completions = Cell::new(0_u32);

        let result = run_blocking(concurrently((0..3_usize).map(|index| {
            let completions = &completions;
            async move {
                if index == 0 {
                    yield_rounds(1).await;
                    Err("task 0 failed")
                } else {
                    // These would complete much later; the failure must prevent that.
                    yield_rounds(100).await;
                    completions.set(completions.get() + 1);
                    Ok(index)
                }
            }
        })));

        assert_eq!(result, Err("task 0 failed"));
        assert_eq!(completions.get(), 0);
    }

    #[test]
    fn map_outputs_are_keyed_by_input() {
        let keys = BTreeSet::from([3_u32, 1, 4, 1, 5]);

        let mapping = run_blocking(map_concurrently(
            async |key| { Ok::<_, ()>(key * 10) },
            keys.clone(),
        ))
        .unwrap();

        let mapped_keys: BTreeSet<u32> = mapping.keys().copied().collect();
        assert_eq!(mapped_keys, keys);
        assert_eq!(mapping[&4], 40);
    }

    #[test]
    fn map_failure_propagates_without_a_mapping() {
        let result = run_blocking(map_concurrently(
            async |key: u32| {
                if key == 2 { Err("key 2 failed") } else { Ok(key) }
            },
            [1, 2, 3],
        ));

        assert_eq!(result, Err("key 2 failed"));
    }
}
