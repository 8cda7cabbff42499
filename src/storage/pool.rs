//! Bounded-concurrency worker pool for parallel plane transfer (§4.2, §5).
//!
//! The storage backend is the only async component in the crate; everything
//! else is synchronous, mirroring the rest of this codebase. `run_bounded`
//! is the moral equivalent of a fixed-size thread pool consuming a channel
//! of work items: at most `workers` transfers are in flight at once, and the
//! caller blocks (via the backend's owned runtime) until all items have
//! completed. Ordering of completions is not preserved — results are
//! returned in input order only because each task's slot in the output
//! vector is fixed ahead of time, not because completions are awaited in
//! order.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Run `f` once per item in `items`, with at most `workers` invocations
/// in flight concurrently. Every item runs to completion (success or
/// failure); the caller decides whether any single failure should fail the
/// whole batch.
pub async fn run_bounded<I, T, Fut, F>(items: Vec<I>, workers: usize, f: F) -> Vec<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
{
    let workers = workers.max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    let f = Arc::new(f);

    let mut indexed: Vec<(usize, I)> = items.into_iter().enumerate().collect();
    let mut tasks = FuturesUnordered::new();
    let mut results: Vec<Option<T>> = Vec::new();
    results.resize_with(indexed.len(), || None);

    for (idx, item) in indexed.drain(..) {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let f = f.clone();
        tasks.push(async move {
            let out = f(item).await;
            drop(permit);
            (idx, out)
        });
    }

    while let Some((idx, out)) = tasks.next().await {
        results[idx] = Some(out);
    }

    results.into_iter().map(|r| r.expect("every index is filled exactly once")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_input_order_in_output() {
        let items: Vec<u32> = (0..20).collect();
        let results = run_bounded(items, 4, |n| async move { n * 2 }).await;
        let expected: Vec<u32> = (0..20).map(|n| n * 2).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn zero_workers_still_makes_progress() {
        let items = vec![1, 2, 3];
        let results = run_bounded(items, 0, |n| async move { n + 1 }).await;
        assert_eq!(results, vec![2, 3, 4]);
    }
}
