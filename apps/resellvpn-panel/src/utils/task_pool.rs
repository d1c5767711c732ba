//! Bounded-concurrency fan-out used for notification dispatch and panel
//! credential toggling. One reusable primitive instead of ad hoc loops at
//! every call site.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Runs `tasks` with at most `max_concurrent` in flight and at most
/// `rate_per_second` task starts per second. Results come back in completion
/// order.
pub async fn run<T, F>(tasks: Vec<F>, max_concurrent: usize, rate_per_second: u32) -> Vec<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let period = Duration::from_secs(1) / rate_per_second.max(1);
    let mut ticker = tokio::time::interval(period);
    let mut set = JoinSet::new();

    for task in tasks {
        ticker.tick().await;
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        set.spawn(async move {
            let _permit = permit;
            task.await
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(value) => results.push(value),
            Err(e) => warn!("fan-out task panicked: {}", e),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_concurrency_bound() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            })
            .collect();

        let results = run(tasks, 5, 1000).await;
        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_every_result() {
        let tasks: Vec<_> = (0..7).map(|i| async move { i * 2 }).collect();
        let mut results = run(tasks, 3, 100).await;
        results.sort_unstable();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12]);
    }
}
