use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::{Result, anyhow};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};

/// In-process executor with bounded concurrency.
///
/// Tasks are polled cooperatively on the caller's task; there is no OS
/// isolation. As soon as one settles the next queued index starts.
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Run `runner(index)` for every index in `0..total`.
    ///
    /// `on_settled` is called in completion order. The returned vector is
    /// ordered by task index. A panicking task settles its own slot as an
    /// error and never stalls the others.
    pub async fn execute<T, F, Fut, S>(&self, total: usize, runner: F, mut on_settled: S) -> Vec<Result<T>>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
        S: FnMut(usize, &Result<T>),
    {
        let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
        let mut in_flight = FuturesUnordered::new();
        let mut next = 0;

        let settle = |index: usize, task: Fut| async move {
            let result = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(anyhow!("task {index} panicked: {}", panic_message(&panic))));
            (index, result)
        };

        while next < total && in_flight.len() < self.concurrency {
            in_flight.push(settle(next, runner(next)));
            next += 1;
        }

        while let Some((index, result)) = in_flight.next().await {
            on_settled(index, &result);
            slots[index] = Some(result);

            if next < total {
                in_flight.push(settle(next, runner(next)));
                next += 1;
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.unwrap_or_else(|| Err(anyhow!("task {index} never settled"))))
            .collect()
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn results_follow_task_order_not_completion_order() {
        let pool = WorkerPool::new(4);
        let completion = Mutex::new(Vec::new());

        let results = pool
            .execute(
                4,
                |index| async move {
                    // Later indices finish first.
                    tokio::time::sleep(Duration::from_millis(40 - index as u64 * 10)).await;
                    Ok(index * 10)
                },
                |index, _| completion.lock().unwrap().push(index),
            )
            .await;

        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30]);
        assert_eq!(*completion.lock().unwrap(), vec![3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn never_exceeds_the_concurrency_limit() {
        let pool = WorkerPool::new(3);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = pool
            .execute(
                12,
                |index| {
                    let running = &running;
                    let peak = &peak;
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(index)
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(results.len(), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_and_panics_settle_only_their_own_slot() {
        let pool = WorkerPool::new(2);
        let settled = AtomicUsize::new(0);

        let results = pool
            .execute(
                5,
                |index| async move {
                    match index {
                        1 => bail!("unreadable file"),
                        3 => panic!("decoder exploded"),
                        _ => Ok(index),
                    }
                },
                |_, _| {
                    settled.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(settled.load(Ordering::SeqCst), 5);
        assert_eq!(*results[0].as_ref().unwrap(), 0);
        assert!(results[1].is_err());
        let panic = results[3].as_ref().unwrap_err().to_string();
        assert!(panic.contains("decoder exploded"), "{panic}");
        assert_eq!(*results[4].as_ref().unwrap(), 4);
    }

    #[tokio::test]
    async fn empty_task_set_returns_immediately() {
        let results: Vec<Result<()>> = WorkerPool::new(2)
            .execute(0, |_| async { Ok(()) }, |_, _| {})
            .await;
        assert!(results.is_empty());
    }
}
