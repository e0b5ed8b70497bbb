//! Run-with-deadline execution of remote filesystem work.
//!
//! A remote node that stopped answering must never wedge a query thread, so
//! every mediated call runs on its own spawned task under an absolute
//! deadline. On timeout the task is aborted, which drops the in-flight
//! future and with it whatever socket it was holding; the extra delay until
//! the resource is actually released is bounded by the runtime's abort
//! handling, not by the remote side.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::FsError;

/// Terminal outcome of one executed work unit.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Ok(T),
    Timeout,
    Failure(FsError),
}

impl<T> TaskOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskOutcome::Ok(_))
    }

    /// Collapses the outcome into a `Result`, mapping `Timeout` to
    /// [`FsError::Timeout`].
    pub fn into_result(self) -> Result<T, FsError> {
        match self {
            TaskOutcome::Ok(v) => Ok(v),
            TaskOutcome::Timeout => Err(FsError::Timeout),
            TaskOutcome::Failure(e) => Err(e),
        }
    }
}

/// Shared, bounded-fan-out executor. One instance serves the whole process;
/// the registry owns it and threads it into the bridge.
pub struct TaskExecutor {
    workers: Arc<Semaphore>,
}

impl TaskExecutor {
    pub fn new(max_workers: usize) -> Self {
        TaskExecutor {
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Runs `work` with the given per-attempt budget.
    ///
    /// The work future is spawned so that a timeout can abort it; plain
    /// `tokio::time::timeout` would only stop polling, leaving the work
    /// parked on whatever it was awaiting.
    pub async fn run<T, F>(&self, budget: Duration, work: F) -> TaskOutcome<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, FsError>> + Send + 'static,
    {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .expect("executor semaphore is never closed");

        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            work.await
        });

        match tokio::time::timeout(budget, &mut handle).await {
            Ok(Ok(Ok(value))) => TaskOutcome::Ok(value),
            Ok(Ok(Err(e))) => TaskOutcome::Failure(e),
            Ok(Err(join_error)) => TaskOutcome::Failure(FsError::Other(anyhow::anyhow!(
                "remote filesystem work unit panicked: {join_error}"
            ))),
            Err(_elapsed) => {
                handle.abort();
                TaskOutcome::Timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_budget() {
        let executor = TaskExecutor::new(4);
        let outcome = executor
            .run(Duration::from_secs(1), async { Ok(42u32) })
            .await;
        assert!(matches!(outcome, TaskOutcome::Ok(42)));
    }

    #[tokio::test]
    async fn propagates_failure() {
        let executor = TaskExecutor::new(4);
        let outcome = executor
            .run(Duration::from_secs(1), async {
                Err::<(), _>(FsError::NotFound)
            })
            .await;
        assert!(matches!(outcome, TaskOutcome::Failure(FsError::NotFound)));
    }

    #[tokio::test]
    async fn aborts_hung_work_on_timeout() {
        let executor = TaskExecutor::new(4);

        // Observable side effect of the abort: the guard held by the hung
        // work gets dropped shortly after the deadline.
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let started = std::time::Instant::now();
        let outcome = executor
            .run(Duration::from_millis(50), async move {
                let _tx = tx;
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert!(matches!(outcome, TaskOutcome::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));

        // rx completes with an error once the sender is dropped by the abort.
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("aborted work must release its resources")
            .expect_err("sender is dropped, not used");
    }

    #[tokio::test]
    async fn fan_out_is_bounded() {
        let executor = Arc::new(TaskExecutor::new(2));
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let executor = executor.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                executor
                    .run(Duration::from_secs(5), async move {
                        use std::sync::atomic::Ordering;
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            });
        }
        while let Some(res) = tasks.join_next().await {
            assert!(res.unwrap().is_ok());
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }
}
