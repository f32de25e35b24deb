/// Execution Client - Seam to the Remote Job Service
///
/// **Responsibility:**
/// Accept layer descriptors and job specs, run each job in an isolated
/// container, and hand back a `JobHandle` that resolves exactly once.
///
/// The client owns slot accounting: submissions beyond its capacity are
/// queued by the client, never by the orchestrator. A client that queues
/// attaches a start signal to the handle so that time spent waiting for a
/// slot does not count against the job's timeout.

use sandrun_common::layer::Layer;
use sandrun_common::types::{JobResult, JobSpec, LayerRef};
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

pub trait ExecutionClient: Send + Sync + 'static {
    /// Register a layer and return a reference usable in any later job spec
    fn add_layer(&self, layer: Layer) -> impl Future<Output = Result<LayerRef>> + Send;

    /// Submit one job. Returns immediately; the job runs in the background.
    fn submit_job(&self, spec: JobSpec) -> Result<JobHandle>;
}

/// Token for a submitted job. Resolves exactly once.
#[derive(Debug)]
pub struct JobHandle {
    receiver: oneshot::Receiver<JobResult>,
    execution: Option<AbortHandle>,
    started: Option<oneshot::Receiver<()>>,
}

impl JobHandle {
    pub fn new(receiver: oneshot::Receiver<JobResult>, execution: Option<AbortHandle>) -> Self {
        Self {
            receiver,
            execution,
            started: None,
        }
    }

    /// Fires once the job holds an execution slot
    pub fn with_start_signal(mut self, started: oneshot::Receiver<()>) -> Self {
        self.started = Some(started);
        self
    }

    /// A handle that is already resolved, used when a job never reached the client
    pub fn resolved(result: JobResult) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self::new(receiver, None)
    }

    pub async fn result(self) -> JobResult {
        self.receiver
            .await
            .unwrap_or_else(|_| dropped_result())
    }

    /// Wait for the result, cancelling the remote execution once `limit`
    /// elapses. The limit runs from the start signal when there is one.
    pub async fn result_within(self, limit: Option<Duration>) -> JobResult {
        let Some(limit) = limit else {
            return self.result().await;
        };

        let JobHandle { mut receiver, execution, started } = self;
        if let Some(started) = started {
            tokio::select! {
                result = &mut receiver => {
                    return result.unwrap_or_else(|_| dropped_result());
                }
                _ = started => {}
            }
        }
        match tokio::time::timeout(limit, &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => dropped_result(),
            Err(_) => {
                if let Some(execution) = execution {
                    execution.abort();
                }
                JobResult::error(format!("timed out after {}s", limit.as_secs()))
            }
        }
    }
}

fn dropped_result() -> JobResult {
    JobResult::error("execution client dropped the job before it resolved")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolved_handle() {
        let handle = JobHandle::resolved(JobResult::error("no slot"));
        assert_eq!(handle.result().await, JobResult::error("no slot"));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_an_error() {
        let (sender, receiver) = oneshot::channel();
        drop(sender);
        let result = JobHandle::new(receiver, None).result().await;
        assert!(matches!(result, JobResult::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_execution() {
        let (sender, receiver) = oneshot::channel::<JobResult>();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let _ = sender.send(JobResult::error("too late"));
        });
        let handle = JobHandle::new(receiver, Some(task.abort_handle()));

        let result = handle.result_within(Some(Duration::from_secs(5))).await;
        assert_eq!(result, JobResult::error("timed out after 5s"));

        let join = task.await.unwrap_err();
        assert!(join.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_runs_from_start_signal() {
        let (started_tx, started_rx) = oneshot::channel();
        let (sender, receiver) = oneshot::channel();
        let task = tokio::spawn(async move {
            // Queued for longer than the limit, then runs well within it
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = sender.send(JobResult::error("finished"));
        });
        let handle =
            JobHandle::new(receiver, Some(task.abort_handle())).with_start_signal(started_rx);

        let result = handle.result_within(Some(Duration::from_secs(5))).await;
        assert_eq!(result, JobResult::error("finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_start_still_aborts() {
        let (started_tx, started_rx) = oneshot::channel();
        let (sender, receiver) = oneshot::channel::<JobResult>();
        let task = tokio::spawn(async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let _ = sender.send(JobResult::error("too late"));
        });
        let handle =
            JobHandle::new(receiver, Some(task.abort_handle())).with_start_signal(started_rx);

        let result = handle.result_within(Some(Duration::from_secs(5))).await;
        assert_eq!(result, JobResult::error("timed out after 5s"));
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_result_before_start_signal() {
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (sender, receiver) = oneshot::channel();
        sender.send(JobResult::error("no slot")).unwrap();
        drop(started_tx);
        let handle = JobHandle::new(receiver, None).with_start_signal(started_rx);

        let result = handle.result_within(Some(Duration::from_secs(5))).await;
        assert_eq!(result, JobResult::error("no slot"));
    }

    #[tokio::test]
    async fn test_no_timeout_waits_for_result() {
        let (sender, receiver) = oneshot::channel();
        sender.send(JobResult::error("done")).unwrap();
        let result = JobHandle::new(receiver, None).result_within(None).await;
        assert_eq!(result, JobResult::error("done"));
    }
}
