/// Dispatch Orchestrator - Concurrent Fan-Out and Collection
///
/// **Responsibility:**
/// Submit one job per test case and bind one waiter task to each handle.
///
/// **Concurrency Model:**
/// - Every job is submitted immediately; nothing waits on a previous job
/// - Each waiter blocks only on its own handle, so results are reported in
///   completion order, not submission order
/// - A failed composition or submission becomes an `Error` result for that
///   job alone; the batch carries on
/// - The caller joins all waiters (`Waiters::join`) before exiting
///
/// Waiters are tokio tasks. Concurrent container executions are bounded by
/// the execution client's slots, not here.

use crate::client::{ExecutionClient, JobHandle};
use crate::collector::ResultCollector;
use crate::composer::{label_for, PreparedJob};
use crate::reporter::{Outcome, Reporter, Summary};
use crate::session::Session;
use sandrun_common::types::{JobResult, TestCase};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Outstanding waiter tasks for one dispatched batch
pub struct Waiters {
    set: JoinSet<Outcome>,
    reporter: Arc<Reporter>,
}

impl Waiters {
    fn new(reporter: Arc<Reporter>) -> Self {
        Self {
            set: JoinSet::new(),
            reporter,
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Wait for every waiter to finish and return the final tally
    pub async fn join(mut self) -> Summary {
        while let Some(joined) = self.set.join_next().await {
            if let Err(e) = joined {
                // The job's report was lost with its task; still count it
                error!(error = %e, "Job waiter failed");
                self.reporter.record(Outcome::Errored);
            }
        }
        self.reporter.summary()
    }
}

pub struct DispatchOrchestrator<C: ExecutionClient> {
    session: Session<C>,
    collector: ResultCollector,
}

impl<C: ExecutionClient> DispatchOrchestrator<C> {
    pub fn new(session: Session<C>, collector: ResultCollector) -> Self {
        Self { session, collector }
    }

    /// Compose one job per test case, then submit them in inventory order.
    /// Test cases that cannot be composed are reported as errors.
    #[instrument(skip_all, fields(tests = tests.len()))]
    pub fn dispatch(&self, tests: &[TestCase]) -> Waiters {
        let mut jobs = Vec::with_capacity(tests.len());
        let mut rejected = Vec::new();

        for test_case in tests {
            match self.session.composer.compose(test_case) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let label = label_for(test_case);
                    warn!(label = %label, error = %e, "Failed to compose job");
                    let result = JobResult::error(format!("could not compose job: {:#}", e));
                    rejected.push((label, result));
                }
            }
        }

        let mut waiters = self.submit_all(jobs);
        for (label, result) in rejected {
            self.spawn_waiter(label, JobHandle::resolved(result), &mut waiters);
        }

        info!(jobs = waiters.len(), "All jobs submitted");
        waiters
    }

    /// Submit already composed jobs
    pub fn submit_all(&self, jobs: Vec<PreparedJob>) -> Waiters {
        let mut waiters = Waiters::new(Arc::clone(self.collector.reporter()));
        for job in jobs {
            self.submit(job, &mut waiters);
        }
        waiters
    }

    fn submit(&self, job: PreparedJob, waiters: &mut Waiters) {
        let PreparedJob { label, spec } = job;
        let handle = match self.session.client.submit_job(spec) {
            Ok(handle) => {
                debug!(label = %label, "Job submitted");
                handle
            }
            Err(e) => {
                warn!(label = %label, error = %e, "Job submission failed");
                JobHandle::resolved(JobResult::error(format!("submission failed: {:#}", e)))
            }
        };
        self.spawn_waiter(label, handle, waiters);
    }

    fn spawn_waiter(&self, label: String, handle: JobHandle, waiters: &mut Waiters) {
        let collector = self.collector.clone();
        let timeout = self.session.job_timeout;
        waiters.set.spawn(async move {
            collector.await_and_report(&label, handle, timeout).await
        });
    }
}
