// Per-run context threaded through composition and dispatch
use crate::client::ExecutionClient;
use crate::composer::JobComposer;
use std::sync::Arc;
use std::time::Duration;

/// Everything shared by the jobs of one run: the execution client, the
/// composer holding the registered layers and image, and the per-job timeout.
/// Read-only once built.
pub struct Session<C: ExecutionClient> {
    pub client: Arc<C>,
    pub composer: JobComposer,
    pub job_timeout: Option<Duration>,
}

impl<C: ExecutionClient> Session<C> {
    pub fn new(client: Arc<C>, composer: JobComposer, job_timeout: Option<Duration>) -> Self {
        Self {
            client,
            composer,
            job_timeout,
        }
    }
}
