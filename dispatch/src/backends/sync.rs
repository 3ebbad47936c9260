use crate::{
    config::ConnectionConfig,
    jobs::{Handlers, Job, JobHandle, LeasedJob},
    Error, Result,
};
use std::time::Duration;
use tracing::{debug, instrument};

/// Runs each job inline inside `enqueue`.
///
/// Unlike every other driver, a failing handler surfaces as the `enqueue`
/// error and nothing is retried. `enqueue` blocks for the whole handler run,
/// so callers needing a bound must wrap it in their own timeout. The delay is
/// ignored.
#[derive(Debug, Clone)]
pub struct Backend {
    handlers: Handlers,
}

impl Backend {
    pub fn new(handlers: Handlers) -> Self {
        Self { handlers }
    }

    pub fn from_config(_config: &ConnectionConfig, handlers: Handlers) -> Self {
        Self::new(handlers)
    }
}

#[async_trait::async_trait]
impl super::Backend for Backend {
    fn name(&self) -> &'static str {
        "sync"
    }

    #[instrument(skip(self))]
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<JobHandle> {
        if !delay.is_zero() {
            debug!("sync driver ignores delay of {:?}", delay);
        }
        self.handlers.perform(&job).await?;
        Ok(JobHandle::new(job.id().as_str()))
    }

    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        Ok(None)
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        Err(Error::HandleExpired(handle.to_string()))
    }

    async fn release(&self, handle: &JobHandle, _delay: Duration) -> Result<()> {
        Err(Error::HandleExpired(handle.to_string()))
    }
}
