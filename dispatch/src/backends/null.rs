use crate::{
    config::ConnectionConfig,
    jobs::{Job, JobHandle, LeasedJob},
    Result,
};
use std::time::Duration;
use tracing::trace;

/// Accepts and drops every job.
#[derive(Debug, Clone, Default)]
pub struct Backend {}

impl Backend {
    pub fn from_config(_config: &ConnectionConfig) -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl super::Backend for Backend {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn enqueue(&self, job: Job, _delay: Duration) -> Result<JobHandle> {
        trace!("discarding {:?}", job);
        Ok(JobHandle::new(job.id().as_str()))
    }

    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        Ok(None)
    }

    async fn ack(&self, _handle: &JobHandle) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _handle: &JobHandle, _delay: Duration) -> Result<()> {
        Ok(())
    }
}
