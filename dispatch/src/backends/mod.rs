//! Backend drivers.
//!
//! Every driver speaks the same lease protocol: `enqueue` stores a job,
//! `dequeue` claims one ready job under a visibility timeout, and the holder
//! of the returned handle either `ack`s it or `release`s it for another try.
//!
//! Two drivers do not follow that model. `null` discards everything, and
//! `sync` runs the job inside `enqueue` on the caller's task, returning only
//! once the handler has finished. A handler failure comes back from the sync
//! driver's `enqueue` as [`Error::JobFailed`](crate::Error::JobFailed) rather
//! than being retried later, so callers pushing to a sync connection see
//! execution errors directly and wait for the full run.

pub(crate) mod beanstalk;
pub(crate) mod database;
pub(crate) mod memory;
pub(crate) mod null;
#[cfg(feature = "backend-redis")]
pub(crate) mod redis;
pub(crate) mod sqs;
pub(crate) mod sync;

use crate::{
    jobs::{Job, JobHandle, LeasedJob},
    Result,
};
use std::time::Duration;

#[async_trait::async_trait]
pub trait Backend: std::fmt::Debug + Send + Sync {
    /// Registry key of the driver, used in logs.
    fn name(&self) -> &'static str;

    /// Stores `job` so that it becomes available after `delay`. Atomic from
    /// the caller's point of view: either the whole job is stored or nothing.
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<JobHandle>;

    /// Claims one available job. `None` when nothing is ready.
    async fn dequeue(&self) -> Result<Option<LeasedJob>>;

    /// Removes a leased job for good.
    async fn ack(&self, handle: &JobHandle) -> Result<()>;

    /// Gives a leased job back after `delay`, counting one more attempt.
    /// Jobs past their attempt budget go to the dead-letter path instead.
    async fn release(&self, handle: &JobHandle, delay: Duration) -> Result<()>;

    /// Jobs that exhausted their attempts, for backends that keep them locally.
    async fn dead_letters(&self) -> Result<Vec<Job>> {
        Ok(Vec::new())
    }
}
