use crate::{
    error::{ErrorHandler, ErrorHandlers},
    jobs::{JobHandler, LeasedJob, QueueName},
    manager::DispatchManager,
    Error, Result,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Pulls jobs from one connection and runs them through the registered
/// handlers.
///
/// A successful run acks the job. A failed run reports to the error handlers
/// and releases the job with an exponential backoff of
/// `backoff * 2^attempts`, so the backend decides when it is dead.
pub struct Worker {
    manager: Arc<DispatchManager>,
    queue: QueueName,
    error_handlers: ErrorHandlers,
    poll_interval: Duration,
    backoff: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue)
            .field("poll_interval", &self.poll_interval)
            .field("handlers", self.manager.handlers())
            .finish()
    }
}

impl Worker {
    pub fn new<Q>(manager: Arc<DispatchManager>, queue: Q) -> Self
    where
        Q: Into<QueueName>,
    {
        Self {
            manager,
            queue: queue.into(),
            error_handlers: ErrorHandlers::default(),
            poll_interval: Duration::from_millis(250),
            backoff: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn add_error_handler(&mut self, handler: impl ErrorHandler + 'static) {
        self.error_handlers.add(handler);
    }

    /// Registers `S` on the manager's handlers, which the `sync` driver
    /// shares.
    pub fn register_handler<S>(&mut self) -> Result<()>
    where
        S: JobHandler + 'static,
    {
        self.manager.handlers().register::<S>()
    }

    fn retry_delay(&self, attempts: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempts.min(16)))
    }

    /// Runs at most one job. Returns `false` when nothing was ready.
    #[instrument(name = "work_once", skip(self), fields(queue = %self.queue))]
    pub async fn work_once(&self) -> Result<bool> {
        let queue = self.queue.as_str();
        let LeasedJob { job, handle } = match self.manager.pop(queue).await? {
            Some(leased) => leased,
            None => return Ok(false),
        };

        let outcome = self
            .manager
            .handlers()
            .perform(&job)
            .instrument(tracing::info_span!("run_job", job = %job.id(), handler = job.name()))
            .await;

        let settled = match outcome {
            Ok(()) => {
                debug!("job {} done", job.id());
                self.manager.ack(queue, &handle).await
            }
            Err(e) => {
                error!("job {} failed: {}", job.id(), e);
                self.error_handlers.job_failed(job.id(), job.name(), &e);
                let delay = self.retry_delay(job.attempts());
                self.manager.release(queue, &handle, delay).await
            }
        };

        match settled {
            Err(Error::HandleExpired(_)) => {
                warn!("lease on job {} expired before it was settled", job.id());
                Ok(true)
            }
            Err(e) => Err(e),
            Ok(()) => Ok(true),
        }
    }

    /// Polls until `shutdown` resolves, draining every ready job on each
    /// tick.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut interval = time::interval(self.poll_interval);
        tokio::pin!(shutdown);
        info!("worker on {} started", self.queue);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("worker on {} stopping", self.queue);
                    break;
                }
                _ = interval.tick() => {
                    loop {
                        match self.work_once().await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(e) => {
                                error!("queue [{}] failed to process: {}", self.queue, e);
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;

    #[test]
    fn retry_delay_doubles() {
        let manager = Arc::new(DispatchManager::new(&DispatchConfig::default()));
        let worker = Worker::new(manager, "default").with_backoff(Duration::from_millis(100));
        assert_eq!(worker.retry_delay(0), Duration::from_millis(100));
        assert_eq!(worker.retry_delay(3), Duration::from_millis(800));
        assert!(worker.retry_delay(u32::MAX) >= worker.retry_delay(16));
    }
}
