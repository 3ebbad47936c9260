//! Cloud message-queue driver with SQS semantics.
//!
//! The driver talks to the queue through [`QueueClient`], which the
//! `backend-sqs` feature implements on top of `aws-sdk-sqs`. Releasing a job
//! sends a fresh message carrying the bumped attempt count and then deletes
//! the received one, because SQS bodies are immutable. A failure between the
//! two leaves a duplicate rather than losing the job.

use crate::{
    config::ConnectionConfig,
    jobs::{Job, JobHandle, LeasedJob},
    Error, Result,
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, instrument, warn};

/// Longest delay SQS accepts on a single message.
pub const MAX_DELAY: Duration = Duration::from_secs(900);

/// Longest visibility timeout SQS accepts.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(43_200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub body: String,
    pub receipt: String,
}

#[async_trait::async_trait]
pub trait QueueClient: Send + Sync {
    /// Sends `body`, hidden for `delay`. Returns the message id.
    async fn send(&self, queue_url: &str, body: String, delay: Duration) -> Result<String>;

    async fn receive(
        &self,
        queue_url: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>>;

    /// Fails with `HandleExpired` when the receipt is no longer valid.
    async fn delete(&self, queue_url: &str, receipt: &str) -> Result<()>;
}

fn handle_for(receipt: &str, job: &Job) -> Result<JobHandle> {
    Ok(JobHandle::new(format!("{} {}", receipt, job.to_text()?)))
}

fn split_handle(handle: &JobHandle) -> Result<(&str, &str)> {
    handle
        .as_str()
        .split_once(' ')
        .ok_or_else(|| Error::HandleExpired(handle.to_string()))
}

pub struct Backend {
    client: Arc<dyn QueueClient>,
    queue_url: String,
    dead_letter_url: Option<String>,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsBackend")
            .field("queue_url", &self.queue_url)
            .field("dead_letter_url", &self.dead_letter_url)
            .finish()
    }
}

impl Backend {
    pub fn new<S: Into<String>>(client: Arc<dyn QueueClient>, queue_url: S) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            dead_letter_url: None,
            visibility_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_client(client: Arc<dyn QueueClient>, config: &ConnectionConfig) -> Result<Self> {
        let mut backend = Self::new(client, config.require_url()?);
        backend.dead_letter_url = config.dead_letter.clone();
        backend.visibility_timeout = config.visibility_timeout().min(MAX_VISIBILITY_TIMEOUT);
        Ok(backend)
    }

    #[cfg(feature = "backend-sqs")]
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let client = aws::SqsClient::from_config(config).await;
        Self::with_client(Arc::new(client), config)
    }

    #[cfg(not(feature = "backend-sqs"))]
    pub async fn connect(_config: &ConnectionConfig) -> Result<Self> {
        Err(Error::Config(
            "built without the backend-sqs feature".to_string(),
        ))
    }

    async fn send(&self, queue_url: &str, job: &Job) -> Result<()> {
        let delay = (job.available_at() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_DELAY);
        self.client.send(queue_url, job.to_text()?, delay).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl super::Backend for Backend {
    fn name(&self) -> &'static str {
        "sqs"
    }

    #[instrument(skip(self), fields(queue_url = %self.queue_url))]
    async fn enqueue(&self, mut job: Job, delay: Duration) -> Result<JobHandle> {
        job.delay_by(delay)?;
        if delay > MAX_DELAY {
            debug!("delay {:?} exceeds the sqs limit, job will be re-sent", delay);
        }
        self.send(&self.queue_url, &job).await?;
        Ok(JobHandle::new(job.id().as_str()))
    }

    #[instrument(skip(self), fields(queue_url = %self.queue_url))]
    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        let message = match self
            .client
            .receive(&self.queue_url, self.visibility_timeout)
            .await?
        {
            Some(message) => message,
            None => return Ok(None),
        };

        let job = Job::from_text(&message.body)?;
        if !job.is_available(Utc::now()) {
            // delay longer than one sqs hop: push it back for the remainder
            self.send(&self.queue_url, &job).await?;
            self.client.delete(&self.queue_url, &message.receipt).await?;
            return Ok(None);
        }

        let handle = handle_for(&message.receipt, &job)?;
        Ok(Some(LeasedJob { job, handle }))
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        let (receipt, _) = split_handle(handle)?;
        self.client.delete(&self.queue_url, receipt).await
    }

    #[instrument(skip(self), fields(queue_url = %self.queue_url))]
    async fn release(&self, handle: &JobHandle, delay: Duration) -> Result<()> {
        let (receipt, text) = split_handle(handle)?;
        let mut job = Job::from_text(text)?;

        if job.record_attempt() {
            warn!("job {} exhausted {} attempts", job.id(), job.max_attempts());
            match &self.dead_letter_url {
                Some(url) => self.send(url, &job).await?,
                None => error!("no dead-letter queue configured, dropping job {}", job.id()),
            }
        } else {
            job.delay_by(delay)?;
            self.send(&self.queue_url, &job).await?;
        }
        self.client.delete(&self.queue_url, receipt).await
    }
}

#[cfg(feature = "backend-sqs")]
pub mod aws {
    use super::{QueueClient, ReceivedMessage};
    use crate::{config::ConnectionConfig, Error, Result};
    use aws_sdk_sqs::{
        error::DisplayErrorContext, operation::delete_message::DeleteMessageError, Client,
    };
    use std::time::Duration;

    fn unavailable<E>(e: E) -> Error
    where
        E: std::error::Error,
    {
        Error::BackendUnavailable(DisplayErrorContext(e).to_string())
    }

    #[derive(Debug, Clone)]
    pub struct SqsClient {
        client: Client,
    }

    impl SqsClient {
        pub async fn from_config(config: &ConnectionConfig) -> Self {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = &config.region {
                loader = loader.region(aws_config::Region::new(region.clone()));
            }
            let shared = loader.load().await;
            Self {
                client: Client::new(&shared),
            }
        }
    }

    #[async_trait::async_trait]
    impl QueueClient for SqsClient {
        async fn send(&self, queue_url: &str, body: String, delay: Duration) -> Result<String> {
            let output = self
                .client
                .send_message()
                .queue_url(queue_url)
                .message_body(body)
                .delay_seconds(delay.min(super::MAX_DELAY).as_secs() as i32)
                .send()
                .await
                .map_err(unavailable)?;
            Ok(output.message_id().unwrap_or_default().to_string())
        }

        async fn receive(
            &self,
            queue_url: &str,
            visibility_timeout: Duration,
        ) -> Result<Option<ReceivedMessage>> {
            let output = self
                .client
                .receive_message()
                .queue_url(queue_url)
                .max_number_of_messages(1)
                .visibility_timeout(
                    visibility_timeout
                        .min(super::MAX_VISIBILITY_TIMEOUT)
                        .as_secs() as i32,
                )
                .wait_time_seconds(0)
                .send()
                .await
                .map_err(unavailable)?;

            let message = match output.messages().first() {
                Some(message) => message,
                None => return Ok(None),
            };
            match (message.body(), message.receipt_handle()) {
                (Some(body), Some(receipt)) => Ok(Some(ReceivedMessage {
                    body: body.to_string(),
                    receipt: receipt.to_string(),
                })),
                _ => Err(Error::Serialization(
                    "sqs message without body or receipt handle".to_string(),
                )),
            }
        }

        async fn delete(&self, queue_url: &str, receipt: &str) -> Result<()> {
            match self
                .client
                .delete_message()
                .queue_url(queue_url)
                .receipt_handle(receipt)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => match e.as_service_error() {
                    Some(DeleteMessageError::ReceiptHandleIsInvalid(_)) => {
                        Err(Error::HandleExpired(receipt.to_string()))
                    }
                    _ => Err(unavailable(e)),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Backend as _;
    use nanoid::nanoid;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Instant,
    };
    use tokio::sync::Mutex;

    struct Message {
        body: String,
        receipt: Option<String>,
        visible_at: Instant,
    }

    /// Single-process stand-in with SQS visibility semantics.
    #[derive(Default)]
    struct FakeSqs {
        queues: Mutex<std::collections::HashMap<String, Vec<Message>>>,
        fail_sends: AtomicBool,
    }

    impl FakeSqs {
        async fn depth(&self, queue_url: &str) -> usize {
            self.queues
                .lock()
                .await
                .get(queue_url)
                .map(|messages| messages.len())
                .unwrap_or(0)
        }
    }

    #[async_trait::async_trait]
    impl QueueClient for FakeSqs {
        async fn send(&self, queue_url: &str, body: String, delay: Duration) -> Result<String> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::BackendUnavailable("sqs is down".into()));
            }
            self.queues
                .lock()
                .await
                .entry(queue_url.to_string())
                .or_default()
                .push(Message {
                    body,
                    receipt: None,
                    visible_at: Instant::now() + delay,
                });
            Ok(nanoid!())
        }

        async fn receive(
            &self,
            queue_url: &str,
            visibility_timeout: Duration,
        ) -> Result<Option<ReceivedMessage>> {
            let mut queues = self.queues.lock().await;
            let now = Instant::now();
            let message = queues
                .get_mut(queue_url)
                .and_then(|messages| messages.iter_mut().find(|m| m.visible_at <= now));
            Ok(message.map(|message| {
                let receipt = nanoid!();
                message.receipt = Some(receipt.clone());
                message.visible_at = now + visibility_timeout;
                ReceivedMessage {
                    body: message.body.clone(),
                    receipt,
                }
            }))
        }

        async fn delete(&self, queue_url: &str, receipt: &str) -> Result<()> {
            let mut queues = self.queues.lock().await;
            let messages = queues.entry(queue_url.to_string()).or_default();
            match messages
                .iter()
                .position(|m| m.receipt.as_deref() == Some(receipt))
            {
                Some(i) => {
                    messages.remove(i);
                    Ok(())
                }
                None => Err(Error::HandleExpired(receipt.to_string())),
            }
        }
    }

    fn backend(client: Arc<FakeSqs>, max_attempts: u32) -> Backend {
        let config = ConnectionConfig::new("sqs")
            .with_url("https://sqs.local/jobs")
            .with_dead_letter("https://sqs.local/jobs-dlq")
            .with_max_attempts(max_attempts);
        Backend::with_client(client, &config).unwrap()
    }

    #[tokio::test]
    async fn ack_deletes_the_message() {
        let client = Arc::new(FakeSqs::default());
        let backend = backend(client.clone(), 3);
        backend
            .enqueue(Job::new("mail", Vec::new()), Duration::ZERO)
            .await
            .unwrap();

        let leased = backend.dequeue().await.unwrap().unwrap();
        backend.ack(&leased.handle).await.unwrap();
        assert!(backend.dequeue().await.unwrap().is_none());
        assert_eq!(client.depth("https://sqs.local/jobs").await, 0);
    }

    #[tokio::test]
    async fn exhausted_job_moves_to_dead_letter_queue() {
        let client = Arc::new(FakeSqs::default());
        let backend = backend(client.clone(), 1);
        let job = Job::new("mail", Vec::new()).on_queue("jobs".into(), 1);
        backend.enqueue(job, Duration::ZERO).await.unwrap();

        let leased = backend.dequeue().await.unwrap().unwrap();
        backend.release(&leased.handle, Duration::ZERO).await.unwrap();
        let leased = backend.dequeue().await.unwrap().unwrap();
        assert_eq!(leased.job.attempts(), 1);
        backend.release(&leased.handle, Duration::ZERO).await.unwrap();

        assert!(backend.dequeue().await.unwrap().is_none());
        assert_eq!(client.depth("https://sqs.local/jobs-dlq").await, 1);
    }

    #[tokio::test]
    async fn long_delay_is_not_delivered_early() {
        let client = Arc::new(FakeSqs::default());
        let backend = backend(client.clone(), 3);
        backend
            .enqueue(Job::new("mail", Vec::new()), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(backend.dequeue().await.unwrap().is_none());
        assert_eq!(client.depth("https://sqs.local/jobs").await, 1);
    }

    #[tokio::test]
    async fn stale_receipt_is_expired() {
        let client = Arc::new(FakeSqs::default());
        let backend = backend(client, 3);
        backend
            .enqueue(Job::new("mail", Vec::new()), Duration::ZERO)
            .await
            .unwrap();
        let leased = backend.dequeue().await.unwrap().unwrap();
        backend.ack(&leased.handle).await.unwrap();
        assert!(matches!(
            backend.ack(&leased.handle).await,
            Err(Error::HandleExpired(_))
        ));
    }

    #[tokio::test]
    async fn failed_resend_keeps_the_message() {
        let client = Arc::new(FakeSqs::default());
        let backend = backend(client.clone(), 3);
        backend
            .enqueue(Job::new("mail", Vec::new()), Duration::ZERO)
            .await
            .unwrap();
        let leased = backend.dequeue().await.unwrap().unwrap();

        client.fail_sends.store(true, Ordering::SeqCst);
        let err = backend
            .release(&leased.handle, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backend_unavailable");
        assert_eq!(client.depth("https://sqs.local/jobs").await, 1);
    }

    #[test]
    fn visibility_timeout_is_clamped() {
        let config = ConnectionConfig::new("sqs")
            .with_url("https://sqs.local/jobs")
            .with_visibility_timeout(Duration::from_secs(100_000));
        let backend = Backend::with_client(Arc::new(FakeSqs::default()), &config).unwrap();
        assert_eq!(backend.visibility_timeout, MAX_VISIBILITY_TIMEOUT);
    }
}
