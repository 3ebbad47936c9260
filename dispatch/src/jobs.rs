use crate::error::{Error, Result, StdError};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use nanoid::nanoid;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{instrument, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + Default {
    const NAME: &'static str;
    type Arg: DeserializeOwned + Send;
    type Error: Into<StdError> + Send + Sync;

    async fn perform(&mut self, arg: Self::Arg) -> std::result::Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

impl JobId {
    pub(crate) fn random() -> Self {
        Self(nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A unit of work plus the bookkeeping drivers need to lease and retry it.
///
/// Only `attempts` and `available_at` change after enqueue, and only the
/// driver holding the job changes them.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    name: String,
    payload: Vec<u8>,
    queue: QueueName,
    attempts: u32,
    max_attempts: u32,
    available_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("available_at", &self.available_at)
            .finish()
    }
}

impl Job {
    pub fn new<N>(name: N, payload: Vec<u8>) -> Self
    where
        N: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: JobId::random(),
            name: name.into(),
            payload,
            queue: QueueName::from("default"),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            available_at: now,
            created_at: now,
        }
    }

    /// Builds a job whose payload is the JSON encoding of `arg`.
    pub fn from_json<N, S>(name: N, arg: &S) -> Result<Self>
    where
        N: Into<String>,
        S: Serialize + ?Sized,
    {
        Ok(Self::new(name, serde_json::to_vec(arg)?))
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn available_at(&self) -> DateTime<Utc> {
        self.available_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn decode_payload<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn on_queue(self, queue: QueueName, max_attempts: u32) -> Self {
        Self {
            queue,
            max_attempts,
            ..self
        }
    }

    /// Pushes `available_at` to `now + delay`. Drivers call this on enqueue
    /// and release.
    pub fn delay_by(&mut self, delay: std::time::Duration) -> Result<()> {
        let delay = Duration::from_std(delay)
            .map_err(|_| Error::InvalidArgument(format!("delay {:?} out of range", delay)))?;
        self.available_at = Utc::now() + delay;
        Ok(())
    }

    /// Records a failed delivery. Returns true once the retry budget is spent
    /// and the job belongs in the dead-letter path.
    pub fn record_attempt(&mut self) -> bool {
        self.attempts += 1;
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts > self.max_attempts
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Text form for transports that only carry UTF-8 bodies.
    pub fn to_text(&self) -> Result<String> {
        Ok(STANDARD.encode(self.to_bytes()?))
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Self::from_bytes(&STANDARD.decode(text.trim())?)
    }
}

/// Driver-issued token correlating a lease with its backend record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new<S>(handle: S) -> Self
    where
        S: Into<String>,
    {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub handle: JobHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

impl<S> From<S> for QueueName
where
    S: Into<String>,
{
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

#[async_trait::async_trait]
trait AnyJobHandler: Send + Sync {
    async fn perform(&mut self, job: &Job) -> Result<()>;
}

#[async_trait::async_trait]
impl<T, A, E> AnyJobHandler for T
where
    A: DeserializeOwned + Send,
    E: Into<StdError> + Send + Sync,
    T: JobHandler<Arg = A, Error = E> + 'static,
{
    #[instrument(skip(self))]
    async fn perform(&mut self, job: &Job) -> Result<()> {
        let arg = job.decode_payload::<A>()?;
        T::perform(self, arg).await.map_err(|e| Error::JobFailed {
            id: job.id.clone(),
            name: job.name.clone(),
            source: e.into(),
        })
    }
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn AnyJobHandler> + Send + Sync>;

/// Job name to handler mapping, shared by the sync driver and workers.
#[derive(Default, Clone)]
pub struct Handlers {
    handlers_by_name: Arc<RwLock<HashMap<String, HandlerFactory>>>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("names", &self.names())
            .finish()
    }
}

impl Handlers {
    pub fn register<S>(&self) -> Result<()>
    where
        S: JobHandler + 'static,
    {
        let mut handlers = self
            .handlers_by_name
            .write()
            .map_err(|_| Error::Config("handler registry poisoned".into()))?;
        if handlers.contains_key(S::NAME) {
            let err = Error::HandlerAlreadyRegistered(S::NAME);
            warn!("{}", err);
            return Err(err);
        }
        let factory: HandlerFactory = Arc::new(|| Box::new(S::default()) as Box<dyn AnyJobHandler>);
        handlers.insert(S::NAME.to_string(), factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers_by_name
            .read()
            .map(|handlers| handlers.contains_key(name))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers_by_name
            .read()
            .map(|handlers| handlers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Runs the handler registered for `job.name()` to completion.
    pub async fn perform(&self, job: &Job) -> Result<()> {
        let factory = self
            .handlers_by_name
            .read()
            .map_err(|_| Error::Config("handler registry poisoned".into()))?
            .get(job.name())
            .cloned()
            .ok_or_else(|| Error::NoHandler(job.name().to_string()))?;
        let mut handler = factory();
        handler.perform(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_exhaust_after_max() {
        let mut job = Job::new("mail", b"{}".to_vec()).on_queue("emails".into(), 2);
        assert!(!job.record_attempt());
        assert!(!job.record_attempt());
        assert!(job.record_attempt());
        assert_eq!(job.attempts(), 3);
    }

    #[test]
    fn text_encoding_survives_whitespace() {
        let job = Job::from_json("mail", &serde_json::json!({"to": "a@b.c"})).unwrap();
        let text = format!("{}\r\n", job.to_text().unwrap());
        assert_eq!(Job::from_text(&text).unwrap(), job);
    }

    #[test]
    fn garbage_text_is_a_serialization_error() {
        let err = Job::from_text("not base64!").unwrap_err();
        assert_eq!(err.kind(), "serialization_error");
    }
}
