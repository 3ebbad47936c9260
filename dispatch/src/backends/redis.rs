//! Redis-backed queue.
//!
//! Keys for a queue named `emails`:
//! - `steady_queue:emails` ready list
//! - `steady_queue:emails:delayed` sorted set scored by `available_at`
//! - `steady_queue:emails:reserved` sorted set scored by lease deadline
//! - `steady_queue:emails:failed` dead-letter list
//!
//! Reserved members are `{lease}:{job}` so a reclaimed and re-leased job gets
//! a different member and the stale handle no longer matches.

use crate::{
    config::ConnectionConfig,
    jobs::{Job, JobHandle, LeasedJob, QueueName},
    Error, Result,
};
use chrono::Utc;
use lazy_static::lazy_static;
use nanoid::nanoid;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

lazy_static! {
    // KEYS: ready, delayed, reserved. ARGV: now, lease deadline, lease token.
    static ref SCRIPT_POP: redis::Script = redis::Script::new(
        r#"
            local due = redis.call("zrangebyscore", KEYS[2], "-inf", ARGV[1])
            for i = 1, #due do
                redis.call("zrem", KEYS[2], due[i])
                redis.call("rpush", KEYS[1], due[i])
            end
            local expired = redis.call("zrangebyscore", KEYS[3], "-inf", ARGV[1])
            for i = 1, #expired do
                redis.call("zrem", KEYS[3], expired[i])
                local sep = string.find(expired[i], ":", 1, true)
                redis.call("rpush", KEYS[1], string.sub(expired[i], sep + 1))
            end
            local job = redis.call("lpop", KEYS[1])
            if not job then
                return false
            end
            local member = ARGV[3] .. ":" .. job
            redis.call("zadd", KEYS[3], ARGV[2], member)
            return member
            "#
    );

    // KEYS: reserved, ready, delayed, failed. ARGV: member, job, placement, score.
    static ref SCRIPT_RELEASE: redis::Script = redis::Script::new(
        r#"
            if redis.call("zrem", KEYS[1], ARGV[1]) == 0 then
                return 0
            end
            if ARGV[3] == "ready" then
                redis.call("rpush", KEYS[2], ARGV[2])
            elseif ARGV[3] == "delayed" then
                redis.call("zadd", KEYS[3], ARGV[4], ARGV[2])
            else
                redis.call("rpush", KEYS[4], ARGV[2])
            end
            return 1
            "#
    );
}

/// Where a released job goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Ready,
    Delayed(i64),
    Failed,
}

impl Placement {
    fn after_release(job: &mut Job, delay: Duration) -> Result<Self> {
        if job.record_attempt() {
            warn!("job {} exhausted {} attempts", job.id(), job.max_attempts());
            return Ok(Placement::Failed);
        }
        job.delay_by(delay)?;
        if delay.is_zero() {
            Ok(Placement::Ready)
        } else {
            Ok(Placement::Delayed(job.available_at().timestamp_millis()))
        }
    }

    fn as_args(self) -> (&'static str, i64) {
        match self {
            Placement::Ready => ("ready", 0),
            Placement::Delayed(score) => ("delayed", score),
            Placement::Failed => ("failed", 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Keys {
    ready: String,
    delayed: String,
    reserved: String,
    failed: String,
}

impl Keys {
    fn new(queue: &QueueName) -> Self {
        let ready = format!("steady_queue:{}", queue.as_str());
        Self {
            delayed: format!("{}:delayed", ready),
            reserved: format!("{}:reserved", ready),
            failed: format!("{}:failed", ready),
            ready,
        }
    }
}

fn job_from_member(member: &str) -> Result<Job> {
    let (_, text) = member
        .split_once(':')
        .ok_or_else(|| Error::Serialization(format!("malformed reservation '{}'", member)))?;
    Job::from_text(text)
}

pub struct Backend {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    keys: Keys,
    visibility_timeout: Duration,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("keys", &self.keys)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

impl Backend {
    pub fn new(redis_url: &str, queue: QueueName) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            keys: Keys::new(&queue),
            visibility_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
        })
    }

    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let mut backend = Self::new(config.require_url()?, config.queue_name())?;
        backend.visibility_timeout = config.visibility_timeout();
        backend.connect_timeout = config.connect_timeout();
        Ok(backend)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }
        let connection = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| Error::BackendUnavailable("timed out connecting to redis".into()))??;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Drops the cached connection after transport errors so the next call
    /// reconnects.
    async fn checked<T>(&self, result: redis::RedisResult<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                warn!("dropping redis connection: {}", e);
                *self.connection.lock().await = None;
            }
        }
        Ok(result?)
    }

    async fn make_available(
        &self,
        connection: &mut MultiplexedConnection,
        job: &Job,
        delay: Duration,
    ) -> Result<()> {
        let text = job.to_text()?;
        if delay.is_zero() {
            let result: redis::RedisResult<i64> = connection.rpush(&self.keys.ready, text).await;
            self.checked(result).await?;
        } else {
            debug!("job executes in the future, placing in delayed set");
            let result: redis::RedisResult<i64> = connection
                .zadd(&self.keys.delayed, text, job.available_at().timestamp_millis())
                .await;
            self.checked(result).await?;
        }
        Ok(())
    }

    async fn take_reservation(
        &self,
        connection: &mut MultiplexedConnection,
        handle: &JobHandle,
    ) -> Result<()> {
        let result: redis::RedisResult<i64> =
            connection.zrem(&self.keys.reserved, handle.as_str()).await;
        if self.checked(result).await? == 0 {
            return Err(Error::HandleExpired(handle.to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl super::Backend for Backend {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self), fields(queue = %self.keys.ready))]
    async fn enqueue(&self, mut job: Job, delay: Duration) -> Result<JobHandle> {
        job.delay_by(delay)?;
        let mut connection = self.connection().await?;
        self.make_available(&mut connection, &job, delay).await?;
        Ok(JobHandle::new(job.id().as_str()))
    }

    #[instrument(skip(self), fields(queue = %self.keys.ready))]
    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        let mut connection = self.connection().await?;
        let now = Utc::now().timestamp_millis();
        let deadline = now
            .saturating_add(i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX));
        let result = SCRIPT_POP
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.reserved)
            .arg(now)
            .arg(deadline)
            .arg(nanoid!())
            .invoke_async::<_, Option<String>>(&mut connection)
            .await;

        match self.checked(result).await? {
            Some(member) => {
                let job = job_from_member(&member)?;
                Ok(Some(LeasedJob {
                    job,
                    handle: JobHandle::new(member),
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        let mut connection = self.connection().await?;
        self.take_reservation(&mut connection, handle).await
    }

    /// Removes the reservation and files the job in one script so a failed
    /// round trip leaves the reservation to be reclaimed.
    #[instrument(skip(self), fields(queue = %self.keys.ready))]
    async fn release(&self, handle: &JobHandle, delay: Duration) -> Result<()> {
        let mut job = job_from_member(handle.as_str())?;
        let (placement, score) = Placement::after_release(&mut job, delay)?.as_args();

        let mut connection = self.connection().await?;
        let result = SCRIPT_RELEASE
            .key(&self.keys.reserved)
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.failed)
            .arg(handle.as_str())
            .arg(job.to_text()?)
            .arg(placement)
            .arg(score)
            .invoke_async::<_, i64>(&mut connection)
            .await;
        if self.checked(result).await? == 0 {
            return Err(Error::HandleExpired(handle.to_string()));
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<Job>> {
        let mut connection = self.connection().await?;
        let result: redis::RedisResult<Vec<String>> =
            connection.lrange(&self.keys.failed, 0, -1).await;
        self.checked(result)
            .await?
            .iter()
            .map(|text| Job::from_text(text))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Backend as _;

    const REDIS_URL: &str = "redis://127.0.0.1";

    #[test]
    fn keys_share_the_queue_prefix() {
        let keys = Keys::new(&QueueName::from("emails"));
        assert_eq!(keys.ready, "steady_queue:emails");
        assert_eq!(keys.reserved, "steady_queue:emails:reserved");
        assert_eq!(keys.failed, "steady_queue:emails:failed");
    }

    #[test]
    fn member_carries_the_job() {
        let job = Job::new("mail", b"{}".to_vec());
        let member = format!("{}:{}", nanoid!(), job.to_text().unwrap());
        assert_eq!(job_from_member(&member).unwrap(), job);
        assert!(job_from_member("no-separator").is_err());
    }

    #[test]
    fn release_placement_follows_attempts_and_delay() {
        let mut job = Job::new("mail", Vec::new()).on_queue("emails".into(), 1);
        assert_eq!(
            Placement::after_release(&mut job, Duration::ZERO).unwrap(),
            Placement::Ready
        );
        assert_eq!(job.attempts(), 1);

        let mut job = Job::new("mail", Vec::new()).on_queue("emails".into(), 3);
        let placement = Placement::after_release(&mut job, Duration::from_secs(30)).unwrap();
        assert_eq!(
            placement,
            Placement::Delayed(job.available_at().timestamp_millis())
        );

        let mut job = Job::new("mail", Vec::new()).on_queue("emails".into(), 0);
        assert_eq!(
            Placement::after_release(&mut job, Duration::ZERO).unwrap().as_args(),
            ("failed", 0)
        );
    }

    #[tokio::test]
    async fn refused_connection_is_backend_unavailable() {
        let config = ConnectionConfig::new("redis").with_url("redis://127.0.0.1:1");
        let backend = Backend::from_config(&config).unwrap();
        let err = backend
            .enqueue(Job::new("mail", Vec::new()), Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backend_unavailable");
    }

    #[tokio::test]
    #[ignore = "requires a redis server on localhost"]
    async fn lease_round_trip() {
        let queue = QueueName::from(format!("test-{}", nanoid!(8)));
        let backend = Backend::new(REDIS_URL, queue).unwrap();
        let job = Job::new("mail", Vec::new()).on_queue("mail".into(), 1);
        backend.enqueue(job.clone(), Duration::ZERO).await.unwrap();

        let leased = backend.dequeue().await.unwrap().unwrap();
        assert_eq!(leased.job.id(), job.id());
        backend.release(&leased.handle, Duration::ZERO).await.unwrap();

        let leased = backend.dequeue().await.unwrap().unwrap();
        assert_eq!(leased.job.attempts(), 1);
        backend.release(&leased.handle, Duration::ZERO).await.unwrap();

        assert!(backend.dequeue().await.unwrap().is_none());
        assert_eq!(backend.dead_letters().await.unwrap().len(), 1);
    }
}
