//! Beanstalkd driver speaking the text protocol directly.
//!
//! The tube is the connection's queue name and the job TTR is the visibility
//! timeout, so beanstalkd itself hands an unacknowledged job to the next
//! reserver. Jobs past their attempt budget are buried.

use crate::{
    config::ConnectionConfig,
    jobs::{Job, JobHandle, LeasedJob, QueueName},
    Error, Result,
};
use nanoid::nanoid;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::Mutex,
};
use tracing::{debug, instrument, warn};

const DEFAULT_PRIORITY: u32 = 1024;
const DEFAULT_TUBE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Inserted(u64),
    Reserved { id: u64, len: usize },
    Found { id: u64, len: usize },
    Using(String),
    Watching(u32),
    Deleted,
    Buried,
    TimedOut,
    DeadlineSoon,
    NotFound,
    NotIgnored,
    Failure(String),
}

fn parse_reply(line: &str) -> Result<Reply> {
    let malformed = || Error::BackendUnavailable(format!("unexpected beanstalkd reply '{}'", line));
    let mut parts = line.split_whitespace();
    let word = parts.next().ok_or_else(malformed)?;
    let mut number = |what: &str| -> Result<u64> {
        parts
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| {
                Error::BackendUnavailable(format!("missing {} in beanstalkd reply '{}'", what, line))
            })
    };

    let reply = match word {
        "INSERTED" => Reply::Inserted(number("id")?),
        "RESERVED" => Reply::Reserved {
            id: number("id")?,
            len: number("length")? as usize,
        },
        "FOUND" => Reply::Found {
            id: number("id")?,
            len: number("length")? as usize,
        },
        "WATCHING" => Reply::Watching(number("count")? as u32),
        "USING" => Reply::Using(line["USING".len()..].trim().to_string()),
        "DELETED" => Reply::Deleted,
        "BURIED" => Reply::Buried,
        "TIMED_OUT" => Reply::TimedOut,
        "DEADLINE_SOON" => Reply::DeadlineSoon,
        "NOT_FOUND" => Reply::NotFound,
        "NOT_IGNORED" => Reply::NotIgnored,
        "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND"
        | "EXPECTED_CRLF" | "JOB_TOO_BIG" | "DRAINING" => Reply::Failure(word.to_string()),
        _ => return Err(malformed()),
    };
    Ok(reply)
}

struct Lease {
    nonce: String,
    expires_at: Instant,
}

/// Reserved jobs belong to the connection that reserved them, so leases live
/// here and vanish with it.
struct Connection {
    stream: BufReader<TcpStream>,
    leases: HashMap<u64, Lease>,
}

impl Connection {
    async fn open(address: &str, tube: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::BackendUnavailable(format!("timed out connecting to {}", address)))??;
        let mut connection = Self {
            stream: BufReader::new(stream),
            leases: HashMap::new(),
        };

        match connection.send(&format!("use {}", tube), None).await? {
            Reply::Using(_) => {}
            other => return Err(unexpected(other)),
        }
        match connection.send(&format!("watch {}", tube), None).await? {
            Reply::Watching(_) => {}
            other => return Err(unexpected(other)),
        }
        if tube != DEFAULT_TUBE {
            match connection.send("ignore default", None).await? {
                Reply::Watching(_) | Reply::NotIgnored => {}
                other => return Err(unexpected(other)),
            }
        }
        debug!("connected to beanstalkd at {} on tube {}", address, tube);
        Ok(connection)
    }

    async fn send(&mut self, command: &str, body: Option<&[u8]>) -> Result<Reply> {
        let mut frame = Vec::with_capacity(command.len() + 2);
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(b"\r\n");
        if let Some(body) = body {
            frame.extend_from_slice(body);
            frame.extend_from_slice(b"\r\n");
        }
        self.stream.get_mut().write_all(&frame).await?;

        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(Error::BackendUnavailable("beanstalkd closed the connection".into()));
        }
        parse_reply(line.trim_end())
    }

    async fn read_body(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut body = vec![0; len + 2];
        self.stream.read_exact(&mut body).await?;
        body.truncate(len);
        Ok(body)
    }

    async fn read_job(&mut self, len: usize) -> Result<Job> {
        let body = self.read_body(len).await?;
        let text = String::from_utf8(body).map_err(|e| Error::Serialization(e.to_string()))?;
        Job::from_text(&text)
    }

    /// Consumes the lease behind `handle`. A newer reservation of the same
    /// job keeps its lease.
    fn take_lease(&mut self, id: u64, nonce: &str) -> Result<()> {
        match self.leases.remove(&id) {
            Some(lease) if lease.nonce == nonce && lease.expires_at > Instant::now() => Ok(()),
            Some(lease) if lease.nonce != nonce => {
                self.leases.insert(id, lease);
                Err(Error::HandleExpired(format!("{}:{}", id, nonce)))
            }
            _ => Err(Error::HandleExpired(format!("{}:{}", id, nonce))),
        }
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::BackendUnavailable(format!("unexpected beanstalkd reply {:?}", reply))
}

/// Lease handles are `{job id}:{nonce}`.
fn parse_handle(handle: &JobHandle) -> Result<(u64, String)> {
    handle
        .as_str()
        .split_once(':')
        .and_then(|(id, nonce)| Some((id.parse().ok()?, nonce.to_string())))
        .ok_or_else(|| Error::HandleExpired(handle.to_string()))
}

/// beanstalkd counts delays and TTRs in whole seconds.
fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

pub struct Backend {
    address: String,
    tube: QueueName,
    ttr: Duration,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeanstalkBackend")
            .field("address", &self.address)
            .field("tube", &self.tube)
            .finish()
    }
}

impl Backend {
    pub fn new<S: Into<String>>(address: S, tube: QueueName) -> Self {
        Self {
            address: address.into(),
            tube,
            ttr: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
            connection: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let address = config
            .require_url()?
            .trim_start_matches("beanstalkd://")
            .trim_start_matches("beanstalk://")
            .to_string();
        let mut backend = Self::new(address, config.queue_name());
        backend.ttr = config.visibility_timeout();
        backend.connect_timeout = config.connect_timeout();
        Ok(backend)
    }

    fn ttr_secs(&self) -> u64 {
        whole_seconds(self.ttr).max(1)
    }

    async fn put(&self, connection: &mut Connection, job: &Job, delay: Duration) -> Result<u64> {
        let body = job.to_text()?;
        let command = format!(
            "put {} {} {} {}",
            DEFAULT_PRIORITY,
            whole_seconds(delay),
            self.ttr_secs(),
            body.len()
        );
        match connection.send(&command, Some(body.as_bytes())).await? {
            Reply::Inserted(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Runs `op` on the shared connection, opening it first if needed.
    ///
    /// The connection is out of the slot while `op` runs and only goes back
    /// once `op` finishes without a transport error. If the caller drops the
    /// future halfway through an exchange, the connection is dropped with it
    /// instead of leaving an unread reply for the next command.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c Self,
            &'c mut Connection,
        ) -> futures::future::BoxFuture<'c, Result<T>>,
    {
        let mut slot = self.connection.lock().await;
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => {
                Connection::open(&self.address, self.tube.as_str(), self.connect_timeout).await?
            }
        };
        let result = op(self, &mut connection).await;
        match &result {
            Err(Error::BackendUnavailable(e)) => {
                warn!("dropping beanstalkd connection: {}", e);
            }
            _ => *slot = Some(connection),
        }
        result
    }
}

#[async_trait::async_trait]
impl super::Backend for Backend {
    fn name(&self) -> &'static str {
        "beanstalkd"
    }

    #[instrument(skip(self), fields(tube = %self.tube))]
    async fn enqueue(&self, mut job: Job, delay: Duration) -> Result<JobHandle> {
        job.delay_by(delay)?;
        let id = self
            .run(|backend, connection| Box::pin(async move { backend.put(connection, &job, delay).await }))
            .await?;
        Ok(JobHandle::new(id.to_string()))
    }

    #[instrument(skip(self), fields(tube = %self.tube))]
    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        self.run(|backend, connection| {
            Box::pin(async move {
                let reserved_at = Instant::now();
                match connection.send("reserve-with-timeout 0", None).await? {
                    Reply::Reserved { id, len } => {
                        let job = connection.read_job(len).await?;
                        let nonce = nanoid!();
                        connection.leases.insert(
                            id,
                            Lease {
                                nonce: nonce.clone(),
                                expires_at: reserved_at + Duration::from_secs(backend.ttr_secs()),
                            },
                        );
                        Ok(Some(LeasedJob {
                            job,
                            handle: JobHandle::new(format!("{}:{}", id, nonce)),
                        }))
                    }
                    Reply::TimedOut | Reply::DeadlineSoon => Ok(None),
                    other => Err(unexpected(other)),
                }
            })
        })
        .await
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        let (id, nonce) = parse_handle(handle)?;
        self.run(move |_, connection| {
            Box::pin(async move {
                connection.take_lease(id, &nonce)?;
                match connection.send(&format!("delete {}", id), None).await? {
                    Reply::Deleted => Ok(()),
                    Reply::NotFound => Err(Error::HandleExpired(id.to_string())),
                    other => Err(unexpected(other)),
                }
            })
        })
        .await
    }

    #[instrument(skip(self), fields(tube = %self.tube))]
    async fn release(&self, handle: &JobHandle, delay: Duration) -> Result<()> {
        let (id, nonce) = parse_handle(handle)?;
        self.run(move |backend, connection| {
            Box::pin(async move {
                connection.take_lease(id, &nonce)?;
                let mut job = match connection.send(&format!("peek {}", id), None).await? {
                    Reply::Found { len, .. } => connection.read_job(len).await?,
                    Reply::NotFound => return Err(Error::HandleExpired(id.to_string())),
                    other => return Err(unexpected(other)),
                };

                if job.record_attempt() {
                    warn!("job {} exhausted {} attempts, burying", job.id(), job.max_attempts());
                    return match connection
                        .send(&format!("bury {} {}", id, DEFAULT_PRIORITY), None)
                        .await?
                    {
                        Reply::Buried => Ok(()),
                        Reply::NotFound => Err(Error::HandleExpired(id.to_string())),
                        other => Err(unexpected(other)),
                    };
                }

                // the retry copy goes in before the original leaves
                job.delay_by(delay)?;
                backend.put(connection, &job, delay).await?;
                match connection.send(&format!("delete {}", id), None).await? {
                    Reply::Deleted => Ok(()),
                    Reply::NotFound => Err(Error::HandleExpired(id.to_string())),
                    other => Err(unexpected(other)),
                }
            })
        })
        .await
    }
}
