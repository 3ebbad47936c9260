use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use steady_dispatch::{
    ConnectionConfig, DispatchConfig, DispatchManager, Error, ErrorHandler, Job, JobHandler,
    JobId, Worker,
};
use test_env_log::test as logtest;

static DELIVERED: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Email {
    to: String,
}

#[derive(Default)]
struct SendEmail {}

#[steady_dispatch::async_trait]
impl JobHandler for SendEmail {
    const NAME: &'static str = "send_email";
    type Arg = Email;
    type Error = anyhow::Error;

    async fn perform(&mut self, arg: Self::Arg) -> Result<(), Self::Error> {
        tracing::info!("sending to {}", arg.to);
        DELIVERED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Bounce {}

#[steady_dispatch::async_trait]
impl JobHandler for Bounce {
    const NAME: &'static str = "bounce";
    type Arg = Email;
    type Error = anyhow::Error;

    async fn perform(&mut self, arg: Self::Arg) -> Result<(), Self::Error> {
        Err(anyhow::anyhow!("mailbox {} is full", arg.to))
    }
}

#[derive(Clone, Default)]
struct CountFailures(Arc<AtomicUsize>);

impl ErrorHandler for CountFailures {
    fn job_failed(&self, _job_id: &JobId, job_name: &str, _error: &Error) {
        assert_eq!(job_name, "bounce");
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn email(name: &str) -> Result<Job> {
    Ok(Job::from_json(
        name,
        &Email {
            to: "ops@example.com".to_string(),
        },
    )?)
}

fn manager(connection: ConnectionConfig) -> DispatchManager {
    DispatchManager::new(&DispatchConfig::default().with_connection("emails", connection))
}

fn pull_based() -> Vec<ConnectionConfig> {
    vec![
        ConnectionConfig::new("memory"),
        ConnectionConfig::new("database").with_url("sqlite::memory:"),
    ]
}

#[logtest(tokio::test)]
async fn pull_round_trip() -> Result<()> {
    for connection in pull_based() {
        let manager = manager(connection);
        let job = email("send_email")?;
        let id = job.id().clone();
        manager.push("emails", job).await?;

        let leased = manager.pop("emails").await?.expect("job is ready");
        assert_eq!(leased.job.id(), &id);
        assert_eq!(leased.job.attempts(), 0);
        manager.ack("emails", &leased.handle).await?;
        assert!(manager.pop("emails").await?.is_none());
    }
    Ok(())
}

#[logtest(tokio::test)]
async fn release_counts_attempts_then_dead_letters() -> Result<()> {
    for connection in pull_based() {
        let manager = manager(connection.with_max_attempts(2));

        manager.push("emails", email("send_email")?).await?;
        for expected in 0..=2 {
            let leased = manager.pop("emails").await?.expect("job is ready");
            assert_eq!(leased.job.attempts(), expected);
            manager
                .release("emails", &leased.handle, Duration::ZERO)
                .await?;
        }

        assert!(manager.pop("emails").await?.is_none());
        let dead = manager.connection("emails").await?.dead_letters().await?;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts(), 3);
    }
    Ok(())
}

#[logtest(tokio::test)]
async fn delayed_job_is_not_ready() -> Result<()> {
    for connection in pull_based() {
        let manager = manager(connection);
        manager.later("emails", email("send_email")?, 60_000).await?;
        assert!(manager.pop("emails").await?.is_none());
    }
    Ok(())
}

#[logtest(tokio::test)]
async fn null_discards() -> Result<()> {
    let manager = manager(ConnectionConfig::new("null"));
    manager.push("emails", email("send_email")?).await?;
    assert!(manager.pop("emails").await?.is_none());
    Ok(())
}

#[logtest(tokio::test)]
async fn sync_failure_reaches_the_producer() -> Result<()> {
    let manager = manager(ConnectionConfig::new("sync"));
    manager.handlers().register::<Bounce>()?;

    let err = manager.push("emails", email("bounce")?).await.unwrap_err();
    assert_eq!(err.kind(), "job_failed");
    Ok(())
}

#[logtest(tokio::test)]
async fn worker_acks_successful_jobs() -> Result<()> {
    let manager = Arc::new(manager(ConnectionConfig::new("memory")));
    let mut worker = Worker::new(manager.clone(), "emails");
    worker.register_handler::<SendEmail>()?;

    let before = DELIVERED.load(Ordering::SeqCst);
    manager.push("emails", email("send_email")?).await?;
    assert!(worker.work_once().await?);
    assert!(!worker.work_once().await?);
    assert_eq!(DELIVERED.load(Ordering::SeqCst), before + 1);
    Ok(())
}

#[logtest(tokio::test)]
async fn worker_retries_until_dead() -> Result<()> {
    let manager = Arc::new(manager(
        ConnectionConfig::new("memory").with_max_attempts(1),
    ));
    let failures = CountFailures::default();
    let mut worker = Worker::new(manager.clone(), "emails").with_backoff(Duration::ZERO);
    worker.register_handler::<Bounce>()?;
    worker.add_error_handler(failures.clone());

    manager.push("emails", email("bounce")?).await?;
    while worker.work_once().await? {}

    assert_eq!(failures.0.load(Ordering::SeqCst), 2);
    let dead = manager.connection("emails").await?.dead_letters().await?;
    assert_eq!(dead.len(), 1);
    Ok(())
}

#[logtest(tokio::test)]
async fn worker_stops_on_shutdown() -> Result<()> {
    let manager = Arc::new(manager(ConnectionConfig::new("memory")));
    let worker = Worker::new(manager, "emails").with_poll_interval(Duration::from_millis(10));
    tokio::time::timeout(
        Duration::from_secs(5),
        worker.run(tokio::time::sleep(Duration::from_millis(50))),
    )
    .await??;
    Ok(())
}
