use crate::{
    config::ConnectionConfig,
    jobs::{Job, JobHandle, LeasedJob},
    Error, Result,
};
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
struct Lease {
    job: Job,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Job>,
    leased: HashMap<String, Lease>,
    dead: Vec<Job>,
}

impl State {
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(token, _)| token.clone())
            .collect::<Vec<_>>();
        for token in expired {
            if let Some(lease) = self.leased.remove(&token) {
                debug!("lease on {} expired, job {} is ready again", token, lease.job.id());
                self.pending.push_back(lease.job);
            }
        }
    }
}

/// In-process pull-based queue for development and tests.
#[derive(Debug, Clone)]
pub struct Backend {
    state: Arc<Mutex<State>>,
    visibility_timeout: Duration,
}

impl Default for Backend {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Backend {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            visibility_timeout,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.visibility_timeout())
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.leased.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl super::Backend for Backend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, mut job: Job, delay: Duration) -> Result<JobHandle> {
        job.delay_by(delay)?;
        let handle = JobHandle::new(job.id().as_str());
        self.state.lock().await.pending.push_back(job);
        Ok(handle)
    }

    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        let position = match state.pending.iter().position(|job| job.is_available(now)) {
            Some(position) => position,
            None => return Ok(None),
        };
        let job = match state.pending.remove(position) {
            Some(job) => job,
            None => return Ok(None),
        };

        let visibility = chrono::Duration::from_std(self.visibility_timeout)
            .map_err(|e| Error::Config(e.to_string()))?;
        let token = nanoid!();
        state.leased.insert(
            token.clone(),
            Lease {
                job: job.clone(),
                expires_at: now + visibility,
            },
        );
        Ok(Some(LeasedJob {
            job,
            handle: JobHandle::new(token),
        }))
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        match self.state.lock().await.leased.remove(handle.as_str()) {
            Some(_) => Ok(()),
            None => Err(Error::HandleExpired(handle.to_string())),
        }
    }

    async fn release(&self, handle: &JobHandle, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut job = match state.leased.remove(handle.as_str()) {
            Some(lease) => lease.job,
            None => return Err(Error::HandleExpired(handle.to_string())),
        };

        if job.record_attempt() {
            warn!("job {} exhausted {} attempts", job.id(), job.max_attempts());
            state.dead.push(job);
            return Ok(());
        }

        job.delay_by(delay)?;
        state.pending.push_back(job);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<Job>> {
        Ok(self.state.lock().await.dead.clone())
    }
}
