use crate::{
    backends::Backend,
    config::{ConnectionConfig, DispatchConfig},
    jobs::{Handlers, Job, JobHandle, LeasedJob, QueueName},
    registry::DriverRegistry,
    Error, Result,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument};

type Slot = Arc<OnceCell<Arc<dyn Backend>>>;

/// Front door for producers and workers.
///
/// Connection names map to drivers through the configured
/// [`ConnectionConfig`]s. A driver is built the first time its connection is
/// used and shared for the rest of the process; concurrent first uses wait on
/// a single construction. A failed construction is not remembered, so the
/// next call tries again.
pub struct DispatchManager {
    registry: DriverRegistry,
    connections: HashMap<String, ConnectionConfig>,
    handlers: Handlers,
    resolved: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for DispatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchManager")
            .field("registry", &self.registry)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl DispatchManager {
    pub fn new(config: &DispatchConfig) -> Self {
        let handlers = Handlers::default();
        let registry = DriverRegistry::with_defaults(handlers.clone());
        Self::with_registry(config, registry, handlers)
    }

    pub fn with_registry(
        config: &DispatchConfig,
        registry: DriverRegistry,
        handlers: Handlers,
    ) -> Self {
        let connections = config
            .connections
            .iter()
            .map(|(name, connection)| (name.clone(), connection.clone().or_queue(name)))
            .collect();
        Self {
            registry,
            connections,
            handlers,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Handlers used by the `sync` driver.
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Startup hook for custom drivers. Drops drivers built so far.
    pub fn registry_mut(&mut self) -> &mut DriverRegistry {
        self.resolved.get_mut().clear();
        &mut self.registry
    }

    pub fn connection_names(&self) -> Vec<String> {
        let mut names = self.connections.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    fn config(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| Error::unknown_connection(&QueueName::from(name)))
    }

    /// The shared driver for connection `name`, building it on first use.
    #[instrument(skip(self))]
    pub async fn connection(&self, name: &str) -> Result<Arc<dyn Backend>> {
        let config = self.config(name)?;
        let slot = self
            .resolved
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone();

        let backend = slot
            .get_or_try_init(|| async {
                info!("connecting {} via driver {}", name, config.driver);
                self.registry.resolve(&config.driver, config).await
            })
            .await?;
        Ok(backend.clone())
    }

    fn stamp(&self, queue: &str, job: Job) -> Result<Job> {
        let config = self.config(queue)?;
        Ok(job.on_queue(QueueName::from(queue), config.max_attempts))
    }

    #[instrument(skip(self, job), fields(job = %job.id()))]
    pub async fn push(&self, queue: &str, job: Job) -> Result<JobHandle> {
        let job = self.stamp(queue, job)?;
        let backend = self.connection(queue).await?;
        debug!("pushing to {} driver", backend.name());
        backend.enqueue(job, Duration::ZERO).await
    }

    /// Like [`push`](Self::push), available after `delay_ms` milliseconds.
    /// A negative delay is rejected before any backend is touched.
    #[instrument(skip(self, job), fields(job = %job.id()))]
    pub async fn later(&self, queue: &str, job: Job, delay_ms: i64) -> Result<JobHandle> {
        let delay = u64::try_from(delay_ms)
            .map(Duration::from_millis)
            .map_err(|_| Error::InvalidArgument(format!("negative delay {}ms", delay_ms)))?;
        let job = self.stamp(queue, job)?;
        let backend = self.connection(queue).await?;
        debug!("scheduling on {} driver in {:?}", backend.name(), delay);
        backend.enqueue(job, delay).await
    }

    #[instrument(skip(self))]
    pub async fn pop(&self, queue: &str) -> Result<Option<LeasedJob>> {
        self.connection(queue).await?.dequeue().await
    }

    pub async fn ack(&self, queue: &str, handle: &JobHandle) -> Result<()> {
        self.connection(queue).await?.ack(handle).await
    }

    pub async fn release(&self, queue: &str, handle: &JobHandle, delay: Duration) -> Result<()> {
        self.connection(queue).await?.release(handle, delay).await
    }
}
