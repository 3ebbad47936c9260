use crate::{
    backends::{self, Backend},
    config::ConnectionConfig,
    jobs::Handlers,
    Error, Result,
};
use futures::{future::BoxFuture, FutureExt};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, instrument};

/// Builds a driver from its connection settings.
pub type Factory =
    Arc<dyn Fn(ConnectionConfig) -> BoxFuture<'static, Result<Arc<dyn Backend>>> + Send + Sync>;

/// Driver name to factory mapping.
///
/// Populated at startup and treated as read-only afterwards. Registering a
/// name twice replaces the earlier factory.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, Factory>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.registered_names())
            .finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every bundled driver. `handlers` backs the `sync`
    /// driver.
    pub fn with_defaults(handlers: Handlers) -> Self {
        let mut registry = Self::new();
        registry.register("null", |config| async move {
            Ok(Arc::new(backends::null::Backend::from_config(&config)) as Arc<dyn Backend>)
        });
        registry.register("sync", move |config| {
            let handlers = handlers.clone();
            async move {
                Ok(Arc::new(backends::sync::Backend::from_config(&config, handlers))
                    as Arc<dyn Backend>)
            }
        });
        registry.register("database", |config| async move {
            let backend = backends::database::Backend::connect(&config).await?;
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        });
        registry.register("redis", |config| async move { redis_backend(&config) });
        registry.register("beanstalkd", |config| async move {
            let backend = backends::beanstalk::Backend::from_config(&config)?;
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        });
        registry.register("sqs", |config| async move {
            let backend = backends::sqs::Backend::connect(&config).await?;
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        });
        registry.register("memory", |config| async move {
            Ok(Arc::new(backends::memory::Backend::from_config(&config)) as Arc<dyn Backend>)
        });
        registry
    }

    pub fn register<S, F, Fut>(&mut self, name: S, factory: F)
    where
        S: Into<String>,
        F: Fn(ConnectionConfig) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Arc<dyn Backend>>> + Send + 'static,
    {
        let name = name.into();
        debug!("registering driver {}", name);
        self.factories
            .insert(name, Arc::new(move |config| factory(config).boxed()));
    }

    /// Builds a new driver instance. Callers wanting a shared instance go
    /// through the manager, which caches per connection.
    #[instrument(skip(self, config))]
    pub async fn resolve(&self, name: &str, config: &ConnectionConfig) -> Result<Arc<dyn Backend>> {
        let factory = self
            .factories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDriver(name.to_string()))?;
        factory(config.clone()).await
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names = self.factories.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

#[cfg(feature = "backend-redis")]
fn redis_backend(config: &ConnectionConfig) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(backends::redis::Backend::from_config(config)?))
}

#[cfg(not(feature = "backend-redis"))]
fn redis_backend(_config: &ConnectionConfig) -> Result<Arc<dyn Backend>> {
    Err(Error::Config(
        "built without the backend-redis feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_bundled_driver() {
        let registry = DriverRegistry::with_defaults(Handlers::default());
        for name in ["null", "sync", "database", "redis", "beanstalkd", "sqs", "memory"] {
            assert!(registry.is_registered(name), "{} missing", name);
        }
    }

    #[tokio::test]
    async fn unknown_driver_is_an_error() {
        let registry = DriverRegistry::with_defaults(Handlers::default());
        let err = registry
            .resolve("carrier-pigeon", &ConnectionConfig::new("carrier-pigeon"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDriver(name) if name == "carrier-pigeon"));
    }

    #[tokio::test]
    async fn later_registration_wins() {
        let mut registry = DriverRegistry::new();
        registry.register("queue", |_| async {
            Err::<Arc<dyn Backend>, _>(Error::Config("first".into()))
        });
        registry.register("queue", |config| async move {
            Ok(Arc::new(backends::memory::Backend::from_config(&config)) as Arc<dyn Backend>)
        });
        let backend = registry
            .resolve("queue", &ConnectionConfig::new("queue"))
            .await
            .unwrap();
        assert_eq!(backend.name(), "memory");
        assert!(format!("{:?}", backend).starts_with("Backend"));
    }
}
