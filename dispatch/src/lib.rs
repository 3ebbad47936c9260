mod backends;
mod config;
mod consumer;
mod error;
#[cfg(feature = "http")]
pub mod http;
mod jobs;
mod manager;
mod registry;

pub use async_trait::async_trait;
#[cfg(feature = "backend-redis")]
pub use backends::redis::Backend as RedisBackend;
#[cfg(feature = "backend-sqs")]
pub use backends::sqs::aws::SqsClient;
pub use backends::{
    beanstalk::Backend as BeanstalkBackend,
    database::Backend as DatabaseBackend,
    memory::Backend as MemoryBackend,
    null::Backend as NullBackend,
    sqs::{Backend as SqsBackend, QueueClient, ReceivedMessage},
    sync::Backend as SyncBackend,
    Backend,
};
pub use config::{ConnectionConfig, DispatchConfig, DEFAULT_CONNECTION};
pub use consumer::Worker;
pub use error::{Error, ErrorHandler, Result};
pub use jobs::{Handlers, Job, JobHandle, JobHandler, JobId, LeasedJob, QueueName};
pub use manager::DispatchManager;
pub use registry::{DriverRegistry, Factory};
