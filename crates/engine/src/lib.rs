//! `objproc-engine`: the background object-processing engine.
//!
//! - [`processor`]: the pluggable business logic and its status graph
//! - [`storage`]: the persistence collaborator (in-memory and Postgres)
//! - [`engine`]: claim/dispatch/finalize over a bounded worker pool
//! - [`driver`]: polling + notify thread that runs claim cycles
//! - [`registry`]: key -> processor factory map resolved at startup

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod stats;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, EngineConfig};
pub use driver::DriverHandle;
pub use engine::BackgroundObjectProcessor;
pub use error::{EngineError, ProcessingFailure, StorageError, StorageResult};
pub use hooks::{LifecycleHooks, NoopHooks};
pub use pool::{SubmitError, WorkerPool};
pub use processor::{
    NextStatus, ObjectProcessingResult, ObjectProcessor, ProcessorDeclaration, RetryDelay,
    RetryHandling, TransitionMap,
};
pub use registry::{ProcessorFactory, ProcessorRegistry};
pub use stats::EngineStats;
pub use storage::{
    ClaimRequest, Claimed, Finalization, InMemoryObjectStorage, ObjectStorage,
    PostgresObjectStorage,
};
