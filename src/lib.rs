//! podserve: queue text-generation jobs onto a fixed set of model pods.

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod logging;
pub mod prompting;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError};
pub use engine::{CandleEngine, EchoEngine, InferenceEngine};
pub use error::JobError;
pub use registry::{Registry, RegistryError};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use session::SessionStore;
