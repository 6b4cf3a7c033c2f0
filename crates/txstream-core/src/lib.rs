//! txstream-core: Shared infrastructure for the tx-stream consumer.
//!
//! This crate holds the pieces of the service that are not specific to
//! transaction processing:
//!
//! - `config/` - Env interpolation, layered YAML loading, CLI arguments
//! - `storage/` - Object store abstraction (S3, local filesystem, in-memory)
//! - `metrics/` - Prometheus metrics infrastructure and internal events
//! - `signal` - Signal handling and the shutdown controller
//! - `tracing` - Subscriber initialization
//! - `error` - Common error types

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod storage;
pub mod tracing;

// Re-export commonly used items
pub use config::{
    CliArgs, LogFormat, LoggerConfig, MetricsConfig, interpolate, load_layered, merge_yaml,
};
pub use error::{ConfigError, MetricsError, StorageError};
pub use metrics::{
    DEFAULT_METRICS_ADDR, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use signal::{ShutdownController, shutdown_signal};
pub use storage::{StorageProvider, StorageProviderRef};
pub use tracing::init_tracing;
