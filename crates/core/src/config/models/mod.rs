pub mod app_config;
pub mod connection;
pub mod dispatcher_worker;
pub mod observability;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use connection::{BackoffConfig, HeartbeatConfig};
pub use dispatcher_worker::{ServerConfig, WorkerConfig};
pub use observability::{LogFormat, LoggingConfig};
