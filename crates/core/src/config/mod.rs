//! Configuration management
//!
//! Typed configuration for both run modes of the hub. [`AppConfig::load`]
//! layers, from lowest to highest priority:
//!
//! 1. built-in defaults
//! 2. a TOML file (explicit path, or the first of `config/workerhub.toml`,
//!    `workerhub.toml`, `/etc/workerhub/config.toml`)
//! 3. `WORKERHUB__*` environment variables (`WORKERHUB__SERVER__PORT=9000`)
//!
//! ```toml
//! [server]
//! port = 8787
//! auth_token = "shared-secret"
//! heartbeat_timeout_ms = 30000
//!
//! [worker]
//! server_url = "ws://dispatch.internal:8787/"
//! worker_id = "gpu-01"
//! max_concurrent_requests = 4
//!
//! [[worker.models]]
//! model_id = "llama-3-8b"
//! display_name = "Llama 3 8B"
//! max_context_tokens = 8192
//! max_output_tokens = 2048
//! supports_streaming = true
//! ```

pub mod models;

pub use models::{
    AppConfig, BackoffConfig, HeartbeatConfig, LogFormat, LoggingConfig, ServerConfig,
    WorkerConfig,
};
