use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::connection::{BackoffConfig, HeartbeatConfig};
use crate::models::{ModelCapability, WorkerCapabilities};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// 0 binds an ephemeral port.
    pub port: u16,
    /// Shared secret workers must present at registration.
    pub auth_token: Option<String>,
    pub heartbeat_timeout_ms: u64,
    /// Period of the built-in health sweep; 0 disables it.
    pub health_check_interval_ms: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8787,
            auth_token: None,
            heartbeat_timeout_ms: 30_000,
            health_check_interval_ms: 10_000,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("server bind_address must not be empty"));
        }
        self.socket_addr()?;

        if self.heartbeat_timeout_ms == 0 {
            return Err(anyhow::anyhow!("server heartbeat_timeout_ms must be greater than 0"));
        }

        if matches!(self.auth_token.as_deref(), Some("")) {
            return Err(anyhow::anyhow!("server auth_token must not be empty when set"));
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {}: {e}", self.bind_address))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub server_url: String,
    pub worker_id: String,
    pub worker_name: String,
    pub auth_token: Option<String>,
    pub max_concurrent_requests: u32,
    pub models: Vec<ModelCapability>,
    pub concurrency_limits: HashMap<String, u32>,
    pub backoff: BackoffConfig,
    pub heartbeat: HeartbeatConfig,
    /// Static headers sent on every connection attempt.
    pub headers: HashMap<String, String>,
    /// How long shutdown waits for in-flight work before disconnecting.
    pub drain_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8787/".to_string(),
            worker_id: "worker-001".to_string(),
            worker_name: default_worker_name(),
            auth_token: None,
            max_concurrent_requests: 4,
            models: Vec::new(),
            concurrency_limits: HashMap::new(),
            backoff: BackoffConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            headers: HashMap::new(),
            drain_timeout_seconds: 30,
        }
    }
}

fn default_worker_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "worker".to_string())
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            return Err(anyhow::anyhow!("worker_id must not be empty"));
        }

        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "server_url must use ws:// or wss://, got {}",
                self.server_url
            ));
        }

        if self.max_concurrent_requests == 0 {
            return Err(anyhow::anyhow!("max_concurrent_requests must be greater than 0"));
        }

        if let Some((category, _)) = self.concurrency_limits.iter().find(|(_, l)| **l == 0) {
            return Err(anyhow::anyhow!(
                "concurrency limit for category {category} must be greater than 0"
            ));
        }

        self.backoff.validate()?;
        self.heartbeat.validate()?;
        Ok(())
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            models: self.models.clone(),
            max_concurrent_requests: self.max_concurrent_requests,
            concurrency_limits: self.concurrency_limits.clone(),
        }
    }
}
