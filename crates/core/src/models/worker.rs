use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-assigned request identifier, unique across the whole pool.
pub type RequestId = String;

/// One workload type a worker can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapability {
    #[serde(alias = "model_id")]
    pub model_id: String,
    #[serde(alias = "display_name")]
    pub display_name: String,
    #[serde(alias = "max_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(alias = "max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(alias = "supports_streaming")]
    pub supports_streaming: bool,
}

impl ModelCapability {
    pub fn new<S: Into<String>>(model_id: S) -> Self {
        let model_id = model_id.into();
        Self {
            display_name: model_id.clone(),
            model_id,
            max_context_tokens: 8192,
            max_output_tokens: 2048,
            supports_streaming: true,
        }
    }
}

/// Capacity a worker advertises at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCapabilities {
    pub models: Vec<ModelCapability>,
    #[serde(alias = "max_concurrent_requests")]
    pub max_concurrent_requests: u32,
    /// Per-category caps, enforced in addition to `max_concurrent_requests`.
    #[serde(
        default,
        alias = "concurrency_limits",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub concurrency_limits: HashMap<String, u32>,
}

impl WorkerCapabilities {
    pub fn new(models: Vec<ModelCapability>, max_concurrent_requests: u32) -> Self {
        Self {
            models,
            max_concurrent_requests,
            concurrency_limits: HashMap::new(),
        }
    }

    pub fn with_concurrency_limit<S: Into<String>>(mut self, category: S, limit: u32) -> Self {
        self.concurrency_limits.insert(category.into(), limit);
        self
    }

    pub fn supports_model(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.model_id == model_id)
    }

    pub fn category_limit(&self, category: &str) -> Option<u32> {
        self.concurrency_limits.get(category).copied()
    }
}

/// Scheduling state of a connected worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Available,
    Busy,
    Unhealthy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Available => "available",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of a connected worker without its socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    pub name: String,
    pub session_id: String,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active_requests: u32,
    pub pending_requests: Vec<RequestId>,
    pub completed_requests: u64,
    pub category_active_requests: HashMap<String, u32>,
}

impl WorkerInfo {
    /// Load as a percentage of `max_concurrent_requests`.
    pub fn load_percentage(&self) -> f64 {
        if self.capabilities.max_concurrent_requests == 0 {
            0.0
        } else {
            (self.active_requests as f64 / self.capabilities.max_concurrent_requests as f64)
                * 100.0
        }
    }
}
