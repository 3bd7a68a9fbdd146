use serde::{Deserialize, Serialize};

/// Reconnect delay policy: `min(initial_delay_ms * multiplier^attempt, max_delay_ms)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(anyhow::anyhow!("backoff initial_delay_ms must be greater than 0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(anyhow::anyhow!(
                "backoff max_delay_ms ({}) must not be below initial_delay_ms ({})",
                self.max_delay_ms,
                self.initial_delay_ms
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(anyhow::anyhow!(
                "backoff multiplier must be at least 1.0, got {}",
                self.multiplier
            ));
        }
        Ok(())
    }
}

/// Client-side ping/pong liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            timeout_ms: 10_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_ms == 0 {
            return Err(anyhow::anyhow!("heartbeat interval_ms must be greater than 0"));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow::anyhow!("heartbeat timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}
