use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata key holding the number of agent turns.
pub const EPISODES_KEY: &str = "n_episodes";

/// Run-level telemetry written by the agent during `run` and read by the
/// orchestrator afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    cost_usd: Option<f64>,
    metadata: HashMap<String, serde_json::Value>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accrued model cost in USD, if the agent reported one.
    pub fn cost_usd(&self) -> Option<f64> {
        self.cost_usd
    }

    pub fn set_cost_usd(&mut self, cost: f64) {
        self.cost_usd = Some(cost);
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Turn count from the `n_episodes` metadata entry, when it holds a
    /// non-negative integer.
    pub fn episodes(&self) -> Option<u64> {
        self.metadata.get(EPISODES_KEY)?.as_u64()
    }
}
