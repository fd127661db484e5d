//! Named status handlers read by the `/status` endpoint

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const ETH_TO_MX_HANDLER: &str = "EthToMultiversX";
pub const MX_TO_ETH_HANDLER: &str = "MultiversXToEth";
pub const ETH_CLIENT_HANDLER: &str = "EthClient";
pub const MX_CLIENT_HANDLER: &str = "MultiversXClient";

// Integer metrics
pub const METRIC_NUM_BATCHES: &str = "num batches";
pub const METRIC_CURRENT_BATCH_ID: &str = "current batch id";
pub const METRIC_SIGNATURES_RECEIVED: &str = "signatures received";
pub const METRIC_LAST_BLOCK_NONCE: &str = "last block nonce";
pub const METRIC_NUM_TRANSACTIONS: &str = "num transactions";

// String metrics
pub const METRIC_LAST_ERROR: &str = "last error";
pub const METRIC_CURRENT_STEP: &str = "current state machine step";
pub const METRIC_CLIENT_STATUS: &str = "client status";

#[derive(Debug, Default, Clone, Serialize)]
pub struct StatusSnapshot {
    pub int_metrics: BTreeMap<String, i64>,
    pub string_metrics: BTreeMap<String, String>,
}

/// Metrics of one component, shared between its writer and the API
#[derive(Debug)]
pub struct StatusHandler {
    name: String,
    state: RwLock<StatusSnapshot>,
}

impl StatusHandler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(StatusSnapshot::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn set_int_metric(&self, metric: &str, value: i64) {
        self.state
            .write()
            .await
            .int_metrics
            .insert(metric.to_string(), value);
    }

    pub async fn add_int_metric(&self, metric: &str, delta: i64) {
        let mut state = self.state.write().await;
        *state.int_metrics.entry(metric.to_string()).or_insert(0) += delta;
    }

    pub async fn set_string_metric(&self, metric: &str, value: impl Into<String>) {
        self.state
            .write()
            .await
            .string_metrics
            .insert(metric.to_string(), value.into());
    }

    pub async fn int_metric(&self, metric: &str) -> Option<i64> {
        self.state.read().await.int_metrics.get(metric).copied()
    }

    pub async fn string_metric(&self, metric: &str) -> Option<String> {
        self.state.read().await.string_metrics.get(metric).cloned()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.state.read().await.clone()
    }
}

/// All status handlers of the process
#[derive(Debug, Default, Clone)]
pub struct StatusRegistry {
    handlers: Arc<RwLock<Vec<Arc<StatusHandler>>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a handler; an existing handler with the same name is returned instead
    pub async fn handler(&self, name: &str) -> Arc<StatusHandler> {
        let mut handlers = self.handlers.write().await;
        if let Some(existing) = handlers.iter().find(|h| h.name() == name) {
            return existing.clone();
        }
        let handler = Arc::new(StatusHandler::new(name));
        handlers.push(handler.clone());
        handler
    }

    pub async fn snapshot(&self) -> BTreeMap<String, StatusSnapshot> {
        let handlers = self.handlers.read().await.clone();
        let mut all = BTreeMap::new();
        for handler in handlers {
            all.insert(handler.name().to_string(), handler.snapshot().await);
        }
        all
    }
}
