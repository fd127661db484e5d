//! Chain availability: the head must keep advancing
//!
//! A client is unavailable once its block number / nonce has not moved for
//! `allow_delta` consecutive checks, or when the query itself fails.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chain::BridgeSide;
use crate::metrics;
use crate::status::{StatusHandler, METRIC_CLIENT_STATUS, METRIC_LAST_BLOCK_NONCE, METRIC_LAST_ERROR};

pub const AVAILABLE: &str = "Available";
pub const UNAVAILABLE: &str = "Unavailable";

pub struct AvailabilityMonitor {
    side: Arc<dyn BridgeSide>,
    status: Arc<StatusHandler>,
    allow_delta: u64,
    last_height: Option<u64>,
    unchanged: u64,
}

impl AvailabilityMonitor {
    pub fn new(side: Arc<dyn BridgeSide>, status: Arc<StatusHandler>, allow_delta: u64) -> Self {
        Self {
            side,
            status,
            allow_delta,
            last_height: None,
            unchanged: 0,
        }
    }

    /// Query the head once and publish the result; true when available
    pub async fn check(&mut self) -> bool {
        let chain = self.side.chain().as_str();
        let height = match self.side.latest_height().await {
            Ok(height) => height,
            Err(e) => {
                warn!(chain, error = %e, "Failed to fetch latest block");
                self.publish(false, Some(format!("{:#}", e))).await;
                return false;
            }
        };

        metrics::set_last_block_nonce(chain, height);
        self.status
            .set_int_metric(METRIC_LAST_BLOCK_NONCE, height as i64)
            .await;

        match self.last_height {
            Some(last) if height <= last => self.unchanged += 1,
            _ => self.unchanged = 0,
        }
        self.last_height = Some(height);

        if self.unchanged >= self.allow_delta {
            let reason = format!(
                "block {} fetched for {} checks in a row",
                height,
                self.unchanged + 1
            );
            warn!(chain, height, "{}", reason);
            self.publish(false, Some(reason)).await;
            return false;
        }
        debug!(chain, height, "Chain available");
        self.publish(true, None).await;
        true
    }

    async fn publish(&self, available: bool, error: Option<String>) {
        metrics::set_client_available(self.side.chain().as_str(), available);
        let label = if available { AVAILABLE } else { UNAVAILABLE };
        self.status.set_string_metric(METRIC_CLIENT_STATUS, label).await;
        if let Some(error) = error {
            self.status.set_string_metric(METRIC_LAST_ERROR, error).await;
        }
    }

    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
    }
}
