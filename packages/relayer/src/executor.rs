//! Per-direction executor: the state the step graph works on
//!
//! A [`BridgeExecutor`] owns the in-flight batch and action of one half-bridge
//! and applies the error policy at every step boundary:
//!
//! - not-ready errors keep the current step, bounded by the step's wait limit
//! - transient errors retry the step with backoff, up to the retry limit
//! - every other error, or an exhausted retry budget, drops the batch and
//!   returns to [`StepId::GetPendingBatch`]
//!
//! A step that keeps returning itself for longer than its wait limit is sent
//! back to [`StepId::GetPendingBatch`] as well.

use alloy::primitives::U256;
use eyre::Result;
use multichain_rs::{Action, Direction, RetryConfig, TransferBatch};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::balance::BalanceValidator;
use crate::chain::BridgeSide;
use crate::config::Config;
use crate::errors::{classify, ErrorKind, RelayerError};
use crate::metrics;
use crate::status::{StatusHandler, METRIC_CURRENT_STEP, METRIC_LAST_ERROR};
use crate::steps::StepId;
use crate::topology::TopologyProvider;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Execution attempts allowed for the set-status action on the source chain
    pub source_max_quorum_retries: u64,
    /// Execution attempts allowed for the transfer action on the destination chain
    pub destination_max_quorum_retries: u64,
    pub max_retries_on_was_proposed: u64,
    pub polling_timeout: Duration,
    pub interval_to_wait_for_transfer: Duration,
    /// Lowercase token display name to the cap on a batch's cumulative amount
    pub max_bridged_amount_for_token: HashMap<String, U256>,
    /// Retries and backoff for a step failing with a transient error
    pub transient_retry: RetryConfig,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            source_max_quorum_retries: 3,
            destination_max_quorum_retries: 3,
            max_retries_on_was_proposed: 3,
            polling_timeout: Duration::from_secs(30),
            interval_to_wait_for_transfer: Duration::from_secs(600),
            max_bridged_amount_for_token: HashMap::new(),
            transient_retry: RetryConfig::default(),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &Config, direction: Direction) -> Self {
        let (source, destination) = match direction {
            Direction::EthToMx => (
                config.evm.max_retries_on_quorum_reached,
                config.mx.max_retries_on_quorum_reached,
            ),
            Direction::MxToEth => (
                config.mx.max_retries_on_quorum_reached,
                config.evm.max_retries_on_quorum_reached,
            ),
        };
        Self {
            source_max_quorum_retries: source,
            destination_max_quorum_retries: destination,
            max_retries_on_was_proposed: config.mx.max_retries_on_was_transfer_proposed,
            polling_timeout: config.polling_timeout,
            interval_to_wait_for_transfer: config.evm.interval_to_wait_for_transfer,
            max_bridged_amount_for_token: config.max_bridged_amount_for_token.clone(),
            transient_retry: config.retry(),
        }
    }
}

/// Collaborators of one executor
pub struct ExecutorParts {
    pub source: Arc<dyn BridgeSide>,
    pub destination: Arc<dyn BridgeSide>,
    pub topology: Arc<dyn TopologyProvider>,
    pub balance: Arc<BalanceValidator>,
    pub status: Arc<StatusHandler>,
}

pub struct BridgeExecutor {
    pub(crate) direction: Direction,
    pub(crate) source: Arc<dyn BridgeSide>,
    pub(crate) destination: Arc<dyn BridgeSide>,
    pub(crate) topology: Arc<dyn TopologyProvider>,
    pub(crate) balance: Arc<BalanceValidator>,
    pub(crate) status: Arc<StatusHandler>,
    pub(crate) settings: ExecutorSettings,

    pub(crate) batch: Option<TransferBatch>,
    pub(crate) action: Option<Action>,
    /// Action this relayer already submitted a sign for
    pub(crate) signed_action: Option<Action>,
    pub(crate) quorum_retries: u64,
    pub(crate) was_proposed_retries: u64,
    pub(crate) last_perform: Option<Instant>,

    transient_retries: u32,
    retry_at: Option<Instant>,
    current: StepId,
    entered_at: Instant,
}

impl BridgeExecutor {
    pub fn new(direction: Direction, parts: ExecutorParts, settings: ExecutorSettings) -> Self {
        Self {
            direction,
            source: parts.source,
            destination: parts.destination,
            topology: parts.topology,
            balance: parts.balance,
            status: parts.status,
            settings,
            batch: None,
            action: None,
            signed_action: None,
            quorum_retries: 0,
            was_proposed_retries: 0,
            last_perform: None,
            transient_retries: 0,
            retry_at: None,
            current: StepId::GetPendingBatch,
            entered_at: Instant::now(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn current_step(&self) -> StepId {
        self.current
    }

    pub fn current_batch(&self) -> Option<&TransferBatch> {
        self.batch.as_ref()
    }

    pub fn status(&self) -> &Arc<StatusHandler> {
        &self.status
    }

    pub(crate) fn stored_batch(&self) -> Result<TransferBatch> {
        self.batch
            .clone()
            .ok_or_else(|| RelayerError::NilBatch.into())
    }

    pub(crate) fn stored_action(&self) -> Result<Action> {
        self.action
            .clone()
            .ok_or_else(|| RelayerError::NilAction.into())
    }

    /// Forget the batch and every counter tied to it
    pub(crate) fn reset(&mut self) {
        self.batch = None;
        self.action = None;
        self.signed_action = None;
        self.reset_retries();
    }

    pub(crate) fn reset_retries(&mut self) {
        self.quorum_retries = 0;
        self.was_proposed_retries = 0;
        self.last_perform = None;
    }

    pub(crate) async fn is_leader(&self) -> bool {
        let leader = self.topology.am_i_leader().await;
        metrics::set_leader(self.direction.as_str(), leader);
        leader
    }

    /// Cap on the cumulative amount of each token in the batch
    pub(crate) fn check_amount_limits(&self, batch: &TransferBatch) -> Result<()> {
        let mut totals: HashMap<String, U256> = HashMap::new();
        for deposit in &batch.deposits {
            let key = deposit.display_token.to_lowercase();
            let Some(max) = self.settings.max_bridged_amount_for_token.get(&key) else {
                continue;
            };
            let total = totals.entry(key).or_default();
            *total = total.saturating_add(deposit.amount);
            if *total > *max {
                return Err(RelayerError::AmountAboveLimit {
                    token: deposit.display_token.clone(),
                    amount: total.to_string(),
                    max: max.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn wait_limit(&self, step: StepId) -> Option<Duration> {
        match step {
            StepId::GetPendingBatch => None,
            StepId::PerformTransfer | StepId::PerformSetStatus => {
                Some(self.settings.interval_to_wait_for_transfer)
            }
            _ => Some(self.settings.polling_timeout),
        }
    }

    fn transition(&mut self, next: StepId) -> StepId {
        self.clear_transient();
        if next != self.current {
            debug!(
                direction = %self.direction,
                from = self.current.as_str(self.direction),
                to = next.as_str(self.direction),
                "Step transition"
            );
            self.current = next;
            self.entered_at = Instant::now();
        }
        if next == StepId::GetPendingBatch {
            self.reset();
        }
        next
    }

    fn stay_or_give_up(&mut self, step: StepId) -> StepId {
        match self.wait_limit(step) {
            Some(limit) if self.entered_at.elapsed() > limit => {
                warn!(
                    direction = %self.direction,
                    step = step.as_str(self.direction),
                    batch_id = self.batch.as_ref().map(|b| b.id),
                    waited_secs = self.entered_at.elapsed().as_secs(),
                    "Gave up waiting, returning to pending batch"
                );
                self.transition(StepId::GetPendingBatch)
            }
            _ => step,
        }
    }

    fn clear_transient(&mut self) {
        self.transient_retries = 0;
        self.retry_at = None;
    }

    /// Run the current step once and apply the error policy; returns the next step
    pub async fn run_step(&mut self) -> StepId {
        let step = self.current;
        if self.retry_at.is_some_and(|at| Instant::now() < at) {
            return step;
        }
        let label = step.as_str(self.direction);
        metrics::record_step(self.direction.as_str(), label);
        self.status.set_string_metric(METRIC_CURRENT_STEP, label).await;

        match step.execute(self).await {
            Ok(next) if next == step => {
                self.clear_transient();
                self.stay_or_give_up(step)
            }
            Ok(next) => self.transition(next),
            Err(e) => {
                let kind = classify(&e);
                metrics::record_error(self.direction.as_str(), kind.as_str());
                self.status
                    .set_string_metric(METRIC_LAST_ERROR, format!("{}: {:#}", label, e))
                    .await;
                let batch_id = self.batch.as_ref().map(|b| b.id);
                match kind {
                    ErrorKind::NotReady => {
                        debug!(direction = %self.direction, step = label, batch_id, error = %e, "Not ready yet");
                        return self.stay_or_give_up(step);
                    }
                    ErrorKind::Transient => {
                        let retry = &self.settings.transient_retry;
                        if retry.should_retry(self.transient_retries) {
                            let backoff = retry.backoff_for_attempt(self.transient_retries);
                            self.transient_retries += 1;
                            self.retry_at = Some(Instant::now() + backoff);
                            warn!(
                                direction = %self.direction,
                                step = label,
                                batch_id,
                                attempt = self.transient_retries,
                                ?backoff,
                                error = %e,
                                "Step failed, retrying"
                            );
                            return self.stay_or_give_up(step);
                        }
                        warn!(direction = %self.direction, step = label, batch_id, error = %e, "Step failed, retries exhausted")
                    }
                    ErrorKind::WrongSetup | ErrorKind::Integrity | ErrorKind::Fatal => {
                        error!(direction = %self.direction, step = label, batch_id, kind = %kind, error = %e, "Step failed")
                    }
                }
                self.transition(StepId::GetPendingBatch)
            }
        }
    }

    pub(crate) fn log_batch(&self, batch: &TransferBatch) {
        info!(
            direction = %self.direction,
            batch_id = batch.id,
            deposits = batch.deposits.len(),
            "{}",
            batch
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NetworkBuilder;
    use multichain_rs::testing::MockDepositBuilder;

    fn batch(amounts: &[u64]) -> TransferBatch {
        let deposits = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                MockDepositBuilder::new(Direction::MxToEth)
                    .nonce(i as u64 + 1)
                    .amount(*amount)
                    .build()
            })
            .collect();
        TransferBatch::new(1, deposits)
    }

    #[tokio::test]
    async fn test_amount_limit_is_cumulative_per_token() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        let mut settings = ExecutorSettings::default();
        settings
            .max_bridged_amount_for_token
            .insert("tkn-111111".to_string(), U256::from(100));
        let executor = network.nodes[0]
            .executor(Direction::MxToEth, settings)
            .await;

        assert!(executor.check_amount_limits(&batch(&[60, 40])).is_ok());
        let err = executor.check_amount_limits(&batch(&[60, 41])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayerError>(),
            Some(RelayerError::AmountAboveLimit { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_setup_returns_to_pending_and_records_error() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        network.mx.add_pending_batch(TransferBatch::new(
            1,
            vec![MockDepositBuilder::new(Direction::MxToEth)
                .tokens(b"OTHER-000000".to_vec(), vec![0x22; 20])
                .build()],
        ));
        let mut executor = network.nodes[0]
            .executor(Direction::MxToEth, ExecutorSettings::default())
            .await;

        assert_eq!(executor.run_step().await, StepId::GetPendingBatch);
        assert!(executor.current_batch().is_none());
        let last_error = executor
            .status()
            .string_metric(METRIC_LAST_ERROR)
            .await
            .unwrap();
        assert!(last_error.contains("not whitelisted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_limit_sends_back_to_pending() {
        // two relayers, quorum two, only one of them running
        let network = NetworkBuilder::new(2).build().await.unwrap();
        network.mx.add_pending_batch(batch(&[1_000]));
        let settings = ExecutorSettings {
            polling_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let mut executor = network.nodes[0]
            .executor(Direction::MxToEth, settings)
            .await;

        let mut step = executor.run_step().await;
        for _ in 0..4 {
            step = executor.run_step().await;
        }
        assert_eq!(step, StepId::WaitForQuorumOnTransfer);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(executor.run_step().await, StepId::GetPendingBatch);
        assert!(executor.current_batch().is_none());
    }
}
