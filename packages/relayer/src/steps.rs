//! Step graph of a half-bridge
//!
//! Transfer steps act on the destination chain, set-status steps on the source
//! chain. A step that needs to wait returns itself; the executor bounds how long.

use eyre::Result;
use multichain_rs::{Action, ActionKind, ChainKind, Direction};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::BridgeSide;
use crate::errors::RelayerError;
use crate::executor::BridgeExecutor;
use crate::metrics;
use crate::status::{
    METRIC_CURRENT_BATCH_ID, METRIC_NUM_BATCHES, METRIC_NUM_TRANSACTIONS,
    METRIC_SIGNATURES_RECEIVED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    GetPendingBatch,
    GetActionIdForPropose,
    ProposeTransfer,
    SignProposedTransfer,
    WaitForQuorumOnTransfer,
    PerformTransfer,
    ResolveSetStatus,
    ProposeSetStatus,
    SignProposedSetStatus,
    WaitForQuorumOnSetStatus,
    PerformSetStatus,
}

impl StepId {
    pub fn as_str(&self, direction: Direction) -> &'static str {
        match self {
            StepId::GetPendingBatch => match direction.source_chain() {
                ChainKind::Evm => "get pending batch from Ethereum",
                ChainKind::Mx => "get pending batch from MultiversX",
            },
            StepId::GetActionIdForPropose => "get action id for propose transfer",
            StepId::ProposeTransfer => "propose transfer",
            StepId::SignProposedTransfer => "sign proposed transfer",
            StepId::WaitForQuorumOnTransfer => "wait for quorum on transfer",
            StepId::PerformTransfer => "perform transfer",
            StepId::ResolveSetStatus => "resolve set status",
            StepId::ProposeSetStatus => "propose set status",
            StepId::SignProposedSetStatus => "sign proposed set status",
            StepId::WaitForQuorumOnSetStatus => "wait for quorum on set status",
            StepId::PerformSetStatus => "perform set status",
        }
    }

    pub(crate) async fn execute(self, exec: &mut BridgeExecutor) -> Result<StepId> {
        match self {
            StepId::GetPendingBatch => get_pending_batch(exec).await,
            StepId::GetActionIdForPropose => get_action_id_for_propose(exec).await,
            StepId::ProposeTransfer => {
                propose(self, exec, ActionKind::Transfer, StepId::SignProposedTransfer).await
            }
            StepId::SignProposedTransfer => {
                sign(self, exec, ActionKind::Transfer, StepId::WaitForQuorumOnTransfer).await
            }
            StepId::WaitForQuorumOnTransfer => {
                wait_for_quorum(
                    self,
                    exec,
                    ActionKind::Transfer,
                    StepId::SignProposedTransfer,
                    StepId::PerformTransfer,
                )
                .await
            }
            StepId::PerformTransfer => {
                perform(self, exec, ActionKind::Transfer, StepId::ResolveSetStatus).await
            }
            StepId::ResolveSetStatus => resolve_set_status(exec).await,
            StepId::ProposeSetStatus => {
                propose(self, exec, ActionKind::SetStatus, StepId::SignProposedSetStatus).await
            }
            StepId::SignProposedSetStatus => {
                sign(self, exec, ActionKind::SetStatus, StepId::WaitForQuorumOnSetStatus).await
            }
            StepId::WaitForQuorumOnSetStatus => {
                wait_for_quorum(
                    self,
                    exec,
                    ActionKind::SetStatus,
                    StepId::SignProposedSetStatus,
                    StepId::PerformSetStatus,
                )
                .await
            }
            StepId::PerformSetStatus => {
                perform(self, exec, ActionKind::SetStatus, StepId::GetPendingBatch).await
            }
        }
    }
}

/// Transfers run on the destination, status updates on the source
fn side_for(exec: &BridgeExecutor, kind: ActionKind) -> Arc<dyn BridgeSide> {
    match kind {
        ActionKind::Transfer => exec.destination.clone(),
        ActionKind::SetStatus => exec.source.clone(),
    }
}

/// A MultiversX sign is a transaction: once submitted it is only pending until
/// mined, and is never sent twice for the same action
fn sign_submitted(exec: &BridgeExecutor, side: &Arc<dyn BridgeSide>, action: &Action) -> bool {
    side.chain() == ChainKind::Mx && exec.signed_action.as_ref() == Some(action)
}

async fn count_transaction(exec: &BridgeExecutor) {
    exec.status.add_int_metric(METRIC_NUM_TRANSACTIONS, 1).await;
}

async fn get_pending_batch(exec: &mut BridgeExecutor) -> Result<StepId> {
    exec.reset();

    let Some(mut batch) = exec.source.get_pending_batch().await? else {
        return Ok(StepId::GetPendingBatch);
    };
    let direction = exec.direction.as_str();
    metrics::set_current_batch(direction, batch.id);
    exec.status
        .set_int_metric(METRIC_CURRENT_BATCH_ID, batch.id as i64)
        .await;

    if exec.destination.was_batch_transferred(batch.id).await? {
        if exec.source.was_batch_finalized(batch.id).await? {
            debug!(batch_id = batch.id, "Batch already bridged and finalized");
            return Ok(StepId::GetPendingBatch);
        }
        info!(
            batch_id = batch.id,
            "Batch already transferred, resolving its statuses"
        );
        exec.batch = Some(batch);
        return Ok(StepId::ResolveSetStatus);
    }

    batch
        .verify_nonces()
        .map_err(|e| RelayerError::InvalidDepositNonce(e.to_string()))?;
    exec.destination.verify_deposit_nonces(&batch).await?;
    exec.destination.convert_tokens(&mut batch).await?;
    exec.check_amount_limits(&batch)?;
    exec.balance.check_batch(exec.direction, &batch).await?;

    exec.log_batch(&batch);
    exec.status.add_int_metric(METRIC_NUM_BATCHES, 1).await;
    exec.batch = Some(batch);
    Ok(StepId::GetActionIdForPropose)
}

async fn get_action_id_for_propose(exec: &mut BridgeExecutor) -> Result<StepId> {
    let batch = exec.stored_batch()?;
    let action = exec
        .destination
        .get_action(&batch, ActionKind::Transfer)
        .await?;
    debug!(batch_id = batch.id, action = %action, "Fetched action for proposal");
    exec.action = Some(action);
    Ok(StepId::ProposeTransfer)
}

async fn propose(
    step: StepId,
    exec: &mut BridgeExecutor,
    kind: ActionKind,
    next: StepId,
) -> Result<StepId> {
    let side = side_for(exec, kind);
    let batch = exec.stored_batch()?;

    if side.was_proposed(&batch, kind).await? {
        debug!(batch_id = batch.id, kind = %kind, "Already proposed");
        return Ok(next);
    }
    if !exec.is_leader().await {
        debug!(batch_id = batch.id, kind = %kind, "Waiting for the leader to propose");
        return Ok(step);
    }

    info!(
        batch_id = batch.id,
        kind = %kind,
        chain = %side.chain(),
        "Proposing as leader"
    );
    side.propose(&batch, kind).await?;
    if side.chain() == ChainKind::Mx {
        count_transaction(exec).await;
    }
    Ok(next)
}

async fn sign(
    step: StepId,
    exec: &mut BridgeExecutor,
    kind: ActionKind,
    next: StepId,
) -> Result<StepId> {
    let side = side_for(exec, kind);
    let batch = exec.stored_batch()?;

    if !side.was_proposed(&batch, kind).await? {
        exec.was_proposed_retries += 1;
        if exec.was_proposed_retries > exec.settings.max_retries_on_was_proposed {
            warn!(
                batch_id = batch.id,
                kind = %kind,
                retries = exec.was_proposed_retries,
                "Proposal never appeared"
            );
            return Ok(StepId::GetPendingBatch);
        }
        return Ok(step);
    }

    let action = side.get_action(&batch, kind).await?;
    exec.action = Some(action.clone());

    if sign_submitted(exec, &side, &action) {
        debug!(action = %action, "Sign already submitted");
    } else if side.was_signed(&action).await? {
        debug!(action = %action, "Already signed");
    } else {
        side.sign(&action).await?;
        info!(action = %action, chain = %side.chain(), "Signed");
        if side.chain() == ChainKind::Mx {
            count_transaction(exec).await;
        }
    }
    exec.signed_action = Some(action);
    Ok(next)
}

async fn wait_for_quorum(
    step: StepId,
    exec: &mut BridgeExecutor,
    kind: ActionKind,
    sign_step: StepId,
    next: StepId,
) -> Result<StepId> {
    let side = side_for(exec, kind);
    let action = exec.stored_action()?;

    if !side.was_signed(&action).await? {
        if sign_submitted(exec, &side, &action) {
            debug!(action = %action, "Own sign transaction not executed yet");
        } else {
            // a flush of the gossip store may have dropped our own share
            info!(action = %action, "Own signature missing, signing again");
            return Ok(sign_step);
        }
    }

    let count = side.signers_count(&action).await?;
    metrics::set_signatures_received(exec.direction.as_str(), count);
    exec.status
        .set_int_metric(METRIC_SIGNATURES_RECEIVED, count as i64)
        .await;

    if side.is_quorum_reached(&action).await? {
        info!(action = %action, signatures = count, "Quorum reached");
        return Ok(next);
    }
    debug!(action = %action, signatures = count, "Waiting for quorum");
    Ok(step)
}

async fn perform(
    step: StepId,
    exec: &mut BridgeExecutor,
    kind: ActionKind,
    next: StepId,
) -> Result<StepId> {
    let side = side_for(exec, kind);
    let batch = exec.stored_batch()?;
    let action = exec.stored_action()?;

    if side.was_action_executed(&action, &batch).await? {
        info!(action = %action, chain = %side.chain(), "Action executed");
        exec.topology.clean().await;
        exec.reset_retries();
        return Ok(next);
    }
    if !exec.is_leader().await {
        return Ok(step);
    }
    if let Some(at) = exec.last_perform {
        if at.elapsed() < exec.settings.polling_timeout {
            return Ok(step);
        }
    }

    let max_retries = match kind {
        ActionKind::Transfer => exec.settings.destination_max_quorum_retries,
        ActionKind::SetStatus => exec.settings.source_max_quorum_retries,
    };
    exec.quorum_retries += 1;
    if exec.quorum_retries > max_retries {
        warn!(
            action = %action,
            attempts = exec.quorum_retries - 1,
            "Execution attempts exhausted"
        );
        return Ok(StepId::GetPendingBatch);
    }

    info!(
        action = %action,
        chain = %side.chain(),
        attempt = exec.quorum_retries,
        "Performing as leader"
    );
    side.perform(&action, &batch).await?;
    exec.last_perform = Some(Instant::now());
    count_transaction(exec).await;
    Ok(step)
}

async fn resolve_set_status(exec: &mut BridgeExecutor) -> Result<StepId> {
    let stored = exec.stored_batch()?;

    let Some(on_source) = exec.source.get_batch(stored.id).await? else {
        info!(batch_id = stored.id, "Batch no longer on the source chain");
        return Ok(StepId::GetPendingBatch);
    };
    if on_source.is_empty() {
        return Ok(StepId::GetPendingBatch);
    }

    let statuses = exec.destination.statuses_after_execution(stored.id).await?;
    let mut batch = stored;
    batch.statuses = statuses;
    batch.resolve_new_deposits(on_source.deposits.len());

    info!(
        batch_id = batch.id,
        statuses = ?batch.statuses,
        "Resolved statuses"
    );
    exec.batch = Some(batch);
    exec.action = None;
    exec.signed_action = None;
    exec.reset_retries();
    Ok(StepId::ProposeSetStatus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorSettings;
    use crate::testing::NetworkBuilder;
    use multichain_rs::testing::{mock_batch, MockDepositBuilder};
    use multichain_rs::{DepositStatus, RetryConfig, TransferBatch};
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_step_labels_follow_direction() {
        assert_eq!(
            StepId::GetPendingBatch.as_str(Direction::EthToMx),
            "get pending batch from Ethereum"
        );
        assert_eq!(
            StepId::GetPendingBatch.as_str(Direction::MxToEth),
            "get pending batch from MultiversX"
        );
        assert_eq!(
            StepId::WaitForQuorumOnSetStatus.as_str(Direction::MxToEth),
            "wait for quorum on set status"
        );
    }

    #[tokio::test]
    async fn test_empty_source_stays_in_get_pending_batch() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        let mut executor = network.nodes[0]
            .executor(Direction::EthToMx, ExecutorSettings::default())
            .await;
        assert_eq!(executor.run_step().await, StepId::GetPendingBatch);
        assert!(executor.current_batch().is_none());
    }

    #[tokio::test]
    async fn test_non_contiguous_nonces_rejected() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        network.mx.set_last_executed_eth_tx_id(10);
        // expected to start at 11
        network.evm.add_pending_batch(mock_batch(Direction::EthToMx, 1, 13, 2));
        let mut executor = network.nodes[0]
            .executor(Direction::EthToMx, ExecutorSettings::default())
            .await;

        assert_eq!(executor.run_step().await, StepId::GetPendingBatch);
        assert!(network.mx.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_leader_waits_for_proposal() {
        let network = NetworkBuilder::new(2).build().await.unwrap();
        network.evm.add_pending_batch(mock_batch(Direction::EthToMx, 1, 1, 1));
        let follower = 1 - network.current_leader();
        let mut executor = network.nodes[follower]
            .executor(Direction::EthToMx, ExecutorSettings::default())
            .await;

        executor.run_step().await;
        executor.run_step().await;
        assert_eq!(executor.run_step().await, StepId::ProposeTransfer);
        assert_eq!(network.mx.proposals(1, ActionKind::Transfer), 0);
    }

    #[tokio::test]
    async fn test_sign_gives_up_after_was_proposed_retries() {
        let network = NetworkBuilder::new(2).build().await.unwrap();
        network.evm.add_pending_batch(mock_batch(Direction::EthToMx, 1, 1, 1));
        let follower = 1 - network.current_leader();
        let settings = ExecutorSettings {
            max_retries_on_was_proposed: 2,
            ..Default::default()
        };
        let mut executor = network.nodes[follower]
            .executor(Direction::EthToMx, settings)
            .await;
        executor.run_step().await;
        executor.run_step().await;

        let mut steps = Vec::new();
        for _ in 0..3 {
            steps.push(
                StepId::SignProposedTransfer
                    .execute(&mut executor)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(
            steps,
            vec![
                StepId::SignProposedTransfer,
                StepId::SignProposedTransfer,
                StepId::GetPendingBatch
            ]
        );
    }

    #[tokio::test]
    async fn test_already_transferred_batch_goes_to_resolve() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        network.mx.add_pending_batch(TransferBatch::new(
            7,
            vec![MockDepositBuilder::new(Direction::MxToEth).build()],
        ));
        // executed on Ethereum by an earlier run
        network
            .evm
            .mark_executed(7, vec![DepositStatus::Executed.as_u8()]);
        let mut executor = network.nodes[0]
            .executor(Direction::MxToEth, ExecutorSettings::default())
            .await;

        assert_eq!(executor.run_step().await, StepId::ResolveSetStatus);
        assert_eq!(executor.run_step().await, StepId::ProposeSetStatus);
        assert_eq!(
            executor.current_batch().unwrap().statuses,
            vec![DepositStatus::Executed.as_u8()]
        );
    }

    async fn run(executor: &mut BridgeExecutor, steps: usize) -> Vec<StepId> {
        let mut visited = Vec::with_capacity(steps);
        for _ in 0..steps {
            visited.push(executor.run_step().await);
        }
        visited
    }

    #[tokio::test]
    async fn test_pending_mx_sign_is_not_resubmitted() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        // the sign transaction is mined only after a few queries
        network.mx.set_sign_delay(4);
        network.evm.add_pending_batch(mock_batch(Direction::EthToMx, 1, 1, 1));
        let mut executor = network.nodes[0]
            .executor(Direction::EthToMx, ExecutorSettings::default())
            .await;

        let steps = run(&mut executor, 12).await;

        assert_eq!(network.mx.sign_calls(1), 1);
        assert!(!steps.windows(2).any(|w| {
            w[0] == StepId::WaitForQuorumOnTransfer && w[1] == StepId::SignProposedTransfer
        }));
        assert!(steps.contains(&StepId::PerformTransfer));
        assert_eq!(network.mx.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_evm_share_is_signed_again_when_missing() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        network.mx.add_pending_batch(mock_batch(Direction::MxToEth, 1, 1, 1));
        let mut executor = network.nodes[0]
            .executor(Direction::MxToEth, ExecutorSettings::default())
            .await;
        run(&mut executor, 4).await;
        assert_eq!(executor.current_step(), StepId::WaitForQuorumOnTransfer);

        // the gossip store lost our share
        network.nodes[0].mx_to_eth.clear().await;
        assert_eq!(executor.run_step().await, StepId::SignProposedTransfer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_the_step() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        network.evm.add_pending_batch(mock_batch(Direction::EthToMx, 1, 1, 1));
        let mut executor = network.nodes[0]
            .executor(Direction::EthToMx, ExecutorSettings::default())
            .await;
        run(&mut executor, 4).await;
        assert_eq!(executor.current_step(), StepId::WaitForQuorumOnTransfer);

        network.mx.fail_views(1);
        assert_eq!(executor.run_step().await, StepId::WaitForQuorumOnTransfer);
        assert!(executor.current_batch().is_some());
        // still backing off
        assert_eq!(executor.run_step().await, StepId::WaitForQuorumOnTransfer);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(executor.run_step().await, StepId::PerformTransfer);
        assert_eq!(executor.current_batch().map(|b| b.id), Some(1));
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_to_pending_batch() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        network.evm.add_pending_batch(mock_batch(Direction::EthToMx, 1, 1, 1));
        let settings = ExecutorSettings {
            transient_retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::ZERO,
                ..RetryConfig::default()
            },
            ..Default::default()
        };
        let mut executor = network.nodes[0]
            .executor(Direction::EthToMx, settings)
            .await;
        run(&mut executor, 4).await;

        network.mx.fail_views(10);
        assert_eq!(
            run(&mut executor, 3).await,
            vec![
                StepId::WaitForQuorumOnTransfer,
                StepId::WaitForQuorumOnTransfer,
                StepId::GetPendingBatch
            ]
        );
        assert!(executor.current_batch().is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_resolved_statuses_cover_source_deposits(
            executed in 0usize..6,
            extra in 0usize..6,
        ) {
            let on_source = executed + extra;
            prop_assume!(on_source > 0);
            let mut batch = mock_batch(Direction::MxToEth, 1, 1, on_source as u64);
            batch.statuses = vec![DepositStatus::Executed.as_u8(); executed];
            batch.resolve_new_deposits(on_source);

            prop_assert_eq!(batch.statuses.len(), on_source);
            prop_assert!(batch.statuses[executed..]
                .iter()
                .all(|s| *s == DepositStatus::Rejected.as_u8()));
        }
    }
}
