//! End-to-end runs of both half-bridges over the in-memory chains

use alloy::primitives::{Address, U256};
use multichain_rs::testing::{
    assert_statuses_eq, mock_batch, mock_mx_contract_address, MockDepositBuilder,
};
use multichain_rs::{ActionKind, DepositStatus, Direction, ScCallData, TransferBatch};

use super::{
    run_rounds, EsdtTransfer, EvmPayout, EvmToken, MxToken, NetworkBuilder, TestNetwork,
    DEFAULT_ERC20, DEFAULT_TOKEN_ID, MOCK_FEE,
};
use crate::executor::{BridgeExecutor, ExecutorSettings};
use crate::status::METRIC_SIGNATURES_RECEIVED;
use crate::steps::StepId;

const SECOND_ERC20: [u8; 20] = [0x22; 20];
const SECOND_TOKEN_ID: &[u8] = b"TKN-222222";

async fn executors(
    network: &TestNetwork,
    nodes: &[usize],
    direction: Direction,
) -> Vec<BridgeExecutor> {
    let mut executors = Vec::new();
    for &i in nodes {
        executors.push(
            network.nodes[i]
                .executor(direction, ExecutorSettings::default())
                .await,
        );
    }
    executors
}

fn count_mx_calls(network: &TestNetwork, function: &str) -> usize {
    network
        .mx
        .calls()
        .iter()
        .filter(|c| c.function == function)
        .count()
}

/// Batch 346 with two deposits in two tokens
fn two_token_batch(network: &TestNetwork) -> TransferBatch {
    network.evm.add_token(
        Address::from(SECOND_ERC20),
        EvmToken::native_locked(U256::from(u64::MAX)),
    );
    network.mx.add_token(
        SECOND_TOKEN_ID,
        SECOND_ERC20.to_vec(),
        MxToken::mint_burn(U256::ZERO),
    );
    network.mx.set_last_executed_eth_tx_id(772634);

    TransferBatch::new(
        346,
        vec![
            MockDepositBuilder::new(Direction::EthToMx)
                .nonce(772635)
                .amount(111111111)
                .to(vec![0xa1; 32])
                .build(),
            MockDepositBuilder::new(Direction::EthToMx)
                .nonce(772636)
                .amount(222222222)
                .to(vec![0xb2; 32])
                .tokens(SECOND_ERC20.to_vec(), SECOND_TOKEN_ID.to_vec())
                .build(),
        ],
    )
}

fn assert_two_token_batch_bridged(network: &TestNetwork) {
    assert_eq!(network.mx.proposals(346, ActionKind::Transfer), 1);
    assert_eq!(count_mx_calls(network, "performAction"), 1);

    let transfers = network.mx.transfers();
    assert_eq!(transfers.len(), 2);
    assert_eq!(transfers[0].token, DEFAULT_TOKEN_ID.to_vec());
    assert_eq!(transfers[0].amount, U256::from(111111111u64 - MOCK_FEE));
    assert_eq!(transfers[1].token, SECOND_TOKEN_ID.to_vec());
    assert_eq!(transfers[1].amount, U256::from(222222222u64 - MOCK_FEE));

    let statuses = network.evm.finished_statuses(346).unwrap();
    assert_statuses_eq(&statuses, &[DepositStatus::Executed, DepositStatus::Executed]).unwrap();
}

async fn run_happy_eth_to_mx(network: &TestNetwork) -> Vec<BridgeExecutor> {
    let batch = two_token_batch(network);
    network.evm.add_pending_batch(batch);
    let mut executors = executors(network, &[0, 1, 2], Direction::EthToMx).await;
    run_rounds(&mut executors, 25).await;
    executors
}

#[tokio::test]
async fn test_happy_eth_to_mx_two_deposits() {
    let network = NetworkBuilder::new(3).quorum(3).build().await.unwrap();
    let executors = run_happy_eth_to_mx(&network).await;

    assert_two_token_batch_bridged(&network);
    assert_eq!(count_mx_calls(&network, "sign"), 3);

    // set-status carried every relayer's signature
    let finish: Vec<_> = network
        .evm
        .calls()
        .into_iter()
        .filter(|c| c.function == "finishCurrentPendingBatch")
        .collect();
    assert_eq!(finish.len(), 1);
    assert_eq!(finish[0].signatures, 3);

    for executor in &executors {
        assert_eq!(executor.current_step(), StepId::GetPendingBatch);
    }
}

#[tokio::test]
async fn test_truncated_batch_rejects_the_rest() {
    let network = NetworkBuilder::new(3).build().await.unwrap();
    network.mx.add_pending_batch(mock_batch(Direction::MxToEth, 1, 1, 3));
    network.evm.set_accept_limit(2);

    let mut executors = executors(&network, &[0, 1, 2], Direction::MxToEth).await;
    run_rounds(&mut executors, 25).await;

    assert_eq!(network.evm.transfers().len(), 2);
    let statuses = network.mx.finished_statuses(1).unwrap();
    assert_statuses_eq(
        &statuses,
        &[
            DepositStatus::Executed,
            DepositStatus::Executed,
            DepositStatus::Rejected,
        ],
    )
    .unwrap();

    let third = MockDepositBuilder::new(Direction::MxToEth).build();
    assert_eq!(
        network.mx.refunds(),
        vec![EsdtTransfer {
            token: DEFAULT_TOKEN_ID.to_vec(),
            recipient: third.display_from,
            amount: U256::from(3_000 - MOCK_FEE),
        }]
    );
}

#[tokio::test]
async fn test_leader_failure_after_propose() {
    let network = NetworkBuilder::new(3).quorum(2).build().await.unwrap();
    let batch = two_token_batch(&network);
    network.evm.add_pending_batch(batch);

    let leader = network.current_leader();
    let survivors: Vec<usize> = (0..3).filter(|i| *i != leader).collect();

    // the leader proposes, then never runs again
    let mut crashed = network.nodes[leader]
        .executor(Direction::EthToMx, ExecutorSettings::default())
        .await;
    for _ in 0..3 {
        crashed.run_step().await;
    }
    drop(crashed);
    assert_eq!(network.mx.proposals(346, ActionKind::Transfer), 1);
    assert_eq!(count_mx_calls(&network, "sign"), 0);

    let mut executors = executors(&network, &survivors, Direction::EthToMx).await;
    run_rounds(&mut executors, 8).await;
    // quorum reached, nobody left to perform in this window
    assert_eq!(count_mx_calls(&network, "sign"), 2);
    assert_eq!(count_mx_calls(&network, "performAction"), 0);
    for executor in &executors {
        assert_eq!(executor.current_step(), StepId::PerformTransfer);
    }

    network.rotate_leader_to(survivors[0]);
    run_rounds(&mut executors, 25).await;

    assert_two_token_batch_bridged(&network);
}

#[tokio::test]
async fn test_refund_on_unknown_sc_endpoint() {
    let network = NetworkBuilder::new(3).build().await.unwrap();
    let call = ScCallData {
        endpoint: "unknownFunction".to_string(),
        gas_limit: 50_000_000,
        arguments: vec![],
    };
    let deposit = MockDepositBuilder::new(Direction::EthToMx)
        .amount(1000)
        .to(mock_mx_contract_address(5))
        .sc_call_data(call.encode())
        .build();
    let depositor = Address::from_slice(&deposit.from_bytes);
    network
        .evm
        .add_pending_batch(TransferBatch::new(1, vec![deposit]));

    let mut executors = executors(&network, &[0, 1, 2], Direction::EthToMx).await;
    run_rounds(&mut executors, 25).await;

    assert!(network.mx.transfers().is_empty());
    assert_statuses_eq(
        &network.mx.statuses_after_execution(1).unwrap(),
        &[DepositStatus::Rejected],
    )
    .unwrap();
    assert_statuses_eq(
        &network.evm.finished_statuses(1).unwrap(),
        &[DepositStatus::Rejected],
    )
    .unwrap();
    assert_eq!(
        network.evm.refunds(),
        vec![EvmPayout {
            token: Address::from(DEFAULT_ERC20),
            recipient: depositor,
            amount: U256::from(1000 - MOCK_FEE),
        }]
    );
}

#[tokio::test]
async fn test_quorum_not_reached_parks_in_wait() {
    let network = NetworkBuilder::new(4).quorum(3).build().await.unwrap();
    network.mx.add_pending_batch(mock_batch(Direction::MxToEth, 1, 1, 2));

    // relayer 0 is offline, relayer 2 can neither send nor receive shares
    let muted = &network.nodes[2];
    network
        .hub
        .drop_topic_for(&muted.peer_id, muted.mx_to_eth.sign_topic());

    let mut executors = executors(&network, &[1, 2, 3], Direction::MxToEth).await;
    run_rounds(&mut executors, 20).await;

    assert!(network.evm.calls().is_empty());
    for executor in &executors {
        assert_eq!(executor.current_step(), StepId::WaitForQuorumOnTransfer);
    }
    for (i, expected) in [(1, 2), (2, 1), (3, 2)] {
        let received = network.nodes[i]
            .status
            .handler(Direction::MxToEth.as_str())
            .await
            .int_metric(METRIC_SIGNATURES_RECEIVED)
            .await;
        assert_eq!(received, Some(expected), "relayer {}", i);
    }
}

#[tokio::test]
async fn test_replayed_batch_is_skipped() {
    let network = NetworkBuilder::new(3).build().await.unwrap();
    let mut executors = run_happy_eth_to_mx(&network).await;
    let mx_calls = network.mx.calls().len();
    let evm_calls = network.evm.calls().len();

    network.evm.replay_batch(346);
    run_rounds(&mut executors, 10).await;

    assert_eq!(network.mx.calls().len(), mx_calls);
    assert_eq!(network.evm.calls().len(), evm_calls);
    for executor in &executors {
        assert_eq!(executor.current_step(), StepId::GetPendingBatch);
        assert!(executor.current_batch().is_none());
    }
}

#[tokio::test]
async fn test_both_directions_share_relayers() {
    let network = NetworkBuilder::new(3).build().await.unwrap();
    network
        .evm
        .add_pending_batch(mock_batch(Direction::EthToMx, 1, 1, 2));
    network
        .mx
        .add_pending_batch(mock_batch(Direction::MxToEth, 1, 1, 2));

    let mut both = executors(&network, &[0, 1, 2], Direction::EthToMx).await;
    both.extend(executors(&network, &[0, 1, 2], Direction::MxToEth).await);
    run_rounds(&mut both, 30).await;

    for statuses in [
        network.evm.finished_statuses(1).unwrap(),
        network.mx.finished_statuses(1).unwrap(),
    ] {
        assert_statuses_eq(&statuses, &[DepositStatus::Executed, DepositStatus::Executed])
            .unwrap();
    }
}
