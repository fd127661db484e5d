//! Local Network Test
//!
//! Three relayers run their real drivers against the in-memory chains and
//! bridge one batch in each direction.
//!
//! ## Running
//!
//! ```bash
//! cd packages/relayer
//! cargo test --features testing --test local_network
//! ```

use multichain_rs::testing::{assert_statuses_eq, mock_batch};
use multichain_rs::{DepositStatus, Direction};
use relayer::driver::run_driver;
use relayer::executor::ExecutorSettings;
use relayer::testing::NetworkBuilder;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_relayers_bridge_both_directions() {
    let network = NetworkBuilder::new(3).build().await.expect("network");
    network
        .evm
        .add_pending_batch(mock_batch(Direction::EthToMx, 1, 1, 2));
    network
        .mx
        .add_pending_batch(mock_batch(Direction::MxToEth, 1, 1, 3));

    let cancel = CancellationToken::new();
    let mut drivers = Vec::new();
    for node in &network.nodes {
        for direction in [Direction::EthToMx, Direction::MxToEth] {
            let executor = node.executor(direction, ExecutorSettings::default()).await;
            drivers.push(tokio::spawn(run_driver(
                executor,
                Duration::from_millis(5),
                cancel.child_token(),
            )));
        }
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < deadline {
        if network.evm.finished_statuses(1).is_some() && network.mx.finished_statuses(1).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    for driver in drivers {
        driver.await.expect("driver panicked");
    }

    let to_mx = network.evm.finished_statuses(1).expect("EVM batch finished");
    let to_evm = network.mx.finished_statuses(1).expect("MultiversX batch finished");
    assert_statuses_eq(&to_mx, &[DepositStatus::Executed; 2]).unwrap();
    assert_statuses_eq(&to_evm, &[DepositStatus::Executed; 3]).unwrap();
    assert_eq!(network.mx.transfers().len(), 2);
    assert_eq!(network.evm.transfers().len(), 3);
}
