//! Ticks one executor until cancelled

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::executor::BridgeExecutor;

/// Run `executor` one step per `step_duration`
///
/// Cancellation is observed between steps; an in-flight step finishes first.
pub async fn run_driver(
    mut executor: BridgeExecutor,
    step_duration: Duration,
    cancel: CancellationToken,
) {
    let direction = executor.direction().as_str();
    let span = info_span!("driver", direction);

    async move {
        info!(step_duration_ms = step_duration.as_millis() as u64, "State machine started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            executor.run_step().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(step_duration) => {}
            }
        }
        info!(
            step = executor.current_step().as_str(executor.direction()),
            "State machine stopped"
        );
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorSettings;
    use crate::status::{METRIC_CURRENT_STEP, METRIC_NUM_BATCHES};
    use crate::testing::NetworkBuilder;
    use multichain_rs::testing::mock_batch;
    use multichain_rs::Direction;

    #[tokio::test]
    async fn test_driver_stops_promptly_on_cancel() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        let executor = network.nodes[0]
            .executor(Direction::EthToMx, ExecutorSettings::default())
            .await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_driver(
            executor,
            Duration::from_secs(3600),
            cancel.clone(),
        ));

        tokio::task::yield_now().await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("driver did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_driver_advances_the_executor() {
        let network = NetworkBuilder::new(1).build().await.unwrap();
        network
            .evm
            .add_pending_batch(mock_batch(Direction::EthToMx, 1, 1, 1));
        let node = &network.nodes[0];
        let executor = node
            .executor(Direction::EthToMx, ExecutorSettings::default())
            .await;
        let status = node.status.handler(Direction::EthToMx.as_str()).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_driver(
            executor,
            Duration::from_millis(1),
            cancel.clone(),
        ));
        for _ in 0..200 {
            if network.evm.finished_statuses(1).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(network.evm.finished_statuses(1), Some(vec![3]));
        assert_eq!(status.int_metric(METRIC_NUM_BATCHES).await, Some(1));
        assert!(status.string_metric(METRIC_CURRENT_STEP).await.is_some());
    }
}
