//! MultiversX as a half-bridge side
//!
//! Actions are registered on the multisig, which assigns the action ids and
//! counts the signers on chain.

use async_trait::async_trait;
use eyre::Result;
use multichain_rs::{Action, ActionKind, ChainKind, TransferBatch};
use std::sync::Arc;
use tracing::debug;

use super::{BridgeSide, MxChainClient};
use crate::errors::RelayerError;
use crate::metrics;

pub struct MxSide {
    client: Arc<dyn MxChainClient>,
}

impl MxSide {
    pub fn new(client: Arc<dyn MxChainClient>) -> Self {
        Self { client }
    }

    fn action_id(action: &Action) -> Result<u64> {
        match action.action_id {
            Some(id) if id != 0 => Ok(id),
            _ => Err(RelayerError::InvalidActionId(action.batch_id).into()),
        }
    }
}

#[async_trait]
impl BridgeSide for MxSide {
    fn chain(&self) -> ChainKind {
        ChainKind::Mx
    }

    async fn latest_height(&self) -> Result<u64> {
        self.client.current_nonce().await
    }

    async fn get_pending_batch(&self) -> Result<Option<TransferBatch>> {
        Ok(self
            .client
            .get_current_tx_batch()
            .await?
            .filter(|batch| !batch.is_empty()))
    }

    async fn get_batch(&self, batch_id: u64) -> Result<Option<TransferBatch>> {
        Ok(self
            .client
            .get_current_tx_batch()
            .await?
            .filter(|batch| batch.id == batch_id))
    }

    /// The safe moves to the next batch once the status of the current one is set
    async fn was_batch_finalized(&self, batch_id: u64) -> Result<bool> {
        Ok(self
            .client
            .get_current_tx_batch()
            .await?
            .map_or(true, |current| current.id != batch_id))
    }

    async fn was_batch_transferred(&self, batch_id: u64) -> Result<bool> {
        let last_executed = self.client.get_last_executed_eth_batch_id().await?;
        Ok(last_executed >= batch_id)
    }

    async fn verify_deposit_nonces(&self, batch: &TransferBatch) -> Result<()> {
        let last_tx_id = self.client.get_last_executed_eth_tx_id().await?;
        batch
            .verify_nonces_follow(last_tx_id)
            .map_err(|e| RelayerError::InvalidDepositNonce(e.to_string()).into())
    }

    async fn convert_tokens(&self, batch: &mut TransferBatch) -> Result<()> {
        for deposit in batch
            .deposits
            .iter_mut()
            .filter(|d| d.converted_token_bytes.is_empty())
        {
            deposit.converted_token_bytes = self
                .client
                .get_token_id_for_erc20_address(&deposit.token_bytes)
                .await?;
            debug!(
                nonce = deposit.nonce,
                token = %deposit.display_token,
                converted = %String::from_utf8_lossy(&deposit.converted_token_bytes),
                "Converted token"
            );
        }
        Ok(())
    }

    async fn statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>> {
        self.client.get_statuses_after_execution(batch_id).await
    }

    async fn get_action(&self, batch: &TransferBatch, kind: ActionKind) -> Result<Action> {
        let action_id = match kind {
            ActionKind::Transfer => self.client.get_action_id_for_transfer_batch(batch).await?,
            ActionKind::SetStatus => {
                self.client
                    .get_action_id_for_set_current_transaction_batch_status(batch)
                    .await?
            }
        };
        Ok(Action {
            kind,
            batch_id: batch.id,
            action_id: Some(action_id),
            fingerprint: batch.fingerprint(kind),
        })
    }

    async fn was_proposed(&self, batch: &TransferBatch, kind: ActionKind) -> Result<bool> {
        match kind {
            ActionKind::Transfer => self.client.was_transfer_action_proposed(batch).await,
            ActionKind::SetStatus => {
                self.client
                    .was_set_current_transaction_batch_status_action_proposed(batch)
                    .await
            }
        }
    }

    async fn propose(&self, batch: &TransferBatch, kind: ActionKind) -> Result<()> {
        match kind {
            ActionKind::Transfer => {
                self.client.propose_transfer(batch).await?;
                metrics::record_transaction(ChainKind::Mx.as_str(), "propose_transfer");
            }
            ActionKind::SetStatus => {
                self.client.propose_set_status(batch).await?;
                metrics::record_transaction(ChainKind::Mx.as_str(), "propose_set_status");
            }
        }
        Ok(())
    }

    async fn was_signed(&self, action: &Action) -> Result<bool> {
        let id = Self::action_id(action)?;
        self.client
            .signed(&self.client.relayer_public_key(), id)
            .await
    }

    async fn sign(&self, action: &Action) -> Result<()> {
        let id = Self::action_id(action)?;
        self.client.sign(id).await?;
        metrics::record_transaction(ChainKind::Mx.as_str(), "sign");
        Ok(())
    }

    async fn signers_count(&self, action: &Action) -> Result<u64> {
        let id = Self::action_id(action)?;
        self.client.get_action_signer_count(id).await
    }

    async fn is_quorum_reached(&self, action: &Action) -> Result<bool> {
        let id = Self::action_id(action)?;
        self.client.quorum_reached(id).await
    }

    async fn was_action_executed(&self, action: &Action, _batch: &TransferBatch) -> Result<bool> {
        let id = Self::action_id(action)?;
        self.client.was_action_executed(id).await
    }

    async fn perform(&self, action: &Action, batch: &TransferBatch) -> Result<()> {
        let id = Self::action_id(action)?;
        if self.client.is_paused().await? {
            return Err(RelayerError::Paused {
                chain: ChainKind::Mx.as_str(),
            }
            .into());
        }
        self.client.perform_action(id, batch).await?;
        metrics::record_transaction(ChainKind::Mx.as_str(), "perform_action");
        Ok(())
    }
}
