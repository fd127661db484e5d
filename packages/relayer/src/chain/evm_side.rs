//! EVM as a half-bridge side
//!
//! The bridge contract has no on-chain proposals: relayers sign the action hash
//! off chain, gossip the signatures, and the leader submits them (sorted by
//! signer, truncated to quorum) with the call.

use async_trait::async_trait;
use eyre::Result;
use multichain_rs::evm::EvmCryptoHandler;
use multichain_rs::{
    set_status_message_hash, transfer_message_hash, Action, ActionKind, ChainKind, TransferArgs,
    TransferBatch,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::{BridgeSide, EvmChainClient};
use crate::errors::RelayerError;
use crate::metrics;
use crate::p2p::Broadcaster;
use crate::roles::ChainRoleProvider;

pub struct EvmSide {
    client: Arc<dyn EvmChainClient>,
    broadcaster: Arc<Broadcaster>,
    crypto: Arc<EvmCryptoHandler>,
    roles: Arc<ChainRoleProvider>,
}

impl EvmSide {
    pub fn new(
        client: Arc<dyn EvmChainClient>,
        broadcaster: Arc<Broadcaster>,
        crypto: Arc<EvmCryptoHandler>,
        roles: Arc<ChainRoleProvider>,
    ) -> Self {
        Self {
            client,
            broadcaster,
            crypto,
            roles,
        }
    }

    fn message_hash(batch: &TransferBatch, kind: ActionKind) -> Result<[u8; 32]> {
        Ok(match kind {
            ActionKind::Transfer => transfer_message_hash(&TransferArgs::from_batch(batch)?),
            ActionKind::SetStatus => set_status_message_hash(batch.id, &batch.statuses),
        })
    }

    /// Quorum-sized signature list, sorted by signer
    async fn quorum_signatures(&self, action: &Action) -> Result<Vec<Vec<u8>>> {
        let quorum = self.roles.quorum().await?;
        let mut signatures = self.broadcaster.signatures(&action.fingerprint).await;
        if (signatures.len() as u64) < quorum {
            return Err(RelayerError::QuorumNotReached {
                have: signatures.len(),
                need: quorum,
            }
            .into());
        }
        signatures.truncate(quorum as usize);
        Ok(signatures.into_iter().map(|(_, sig)| sig).collect())
    }
}

#[async_trait]
impl BridgeSide for EvmSide {
    fn chain(&self) -> ChainKind {
        ChainKind::Evm
    }

    async fn latest_height(&self) -> Result<u64> {
        self.client.block_number().await
    }

    async fn get_pending_batch(&self) -> Result<Option<TransferBatch>> {
        Ok(self
            .client
            .get_next_pending_batch()
            .await?
            .filter(|batch| !batch.is_empty()))
    }

    async fn get_batch(&self, batch_id: u64) -> Result<Option<TransferBatch>> {
        self.client.get_batch(batch_id).await
    }

    async fn was_batch_finalized(&self, batch_id: u64) -> Result<bool> {
        self.client.was_batch_finished(batch_id).await
    }

    async fn was_batch_transferred(&self, batch_id: u64) -> Result<bool> {
        self.client.was_batch_executed(batch_id).await
    }

    async fn verify_deposit_nonces(&self, batch: &TransferBatch) -> Result<()> {
        batch
            .verify_nonces()
            .map_err(|e| RelayerError::InvalidDepositNonce(e.to_string()).into())
    }

    /// Batches from MultiversX already carry the ERC20 address
    async fn convert_tokens(&self, _batch: &mut TransferBatch) -> Result<()> {
        Ok(())
    }

    async fn statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>> {
        let statuses = self.client.get_statuses_after_execution(batch_id).await?;
        if statuses.is_empty() {
            return Err(RelayerError::NotFinished(batch_id).into());
        }
        Ok(statuses)
    }

    async fn get_action(&self, batch: &TransferBatch, kind: ActionKind) -> Result<Action> {
        Ok(Action {
            kind,
            batch_id: batch.id,
            action_id: None,
            fingerprint: Self::message_hash(batch, kind)?,
        })
    }

    /// Nothing is registered on chain, every relayer signs right away
    async fn was_proposed(&self, _batch: &TransferBatch, _kind: ActionKind) -> Result<bool> {
        Ok(true)
    }

    async fn propose(&self, _batch: &TransferBatch, _kind: ActionKind) -> Result<()> {
        Ok(())
    }

    async fn was_signed(&self, action: &Action) -> Result<bool> {
        Ok(self
            .broadcaster
            .has_signature_from(&action.fingerprint, self.crypto.address())
            .await)
    }

    async fn sign(&self, action: &Action) -> Result<()> {
        let signature = self.crypto.sign(&action.fingerprint)?;
        self.broadcaster
            .broadcast_signature(action.fingerprint, signature)
            .await?;
        debug!(action = %action, "Signed and broadcast");
        Ok(())
    }

    async fn signers_count(&self, action: &Action) -> Result<u64> {
        Ok(self.broadcaster.signatures(&action.fingerprint).await.len() as u64)
    }

    async fn is_quorum_reached(&self, action: &Action) -> Result<bool> {
        let quorum = self.roles.quorum().await?;
        Ok(self.signers_count(action).await? >= quorum)
    }

    async fn was_action_executed(&self, action: &Action, batch: &TransferBatch) -> Result<bool> {
        match action.kind {
            ActionKind::Transfer => self.client.was_batch_executed(batch.id).await,
            ActionKind::SetStatus => self.client.was_batch_finished(batch.id).await,
        }
    }

    async fn perform(&self, action: &Action, batch: &TransferBatch) -> Result<()> {
        if self.client.is_paused().await? {
            return Err(RelayerError::Paused {
                chain: ChainKind::Evm.as_str(),
            }
            .into());
        }
        let signatures = self.quorum_signatures(action).await?;
        let num_deposits = match action.kind {
            ActionKind::Transfer => batch.deposits.len(),
            ActionKind::SetStatus => batch.statuses.len(),
        };
        self.client
            .check_funds_for(self.client.gas_limit_for(num_deposits))
            .await?;

        let tx_hash = match action.kind {
            ActionKind::Transfer => {
                let args = TransferArgs::from_batch(batch)?;
                let hash = self
                    .client
                    .execute_transfer(args.tokens, args.recipients, args.amounts, batch.id, signatures)
                    .await?;
                metrics::record_transaction(ChainKind::Evm.as_str(), "execute_transfer");
                hash
            }
            ActionKind::SetStatus => {
                let hash = self
                    .client
                    .finish_current_pending_batch(batch.id, batch.statuses.clone(), signatures)
                    .await?;
                metrics::record_transaction(ChainKind::Evm.as_str(), "finish_current_pending_batch");
                hash
            }
        };
        info!(action = %action, tx_hash = %tx_hash, "Performed action");
        Ok(())
    }
}
