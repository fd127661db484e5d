//! Chain capabilities consumed by the state machine
//!
//! [`EvmChainClient`] and [`MxChainClient`] are the raw contract surfaces,
//! implemented by the `multichain-rs` clients and by the in-memory mocks.
//! [`BridgeSide`] is the direction-agnostic capability set the step graph
//! drives; each chain provides one implementation.

pub mod evm_side;
pub mod mx_side;

pub use evm_side::EvmSide;
pub use mx_side::MxSide;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use eyre::Result;
use multichain_rs::evm::EvmBridgeClient;
use multichain_rs::mx::MxBridgeClient;
use multichain_rs::{Action, ActionKind, ChainKind, Direction, TransferBatch};
use std::sync::Arc;

/// EVM bridge contract surface
#[async_trait]
pub trait EvmChainClient: Send + Sync {
    async fn get_next_pending_batch(&self) -> Result<Option<TransferBatch>>;
    async fn get_batch(&self, batch_id: u64) -> Result<Option<TransferBatch>>;
    async fn was_batch_executed(&self, batch_id: u64) -> Result<bool>;
    async fn was_batch_finished(&self, batch_id: u64) -> Result<bool>;
    async fn get_statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>>;
    async fn get_relayers(&self) -> Result<Vec<Address>>;
    async fn quorum(&self) -> Result<u64>;
    async fn is_paused(&self) -> Result<bool>;
    async fn block_number(&self) -> Result<u64>;
    async fn total_balances(&self, token: Address) -> Result<U256>;
    async fn is_token_whitelisted(&self, token: Address) -> Result<bool>;
    async fn is_mint_burn_token(&self, token: Address) -> Result<bool>;
    async fn is_native_token(&self, token: Address) -> Result<bool>;
    async fn execute_transfer(
        &self,
        tokens: Vec<Address>,
        recipients: Vec<Address>,
        amounts: Vec<U256>,
        batch_id: u64,
        signatures: Vec<Vec<u8>>,
    ) -> Result<String>;
    async fn finish_current_pending_batch(
        &self,
        batch_id: u64,
        new_statuses: Vec<u8>,
        signatures: Vec<Vec<u8>>,
    ) -> Result<String>;
    async fn check_funds_for(&self, gas_limit: u64) -> Result<()>;
    fn gas_limit_for(&self, num_deposits: usize) -> u64;
}

/// MultiversX multisig and safe surface
#[async_trait]
pub trait MxChainClient: Send + Sync {
    fn relayer_public_key(&self) -> [u8; 32];
    async fn get_current_tx_batch(&self) -> Result<Option<TransferBatch>>;
    async fn was_transfer_action_proposed(&self, batch: &TransferBatch) -> Result<bool>;
    async fn get_action_id_for_transfer_batch(&self, batch: &TransferBatch) -> Result<u64>;
    async fn was_set_current_transaction_batch_status_action_proposed(
        &self,
        batch: &TransferBatch,
    ) -> Result<bool>;
    async fn get_action_id_for_set_current_transaction_batch_status(
        &self,
        batch: &TransferBatch,
    ) -> Result<u64>;
    async fn was_action_executed(&self, action_id: u64) -> Result<bool>;
    async fn quorum_reached(&self, action_id: u64) -> Result<bool>;
    async fn get_action_signer_count(&self, action_id: u64) -> Result<u64>;
    async fn get_quorum(&self) -> Result<u64>;
    async fn get_statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>>;
    async fn get_all_staked_relayers(&self) -> Result<Vec<[u8; 32]>>;
    async fn get_last_executed_eth_batch_id(&self) -> Result<u64>;
    async fn get_last_executed_eth_tx_id(&self) -> Result<u64>;
    async fn signed(&self, signer: &[u8; 32], action_id: u64) -> Result<bool>;
    async fn is_paused(&self) -> Result<bool>;
    async fn get_token_id_for_erc20_address(&self, erc20: &[u8]) -> Result<Vec<u8>>;
    async fn is_mint_burn_allowed(&self, token_id: &[u8]) -> Result<bool>;
    async fn is_native_token(&self, token_id: &[u8]) -> Result<bool>;
    async fn get_accumulated_burned_tokens(&self, token_id: &[u8]) -> Result<U256>;
    async fn current_nonce(&self) -> Result<u64>;
    async fn propose_transfer(&self, batch: &TransferBatch) -> Result<String>;
    async fn propose_set_status(&self, batch: &TransferBatch) -> Result<String>;
    async fn sign(&self, action_id: u64) -> Result<String>;
    async fn perform_action(&self, action_id: u64, batch: &TransferBatch) -> Result<String>;
}

/// What one chain offers to a half-bridge, as source or as destination.
///
/// Source-role methods: `get_pending_batch`, `get_batch`, `was_batch_finalized`.
/// Destination-role methods: `was_batch_transferred`, `verify_deposit_nonces`,
/// `convert_tokens`, `statuses_after_execution`. Action methods serve both roles
/// (transfer on the destination, set-status on the source).
#[async_trait]
pub trait BridgeSide: Send + Sync {
    fn chain(&self) -> ChainKind;

    /// Latest block number / nonce, for availability checks
    async fn latest_height(&self) -> Result<u64>;

    async fn get_pending_batch(&self) -> Result<Option<TransferBatch>>;
    async fn get_batch(&self, batch_id: u64) -> Result<Option<TransferBatch>>;
    async fn was_batch_finalized(&self, batch_id: u64) -> Result<bool>;

    async fn was_batch_transferred(&self, batch_id: u64) -> Result<bool>;
    async fn verify_deposit_nonces(&self, batch: &TransferBatch) -> Result<()>;
    async fn convert_tokens(&self, batch: &mut TransferBatch) -> Result<()>;
    async fn statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>>;

    async fn get_action(&self, batch: &TransferBatch, kind: ActionKind) -> Result<Action>;
    async fn was_proposed(&self, batch: &TransferBatch, kind: ActionKind) -> Result<bool>;
    async fn propose(&self, batch: &TransferBatch, kind: ActionKind) -> Result<()>;
    async fn was_signed(&self, action: &Action) -> Result<bool>;
    async fn sign(&self, action: &Action) -> Result<()>;
    async fn signers_count(&self, action: &Action) -> Result<u64>;
    async fn is_quorum_reached(&self, action: &Action) -> Result<bool>;
    async fn was_action_executed(&self, action: &Action, batch: &TransferBatch) -> Result<bool>;
    async fn perform(&self, action: &Action, batch: &TransferBatch) -> Result<()>;
}

/// `(source, destination)` of a direction
pub fn sides_for(
    direction: Direction,
    evm: Arc<dyn BridgeSide>,
    mx: Arc<dyn BridgeSide>,
) -> (Arc<dyn BridgeSide>, Arc<dyn BridgeSide>) {
    match direction {
        Direction::EthToMx => (evm, mx),
        Direction::MxToEth => (mx, evm),
    }
}

#[async_trait]
impl EvmChainClient for EvmBridgeClient {
    async fn get_next_pending_batch(&self) -> Result<Option<TransferBatch>> {
        EvmBridgeClient::get_next_pending_batch(self).await
    }

    async fn get_batch(&self, batch_id: u64) -> Result<Option<TransferBatch>> {
        EvmBridgeClient::get_batch(self, batch_id).await
    }

    async fn was_batch_executed(&self, batch_id: u64) -> Result<bool> {
        EvmBridgeClient::was_batch_executed(self, batch_id).await
    }

    async fn was_batch_finished(&self, batch_id: u64) -> Result<bool> {
        EvmBridgeClient::was_batch_finished(self, batch_id).await
    }

    async fn get_statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>> {
        EvmBridgeClient::get_statuses_after_execution(self, batch_id).await
    }

    async fn get_relayers(&self) -> Result<Vec<Address>> {
        EvmBridgeClient::get_relayers(self).await
    }

    async fn quorum(&self) -> Result<u64> {
        EvmBridgeClient::quorum(self).await
    }

    async fn is_paused(&self) -> Result<bool> {
        EvmBridgeClient::is_paused(self).await
    }

    async fn block_number(&self) -> Result<u64> {
        EvmBridgeClient::block_number(self).await
    }

    async fn total_balances(&self, token: Address) -> Result<U256> {
        EvmBridgeClient::total_balances(self, token).await
    }

    async fn is_token_whitelisted(&self, token: Address) -> Result<bool> {
        EvmBridgeClient::is_token_whitelisted(self, token).await
    }

    async fn is_mint_burn_token(&self, token: Address) -> Result<bool> {
        EvmBridgeClient::is_mint_burn_token(self, token).await
    }

    async fn is_native_token(&self, token: Address) -> Result<bool> {
        EvmBridgeClient::is_native_token(self, token).await
    }

    async fn execute_transfer(
        &self,
        tokens: Vec<Address>,
        recipients: Vec<Address>,
        amounts: Vec<U256>,
        batch_id: u64,
        signatures: Vec<Vec<u8>>,
    ) -> Result<String> {
        EvmBridgeClient::execute_transfer(self, tokens, recipients, amounts, batch_id, signatures)
            .await
    }

    async fn finish_current_pending_batch(
        &self,
        batch_id: u64,
        new_statuses: Vec<u8>,
        signatures: Vec<Vec<u8>>,
    ) -> Result<String> {
        EvmBridgeClient::finish_current_pending_batch(self, batch_id, new_statuses, signatures)
            .await
    }

    async fn check_funds_for(&self, gas_limit: u64) -> Result<()> {
        EvmBridgeClient::check_funds_for(self, gas_limit).await
    }

    fn gas_limit_for(&self, num_deposits: usize) -> u64 {
        self.config().gas_limit_for(num_deposits)
    }
}

#[async_trait]
impl MxChainClient for MxBridgeClient {
    fn relayer_public_key(&self) -> [u8; 32] {
        MxBridgeClient::relayer_public_key(self)
    }

    async fn get_current_tx_batch(&self) -> Result<Option<TransferBatch>> {
        MxBridgeClient::get_current_tx_batch(self).await
    }

    async fn was_transfer_action_proposed(&self, batch: &TransferBatch) -> Result<bool> {
        MxBridgeClient::was_transfer_action_proposed(self, batch).await
    }

    async fn get_action_id_for_transfer_batch(&self, batch: &TransferBatch) -> Result<u64> {
        MxBridgeClient::get_action_id_for_transfer_batch(self, batch).await
    }

    async fn was_set_current_transaction_batch_status_action_proposed(
        &self,
        batch: &TransferBatch,
    ) -> Result<bool> {
        MxBridgeClient::was_set_current_transaction_batch_status_action_proposed(self, batch).await
    }

    async fn get_action_id_for_set_current_transaction_batch_status(
        &self,
        batch: &TransferBatch,
    ) -> Result<u64> {
        MxBridgeClient::get_action_id_for_set_current_transaction_batch_status(self, batch).await
    }

    async fn was_action_executed(&self, action_id: u64) -> Result<bool> {
        MxBridgeClient::was_action_executed(self, action_id).await
    }

    async fn quorum_reached(&self, action_id: u64) -> Result<bool> {
        MxBridgeClient::quorum_reached(self, action_id).await
    }

    async fn get_action_signer_count(&self, action_id: u64) -> Result<u64> {
        MxBridgeClient::get_action_signer_count(self, action_id).await
    }

    async fn get_quorum(&self) -> Result<u64> {
        MxBridgeClient::get_quorum(self).await
    }

    async fn get_statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>> {
        MxBridgeClient::get_statuses_after_execution(self, batch_id).await
    }

    async fn get_all_staked_relayers(&self) -> Result<Vec<[u8; 32]>> {
        MxBridgeClient::get_all_staked_relayers(self).await
    }

    async fn get_last_executed_eth_batch_id(&self) -> Result<u64> {
        MxBridgeClient::get_last_executed_eth_batch_id(self).await
    }

    async fn get_last_executed_eth_tx_id(&self) -> Result<u64> {
        MxBridgeClient::get_last_executed_eth_tx_id(self).await
    }

    async fn signed(&self, signer: &[u8; 32], action_id: u64) -> Result<bool> {
        MxBridgeClient::signed(self, signer, action_id).await
    }

    async fn is_paused(&self) -> Result<bool> {
        MxBridgeClient::is_paused(self).await
    }

    async fn get_token_id_for_erc20_address(&self, erc20: &[u8]) -> Result<Vec<u8>> {
        MxBridgeClient::get_token_id_for_erc20_address(self, erc20).await
    }

    async fn is_mint_burn_allowed(&self, token_id: &[u8]) -> Result<bool> {
        MxBridgeClient::is_mint_burn_allowed(self, token_id).await
    }

    async fn is_native_token(&self, token_id: &[u8]) -> Result<bool> {
        MxBridgeClient::is_native_token(self, token_id).await
    }

    async fn get_accumulated_burned_tokens(&self, token_id: &[u8]) -> Result<U256> {
        MxBridgeClient::get_accumulated_burned_tokens(self, token_id).await
    }

    async fn current_nonce(&self) -> Result<u64> {
        MxBridgeClient::current_nonce(self).await
    }

    async fn propose_transfer(&self, batch: &TransferBatch) -> Result<String> {
        MxBridgeClient::propose_transfer(self, batch).await
    }

    async fn propose_set_status(&self, batch: &TransferBatch) -> Result<String> {
        MxBridgeClient::propose_set_status(self, batch).await
    }

    async fn sign(&self, action_id: u64) -> Result<String> {
        MxBridgeClient::sign(self, action_id).await
    }

    async fn perform_action(&self, action_id: u64, batch: &TransferBatch) -> Result<String> {
        MxBridgeClient::perform_action(self, action_id, batch).await
    }
}
