//! In-memory EVM bridge and safe
//!
//! Signatures passed to `executeTransfer` / `finishCurrentPendingBatch` are
//! recovered and checked against the relayer set and quorum like the contract does.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use multichain_rs::evm::recover_signer;
use multichain_rs::{
    set_status_message_hash, transfer_message_hash, DepositStatus, TransferArgs, TransferBatch,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::MOCK_FEE;
use crate::chain::EvmChainClient;

const GAS_LIMIT_BASE: u64 = 350_000;
const GAS_LIMIT_FOR_EACH: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmToken {
    pub whitelisted: bool,
    pub native: bool,
    pub mint_burn: bool,
    pub total_balance: U256,
}

impl EvmToken {
    /// Native on Ethereum, locked in the safe
    pub fn native_locked(total_balance: U256) -> Self {
        Self {
            whitelisted: true,
            native: true,
            mint_burn: false,
            total_balance,
        }
    }

    /// Wrapped representation minted by the bridge
    pub fn mint_burn() -> Self {
        Self {
            whitelisted: true,
            native: false,
            mint_burn: true,
            total_balance: U256::ZERO,
        }
    }
}

/// Payout made by `executeTransfer` or a refund made by `finishCurrentPendingBatch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmPayout {
    pub token: Address,
    pub recipient: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmCall {
    pub function: &'static str,
    pub batch_id: u64,
    pub caller: Address,
    pub signatures: usize,
}

#[derive(Debug, Default)]
struct EvmState {
    relayers: Vec<Address>,
    quorum: u64,
    paused: bool,
    halted: bool,
    block: u64,
    batches: BTreeMap<u64, TransferBatch>,
    pending: VecDeque<u64>,
    finished: HashMap<u64, Vec<u8>>,
    executed: HashMap<u64, Vec<u8>>,
    tokens: HashMap<Address, EvmToken>,
    transfers: Vec<EvmPayout>,
    refunds: Vec<EvmPayout>,
    calls: Vec<EvmCall>,
    accept_limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct MockEvmChain {
    state: Mutex<EvmState>,
}

impl MockEvmChain {
    pub fn new(relayers: Vec<Address>, quorum: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EvmState {
                relayers,
                quorum,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, EvmState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Client acting as `caller`
    pub fn client(self: &Arc<Self>, caller: Address) -> Arc<MockEvmClient> {
        Arc::new(MockEvmClient {
            chain: self.clone(),
            caller,
        })
    }

    pub fn add_token(&self, token: Address, config: EvmToken) {
        self.state().tokens.insert(token, config);
    }

    /// Queue a batch as the bridge's pending batch
    pub fn add_pending_batch(&self, batch: TransferBatch) {
        let mut state = self.state();
        state.pending.push_back(batch.id);
        state.batches.insert(batch.id, batch);
    }

    /// Surface an already processed batch again, as a lagging RPC node would
    pub fn replay_batch(&self, batch_id: u64) {
        self.state().pending.push_front(batch_id);
    }

    /// Execute at most `limit` deposits per batch; the rest get no status
    pub fn set_accept_limit(&self, limit: usize) {
        self.state().accept_limit = Some(limit);
    }

    /// Record a batch as executed without going through `executeTransfer`
    pub fn mark_executed(&self, batch_id: u64, statuses: Vec<u8>) {
        self.state().executed.insert(batch_id, statuses);
    }

    pub fn set_paused(&self, paused: bool) {
        self.state().paused = paused;
    }

    /// Stop producing blocks
    pub fn set_halted(&self, halted: bool) {
        self.state().halted = halted;
    }

    pub fn finished_statuses(&self, batch_id: u64) -> Option<Vec<u8>> {
        self.state().finished.get(&batch_id).cloned()
    }

    pub fn transfers(&self) -> Vec<EvmPayout> {
        self.state().transfers.clone()
    }

    pub fn refunds(&self) -> Vec<EvmPayout> {
        self.state().refunds.clone()
    }

    pub fn calls(&self) -> Vec<EvmCall> {
        self.state().calls.clone()
    }

    fn check_signatures(state: &EvmState, hash: &[u8; 32], signatures: &[Vec<u8>]) -> Result<()> {
        let mut signers = HashSet::new();
        for signature in signatures {
            let signer = recover_signer(hash, signature)?;
            if !state.relayers.contains(&signer) {
                return Err(eyre!("execution reverted: signer {} is not a relayer", signer));
            }
            if !signers.insert(signer) {
                return Err(eyre!("execution reverted: duplicate signer {}", signer));
            }
        }
        if (signers.len() as u64) < state.quorum {
            return Err(eyre!(
                "execution reverted: {} signatures below quorum {}",
                signers.len(),
                state.quorum
            ));
        }
        Ok(())
    }
}

pub struct MockEvmClient {
    chain: Arc<MockEvmChain>,
    caller: Address,
}

#[async_trait]
impl EvmChainClient for MockEvmClient {
    async fn get_next_pending_batch(&self) -> Result<Option<TransferBatch>> {
        let state = self.chain.state();
        Ok(state
            .pending
            .front()
            .and_then(|id| state.batches.get(id))
            .cloned())
    }

    async fn get_batch(&self, batch_id: u64) -> Result<Option<TransferBatch>> {
        Ok(self.chain.state().batches.get(&batch_id).cloned())
    }

    async fn was_batch_executed(&self, batch_id: u64) -> Result<bool> {
        Ok(self.chain.state().executed.contains_key(&batch_id))
    }

    async fn was_batch_finished(&self, batch_id: u64) -> Result<bool> {
        Ok(self.chain.state().finished.contains_key(&batch_id))
    }

    async fn get_statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>> {
        Ok(self
            .chain
            .state()
            .executed
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_relayers(&self) -> Result<Vec<Address>> {
        Ok(self.chain.state().relayers.clone())
    }

    async fn quorum(&self) -> Result<u64> {
        Ok(self.chain.state().quorum)
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.chain.state().paused)
    }

    async fn block_number(&self) -> Result<u64> {
        let mut state = self.chain.state();
        if !state.halted {
            state.block += 1;
        }
        Ok(state.block)
    }

    async fn total_balances(&self, token: Address) -> Result<U256> {
        Ok(self
            .chain
            .state()
            .tokens
            .get(&token)
            .map(|t| t.total_balance)
            .unwrap_or_default())
    }

    async fn is_token_whitelisted(&self, token: Address) -> Result<bool> {
        Ok(self
            .chain
            .state()
            .tokens
            .get(&token)
            .map_or(false, |t| t.whitelisted))
    }

    async fn is_mint_burn_token(&self, token: Address) -> Result<bool> {
        Ok(self
            .chain
            .state()
            .tokens
            .get(&token)
            .map_or(false, |t| t.mint_burn))
    }

    async fn is_native_token(&self, token: Address) -> Result<bool> {
        Ok(self
            .chain
            .state()
            .tokens
            .get(&token)
            .map_or(false, |t| t.native))
    }

    async fn execute_transfer(
        &self,
        tokens: Vec<Address>,
        recipients: Vec<Address>,
        amounts: Vec<U256>,
        batch_id: u64,
        signatures: Vec<Vec<u8>>,
    ) -> Result<String> {
        let mut state = self.chain.state();
        if state.paused {
            return Err(eyre!("execution reverted: paused"));
        }
        if state.executed.contains_key(&batch_id) {
            return Err(eyre!("execution reverted: batch already executed"));
        }
        let args = TransferArgs {
            tokens: tokens.clone(),
            recipients: recipients.clone(),
            amounts: amounts.clone(),
            batch_nonce: U256::from(batch_id),
        };
        MockEvmChain::check_signatures(&state, &transfer_message_hash(&args), &signatures)?;

        let accepted = state.accept_limit.unwrap_or(amounts.len()).min(amounts.len());
        let mut statuses = Vec::with_capacity(accepted);
        for i in 0..accepted {
            let amount = amounts[i].saturating_sub(U256::from(MOCK_FEE));
            if let Some(token) = state.tokens.get_mut(&tokens[i]) {
                if !token.mint_burn {
                    token.total_balance = token.total_balance.saturating_sub(amounts[i]);
                }
            }
            state.transfers.push(EvmPayout {
                token: tokens[i],
                recipient: recipients[i],
                amount,
            });
            statuses.push(DepositStatus::Executed.as_u8());
        }
        state.executed.insert(batch_id, statuses);
        state.calls.push(EvmCall {
            function: "executeTransfer",
            batch_id,
            caller: self.caller,
            signatures: signatures.len(),
        });
        Ok(format!("0x{:064x}", state.calls.len()))
    }

    async fn finish_current_pending_batch(
        &self,
        batch_id: u64,
        new_statuses: Vec<u8>,
        signatures: Vec<Vec<u8>>,
    ) -> Result<String> {
        let mut state = self.chain.state();
        if state.paused {
            return Err(eyre!("execution reverted: paused"));
        }
        MockEvmChain::check_signatures(
            &state,
            &set_status_message_hash(batch_id, &new_statuses),
            &signatures,
        )?;
        if state.pending.front() != Some(&batch_id) || state.finished.contains_key(&batch_id) {
            return Err(eyre!("execution reverted: batch {} is not pending", batch_id));
        }
        let batch = state
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| eyre!("execution reverted: unknown batch {}", batch_id))?;
        if new_statuses.len() != batch.deposits.len() {
            return Err(eyre!("execution reverted: invalid number of statuses"));
        }

        for (deposit, status) in batch.deposits.iter().zip(&new_statuses) {
            if *status == DepositStatus::Rejected.as_u8() {
                let refund = EvmPayout {
                    token: Address::from_slice(&deposit.token_bytes),
                    recipient: Address::from_slice(&deposit.from_bytes),
                    amount: deposit.amount.saturating_sub(U256::from(MOCK_FEE)),
                };
                state.refunds.push(refund);
            }
        }
        state.pending.pop_front();
        state.finished.insert(batch_id, new_statuses);
        state.calls.push(EvmCall {
            function: "finishCurrentPendingBatch",
            batch_id,
            caller: self.caller,
            signatures: signatures.len(),
        });
        Ok(format!("0x{:064x}", state.calls.len()))
    }

    async fn check_funds_for(&self, _gas_limit: u64) -> Result<()> {
        Ok(())
    }

    fn gas_limit_for(&self, num_deposits: usize) -> u64 {
        GAS_LIMIT_BASE + GAS_LIMIT_FOR_EACH * num_deposits as u64
    }
}
