//! In-memory MultiversX multisig and safe
//!
//! Proposals are keyed by the batch fingerprint, action ids are assigned from 1,
//! and only staked relayers may propose, sign or perform.
//!
//! Two knobs model a live gateway: sign transactions can stay pending for a
//! number of `signed` queries, and views can fail with a transient error.

use alloy::primitives::U256;
use async_trait::async_trait;
use eyre::{eyre, Result};
use multichain_rs::mx::{MxClientError, QueryError};
use multichain_rs::{
    display_mx_address, ActionKind, DepositStatus, ScCallData, TransferBatch,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::MOCK_FEE;
use crate::chain::MxChainClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxToken {
    pub native: bool,
    pub mint_burn: bool,
    pub accumulated_burned: U256,
}

impl MxToken {
    /// Wrapped representation minted by the bridge
    pub fn mint_burn(accumulated_burned: U256) -> Self {
        Self {
            native: false,
            mint_burn: true,
            accumulated_burned,
        }
    }

    /// Native token bridged out by burning
    pub fn native_mint_burn(accumulated_burned: U256) -> Self {
        Self {
            native: true,
            mint_burn: true,
            accumulated_burned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsdtTransfer {
    pub token: Vec<u8>,
    pub recipient: String,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxCall {
    pub function: &'static str,
    pub action_id: u64,
    pub caller: [u8; 32],
}

#[derive(Debug, Clone)]
struct MxAction {
    kind: ActionKind,
    batch: TransferBatch,
    signers: BTreeSet<[u8; 32]>,
    executed: bool,
}

#[derive(Debug, Default)]
struct MxState {
    relayers: Vec<[u8; 32]>,
    quorum: u64,
    paused: bool,
    halted: bool,
    nonce: u64,
    actions: BTreeMap<u64, MxAction>,
    by_fingerprint: HashMap<[u8; 32], u64>,
    last_executed_eth_batch_id: u64,
    last_executed_eth_tx_id: u64,
    statuses_after: HashMap<u64, Vec<u8>>,
    sc_endpoints: HashSet<String>,
    transfers: Vec<EsdtTransfer>,
    pending: VecDeque<TransferBatch>,
    finished: HashMap<u64, Vec<u8>>,
    refunds: Vec<EsdtTransfer>,
    tokens: HashMap<Vec<u8>, MxToken>,
    erc20_to_token: HashMap<Vec<u8>, Vec<u8>>,
    calls: Vec<MxCall>,
    /// `signed` queries a sign transaction stays pending for
    sign_delay: u64,
    /// `(action id, signer, queries left)`
    pending_signs: Vec<(u64, [u8; 32], u64)>,
    failing_views: u32,
}

#[derive(Debug, Default)]
pub struct MockMxChain {
    state: Mutex<MxState>,
}

impl MockMxChain {
    pub fn new(relayers: Vec<[u8; 32]>, quorum: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MxState {
                relayers,
                quorum,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, MxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Client acting as the relayer with `public_key`
    pub fn client(self: &Arc<Self>, public_key: [u8; 32]) -> Arc<MockMxClient> {
        Arc::new(MockMxClient {
            chain: self.clone(),
            public_key,
        })
    }

    pub fn add_token(&self, token_id: &[u8], erc20: Vec<u8>, config: MxToken) {
        let mut state = self.state();
        state.tokens.insert(token_id.to_vec(), config);
        state.erc20_to_token.insert(erc20, token_id.to_vec());
    }

    /// Endpoints that succeed when called on a smart-contract recipient
    pub fn add_sc_endpoint(&self, endpoint: &str) {
        self.state().sc_endpoints.insert(endpoint.to_string());
    }

    /// Queue an outgoing batch on the safe
    pub fn add_pending_batch(&self, batch: TransferBatch) {
        self.state().pending.push_back(batch);
    }

    pub fn set_last_executed_eth_tx_id(&self, id: u64) {
        self.state().last_executed_eth_tx_id = id;
    }

    pub fn set_paused(&self, paused: bool) {
        self.state().paused = paused;
    }

    /// Stop producing blocks
    pub fn set_halted(&self, halted: bool) {
        self.state().halted = halted;
    }

    /// Keep each sign transaction out of the multisig for `queries` `signed` views
    pub fn set_sign_delay(&self, queries: u64) {
        self.state().sign_delay = queries;
    }

    /// Fail the next `count` views with a gateway timeout
    pub fn fail_views(&self, count: u32) {
        self.state().failing_views = count;
    }

    /// Sign calls submitted by any relayer for `action_id`
    pub fn sign_calls(&self, action_id: u64) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.function == "sign" && c.action_id == action_id)
            .count()
    }

    pub fn transfers(&self) -> Vec<EsdtTransfer> {
        self.state().transfers.clone()
    }

    pub fn refunds(&self) -> Vec<EsdtTransfer> {
        self.state().refunds.clone()
    }

    pub fn finished_statuses(&self, batch_id: u64) -> Option<Vec<u8>> {
        self.state().finished.get(&batch_id).cloned()
    }

    pub fn statuses_after_execution(&self, batch_id: u64) -> Option<Vec<u8>> {
        self.state().statuses_after.get(&batch_id).cloned()
    }

    pub fn calls(&self) -> Vec<MxCall> {
        self.state().calls.clone()
    }

    /// Number of proposals registered for `(batch_id, kind)`
    pub fn proposals(&self, batch_id: u64, kind: ActionKind) -> usize {
        self.state()
            .actions
            .values()
            .filter(|a| a.batch.id == batch_id && a.kind == kind)
            .count()
    }

    fn execute_transfer(state: &mut MxState, batch: &TransferBatch) -> Vec<u8> {
        let mut statuses = Vec::with_capacity(batch.deposits.len());
        for deposit in &batch.deposits {
            let accepted = match deposit.sc_call_data.as_deref() {
                Some(data) => match ScCallData::decode(data) {
                    Ok(Some(call)) => state.sc_endpoints.contains(&call.endpoint),
                    Ok(None) => true,
                    Err(_) => false,
                },
                None => true,
            };
            if accepted {
                state.transfers.push(EsdtTransfer {
                    token: deposit.converted_token_bytes.clone(),
                    recipient: display_mx_address(&deposit.to_bytes),
                    amount: deposit.amount.saturating_sub(U256::from(MOCK_FEE)),
                });
                statuses.push(DepositStatus::Executed.as_u8());
            } else {
                statuses.push(DepositStatus::Rejected.as_u8());
            }
        }
        state.last_executed_eth_batch_id = batch.id;
        if let Some(last) = batch.deposits.last() {
            state.last_executed_eth_tx_id = last.nonce;
        }
        state.statuses_after.insert(batch.id, statuses.clone());
        statuses
    }

    fn set_status(state: &mut MxState, batch: &TransferBatch) -> Result<()> {
        let current = state
            .pending
            .front()
            .cloned()
            .ok_or_else(|| eyre!("execution failed: no current batch"))?;
        if current.id != batch.id {
            return Err(eyre!("execution failed: batch {} is not current", batch.id));
        }
        if batch.statuses.len() != current.deposits.len() {
            return Err(eyre!("execution failed: invalid number of statuses"));
        }
        for (deposit, status) in current.deposits.iter().zip(&batch.statuses) {
            if *status == DepositStatus::Rejected.as_u8() {
                state.refunds.push(EsdtTransfer {
                    token: deposit.token_bytes.clone(),
                    recipient: display_mx_address(&deposit.from_bytes),
                    amount: deposit.amount.saturating_sub(U256::from(MOCK_FEE)),
                });
            }
        }
        state.pending.pop_front();
        state.finished.insert(batch.id, batch.statuses.clone());
        Ok(())
    }
}

pub struct MockMxClient {
    chain: Arc<MockMxChain>,
    public_key: [u8; 32],
}

impl MockMxClient {
    fn ensure_relayer(&self, state: &MxState) -> Result<()> {
        if state.paused {
            return Err(MxClientError::Paused.into());
        }
        if !state.relayers.contains(&self.public_key) {
            return Err(MxClientError::NotWhitelisted(display_mx_address(&self.public_key)).into());
        }
        Ok(())
    }

    fn propose(&self, batch: &TransferBatch, kind: ActionKind, function: &'static str) -> Result<String> {
        let mut state = self.chain.state();
        self.ensure_relayer(&state)?;
        let fingerprint = batch.fingerprint(kind);
        if state.by_fingerprint.contains_key(&fingerprint) {
            return Err(eyre!("execution failed: action already proposed"));
        }
        let action_id = state.actions.len() as u64 + 1;
        state.actions.insert(
            action_id,
            MxAction {
                kind,
                batch: batch.clone(),
                signers: BTreeSet::new(),
                executed: false,
            },
        );
        state.by_fingerprint.insert(fingerprint, action_id);
        state.calls.push(MxCall {
            function,
            action_id,
            caller: self.public_key,
        });
        Ok(format!("{:064x}", state.calls.len()))
    }

    fn action_id_for(&self, batch: &TransferBatch, kind: ActionKind) -> u64 {
        self.chain
            .state()
            .by_fingerprint
            .get(&batch.fingerprint(kind))
            .copied()
            .unwrap_or(0)
    }

    fn check_view(&self) -> Result<()> {
        let mut state = self.chain.state();
        if state.failing_views > 0 {
            state.failing_views -= 1;
            return Err(eyre!("gateway request failed: connection timeout"));
        }
        Ok(())
    }

    /// One `signed` query elapses for every pending sign transaction
    fn mine_pending_signs(state: &mut MxState) {
        let mut mined = Vec::new();
        state.pending_signs.retain_mut(|(action_id, signer, left)| {
            *left = left.saturating_sub(1);
            if *left == 0 {
                mined.push((*action_id, *signer));
                false
            } else {
                true
            }
        });
        for (action_id, signer) in mined {
            if let Some(action) = state.actions.get_mut(&action_id) {
                action.signers.insert(signer);
            }
        }
    }

    fn with_action<T>(&self, action_id: u64, f: impl FnOnce(&MxAction) -> T) -> Result<T> {
        self.chain
            .state()
            .actions
            .get(&action_id)
            .map(f)
            .ok_or_else(|| eyre!("action {} does not exist", action_id))
    }
}

#[async_trait]
impl MxChainClient for MockMxClient {
    fn relayer_public_key(&self) -> [u8; 32] {
        self.public_key
    }

    async fn get_current_tx_batch(&self) -> Result<Option<TransferBatch>> {
        self.check_view()?;
        Ok(self.chain.state().pending.front().cloned())
    }

    async fn was_transfer_action_proposed(&self, batch: &TransferBatch) -> Result<bool> {
        Ok(self.action_id_for(batch, ActionKind::Transfer) != 0)
    }

    async fn get_action_id_for_transfer_batch(&self, batch: &TransferBatch) -> Result<u64> {
        Ok(self.action_id_for(batch, ActionKind::Transfer))
    }

    async fn was_set_current_transaction_batch_status_action_proposed(
        &self,
        batch: &TransferBatch,
    ) -> Result<bool> {
        Ok(self.action_id_for(batch, ActionKind::SetStatus) != 0)
    }

    async fn get_action_id_for_set_current_transaction_batch_status(
        &self,
        batch: &TransferBatch,
    ) -> Result<u64> {
        Ok(self.action_id_for(batch, ActionKind::SetStatus))
    }

    async fn was_action_executed(&self, action_id: u64) -> Result<bool> {
        Ok(self
            .chain
            .state()
            .actions
            .get(&action_id)
            .map_or(false, |a| a.executed))
    }

    async fn quorum_reached(&self, action_id: u64) -> Result<bool> {
        self.check_view()?;
        let quorum = self.chain.state().quorum;
        self.with_action(action_id, |a| a.signers.len() as u64 >= quorum)
    }

    async fn get_action_signer_count(&self, action_id: u64) -> Result<u64> {
        self.with_action(action_id, |a| a.signers.len() as u64)
    }

    async fn get_quorum(&self) -> Result<u64> {
        Ok(self.chain.state().quorum)
    }

    async fn get_statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>> {
        self.chain
            .state()
            .statuses_after
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| QueryError::BatchNotFinished(batch_id).into())
    }

    async fn get_all_staked_relayers(&self) -> Result<Vec<[u8; 32]>> {
        Ok(self.chain.state().relayers.clone())
    }

    async fn get_last_executed_eth_batch_id(&self) -> Result<u64> {
        Ok(self.chain.state().last_executed_eth_batch_id)
    }

    async fn get_last_executed_eth_tx_id(&self) -> Result<u64> {
        Ok(self.chain.state().last_executed_eth_tx_id)
    }

    async fn signed(&self, signer: &[u8; 32], action_id: u64) -> Result<bool> {
        self.check_view()?;
        let mut state = self.chain.state();
        MockMxClient::mine_pending_signs(&mut state);
        Ok(state
            .actions
            .get(&action_id)
            .map_or(false, |a| a.signers.contains(signer)))
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.chain.state().paused)
    }

    async fn get_token_id_for_erc20_address(&self, erc20: &[u8]) -> Result<Vec<u8>> {
        self.chain
            .state()
            .erc20_to_token
            .get(erc20)
            .cloned()
            .ok_or_else(|| MxClientError::UnknownToken(hex::encode(erc20)).into())
    }

    async fn is_mint_burn_allowed(&self, token_id: &[u8]) -> Result<bool> {
        Ok(self
            .chain
            .state()
            .tokens
            .get(token_id)
            .map_or(false, |t| t.mint_burn))
    }

    async fn is_native_token(&self, token_id: &[u8]) -> Result<bool> {
        Ok(self
            .chain
            .state()
            .tokens
            .get(token_id)
            .map_or(false, |t| t.native))
    }

    async fn get_accumulated_burned_tokens(&self, token_id: &[u8]) -> Result<U256> {
        Ok(self
            .chain
            .state()
            .tokens
            .get(token_id)
            .map(|t| t.accumulated_burned)
            .unwrap_or_default())
    }

    async fn current_nonce(&self) -> Result<u64> {
        let mut state = self.chain.state();
        if !state.halted {
            state.nonce += 1;
        }
        Ok(state.nonce)
    }

    async fn propose_transfer(&self, batch: &TransferBatch) -> Result<String> {
        self.propose(batch, ActionKind::Transfer, "proposeMultiTransferEsdtBatch")
    }

    async fn propose_set_status(&self, batch: &TransferBatch) -> Result<String> {
        self.propose(
            batch,
            ActionKind::SetStatus,
            "proposeEsdtSafeSetCurrentTransactionBatchStatus",
        )
    }

    async fn sign(&self, action_id: u64) -> Result<String> {
        let mut state = self.chain.state();
        self.ensure_relayer(&state)?;
        let delay = state.sign_delay;
        let action = state
            .actions
            .get_mut(&action_id)
            .ok_or_else(|| eyre!("execution failed: action {} does not exist", action_id))?;
        if delay == 0 {
            action.signers.insert(self.public_key);
        } else {
            state.pending_signs.push((action_id, self.public_key, delay));
        }
        state.calls.push(MxCall {
            function: "sign",
            action_id,
            caller: self.public_key,
        });
        Ok(format!("{:064x}", state.calls.len()))
    }

    async fn perform_action(&self, action_id: u64, _batch: &TransferBatch) -> Result<String> {
        let mut state = self.chain.state();
        self.ensure_relayer(&state)?;
        let quorum = state.quorum;
        let action = state
            .actions
            .get(&action_id)
            .cloned()
            .ok_or_else(|| eyre!("execution failed: action {} does not exist", action_id))?;
        if action.executed {
            return Err(eyre!("execution failed: action {} already executed", action_id));
        }
        if (action.signers.len() as u64) < quorum {
            return Err(eyre!("execution failed: quorum not reached"));
        }

        match action.kind {
            ActionKind::Transfer => {
                MockMxChain::execute_transfer(&mut state, &action.batch);
            }
            ActionKind::SetStatus => MockMxChain::set_status(&mut state, &action.batch)?,
        }
        if let Some(stored) = state.actions.get_mut(&action_id) {
            stored.executed = true;
        }
        state.calls.push(MxCall {
            function: "performAction",
            action_id,
            caller: self.public_key,
        });
        Ok(format!("{:064x}", state.calls.len()))
    }
}
