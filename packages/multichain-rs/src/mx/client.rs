//! MultiversX bridge client
//!
//! Views are VM queries against the multisig (and the safe for token policy);
//! actions are signed transactions to the multisig sent through the shared
//! [`NonceTransactionsHandler`].

use alloy::primitives::U256;
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use super::data::{
    add_status_args, add_transfer_args, GasMap, TxDataBuilder, PERFORM_ACTION_FUNC,
    PROPOSE_SET_STATUS_FUNC, PROPOSE_TRANSFER_FUNC, SIGN_FUNC,
};
use super::proxy::{MxProxy, VmQueryRequest};
use super::query::{
    batch_from_response, bool_from_response, relayers_from_response, statuses_from_response,
    u256_from_response, u64_from_response,
};
use super::transaction::{MxKey, NetworkConfig, Transaction};
use crate::bounded_cache::{BoundedCache, DEFAULT_TOKEN_CACHE_SIZE, DEFAULT_TOKEN_CACHE_TTL};
use crate::nonce::{NonceTransactionsHandler, TransactionSubmitter};
use crate::redact::redact_url;
use crate::retry::RetryConfig;
use crate::types::TransferBatch;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MxClientError {
    #[error("multisig contract is paused")]
    Paused,
    #[error("relayer {0} is not whitelisted on the multisig")]
    NotWhitelisted(String),
    #[error("no token mapping for {0}")]
    UnknownToken(String),
}

#[derive(Clone)]
pub struct MxClientConfig {
    pub proxy_url: String,
    /// Bech32 multisig address
    pub multisig_address: String,
    /// Bech32 safe address
    pub safe_address: String,
    pub gas_map: GasMap,
    pub request_timeout: Duration,
}

impl fmt::Debug for MxClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MxClientConfig")
            .field("proxy_url", &redact_url(&self.proxy_url))
            .field("multisig_address", &self.multisig_address)
            .field("safe_address", &self.safe_address)
            .field("gas_map", &self.gas_map)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Signs and submits transactions for the nonce handler
pub struct MxSubmitter {
    proxy: Arc<MxProxy>,
    key: Arc<MxKey>,
    retry: RetryConfig,
}

impl MxSubmitter {
    pub fn new(proxy: Arc<MxProxy>, key: Arc<MxKey>, retry: RetryConfig) -> Self {
        Self { proxy, key, retry }
    }
}

#[async_trait]
impl TransactionSubmitter for MxSubmitter {
    type Tx = Transaction;

    async fn account_nonce(&self, address: &str) -> Result<u64> {
        self.proxy.account_nonce(address).await
    }

    async fn submit(&self, tx: &Transaction) -> Result<String> {
        self.proxy.send_transaction(tx).await
    }

    fn bump_gas_price(&self, original: &Transaction, attempt: u32) -> Result<Transaction> {
        let price = self
            .retry
            .gas_price_for_attempt(original.gas_price as u128, attempt);
        let mut bumped = original.clone();
        bumped.gas_price = u64::try_from(price).unwrap_or(u64::MAX);
        self.key.sign_transaction(&mut bumped)?;
        Ok(bumped)
    }
}

pub struct MxBridgeClient {
    config: MxClientConfig,
    proxy: Arc<MxProxy>,
    key: Arc<MxKey>,
    nonces: Arc<NonceTransactionsHandler<MxSubmitter>>,
    network: OnceCell<NetworkConfig>,
    erc20_by_token_id: Mutex<BoundedCache<Vec<u8>, Vec<u8>>>,
    token_id_by_erc20: Mutex<BoundedCache<Vec<u8>, Vec<u8>>>,
}

impl MxBridgeClient {
    pub fn new(
        config: MxClientConfig,
        proxy: Arc<MxProxy>,
        key: Arc<MxKey>,
        nonces: Arc<NonceTransactionsHandler<MxSubmitter>>,
    ) -> Result<Self> {
        if let Some(name) = config.gas_map.first_zero_entry() {
            return Err(eyre!("Invalid MultiversX gas value for {}", name));
        }

        info!(
            proxy = %redact_url(&config.proxy_url),
            relayer = %key.address(),
            multisig = %config.multisig_address,
            safe = %config.safe_address,
            "Created MultiversX bridge client"
        );

        Ok(Self {
            config,
            proxy,
            key,
            nonces,
            network: OnceCell::new(),
            erc20_by_token_id: Mutex::new(BoundedCache::new(
                DEFAULT_TOKEN_CACHE_SIZE,
                DEFAULT_TOKEN_CACHE_TTL,
            )),
            token_id_by_erc20: Mutex::new(BoundedCache::new(
                DEFAULT_TOKEN_CACHE_SIZE,
                DEFAULT_TOKEN_CACHE_TTL,
            )),
        })
    }

    pub fn relayer_public_key(&self) -> [u8; 32] {
        self.key.public_key()
    }

    pub fn relayer_address(&self) -> &str {
        self.key.address()
    }

    pub fn gas_map(&self) -> &GasMap {
        &self.config.gas_map
    }

    async fn query_contract(&self, contract: &str, builder: TxDataBuilder) -> Result<Vec<Vec<u8>>> {
        let request = VmQueryRequest {
            sc_address: contract.to_string(),
            func_name: builder.function().to_string(),
            caller: Some(self.key.address().to_string()),
            args: builder.args().to_vec(),
        };
        self.proxy.execute_query(&request).await
    }

    async fn query(&self, builder: TxDataBuilder) -> Result<Vec<Vec<u8>>> {
        self.query_contract(&self.config.multisig_address, builder).await
    }

    async fn query_safe(&self, builder: TxDataBuilder) -> Result<Vec<Vec<u8>>> {
        self.query_contract(&self.config.safe_address, builder).await
    }

    async fn query_bool(&self, builder: TxDataBuilder) -> Result<bool> {
        Ok(bool_from_response(&self.query(builder).await?))
    }

    async fn query_u64(&self, builder: TxDataBuilder) -> Result<u64> {
        Ok(u64_from_response(&self.query(builder).await?)?)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// The safe's current batch with destination tokens resolved; `None` when there is none
    pub async fn get_current_tx_batch(&self) -> Result<Option<TransferBatch>> {
        let response = self.query(TxDataBuilder::new("getCurrentTxBatch")).await?;
        let Some(mut batch) = batch_from_response(&response)? else {
            return Ok(None);
        };
        for deposit in &mut batch.deposits {
            deposit.converted_token_bytes = self
                .get_erc20_address_for_token_id(&deposit.token_bytes)
                .await?;
        }
        debug!(batch = %batch, "Fetched current MultiversX batch");
        Ok(Some(batch))
    }

    /// The current batch if its id is `batch_id`
    pub async fn get_batch(&self, batch_id: u64) -> Result<Option<TransferBatch>> {
        Ok(self
            .get_current_tx_batch()
            .await?
            .filter(|batch| batch.id == batch_id))
    }

    pub async fn was_transfer_action_proposed(&self, batch: &TransferBatch) -> Result<bool> {
        self.query_bool(add_transfer_args(
            TxDataBuilder::new("wasTransferActionProposed"),
            batch,
        ))
        .await
    }

    pub async fn get_action_id_for_transfer_batch(&self, batch: &TransferBatch) -> Result<u64> {
        self.query_u64(add_transfer_args(
            TxDataBuilder::new("getActionIdForTransferBatch"),
            batch,
        ))
        .await
    }

    pub async fn was_set_current_transaction_batch_status_action_proposed(
        &self,
        batch: &TransferBatch,
    ) -> Result<bool> {
        self.query_bool(add_status_args(
            TxDataBuilder::new("wasSetCurrentTransactionBatchStatusActionProposed"),
            batch,
        ))
        .await
    }

    pub async fn get_action_id_for_set_current_transaction_batch_status(
        &self,
        batch: &TransferBatch,
    ) -> Result<u64> {
        self.query_u64(add_status_args(
            TxDataBuilder::new("getActionIdForSetCurrentTransactionBatchStatus"),
            batch,
        ))
        .await
    }

    pub async fn was_action_executed(&self, action_id: u64) -> Result<bool> {
        self.query_bool(TxDataBuilder::new("wasActionExecuted").arg_u64(action_id))
            .await
    }

    pub async fn quorum_reached(&self, action_id: u64) -> Result<bool> {
        self.query_bool(TxDataBuilder::new("quorumReached").arg_u64(action_id))
            .await
    }

    pub async fn get_action_signer_count(&self, action_id: u64) -> Result<u64> {
        self.query_u64(TxDataBuilder::new("getActionSignerCount").arg_u64(action_id))
            .await
    }

    pub async fn get_quorum(&self) -> Result<u64> {
        self.query_u64(TxDataBuilder::new("getQuorum")).await
    }

    pub async fn get_statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>> {
        let response = self
            .query(TxDataBuilder::new("getStatusesAfterExecution").arg_u64(batch_id))
            .await?;
        Ok(statuses_from_response(batch_id, &response)?)
    }

    pub async fn get_all_staked_relayers(&self) -> Result<Vec<[u8; 32]>> {
        let response = self.query(TxDataBuilder::new("getAllStakedRelayers")).await?;
        Ok(relayers_from_response(&response)?)
    }

    pub async fn get_last_executed_eth_batch_id(&self) -> Result<u64> {
        self.query_u64(TxDataBuilder::new("getLastExecutedEthBatchId"))
            .await
    }

    pub async fn get_last_executed_eth_tx_id(&self) -> Result<u64> {
        self.query_u64(TxDataBuilder::new("getLastExecutedEthTxId"))
            .await
    }

    /// Whether `signer` signed `action_id`
    pub async fn signed(&self, signer: &[u8; 32], action_id: u64) -> Result<bool> {
        self.query_bool(
            TxDataBuilder::new("signed")
                .arg_bytes(signer)
                .arg_u64(action_id),
        )
        .await
    }

    pub async fn is_paused(&self) -> Result<bool> {
        self.query_bool(TxDataBuilder::new("isPaused")).await
    }

    /// ERC20 address mapped to a MultiversX token identifier
    pub async fn get_erc20_address_for_token_id(&self, token_id: &[u8]) -> Result<Vec<u8>> {
        let key = token_id.to_vec();
        if let Some(hit) = self.erc20_by_token_id.lock().await.get(&key) {
            return Ok(hit);
        }
        let response = self
            .query(TxDataBuilder::new("getErc20AddressForTokenId").arg_bytes(token_id))
            .await?;
        let erc20 = first_non_empty(response)
            .ok_or_else(|| MxClientError::UnknownToken(String::from_utf8_lossy(token_id).into_owned()))?;
        self.erc20_by_token_id.lock().await.insert(key, erc20.clone());
        Ok(erc20)
    }

    /// MultiversX token identifier mapped to an ERC20 address
    pub async fn get_token_id_for_erc20_address(&self, erc20: &[u8]) -> Result<Vec<u8>> {
        let key = erc20.to_vec();
        if let Some(hit) = self.token_id_by_erc20.lock().await.get(&key) {
            return Ok(hit);
        }
        let response = self
            .query(TxDataBuilder::new("getTokenIdForErc20Address").arg_bytes(erc20))
            .await?;
        let token_id = first_non_empty(response)
            .ok_or_else(|| MxClientError::UnknownToken(format!("0x{}", hex::encode(erc20))))?;
        self.token_id_by_erc20.lock().await.insert(key, token_id.clone());
        Ok(token_id)
    }

    pub async fn is_mint_burn_allowed(&self, token_id: &[u8]) -> Result<bool> {
        let response = self
            .query_safe(TxDataBuilder::new("isMintBurnAllowed").arg_bytes(token_id))
            .await?;
        Ok(bool_from_response(&response))
    }

    pub async fn is_native_token(&self, token_id: &[u8]) -> Result<bool> {
        let response = self
            .query_safe(TxDataBuilder::new("isNativeToken").arg_bytes(token_id))
            .await?;
        Ok(bool_from_response(&response))
    }

    pub async fn get_accumulated_burned_tokens(&self, token_id: &[u8]) -> Result<U256> {
        let response = self
            .query_safe(TxDataBuilder::new("getAccumulatedBurnedTokens").arg_bytes(token_id))
            .await?;
        Ok(u256_from_response(&response)?)
    }

    /// Latest metachain block nonce, used for availability checks
    pub async fn current_nonce(&self) -> Result<u64> {
        self.proxy.current_nonce().await
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    pub async fn propose_transfer(&self, batch: &TransferBatch) -> Result<String> {
        let builder = add_transfer_args(TxDataBuilder::new(PROPOSE_TRANSFER_FUNC), batch);
        let gas = self.config.gas_map.propose_transfer(batch);
        let hash = self.send(builder, gas).await?;
        info!(batch_id = batch.id, tx_hash = %hash, "Proposed transfer");
        Ok(hash)
    }

    pub async fn propose_set_status(&self, batch: &TransferBatch) -> Result<String> {
        let builder = add_status_args(TxDataBuilder::new(PROPOSE_SET_STATUS_FUNC), batch);
        let gas = self.config.gas_map.propose_status(batch);
        let hash = self.send(builder, gas).await?;
        info!(batch_id = batch.id, statuses = ?batch.statuses, tx_hash = %hash, "Proposed set status");
        Ok(hash)
    }

    pub async fn sign(&self, action_id: u64) -> Result<String> {
        let builder = TxDataBuilder::new(SIGN_FUNC).arg_u64(action_id);
        let hash = self.send(builder, self.config.gas_map.sign).await?;
        info!(action_id, tx_hash = %hash, "Signed action");
        Ok(hash)
    }

    pub async fn perform_action(&self, action_id: u64, batch: &TransferBatch) -> Result<String> {
        let builder = TxDataBuilder::new(PERFORM_ACTION_FUNC).arg_u64(action_id);
        let gas = self.config.gas_map.perform_action(batch);
        let hash = self.send(builder, gas).await?;
        info!(action_id, batch_id = batch.id, tx_hash = %hash, "Performed action");
        Ok(hash)
    }

    async fn check_can_send(&self) -> Result<()> {
        if self.is_paused().await? {
            return Err(MxClientError::Paused.into());
        }
        let me = self.key.public_key();
        if !self.get_all_staked_relayers().await?.contains(&me) {
            return Err(MxClientError::NotWhitelisted(self.key.address().to_string()).into());
        }
        Ok(())
    }

    async fn send(&self, builder: TxDataBuilder, gas_limit: u64) -> Result<String> {
        self.check_can_send().await?;

        let network = self
            .network
            .get_or_try_init(|| self.proxy.network_config())
            .await?
            .clone();
        let data = builder.to_data_string();
        let sender = self.key.address().to_string();
        let receiver = self.config.multisig_address.clone();
        let key = self.key.clone();

        self.nonces
            .send_transaction(&sender, |nonce| {
                let mut tx = Transaction::new_call(nonce, &sender, &receiver, &data, gas_limit, &network);
                key.sign_transaction(&mut tx)?;
                Ok(tx)
            })
            .await
    }
}

fn first_non_empty(response: Vec<Vec<u8>>) -> Option<Vec<u8>> {
    response.into_iter().next().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> NetworkConfig {
        NetworkConfig {
            chain_id: "D".to_string(),
            min_gas_price: 1_000_000_000,
            min_transaction_version: 1,
        }
    }

    #[test]
    fn test_bump_resigns_with_higher_price() {
        let key = Arc::new(MxKey::from_seed(&[4u8; 32]).unwrap());
        let proxy = Arc::new(MxProxy::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap());
        let submitter = MxSubmitter::new(proxy, key.clone(), RetryConfig::default());

        let mut tx = Transaction::new_call(3, key.address(), "erd1multisig", "sign@01", 8_000_000, &network());
        key.sign_transaction(&mut tx).unwrap();

        let bumped = submitter.bump_gas_price(&tx, 1).unwrap();
        assert_eq!(bumped.gas_price, 1_200_000_000);
        assert_eq!(bumped.nonce, 3);
        assert_ne!(bumped.signature, tx.signature);
    }

    #[test]
    fn test_first_non_empty() {
        assert_eq!(first_non_empty(vec![]), None);
        assert_eq!(first_non_empty(vec![vec![]]), None);
        assert_eq!(first_non_empty(vec![vec![1, 2]]), Some(vec![1, 2]));
    }

    #[test]
    fn test_zero_gas_entry_rejected() {
        let key = Arc::new(MxKey::from_seed(&[4u8; 32]).unwrap());
        let proxy = Arc::new(MxProxy::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap());
        let nonces = Arc::new(NonceTransactionsHandler::new(
            "MultiversX",
            Arc::new(MxSubmitter::new(proxy.clone(), key.clone(), RetryConfig::default())),
            Duration::from_secs(60),
            RetryConfig::default(),
        ));
        let config = MxClientConfig {
            proxy_url: "http://127.0.0.1:1".to_string(),
            multisig_address: "erd1multisig".to_string(),
            safe_address: "erd1safe".to_string(),
            gas_map: GasMap {
                sign: 0,
                ..GasMap::default()
            },
            request_timeout: Duration::from_secs(1),
        };
        assert!(MxBridgeClient::new(config, proxy, key, nonces).is_err());
    }
}
