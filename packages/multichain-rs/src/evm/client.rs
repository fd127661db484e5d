//! EVM bridge client
//!
//! Read side goes through a plain HTTP provider; writes are built as
//! [`TransactionRequest`]s with an explicit nonce and handed to the shared
//! [`NonceTransactionsHandler`], which signs them through a wallet provider.

use alloy::{
    network::{Ethereum, EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, B256, U256},
    providers::{
        fillers::{FillProvider, JoinFill, WalletFiller},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::types::{Filter, TransactionRequest},
    sol_types::{SolCall, SolEvent},
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::contracts::{Batch, Bridge, SCExecProxy, ERC20, ERC20Safe};
use super::gas_station::GasStation;
use super::signer::EvmCryptoHandler;
use crate::address_codec::{display_mx_address, encode_evm_address};
use crate::nonce::{NonceTransactionsHandler, TransactionSubmitter};
use crate::redact::redact_url;
use crate::retry::RetryConfig;
use crate::sc_call::display_sc_call_data;
use crate::types::{Deposit, TransferBatch};

#[allow(clippy::type_complexity)]
type WalletProvider = FillProvider<
    JoinFill<Identity, WalletFiller<EthereumWallet>>,
    RootProvider<Http<Client>>,
    Http<Client>,
    Ethereum,
>;

/// EVM client configuration
#[derive(Debug, Clone)]
pub struct EvmClientConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub bridge_address: Address,
    pub safe_address: Address,
    /// Source of smart-contract call data for deposits; `None` disables the lookup
    pub sc_exec_proxy_address: Option<Address>,
    pub gas_limit_base: u64,
    pub gas_limit_for_each: u64,
    /// Log window for SC metadata, relative to the batch's last updated block
    pub events_block_range_from: i64,
    pub events_block_range_to: i64,
}

impl EvmClientConfig {
    pub fn gas_limit_for(&self, num_deposits: usize) -> u64 {
        self.gas_limit_base + self.gas_limit_for_each * num_deposits as u64
    }
}

/// Signs and submits transactions for the nonce handler
pub struct EvmSubmitter {
    provider: WalletProvider,
    retry: RetryConfig,
}

impl EvmSubmitter {
    pub fn new(rpc_url: &str, wallet: EthereumWallet, retry: RetryConfig) -> Result<Self> {
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_http(rpc_url.parse().wrap_err("Invalid RPC URL")?);
        Ok(Self { provider, retry })
    }
}

#[async_trait]
impl TransactionSubmitter for EvmSubmitter {
    type Tx = TransactionRequest;

    async fn account_nonce(&self, address: &str) -> Result<u64> {
        let address: Address = address
            .parse()
            .map_err(|e| eyre!("Invalid EVM address {}: {}", address, e))?;
        Ok(self.provider.get_transaction_count(address).await?)
    }

    async fn submit(&self, tx: &TransactionRequest) -> Result<String> {
        let pending = self
            .provider
            .send_transaction(tx.clone())
            .await
            .map_err(|e| eyre!("Failed to send transaction: {}", e))?;
        Ok(format!("{}", pending.tx_hash()))
    }

    fn bump_gas_price(&self, original: &TransactionRequest, attempt: u32) -> Result<TransactionRequest> {
        let base = original
            .gas_price
            .ok_or_else(|| eyre!("Transaction has no gas price to bump"))?;
        let mut bumped = original.clone();
        bumped.set_gas_price(self.retry.gas_price_for_attempt(base, attempt));
        Ok(bumped)
    }
}

/// High-level client for the EVM side of the bridge
pub struct EvmBridgeClient {
    config: EvmClientConfig,
    provider: RootProvider<Http<Client>>,
    crypto: Arc<EvmCryptoHandler>,
    nonces: Arc<NonceTransactionsHandler<EvmSubmitter>>,
    gas_station: Option<Arc<GasStation>>,
}

impl EvmBridgeClient {
    pub fn new(
        config: EvmClientConfig,
        crypto: Arc<EvmCryptoHandler>,
        nonces: Arc<NonceTransactionsHandler<EvmSubmitter>>,
        gas_station: Option<Arc<GasStation>>,
    ) -> Result<Self> {
        let provider = ProviderBuilder::new().on_http(
            config
                .rpc_url
                .parse()
                .map_err(|e| eyre!("Invalid RPC URL: {}", e))?,
        );

        info!(
            rpc_url = %redact_url(&config.rpc_url),
            chain_id = config.chain_id,
            bridge = %config.bridge_address,
            relayer = %crypto.address(),
            "Created EVM bridge client"
        );

        Ok(Self {
            config,
            provider,
            crypto,
            nonces,
            gas_station,
        })
    }

    pub fn config(&self) -> &EvmClientConfig {
        &self.config
    }

    pub fn relayer_address(&self) -> Address {
        self.crypto.address()
    }

    pub fn crypto(&self) -> &Arc<EvmCryptoHandler> {
        &self.crypto
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// The bridge's next pending batch with SC call data attached; `None` if there is none
    pub async fn get_next_pending_batch(&self) -> Result<Option<TransferBatch>> {
        let bridge = Bridge::new(self.config.bridge_address, &self.provider);
        let batch = bridge.getNextPendingBatch().call().await?._0;
        self.complete_batch(batch).await
    }

    /// Re-fetch a batch by id; `None` if the bridge reports no such batch
    pub async fn get_batch(&self, batch_id: u64) -> Result<Option<TransferBatch>> {
        let bridge = Bridge::new(self.config.bridge_address, &self.provider);
        let batch = bridge.getBatch(U256::from(batch_id)).call().await?._0;
        self.complete_batch(batch).await
    }

    async fn complete_batch(&self, batch: Batch) -> Result<Option<TransferBatch>> {
        if batch.nonce.is_zero() {
            return Ok(None);
        }
        let last_updated_block = u256_to_u64(batch.lastUpdatedBlockNumber, "lastUpdatedBlockNumber")?;
        let mut transfer = batch_from_contract(&batch)?;
        self.add_sc_metadata(&mut transfer, last_updated_block).await?;
        Ok(Some(transfer))
    }

    async fn add_sc_metadata(&self, batch: &mut TransferBatch, last_updated_block: u64) -> Result<()> {
        let Some(proxy) = self.config.sc_exec_proxy_address else {
            return Ok(());
        };

        let from_block = offset_block(last_updated_block, self.config.events_block_range_from);
        let to_block = offset_block(last_updated_block, self.config.events_block_range_to);
        let filter = Filter::new()
            .address(proxy)
            .event_signature(SCExecProxy::ERC20SCDeposit::SIGNATURE_HASH)
            .topic1(B256::from(U256::from(batch.id).to_be_bytes::<32>()))
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.provider.get_logs(&filter).await?;
        let mut call_data: HashMap<u64, Vec<u8>> = HashMap::new();
        for log in logs {
            match SCExecProxy::ERC20SCDeposit::decode_log_data(log.data(), true) {
                Ok(event) if event.batchNonce == batch.id => {
                    let nonce = u256_to_u64(event.depositNonce, "depositNonce")?;
                    call_data.insert(nonce, event.callData.into_bytes());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to decode ERC20SCDeposit log"),
            }
        }

        for deposit in &mut batch.deposits {
            if let Some(data) = call_data.remove(&deposit.nonce) {
                match display_sc_call_data(&data) {
                    Ok(shown) => debug!(deposit_nonce = deposit.nonce, call = %shown, "Attached SC call data"),
                    Err(e) => warn!(deposit_nonce = deposit.nonce, error = %e, "Undecodable SC call data"),
                }
                deposit.sc_call_data = Some(data);
            }
        }
        Ok(())
    }

    pub async fn was_batch_executed(&self, batch_id: u64) -> Result<bool> {
        let bridge = Bridge::new(self.config.bridge_address, &self.provider);
        Ok(bridge.wasBatchExecuted(U256::from(batch_id)).call().await?._0)
    }

    pub async fn was_batch_finished(&self, batch_id: u64) -> Result<bool> {
        let bridge = Bridge::new(self.config.bridge_address, &self.provider);
        Ok(bridge.wasBatchFinished(U256::from(batch_id)).call().await?._0)
    }

    pub async fn get_statuses_after_execution(&self, batch_id: u64) -> Result<Vec<u8>> {
        let bridge = Bridge::new(self.config.bridge_address, &self.provider);
        Ok(bridge
            .getStatusesAfterExecution(U256::from(batch_id))
            .call()
            .await?
            ._0)
    }

    pub async fn get_relayers(&self) -> Result<Vec<Address>> {
        let bridge = Bridge::new(self.config.bridge_address, &self.provider);
        Ok(bridge.getRelayers().call().await?._0)
    }

    pub async fn quorum(&self) -> Result<u64> {
        let bridge = Bridge::new(self.config.bridge_address, &self.provider);
        u256_to_u64(bridge.quorum().call().await?._0, "quorum")
    }

    pub async fn is_paused(&self) -> Result<bool> {
        let bridge = Bridge::new(self.config.bridge_address, &self.provider);
        Ok(bridge.paused().call().await?._0)
    }

    pub async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chain_id().await?)
    }

    pub async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    pub async fn nonce_at(&self, address: Address) -> Result<u64> {
        Ok(self.provider.get_transaction_count(address).await?)
    }

    pub async fn native_balance(&self, address: Address) -> Result<U256> {
        Ok(self.provider.get_balance(address).await?)
    }

    pub async fn erc20_balance_of(&self, token: Address, owner: Address) -> Result<U256> {
        let erc20 = ERC20::new(token, &self.provider);
        Ok(erc20.balanceOf(owner).call().await?._0)
    }

    /// Balance held by the safe for a lock/unlock token
    pub async fn total_balances(&self, token: Address) -> Result<U256> {
        self.erc20_balance_of(token, self.config.safe_address).await
    }

    pub async fn is_token_whitelisted(&self, token: Address) -> Result<bool> {
        let safe = ERC20Safe::new(self.config.safe_address, &self.provider);
        Ok(safe.isTokenWhitelisted(token).call().await?._0)
    }

    pub async fn is_mint_burn_token(&self, token: Address) -> Result<bool> {
        let safe = ERC20Safe::new(self.config.safe_address, &self.provider);
        Ok(safe.mintBurnTokens(token).call().await?._0)
    }

    pub async fn is_native_token(&self, token: Address) -> Result<bool> {
        let safe = ERC20Safe::new(self.config.safe_address, &self.provider);
        Ok(safe.nativeTokens(token).call().await?._0)
    }

    /// Gas station price when configured, node price otherwise
    pub async fn gas_price(&self) -> Result<u128> {
        match &self.gas_station {
            Some(station) => station.current_gas_price().await,
            None => Ok(self.provider.get_gas_price().await?),
        }
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Submit `executeTransfer`; `signatures` must already be sorted and sized to quorum
    pub async fn execute_transfer(
        &self,
        tokens: Vec<Address>,
        recipients: Vec<Address>,
        amounts: Vec<U256>,
        batch_id: u64,
        signatures: Vec<Vec<u8>>,
    ) -> Result<String> {
        let num_deposits = amounts.len();
        let call = Bridge::executeTransferCall {
            tokens,
            recipients,
            amounts,
            batchNonce: U256::from(batch_id),
            signatures: signatures.into_iter().map(Bytes::from).collect(),
        };
        let hash = self
            .send(call.abi_encode(), self.config.gas_limit_for(num_deposits))
            .await?;
        info!(batch_id, tx_hash = %hash, "Sent executeTransfer");
        Ok(hash)
    }

    /// Submit `finishCurrentPendingBatch`
    pub async fn finish_current_pending_batch(
        &self,
        batch_id: u64,
        new_statuses: Vec<u8>,
        signatures: Vec<Vec<u8>>,
    ) -> Result<String> {
        let num_deposits = new_statuses.len();
        let call = Bridge::finishCurrentPendingBatchCall {
            batchNonce: U256::from(batch_id),
            newDepositStatuses: new_statuses,
            signatures: signatures.into_iter().map(Bytes::from).collect(),
        };
        let hash = self
            .send(call.abi_encode(), self.config.gas_limit_for(num_deposits))
            .await?;
        info!(batch_id, tx_hash = %hash, "Sent finishCurrentPendingBatch");
        Ok(hash)
    }

    /// Ensure the relayer can pay for a transaction with `gas_limit`
    pub async fn check_funds_for(&self, gas_limit: u64) -> Result<()> {
        let gas_price = self.gas_price().await?;
        let required = U256::from(gas_price) * U256::from(gas_limit);
        let available = self.native_balance(self.relayer_address()).await?;
        if available < required {
            return Err(eyre!(
                "Insufficient balance for fees: have {}, need {}",
                available,
                required
            ));
        }
        Ok(())
    }

    async fn send(&self, input: Vec<u8>, gas_limit: u64) -> Result<String> {
        let gas_price = self.gas_price().await?;
        let from = self.relayer_address();
        let to = self.config.bridge_address;
        let chain_id = self.config.chain_id;
        let input = Bytes::from(input);

        self.nonces
            .send_transaction(&from.to_string(), |nonce| {
                Ok(TransactionRequest::default()
                    .with_from(from)
                    .with_to(to)
                    .with_input(input.clone())
                    .with_nonce(nonce)
                    .with_gas_limit(gas_limit)
                    .with_gas_price(gas_price)
                    .with_chain_id(chain_id))
            })
            .await
    }
}

/// Convert the contract's batch into the shared model
pub fn batch_from_contract(batch: &Batch) -> Result<TransferBatch> {
    let id = u256_to_u64(batch.nonce, "batch nonce")?;
    let deposits = batch
        .deposits
        .iter()
        .map(|d| {
            Ok(Deposit {
                nonce: u256_to_u64(d.nonce, "deposit nonce")?,
                from_bytes: d.depositor.to_vec(),
                display_from: encode_evm_address(d.depositor.as_slice()),
                to_bytes: d.recipient.to_vec(),
                display_to: display_mx_address(d.recipient.as_slice()),
                token_bytes: d.tokenAddress.to_vec(),
                display_token: encode_evm_address(d.tokenAddress.as_slice()),
                converted_token_bytes: Vec::new(),
                amount: d.amount,
                sc_call_data: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TransferBatch::new(id, deposits))
}

fn u256_to_u64(value: U256, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("{} does not fit in u64: {}", what, value))
}

fn offset_block(base: u64, offset: i64) -> u64 {
    if offset < 0 {
        base.saturating_sub(offset.unsigned_abs())
    } else {
        base.saturating_add(offset as u64)
    }
}
