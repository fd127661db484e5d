//! Hash computation matching the bridge contracts
//!
//! The EVM bridge verifies relayer signatures over an EIP-191 prefixed hash of the
//! ABI-encoded action arguments. Both actions are covered here:
//!
//! ```solidity
//! keccak256(abi.encode(recipients, tokens, amounts, batchNonce, "ExecuteBatchedTransfer"))
//! keccak256(abi.encode(batchNonce, newDepositStatuses, "CurrentPendingBatchSetStatus"))
//! ```

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolValue;
use eyre::{eyre, Result};
use tiny_keccak::{Hasher, Keccak};

use crate::types::TransferBatch;

pub const EXECUTE_TRANSFER_ACTION: &str = "ExecuteBatchedTransfer";
pub const SET_STATUS_ACTION: &str = "CurrentPendingBatchSetStatus";

const ETH_SIGNED_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Apply the `personal_sign` prefix to a 32-byte hash
pub fn to_eth_signed_message_hash(hash: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(ETH_SIGNED_MESSAGE_PREFIX.len() + 32);
    data.extend_from_slice(ETH_SIGNED_MESSAGE_PREFIX);
    data.extend_from_slice(hash);
    keccak256(&data)
}

/// Arguments of `executeTransfer` derived from a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferArgs {
    pub tokens: Vec<Address>,
    pub recipients: Vec<Address>,
    pub amounts: Vec<U256>,
    pub batch_nonce: U256,
}

impl TransferArgs {
    pub fn from_batch(batch: &TransferBatch) -> Result<Self> {
        let mut tokens = Vec::with_capacity(batch.deposits.len());
        let mut recipients = Vec::with_capacity(batch.deposits.len());
        let mut amounts = Vec::with_capacity(batch.deposits.len());

        for deposit in &batch.deposits {
            tokens.push(address_from_slice(&deposit.converted_token_bytes).map_err(|e| {
                eyre!("Deposit {} has invalid destination token: {}", deposit.nonce, e)
            })?);
            recipients.push(address_from_slice(&deposit.to_bytes).map_err(|e| {
                eyre!("Deposit {} has invalid recipient: {}", deposit.nonce, e)
            })?);
            amounts.push(deposit.amount);
        }

        Ok(Self {
            tokens,
            recipients,
            amounts,
            batch_nonce: U256::from(batch.id),
        })
    }
}

/// Prefixed hash the relayers sign to authorize `executeTransfer`
pub fn transfer_message_hash(args: &TransferArgs) -> [u8; 32] {
    let encoded = (
        args.recipients.clone(),
        args.tokens.clone(),
        args.amounts.clone(),
        args.batch_nonce,
        EXECUTE_TRANSFER_ACTION.to_string(),
    )
        .abi_encode_params();
    to_eth_signed_message_hash(&keccak256(&encoded))
}

/// Prefixed hash the relayers sign to authorize `finishCurrentPendingBatch`
pub fn set_status_message_hash(batch_id: u64, statuses: &[u8]) -> [u8; 32] {
    let encoded = (
        U256::from(batch_id),
        statuses.to_vec(),
        SET_STATUS_ACTION.to_string(),
    )
        .abi_encode_params();
    to_eth_signed_message_hash(&keccak256(&encoded))
}

fn address_from_slice(bytes: &[u8]) -> Result<Address> {
    match bytes.len() {
        20 => Ok(Address::from_slice(bytes)),
        32 if bytes[..12].iter().all(|b| *b == 0) => Ok(Address::from_slice(&bytes[12..])),
        len => Err(eyre!("expected a 20 byte address, got {} bytes", len)),
    }
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}
