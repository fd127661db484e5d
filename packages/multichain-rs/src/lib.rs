//! Multichain-RS: Shared Chain Library for the MultiversX <-> EVM Bridge Relayer
//!
//! This crate provides the chain-facing half of the relayer:
//!
//! - **Types** - Deposits, transfer batches, statuses, actions and directions
//! - **Hash Computation** - Keccak and the EVM multisig message hashes
//! - **Address Encoding/Decoding** - MultiversX bech32 and EVM hex addresses
//! - **SC Call Data** - Codec for smart-contract calls attached to deposits
//! - **Nonce Handling** - Per-sender nonce bookkeeping with background resends
//! - **EVM Module** - Bridge bindings, client, gas station and signer
//! - **MX Module** - Gateway client, VM query parsing, transactions and keys
//! - **Testing Module** - Deposit/batch builders and assertions
//!
//! ## Feature Flags
//!
//! - `evm` - Enable EVM chain support (default)
//! - `mx` - Enable MultiversX chain support (default)
//! - `testing` - Enable testing utilities
//! - `full` - Enable all features

// Core modules (always available)
pub mod address_codec;
pub mod bounded_cache;
pub mod hash;
pub mod nonce;
pub mod redact;
pub mod retry;
pub mod sc_call;
pub mod types;

// Chain-specific modules (feature-gated)
#[cfg(feature = "evm")]
pub mod evm;

#[cfg(feature = "mx")]
pub mod mx;

// Testing utilities (feature-gated)
#[cfg(feature = "testing")]
pub mod testing;

// Re-export commonly used items at the crate root
pub use address_codec::{
    decode_mx_address, display_mx_address, encode_evm_address, encode_mx_address,
    is_mx_smart_contract, parse_evm_address,
};
pub use hash::{
    bytes32_to_hex, keccak256, set_status_message_hash, to_eth_signed_message_hash,
    transfer_message_hash, TransferArgs,
};
pub use nonce::{NonceTransactionsHandler, TransactionSubmitter};
pub use retry::{classify_error, with_retry, ErrorClass, RetryConfig};
pub use sc_call::{display_sc_call_data, ScCallData, ScCallError};
pub use types::{
    Action, ActionKind, ChainKind, Deposit, DepositStatus, Direction, TransferBatch,
};
