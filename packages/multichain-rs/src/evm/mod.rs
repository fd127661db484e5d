//! EVM Chain Support Module
//!
//! ## Submodules
//!
//! - `client` - bridge views and the two multisig actions
//! - `contracts` - Bridge, safe, SC proxy and ERC20 bindings using alloy sol! macro
//! - `gas_station` - HTTP gas price oracle
//! - `signer` - relayer key, message signing and signer recovery

pub mod client;
pub mod contracts;
pub mod gas_station;
pub mod signer;

// Re-export commonly used items
pub use client::{batch_from_contract, EvmBridgeClient, EvmClientConfig, EvmSubmitter};
pub use contracts::{Bridge, ERC20Safe, SCExecProxy, ERC20};
pub use gas_station::{GasPriceSelector, GasStation, GasStationConfig};
pub use signer::{recover_signer, EvmCryptoHandler};
