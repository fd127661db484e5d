//! In-memory chains and a multi-relayer harness
//!
//! Enabled for unit tests and through the `testing` feature.

mod mock_evm;
mod mock_mx;
mod network;

#[cfg(test)]
mod scenarios;

pub use mock_evm::{EvmCall, EvmPayout, EvmToken, MockEvmChain, MockEvmClient};
pub use mock_mx::{EsdtTransfer, MockMxChain, MockMxClient, MxCall, MxToken};
pub use network::{
    run_rounds, settle, NetworkBuilder, TestNetwork, TestNode, DEFAULT_ERC20, DEFAULT_TOKEN_ID,
};

/// Flat fee both safes keep from every transfer and refund
pub const MOCK_FEE: u64 = 50;
