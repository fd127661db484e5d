//! MultiversX Chain Support Module
//!
//! ## Submodules
//!
//! - `client` - multisig views and actions
//! - `data` - `function@args` encoding and the gas map
//! - `proxy` - gateway REST client
//! - `query` - typed parsing of VM query results
//! - `transaction` - transaction JSON, ed25519 key and PEM loading

pub mod client;
pub mod data;
pub mod proxy;
pub mod query;
pub mod transaction;

pub use client::{MxBridgeClient, MxClientConfig, MxClientError, MxSubmitter};
pub use data::{GasMap, TxDataBuilder};
pub use proxy::MxProxy;
pub use query::QueryError;
pub use transaction::{verify_signature, MxKey, NetworkConfig, Transaction};
