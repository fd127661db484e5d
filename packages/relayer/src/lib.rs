//! MX-ETH Bridge Relayer - Library interface
//!
//! Two half-bridges (Ethereum to MultiversX and back) each run the step graph
//! in [`steps`] through a [`executor::BridgeExecutor`], ticked by [`driver`].
//! Relayers share EVM signatures over [`p2p`] and take turns leading per
//! [`topology`].

pub mod api;
pub mod availability;
pub mod balance;
pub mod chain;
pub mod config;
pub mod driver;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod p2p;
pub mod roles;
pub mod status;
pub mod steps;
pub mod topology;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
