//! Live Chain Test
//!
//! Read-only checks of the relayer's role provider and availability monitor
//! against a MultiversX gateway with the bridge deployed.
//!
//! ## Setup
//!
//! - `MX_PROXY_URL` - Gateway URL (e.g., http://localhost:8085)
//! - `MX_MULTISIG_ADDRESS` - Bech32 multisig address
//! - `MX_SAFE_ADDRESS` - Bech32 safe address
//!
//! ## Running
//!
//! ```bash
//! cd packages/relayer
//! cargo test --test live_chains -- --ignored --nocapture
//! ```

use multichain_rs::mx::{GasMap, MxBridgeClient, MxClientConfig, MxKey, MxProxy, MxSubmitter};
use multichain_rs::{ChainKind, NonceTransactionsHandler, RetryConfig};
use relayer::availability::{AvailabilityMonitor, AVAILABLE};
use relayer::chain::{MxChainClient, MxSide};
use relayer::roles::{ChainRoleProvider, MxRoleSource};
use relayer::status::{StatusHandler, METRIC_CLIENT_STATUS, MX_CLIENT_HANDLER};
use std::sync::Arc;
use std::time::Duration;

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn mx_client(url: &str, multisig: String, safe: String) -> Arc<dyn MxChainClient> {
    let timeout = Duration::from_secs(10);
    let proxy = Arc::new(MxProxy::new(url, timeout).expect("proxy"));
    // queries only, any key will do
    let key = Arc::new(MxKey::from_seed(&[7u8; 32]).expect("key"));
    let nonces = Arc::new(NonceTransactionsHandler::new(
        ChainKind::Mx.as_str(),
        Arc::new(MxSubmitter::new(proxy.clone(), key.clone(), RetryConfig::default())),
        Duration::from_secs(60),
        RetryConfig::default(),
    ));
    let config = MxClientConfig {
        proxy_url: url.to_string(),
        multisig_address: multisig,
        safe_address: safe,
        gas_map: GasMap::default(),
        request_timeout: timeout,
    };
    Arc::new(MxBridgeClient::new(config, proxy, key, nonces).expect("client"))
}

#[tokio::test]
#[ignore = "requires MultiversX gateway with bridge: MX_PROXY_URL, MX_MULTISIG_ADDRESS, MX_SAFE_ADDRESS"]
async fn test_mx_roles_and_availability() {
    let (Some(url), Some(multisig), Some(safe)) = (
        env("MX_PROXY_URL"),
        env("MX_MULTISIG_ADDRESS"),
        env("MX_SAFE_ADDRESS"),
    ) else {
        eprintln!("Skipping: set MX_PROXY_URL, MX_MULTISIG_ADDRESS and MX_SAFE_ADDRESS to run.");
        return;
    };
    let client = mx_client(&url, multisig, safe);

    let roles = ChainRoleProvider::new(
        Arc::new(MxRoleSource::new(client.clone())),
        Duration::from_secs(60),
        None,
    );
    roles.refresh().await.expect("role refresh");
    let quorum = roles.quorum().await.expect("quorum");
    assert!(quorum > 0);

    let status = Arc::new(StatusHandler::new(MX_CLIENT_HANDLER));
    let mut monitor = AvailabilityMonitor::new(Arc::new(MxSide::new(client)), status.clone(), 10);
    assert!(monitor.check().await);
    assert_eq!(
        status.string_metric(METRIC_CLIENT_STATUS).await.as_deref(),
        Some(AVAILABLE)
    );
}
