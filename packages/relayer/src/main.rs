//! MX-ETH Bridge Relayer Node
//!
//! Runs both half-bridges against live chains:
//! 1. Loads keys and builds the EVM and MultiversX clients with their nonce handlers
//! 2. Refreshes the relayer roles of both chains, then keeps them fresh
//! 3. Joins the peer network with one broadcaster per direction
//! 4. Ticks one state machine per direction until SIGINT/SIGTERM

use eyre::{Result, WrapErr};
use multichain_rs::evm::{
    EvmBridgeClient, EvmClientConfig, EvmCryptoHandler, EvmSubmitter, GasStation,
};
use multichain_rs::mx::{MxBridgeClient, MxClientConfig, MxKey, MxProxy, MxSubmitter};
use multichain_rs::{with_retry, ChainKind, Direction, NonceTransactionsHandler};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use relayer::api::{self, AppState};
use relayer::availability::AvailabilityMonitor;
use relayer::balance::BalanceValidator;
use relayer::chain::{sides_for, BridgeSide, EvmChainClient, EvmSide, MxChainClient, MxSide};
use relayer::config::Config;
use relayer::driver::run_driver;
use relayer::executor::{BridgeExecutor, ExecutorParts, ExecutorSettings};
use relayer::metrics;
use relayer::p2p::antiflood::AntiFlood;
use relayer::p2p::{Broadcaster, HttpMessenger, MessageSigner, NetMessenger};
use relayer::roles::{ChainRoleProvider, EvmRoleSource, MxRoleSource};
use relayer::status::{StatusRegistry, ETH_CLIENT_HANDLER, MX_CLIENT_HANDLER};
use relayer::topology::{SystemClock, TopologyHandler};

fn main() -> Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_logging();

    info!("Starting MX-ETH Bridge Relayer");

    let config = Config::load()?;
    info!(
        evm_chain_id = config.evm.chain_id,
        evm_bridge = %config.evm.bridge_address,
        mx_multisig = %config.mx.multisig_address,
        peer_id = %config.p2p.peer_id,
        peers = config.p2p.peers.len(),
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    let status = StatusRegistry::new();
    let mut tasks = JoinSet::new();
    let retry = config.retry();

    // Keys
    let mx_key = Arc::new(
        MxKey::from_pem_file(&config.mx.private_key_file)
            .wrap_err("Failed to load the MultiversX key")?,
    );
    let crypto = Arc::new(EvmCryptoHandler::from_key_file(&config.evm.private_key_file)?);

    // EVM client
    let evm_submitter = Arc::new(EvmSubmitter::new(
        &config.evm.rpc_url,
        crypto.wallet(),
        retry.clone(),
    )?);
    let evm_nonces = Arc::new(NonceTransactionsHandler::new(
        ChainKind::Evm.as_str(),
        evm_submitter,
        config.evm.interval_to_resend_txs,
        retry.clone(),
    ));
    let gas_station = match config.gas_station.station_config()? {
        Some(station) => {
            let station = Arc::new(GasStation::new(station)?);
            tasks.spawn(station.clone().run(cancel.child_token()));
            Some(station)
        }
        None => None,
    };
    let evm_client: Arc<dyn EvmChainClient> = Arc::new(EvmBridgeClient::new(
        evm_client_config(&config)?,
        crypto.clone(),
        evm_nonces.clone(),
        gas_station,
    )?);

    // MultiversX client
    let proxy = Arc::new(MxProxy::new(&config.mx.proxy_url, config.rpc_timeout)?);
    let mx_submitter = Arc::new(MxSubmitter::new(proxy.clone(), mx_key.clone(), retry.clone()));
    let mx_nonces = Arc::new(NonceTransactionsHandler::new(
        ChainKind::Mx.as_str(),
        mx_submitter,
        config.mx.interval_to_resend_txs,
        retry.clone(),
    ));
    let mx_client: Arc<dyn MxChainClient> = Arc::new(MxBridgeClient::new(
        mx_client_config(&config),
        proxy,
        mx_key.clone(),
        mx_nonces.clone(),
    )?);

    tasks.spawn(evm_nonces.run_resend_loop(cancel.child_token(), |resent| {
        metrics::record_nonce_resends(ChainKind::Evm.as_str(), resent)
    }));
    tasks.spawn(mx_nonces.run_resend_loop(cancel.child_token(), |resent| {
        metrics::record_nonce_resends(ChainKind::Mx.as_str(), resent)
    }));

    // Roles
    let mx_roles = Arc::new(ChainRoleProvider::new(
        Arc::new(MxRoleSource::new(mx_client.clone())),
        config.roles.max_staleness,
        config.quorum_override,
    ));
    let evm_roles = Arc::new(ChainRoleProvider::new(
        Arc::new(EvmRoleSource::new(evm_client.clone())),
        config.roles.max_staleness,
        config.quorum_override,
    ));
    with_retry(&retry, "read MultiversX relayers", |_| mx_roles.refresh())
        .await
        .wrap_err("Failed to read MultiversX relayers")?;
    with_retry(&retry, "read Ethereum relayers", |_| evm_roles.refresh())
        .await
        .wrap_err("Failed to read Ethereum relayers")?;
    tasks.spawn(mx_roles.clone().run(cancel.child_token(), config.roles.polling_interval));
    tasks.spawn(evm_roles.clone().run(cancel.child_token(), config.roles.polling_interval));

    // Peer network
    let messenger = Arc::new(HttpMessenger::new(
        &config.p2p.peer_id,
        &config.p2p.peers,
        config.rpc_timeout,
    )?);
    let signer = Arc::new(MessageSigner::new(mx_key.clone()));
    let broadcaster = |direction: Direction| {
        Arc::new(Broadcaster::new(
            direction,
            &config.p2p.protocol_id,
            messenger.clone() as Arc<dyn NetMessenger>,
            signer.clone(),
            crypto.address(),
            mx_roles.clone(),
            evm_roles.clone(),
            config.p2p.max_messages_per_second,
        ))
    };

    let clock = Arc::new(SystemClock);
    let balance = Arc::new(BalanceValidator::new(evm_client.clone(), mx_client.clone()));
    let mx_side: Arc<dyn BridgeSide> = Arc::new(MxSide::new(mx_client.clone()));

    // State machines
    let mut evm_head: Option<Arc<dyn BridgeSide>> = None;
    for direction in [Direction::EthToMx, Direction::MxToEth] {
        let broadcaster = broadcaster(direction);
        tasks.spawn(
            broadcaster
                .clone()
                .run(cancel.child_token(), config.p2p.repeat_join),
        );

        let evm_side: Arc<dyn BridgeSide> = Arc::new(EvmSide::new(
            evm_client.clone(),
            broadcaster.clone(),
            crypto.clone(),
            evm_roles.clone(),
        ));
        evm_head.get_or_insert_with(|| evm_side.clone());
        let (source, destination) = sides_for(direction, evm_side, mx_side.clone());
        let executor = BridgeExecutor::new(
            direction,
            ExecutorParts {
                source,
                destination,
                topology: Arc::new(TopologyHandler::new(
                    broadcaster,
                    clock.clone(),
                    config.state_machine.interval_for_leader.as_secs(),
                )),
                balance: balance.clone(),
                status: status.handler(direction.as_str()).await,
            },
            ExecutorSettings::from_config(&config, direction),
        );
        tasks.spawn(run_driver(
            executor,
            config.state_machine.step_duration,
            cancel.child_token(),
        ));
    }

    // Availability
    if let Some(evm_side) = evm_head {
        let monitor = AvailabilityMonitor::new(
            evm_side,
            status.handler(ETH_CLIENT_HANDLER).await,
            config.evm.client_availability_allow_delta,
        );
        tasks.spawn(monitor.run(config.polling_timeout, cancel.child_token()));
    }
    let mx_monitor = AvailabilityMonitor::new(
        mx_side,
        status.handler(MX_CLIENT_HANDLER).await,
        config.mx.client_availability_allow_delta,
    );
    tasks.spawn(mx_monitor.run(config.polling_timeout, cancel.child_token()));

    // API
    let api_state = AppState {
        status,
        messenger: Some(messenger),
        antiflood: Arc::new(AntiFlood::new(config.p2p.max_messages_per_second)),
    };
    let bind_address = config.api.bind_address.clone();
    let api_cancel = cancel.child_token();
    tasks.spawn(async move {
        if let Err(e) = api::start_api_server(&bind_address, api_state, api_cancel).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Relayer started, waiting for shutdown signal");
    wait_for_shutdown_signal().await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    info!("MX-ETH Bridge Relayer stopped");
    Ok(())
}

fn evm_client_config(config: &Config) -> Result<EvmClientConfig> {
    Ok(EvmClientConfig {
        rpc_url: config.evm.rpc_url.clone(),
        chain_id: config.evm.chain_id,
        bridge_address: config.evm.bridge()?,
        safe_address: config.evm.safe()?,
        sc_exec_proxy_address: config.evm.sc_exec_proxy()?,
        gas_limit_base: config.evm.gas_limit_base,
        gas_limit_for_each: config.evm.gas_limit_for_each,
        events_block_range_from: config.evm.events_block_range_from,
        events_block_range_to: config.evm.events_block_range_to,
    })
}

fn mx_client_config(config: &Config) -> MxClientConfig {
    MxClientConfig {
        proxy_url: config.mx.proxy_url.clone(),
        multisig_address: config.mx.multisig_address.clone(),
        safe_address: config.mx.safe_address.clone(),
        gas_map: config.mx.gas_map.clone(),
        request_timeout: config.rpc_timeout,
    }
}

/// Initialize tracing; `LOG_FORMAT=json` switches to JSON lines
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,relayer=debug,multichain_rs=info"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
