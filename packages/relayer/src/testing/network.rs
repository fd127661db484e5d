//! A set of relayers wired to shared in-memory chains and one local hub
//!
//! Each [`TestNode`] owns its chain clients, role providers and one broadcaster
//! per direction, exactly as `main` wires a real relayer. Leadership follows a
//! [`ManualClock`] shared by every node.

use alloy::primitives::{Address, U256};
use eyre::{eyre, Result};
use multichain_rs::evm::EvmCryptoHandler;
use multichain_rs::mx::MxKey;
use multichain_rs::Direction;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{EvmToken, MockEvmChain, MockEvmClient, MockMxChain, MockMxClient, MxToken};
use crate::balance::BalanceValidator;
use crate::chain::{sides_for, BridgeSide, EvmSide, MxSide};
use crate::executor::{BridgeExecutor, ExecutorParts, ExecutorSettings};
use crate::p2p::{Broadcaster, LocalHub, MessageSigner};
use crate::roles::{ChainRoleProvider, EvmRoleSource, MxRoleSource};
use crate::status::StatusRegistry;
use crate::topology::{leader_index, Clock, ManualClock, TopologyHandler};

/// Anvil development accounts
const EVM_KEYS: [&str; 4] = [
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
    "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
    "0x7c852118294e51e653712a81e05800f419141751be58f605c371e15141b007a6",
];

const PROTOCOL_ID: &str = "/bridge-test/1.0.0";
const ROLE_STALENESS: Duration = Duration::from_secs(3600);
const REPEAT_JOIN: Duration = Duration::from_secs(3600);

/// Token pair registered on both chains by default
pub const DEFAULT_ERC20: [u8; 20] = [0x11; 20];
pub const DEFAULT_TOKEN_ID: &[u8] = b"TKN-111111";

/// Let spawned broadcasters drain their queues
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub struct TestNode {
    pub index: usize,
    pub peer_id: String,
    pub mx_key: Arc<MxKey>,
    pub crypto: Arc<EvmCryptoHandler>,
    pub evm_client: Arc<MockEvmClient>,
    pub mx_client: Arc<MockMxClient>,
    pub mx_roles: Arc<ChainRoleProvider>,
    pub evm_roles: Arc<ChainRoleProvider>,
    pub eth_to_mx: Arc<Broadcaster>,
    pub mx_to_eth: Arc<Broadcaster>,
    pub status: StatusRegistry,
    clock: Arc<dyn Clock>,
    interval_for_leader: u64,
}

impl TestNode {
    pub fn broadcaster(&self, direction: Direction) -> &Arc<Broadcaster> {
        match direction {
            Direction::EthToMx => &self.eth_to_mx,
            Direction::MxToEth => &self.mx_to_eth,
        }
    }

    pub fn evm_address(&self) -> Address {
        self.crypto.address()
    }

    /// Executor for `direction`, wired like the production bootstrap
    pub async fn executor(&self, direction: Direction, settings: ExecutorSettings) -> BridgeExecutor {
        let broadcaster = self.broadcaster(direction).clone();
        let evm_side: Arc<dyn BridgeSide> = Arc::new(EvmSide::new(
            self.evm_client.clone(),
            broadcaster.clone(),
            self.crypto.clone(),
            self.evm_roles.clone(),
        ));
        let mx_side: Arc<dyn BridgeSide> = Arc::new(MxSide::new(self.mx_client.clone()));
        let (source, destination) = sides_for(direction, evm_side, mx_side);

        let parts = ExecutorParts {
            source,
            destination,
            topology: Arc::new(TopologyHandler::new(
                broadcaster,
                self.clock.clone(),
                self.interval_for_leader,
            )),
            balance: Arc::new(BalanceValidator::new(
                self.evm_client.clone(),
                self.mx_client.clone(),
            )),
            status: self.status.handler(direction.as_str()).await,
        };
        BridgeExecutor::new(direction, parts, settings)
    }
}

pub struct NetworkBuilder {
    relayers: usize,
    evm_quorum: Option<u64>,
    mx_quorum: Option<u64>,
    interval_for_leader: u64,
    start_time: u64,
}

impl NetworkBuilder {
    /// `relayers` nodes (at most four); quorum defaults to all of them
    pub fn new(relayers: usize) -> Self {
        Self {
            relayers,
            evm_quorum: None,
            mx_quorum: None,
            interval_for_leader: 60,
            start_time: 0,
        }
    }

    /// Same quorum on both chains
    pub fn quorum(mut self, quorum: u64) -> Self {
        self.evm_quorum = Some(quorum);
        self.mx_quorum = Some(quorum);
        self
    }

    pub fn interval_for_leader(mut self, secs: u64) -> Self {
        self.interval_for_leader = secs;
        self
    }

    pub async fn build(self) -> Result<TestNetwork> {
        if self.relayers == 0 || self.relayers > EVM_KEYS.len() {
            return Err(eyre!("between 1 and {} relayers supported", EVM_KEYS.len()));
        }

        let mx_keys = (0..self.relayers)
            .map(|i| MxKey::from_seed(&[i as u8 + 1; 32]).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let cryptos = EVM_KEYS[..self.relayers]
            .iter()
            .map(|key| EvmCryptoHandler::from_private_key(key).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let all = self.relayers as u64;
        let evm = MockEvmChain::new(
            cryptos.iter().map(|c| c.address()).collect(),
            self.evm_quorum.unwrap_or(all),
        );
        let mx = MockMxChain::new(
            mx_keys.iter().map(|k| k.public_key()).collect(),
            self.mx_quorum.unwrap_or(all),
        );
        evm.add_token(
            Address::from(DEFAULT_ERC20),
            EvmToken::native_locked(U256::from(u64::MAX)),
        );
        mx.add_token(
            DEFAULT_TOKEN_ID,
            DEFAULT_ERC20.to_vec(),
            MxToken::mint_burn(U256::ZERO),
        );

        let hub = LocalHub::new();
        let clock = ManualClock::new(self.start_time);
        let cancel = CancellationToken::new();
        let mut nodes = Vec::with_capacity(self.relayers);

        for (index, (mx_key, crypto)) in mx_keys.into_iter().zip(cryptos).enumerate() {
            let peer_id = format!("relayer-{}", index);
            let evm_client = evm.client(crypto.address());
            let mx_client = mx.client(mx_key.public_key());

            let mx_roles = Arc::new(ChainRoleProvider::new(
                Arc::new(MxRoleSource::new(mx_client.clone())),
                ROLE_STALENESS,
                None,
            ));
            let evm_roles = Arc::new(ChainRoleProvider::new(
                Arc::new(EvmRoleSource::new(evm_client.clone())),
                ROLE_STALENESS,
                None,
            ));
            mx_roles.refresh().await?;
            evm_roles.refresh().await?;

            let messenger = hub.messenger(&peer_id);
            let signer = Arc::new(MessageSigner::new(mx_key.clone()));
            let broadcaster = |direction: Direction| {
                Arc::new(Broadcaster::new(
                    direction,
                    PROTOCOL_ID,
                    messenger.clone(),
                    signer.clone(),
                    crypto.address(),
                    mx_roles.clone(),
                    evm_roles.clone(),
                    1_000,
                ))
            };
            let eth_to_mx = broadcaster(Direction::EthToMx);
            let mx_to_eth = broadcaster(Direction::MxToEth);
            tokio::spawn(eth_to_mx.clone().run(cancel.child_token(), REPEAT_JOIN));
            tokio::spawn(mx_to_eth.clone().run(cancel.child_token(), REPEAT_JOIN));

            nodes.push(TestNode {
                index,
                peer_id,
                mx_key,
                crypto,
                evm_client,
                mx_client,
                mx_roles,
                evm_roles,
                eth_to_mx,
                mx_to_eth,
                status: StatusRegistry::new(),
                clock: clock.clone(),
                interval_for_leader: self.interval_for_leader,
            });
        }
        settle().await;

        Ok(TestNetwork {
            evm,
            mx,
            hub,
            clock,
            nodes,
            interval_for_leader: self.interval_for_leader,
            cancel,
        })
    }
}

pub struct TestNetwork {
    pub evm: Arc<MockEvmChain>,
    pub mx: Arc<MockMxChain>,
    pub hub: Arc<LocalHub>,
    pub clock: Arc<ManualClock>,
    pub nodes: Vec<TestNode>,
    interval_for_leader: u64,
    cancel: CancellationToken,
}

impl TestNetwork {
    /// Index of the node leading the current window
    pub fn current_leader(&self) -> usize {
        let mut keys: Vec<[u8; 32]> = self.nodes.iter().map(|n| n.mx_key.public_key()).collect();
        keys.sort();
        let index = leader_index(self.clock.now_unix(), self.interval_for_leader, keys.len())
            .unwrap_or_default();
        self.nodes
            .iter()
            .position(|n| n.mx_key.public_key() == keys[index])
            .unwrap_or_default()
    }

    /// Move the clock to the first window led by `node`
    pub fn rotate_leader_to(&self, node: usize) {
        for _ in 0..self.nodes.len() {
            if self.current_leader() == node {
                return;
            }
            self.clock.advance(self.interval_for_leader);
        }
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Step every executor once per round, letting gossip settle after each step
pub async fn run_rounds(executors: &mut [BridgeExecutor], rounds: usize) {
    for _ in 0..rounds {
        for executor in executors.iter_mut() {
            executor.run_step().await;
            settle().await;
        }
    }
}
