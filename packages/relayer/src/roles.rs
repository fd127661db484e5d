//! Whitelist and quorum cache per chain
//!
//! A [`ChainRoleProvider`] is the only writer of its chain's role data; the
//! broadcaster and the state machine read it through [`WhitelistView`] and
//! [`ChainRoleProvider::quorum`].

use async_trait::async_trait;
use eyre::Result;
use multichain_rs::ChainKind;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{EvmChainClient, MxChainClient};
use crate::errors::RelayerError;

/// Where a provider reads its roles from
#[async_trait]
pub trait RoleSource: Send + Sync {
    fn chain(&self) -> ChainKind;
    async fn fetch_whitelist(&self) -> Result<Vec<Vec<u8>>>;
    async fn fetch_quorum(&self) -> Result<u64>;
}

/// Staked relayers (ed25519 public keys) of the multisig
pub struct MxRoleSource {
    client: Arc<dyn MxChainClient>,
}

impl MxRoleSource {
    pub fn new(client: Arc<dyn MxChainClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoleSource for MxRoleSource {
    fn chain(&self) -> ChainKind {
        ChainKind::Mx
    }

    async fn fetch_whitelist(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .client
            .get_all_staked_relayers()
            .await?
            .into_iter()
            .map(|key| key.to_vec())
            .collect())
    }

    async fn fetch_quorum(&self) -> Result<u64> {
        self.client.get_quorum().await
    }
}

/// Relayer addresses of the EVM bridge
pub struct EvmRoleSource {
    client: Arc<dyn EvmChainClient>,
}

impl EvmRoleSource {
    pub fn new(client: Arc<dyn EvmChainClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoleSource for EvmRoleSource {
    fn chain(&self) -> ChainKind {
        ChainKind::Evm
    }

    async fn fetch_whitelist(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .client
            .get_relayers()
            .await?
            .into_iter()
            .map(|address| address.to_vec())
            .collect())
    }

    async fn fetch_quorum(&self) -> Result<u64> {
        self.client.quorum().await
    }
}

/// Read-only view of a whitelist
#[async_trait]
pub trait WhitelistView: Send + Sync {
    async fn is_whitelisted(&self, member: &[u8]) -> bool;
    /// Members in ascending byte order
    async fn sorted_members(&self) -> Vec<Vec<u8>>;
    /// `None` until the first successful refresh
    async fn last_refresh_age(&self) -> Option<Duration>;
}

#[derive(Debug, Default)]
struct RoleState {
    whitelist: BTreeSet<Vec<u8>>,
    quorum: Option<u64>,
    refreshed_at: Option<Instant>,
}

pub struct ChainRoleProvider {
    source: Arc<dyn RoleSource>,
    state: RwLock<RoleState>,
    max_staleness: Duration,
    quorum_override: Option<u64>,
}

impl ChainRoleProvider {
    pub fn new(
        source: Arc<dyn RoleSource>,
        max_staleness: Duration,
        quorum_override: Option<u64>,
    ) -> Self {
        Self {
            source,
            state: RwLock::new(RoleState::default()),
            max_staleness,
            quorum_override,
        }
    }

    pub fn chain(&self) -> ChainKind {
        self.source.chain()
    }

    /// Fetch whitelist and quorum; the cache keeps its previous content on error
    pub async fn refresh(&self) -> Result<()> {
        let whitelist = self.source.fetch_whitelist().await?;
        let quorum = self.source.fetch_quorum().await?;

        let mut state = self.state.write().await;
        let members: BTreeSet<Vec<u8>> = whitelist.into_iter().collect();
        if members != state.whitelist || state.quorum != Some(quorum) {
            info!(
                chain = %self.chain(),
                members = members.len(),
                quorum,
                "Role data changed"
            );
        }
        state.whitelist = members;
        state.quorum = Some(quorum);
        state.refreshed_at = Some(Instant::now());
        Ok(())
    }

    /// Refresh every `interval` until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(chain = %self.chain(), "Role provider stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(chain = %self.chain(), error = %e, "Failed to refresh role data");
                    }
                }
            }
        }
    }

    fn is_stale(&self, state: &RoleState) -> bool {
        state
            .refreshed_at
            .map_or(true, |at| at.elapsed() > self.max_staleness)
    }

    /// Cached quorum; the override wins when the cache is stale or empty
    pub async fn quorum(&self) -> Result<u64> {
        let state = self.state.read().await;
        if self.is_stale(&state) {
            if let Some(quorum) = self.quorum_override {
                return Ok(quorum);
            }
        }
        match state.quorum {
            Some(quorum) => Ok(quorum),
            None => Err(RelayerError::RolesUnavailable {
                chain: self.chain().as_str(),
            }
            .into()),
        }
    }

    /// Reject reads older than the configured staleness bound
    pub async fn ensure_fresh(&self) -> Result<()> {
        match self.last_refresh_age().await {
            Some(age) if age <= self.max_staleness => Ok(()),
            Some(age) => Err(RelayerError::StaleRoles {
                chain: self.chain().as_str(),
                age_secs: age.as_secs(),
            }
            .into()),
            None => Err(RelayerError::RolesUnavailable {
                chain: self.chain().as_str(),
            }
            .into()),
        }
    }
}

#[async_trait]
impl WhitelistView for ChainRoleProvider {
    async fn is_whitelisted(&self, member: &[u8]) -> bool {
        self.state.read().await.whitelist.contains(member)
    }

    async fn sorted_members(&self) -> Vec<Vec<u8>> {
        self.state.read().await.whitelist.iter().cloned().collect()
    }

    async fn last_refresh_age(&self) -> Option<Duration> {
        self.state
            .read()
            .await
            .refreshed_at
            .map(|at| at.elapsed())
    }
}
