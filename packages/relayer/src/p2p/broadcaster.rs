//! Signature gossip for one direction
//!
//! Each direction owns a [`Broadcaster`] listening on the shared `join` topic and
//! on its own `sign/<direction>` topic. Inbound messages go through, in order:
//! topic filter, decoding, anti-flood, envelope signature, MultiversX whitelist
//! (with staleness bound), per-sender nonce, then payload checks.
//!
//! Concurrent HTTP posts from one peer may arrive out of order, so a nonce is
//! accepted once if it lies within [`NONCE_WINDOW`] of the highest one seen.

use alloy::primitives::{Address, Bytes, B256};
use eyre::Result;
use multichain_rs::evm::recover_signer;
use multichain_rs::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::antiflood::AntiFlood;
use super::message::{
    decode_payload, encode_payload, JoinPayload, MessageSigner, SignaturePayload, SignedMessage,
};
use super::messenger::{InboundMessage, NetMessenger};
use crate::errors::RelayerError;
use crate::metrics;
use crate::roles::{ChainRoleProvider, WhitelistView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not one of this broadcaster's topics
    Ignored,
    Flooded,
    Accepted,
}

/// How far below a sender's highest nonce a late message is still accepted
pub const NONCE_WINDOW: u64 = 64;

/// Nonces seen from one sender, bounded to the window below the highest
#[derive(Debug, Default)]
struct NonceWindow {
    highest: u64,
    seen: BTreeSet<u64>,
}

impl NonceWindow {
    /// Record `nonce`; false for a duplicate or one too far below the highest
    fn accept(&mut self, nonce: u64) -> bool {
        if self.seen.is_empty() || nonce > self.highest {
            self.highest = nonce;
            let floor = nonce.saturating_sub(NONCE_WINDOW - 1);
            self.seen = self.seen.split_off(&floor);
            return self.seen.insert(nonce);
        }
        if self.highest - nonce >= NONCE_WINDOW {
            return false;
        }
        self.seen.insert(nonce)
    }
}

#[derive(Debug, Default)]
struct SignatureStore {
    /// Message hash to signatures keyed (and thus sorted) by signer
    by_hash: HashMap<[u8; 32], BTreeMap<Address, Vec<u8>>>,
    /// Our own shares, replayed to peers that join late
    own: HashMap<[u8; 32], Vec<u8>>,
}

pub struct Broadcaster {
    direction: Direction,
    join_topic: String,
    sign_topic: String,
    messenger: Arc<dyn NetMessenger>,
    signer: Arc<MessageSigner>,
    evm_address: Address,
    mx_roles: Arc<ChainRoleProvider>,
    evm_roles: Arc<ChainRoleProvider>,
    antiflood: AntiFlood,
    store: RwLock<SignatureStore>,
    nonces: Mutex<HashMap<Vec<u8>, NonceWindow>>,
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl Broadcaster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        protocol_id: &str,
        messenger: Arc<dyn NetMessenger>,
        signer: Arc<MessageSigner>,
        evm_address: Address,
        mx_roles: Arc<ChainRoleProvider>,
        evm_roles: Arc<ChainRoleProvider>,
        max_messages_per_second: u32,
    ) -> Self {
        // subscribe now so nothing sent before `run` is lost
        let inbound = messenger.subscribe();
        Self {
            direction,
            join_topic: format!("{}/join", protocol_id),
            sign_topic: format!("{}/sign/{}", protocol_id, direction.topic_suffix()),
            messenger,
            signer,
            evm_address,
            mx_roles,
            evm_roles,
            antiflood: AntiFlood::new(max_messages_per_second),
            store: RwLock::new(SignatureStore::default()),
            nonces: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Some(inbound)),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn sign_topic(&self) -> &str {
        &self.sign_topic
    }

    pub fn my_public_key(&self) -> [u8; 32] {
        self.signer.public_key()
    }

    pub fn evm_address(&self) -> Address {
        self.evm_address
    }

    /// Staked relayer keys in ascending order; the leader rotation runs over this list
    pub async fn sorted_public_keys(&self) -> Vec<Vec<u8>> {
        self.mx_roles.sorted_members().await
    }

    /// Store our share locally and gossip it
    pub async fn broadcast_signature(&self, message_hash: [u8; 32], signature: Vec<u8>) -> Result<()> {
        {
            let mut store = self.store.write().await;
            store.own.insert(message_hash, signature.clone());
            store
                .by_hash
                .entry(message_hash)
                .or_default()
                .insert(self.evm_address, signature.clone());
        }
        let data = self.signature_message(message_hash, signature)?;
        self.messenger.broadcast(&self.sign_topic, data).await?;
        debug!(
            direction = %self.direction,
            hash = %B256::from(message_hash),
            "Broadcast signature"
        );
        Ok(())
    }

    /// Collected signatures for `message_hash`, sorted by signer address
    pub async fn signatures(&self, message_hash: &[u8; 32]) -> Vec<(Address, Vec<u8>)> {
        self.store
            .read()
            .await
            .by_hash
            .get(message_hash)
            .map(|sigs| sigs.iter().map(|(a, s)| (*a, s.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn has_signature_from(&self, message_hash: &[u8; 32], signer: Address) -> bool {
        self.store
            .read()
            .await
            .by_hash
            .get(message_hash)
            .map_or(false, |sigs| sigs.contains_key(&signer))
    }

    /// Forget every collected signature; called once an action is executed
    pub async fn clear(&self) {
        let mut store = self.store.write().await;
        store.by_hash.clear();
        store.own.clear();
    }

    pub async fn send_join(&self) -> Result<()> {
        let payload = JoinPayload {
            peer_id: self.messenger.peer_id().to_string(),
            evm_address: self.evm_address,
            mx_public_key: B256::from(self.signer.public_key()),
        };
        let data = self.signer.sign(encode_payload(&payload)?).encode()?;
        self.messenger.broadcast(&self.join_topic, data).await
    }

    fn signature_message(&self, message_hash: [u8; 32], signature: Vec<u8>) -> Result<Vec<u8>> {
        let payload = SignaturePayload {
            message_hash: B256::from(message_hash),
            signer: self.evm_address,
            signature: Bytes::from(signature),
        };
        self.signer.sign(encode_payload(&payload)?).encode()
    }

    /// Validate and apply one inbound message
    pub async fn handle(&self, message: &InboundMessage) -> Result<Outcome> {
        let is_join = message.topic == self.join_topic;
        if !is_join && message.topic != self.sign_topic {
            return Ok(Outcome::Ignored);
        }

        let signed = SignedMessage::decode(&message.data)?;
        if !self.antiflood.allow(&message.peer) {
            return Ok(Outcome::Flooded);
        }
        if !signed.verify() {
            return Err(RelayerError::InvalidMessage("bad envelope signature".to_string()).into());
        }

        self.mx_roles.ensure_fresh().await?;
        if !self.mx_roles.is_whitelisted(&signed.public_key).await {
            return Err(RelayerError::SignerNotWhitelisted(hex::encode(&signed.public_key)).into());
        }
        self.check_nonce(&signed).await?;

        if is_join {
            self.on_join(&message.peer, &signed).await?;
        } else {
            self.on_signature(&signed).await?;
        }
        Ok(Outcome::Accepted)
    }

    async fn check_nonce(&self, signed: &SignedMessage) -> Result<()> {
        let mut nonces = self.nonces.lock().await;
        let window = nonces.entry(signed.public_key.to_vec()).or_default();
        if !window.accept(signed.nonce) {
            return Err(RelayerError::ReplayedNonce {
                peer: hex::encode(&signed.public_key),
                got: signed.nonce,
                highest: window.highest,
            }
            .into());
        }
        Ok(())
    }

    async fn on_join(&self, peer: &str, signed: &SignedMessage) -> Result<()> {
        let join: JoinPayload = decode_payload(&signed.payload)?;
        if join.mx_public_key.as_slice() != signed.public_key.as_ref() {
            return Err(RelayerError::InvalidMessage(
                "join key differs from envelope key".to_string(),
            )
            .into());
        }

        let own: Vec<([u8; 32], Vec<u8>)> = self
            .store
            .read()
            .await
            .own
            .iter()
            .map(|(h, s)| (*h, s.clone()))
            .collect();
        debug!(
            direction = %self.direction,
            peer,
            evm_address = %join.evm_address,
            shares = own.len(),
            "Peer joined"
        );
        for (hash, signature) in own {
            let data = self.signature_message(hash, signature)?;
            self.messenger.send_to_peer(peer, &self.sign_topic, data).await?;
        }
        Ok(())
    }

    async fn on_signature(&self, signed: &SignedMessage) -> Result<()> {
        let payload: SignaturePayload = decode_payload(&signed.payload)?;
        let hash: [u8; 32] = payload.message_hash.0;

        let recovered = recover_signer(&hash, &payload.signature)
            .map_err(|e| RelayerError::InvalidMessage(e.to_string()))?;
        if recovered != payload.signer {
            return Err(RelayerError::SignerMismatch {
                claimed: payload.signer.to_string(),
                recovered: recovered.to_string(),
            }
            .into());
        }
        if !self.evm_roles.is_whitelisted(payload.signer.as_slice()).await {
            return Err(RelayerError::SignerNotWhitelisted(payload.signer.to_string()).into());
        }

        self.store
            .write()
            .await
            .by_hash
            .entry(hash)
            .or_default()
            .insert(payload.signer, payload.signature.to_vec());
        debug!(
            direction = %self.direction,
            signer = %payload.signer,
            hash = %payload.message_hash,
            "Stored signature"
        );
        Ok(())
    }

    fn topic_label(&self, topic: &str) -> &'static str {
        if topic == self.join_topic {
            "join"
        } else {
            "sign"
        }
    }

    /// Process inbound messages and re-announce every `repeat_join` until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, repeat_join: Duration) {
        let Some(mut inbound) = self.inbound.lock().await.take() else {
            warn!(direction = %self.direction, "Broadcaster already running");
            return;
        };
        info!(
            direction = %self.direction,
            topic = %self.sign_topic,
            "Broadcaster started"
        );

        let mut join_ticker = tokio::time::interval(repeat_join);
        join_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(direction = %self.direction, "Broadcaster stopped");
                    return;
                }
                received = inbound.recv() => {
                    let Some(message) = received else {
                        warn!(direction = %self.direction, "Messenger closed");
                        return;
                    };
                    match self.handle(&message).await {
                        Ok(Outcome::Ignored) => {}
                        Ok(Outcome::Flooded) => {
                            metrics::record_p2p_message(self.topic_label(&message.topic), "flooded");
                        }
                        Ok(Outcome::Accepted) => {
                            metrics::record_p2p_message(self.topic_label(&message.topic), "accepted");
                        }
                        Err(e) => {
                            metrics::record_p2p_message(self.topic_label(&message.topic), "rejected");
                            debug!(
                                direction = %self.direction,
                                peer = %message.peer,
                                error = %e,
                                "Rejected peer message"
                            );
                        }
                    }
                }
                _ = join_ticker.tick() => {
                    if let Err(e) = self.send_join().await {
                        warn!(direction = %self.direction, error = %e, "Failed to send join");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("direction", &self.direction)
            .field("sign_topic", &self.sign_topic)
            .field("evm_address", &self.evm_address)
            .finish()
    }
}
