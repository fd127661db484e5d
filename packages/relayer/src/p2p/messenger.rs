//! Peer transports
//!
//! [`LocalHub`] connects messengers inside one process. [`HttpMessenger`]
//! POSTs [`HttpEnvelope`]s to the `/p2p/message` endpoint of each peer and
//! receives through the API server.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

const SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub peer: String,
    pub topic: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait NetMessenger: Send + Sync {
    fn peer_id(&self) -> &str;
    async fn broadcast(&self, topic: &str, data: Vec<u8>) -> Result<()>;
    async fn send_to_peer(&self, peer: &str, topic: &str, data: Vec<u8>) -> Result<()>;
    /// Every subscriber receives every inbound message
    fn subscribe(&self) -> mpsc::Receiver<InboundMessage>;
}

/// Fan-out to subscriber channels; closed channels are pruned on delivery
#[derive(Default)]
struct Subscribers {
    senders: Mutex<Vec<mpsc::Sender<InboundMessage>>>,
}

impl Subscribers {
    fn subscribe(&self) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }

    fn deliver(&self, message: InboundMessage) {
        let Ok(mut senders) = self.senders.lock() else {
            return;
        };
        senders.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %message.topic, peer = %message.peer, "Subscriber queue full, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

// ============================================================================
// In-process hub
// ============================================================================

/// In-process network of [`LocalMessenger`]s
#[derive(Default)]
pub struct LocalHub {
    peers: Mutex<HashMap<String, Arc<Subscribers>>>,
    /// `(peer, topic prefix)`: messages on a matching topic sent by or to `peer` are lost
    drop_rules: Mutex<Vec<(String, String)>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messenger(self: &Arc<Self>, peer_id: &str) -> Arc<LocalMessenger> {
        if let Ok(mut peers) = self.peers.lock() {
            peers
                .entry(peer_id.to_string())
                .or_insert_with(|| Arc::new(Subscribers::default()));
        }
        Arc::new(LocalMessenger {
            peer_id: peer_id.to_string(),
            hub: self.clone(),
        })
    }

    /// Lose every message on topics starting with `topic_prefix` sent by or to `peer`
    pub fn drop_topic_for(&self, peer: &str, topic_prefix: &str) {
        if let Ok(mut rules) = self.drop_rules.lock() {
            rules.push((peer.to_string(), topic_prefix.to_string()));
        }
    }

    fn is_dropped(&self, from: &str, to: &str, topic: &str) -> bool {
        self.drop_rules.lock().map_or(false, |rules| {
            rules.iter().any(|(peer, prefix)| {
                (peer == from || peer == to) && topic.starts_with(prefix.as_str())
            })
        })
    }

    fn deliver(&self, from: &str, to: &str, topic: &str, data: &[u8]) {
        if self.is_dropped(from, to, topic) {
            debug!(from, to, topic, "Dropped message by rule");
            return;
        }
        let target = self
            .peers
            .lock()
            .ok()
            .and_then(|peers| peers.get(to).cloned());
        if let Some(subscribers) = target {
            subscribers.deliver(InboundMessage {
                peer: from.to_string(),
                topic: topic.to_string(),
                data: data.to_vec(),
            });
        }
    }

    fn peer_ids(&self) -> Vec<String> {
        self.peers
            .lock()
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn subscribers(&self, peer: &str) -> Option<Arc<Subscribers>> {
        self.peers.lock().ok().and_then(|peers| peers.get(peer).cloned())
    }
}

pub struct LocalMessenger {
    peer_id: String,
    hub: Arc<LocalHub>,
}

#[async_trait]
impl NetMessenger for LocalMessenger {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn broadcast(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        for peer in self.hub.peer_ids() {
            if peer != self.peer_id {
                self.hub.deliver(&self.peer_id, &peer, topic, &data);
            }
        }
        Ok(())
    }

    async fn send_to_peer(&self, peer: &str, topic: &str, data: Vec<u8>) -> Result<()> {
        self.hub.deliver(&self.peer_id, peer, topic, &data);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<InboundMessage> {
        match self.hub.subscribers(&self.peer_id) {
            Some(subscribers) => subscribers.subscribe(),
            None => mpsc::channel(1).1,
        }
    }
}

// ============================================================================
// HTTP messenger
// ============================================================================

/// Wire form of a message posted to `/p2p/message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEnvelope {
    pub from: String,
    pub topic: String,
    /// Base64 message bytes
    pub data: String,
}

impl HttpEnvelope {
    pub fn new(from: &str, topic: &str, data: &[u8]) -> Self {
        Self {
            from: from.to_string(),
            topic: topic.to_string(),
            data: STANDARD.encode(data),
        }
    }

    pub fn into_inbound(self) -> Result<InboundMessage> {
        let data = STANDARD
            .decode(self.data.as_bytes())
            .wrap_err("Envelope data is not valid base64")?;
        Ok(InboundMessage {
            peer: self.from,
            topic: self.topic,
            data,
        })
    }
}

pub struct HttpMessenger {
    peer_id: String,
    /// Peer id to message endpoint
    peers: HashMap<String, Url>,
    client: reqwest::Client,
    subscribers: Subscribers,
}

impl HttpMessenger {
    pub fn new(peer_id: &str, peers: &[(String, String)], timeout: Duration) -> Result<Self> {
        let mut endpoints = HashMap::new();
        for (id, base) in peers {
            if id == peer_id {
                continue;
            }
            let endpoint = Url::parse(&format!("{}/", base.trim_end_matches('/')))
                .and_then(|url| url.join("p2p/message"))
                .map_err(|e| eyre!("Invalid URL for peer {}: {}", id, e))?;
            endpoints.insert(id.clone(), endpoint);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build HTTP client")?;

        Ok(Self {
            peer_id: peer_id.to_string(),
            peers: endpoints,
            client,
            subscribers: Subscribers::default(),
        })
    }

    pub fn is_known_peer(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    /// Hand an envelope received by the API server to the subscribers
    pub fn deliver_inbound(&self, envelope: HttpEnvelope) -> Result<()> {
        if !self.is_known_peer(&envelope.from) {
            return Err(eyre!("Unknown peer {}", envelope.from));
        }
        self.subscribers.deliver(envelope.into_inbound()?);
        Ok(())
    }

    async fn post(&self, peer: &str, endpoint: &Url, envelope: &HttpEnvelope) -> Result<()> {
        let response = self
            .client
            .post(endpoint.clone())
            .json(envelope)
            .send()
            .await
            .wrap_err_with(|| format!("Failed to reach peer {}", peer))?;
        if !response.status().is_success() {
            return Err(eyre!("Peer {} answered {}", peer, response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl NetMessenger for HttpMessenger {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn broadcast(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let envelope = HttpEnvelope::new(&self.peer_id, topic, &data);
        let envelope = &envelope;
        let sends = self
            .peers
            .iter()
            .map(|(peer, endpoint)| async move { (peer, self.post(peer, endpoint, envelope).await) });
        for (peer, result) in futures::future::join_all(sends).await {
            if let Err(e) = result {
                debug!(peer = %peer, topic, error = %e, "Broadcast to peer failed");
            }
        }
        Ok(())
    }

    async fn send_to_peer(&self, peer: &str, topic: &str, data: Vec<u8>) -> Result<()> {
        let endpoint = self
            .peers
            .get(peer)
            .ok_or_else(|| eyre!("Unknown peer {}", peer))?;
        self.post(peer, endpoint, &HttpEnvelope::new(&self.peer_id, topic, &data))
            .await
    }

    fn subscribe(&self) -> mpsc::Receiver<InboundMessage> {
        self.subscribers.subscribe()
    }
}
