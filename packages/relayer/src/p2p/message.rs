//! Signed envelopes and payloads exchanged between relayers
//!
//! Every message is signed with the relayer's MultiversX ed25519 key over
//! `payload ‖ nonce` (nonce big-endian). Nonces start at the sender's boot time
//! in nanoseconds, so they keep increasing across restarts.

use alloy::primitives::{Address, Bytes, B256};
use eyre::{Result, WrapErr};
use multichain_rs::mx::{verify_signature, MxKey};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::RelayerError;

pub const MAX_MESSAGE_LEN: usize = 16 * 1024;
pub const MAX_PAYLOAD_LEN: usize = 4 * 1024;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub payload: Bytes,
    pub public_key: Bytes,
    pub signature: Bytes,
    pub nonce: u64,
}

impl SignedMessage {
    pub fn signing_bytes(payload: &[u8], nonce: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(payload.len() + 8);
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(&nonce.to_be_bytes());
        bytes
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).wrap_err("Failed to encode peer message")
    }

    /// Parse and bound-check raw message bytes
    pub fn decode(data: &[u8]) -> Result<Self, RelayerError> {
        if data.len() > MAX_MESSAGE_LEN {
            return Err(RelayerError::InvalidMessage(format!(
                "message of {} bytes exceeds {}",
                data.len(),
                MAX_MESSAGE_LEN
            )));
        }
        let message: SignedMessage = serde_json::from_slice(data)
            .map_err(|e| RelayerError::InvalidMessage(format!("malformed message: {}", e)))?;
        if message.payload.len() > MAX_PAYLOAD_LEN {
            return Err(RelayerError::InvalidMessage(format!(
                "payload of {} bytes exceeds {}",
                message.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        if message.public_key.len() != PUBLIC_KEY_LEN {
            return Err(RelayerError::InvalidMessage(format!(
                "public key has {} bytes",
                message.public_key.len()
            )));
        }
        if message.signature.len() != SIGNATURE_LEN {
            return Err(RelayerError::InvalidMessage(format!(
                "signature has {} bytes",
                message.signature.len()
            )));
        }
        Ok(message)
    }

    pub fn verify(&self) -> bool {
        verify_signature(
            &self.public_key,
            &Self::signing_bytes(&self.payload, self.nonce),
            &self.signature,
        )
    }
}

/// Signs outgoing messages; shared by every broadcaster of the process
pub struct MessageSigner {
    key: Arc<MxKey>,
    next_nonce: AtomicU64,
}

impl MessageSigner {
    pub fn new(key: Arc<MxKey>) -> Self {
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            key,
            next_nonce: AtomicU64::new(start),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.public_key()
    }

    pub fn sign(&self, payload: Vec<u8>) -> SignedMessage {
        let nonce = self.next_nonce.fetch_add(1, Ordering::SeqCst);
        let signature = self.key.sign(&SignedMessage::signing_bytes(&payload, nonce));
        SignedMessage {
            payload: payload.into(),
            public_key: Bytes::copy_from_slice(&self.key.public_key()),
            signature: signature.into(),
            nonce,
        }
    }
}

/// Announced on startup and every `repeat_join`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub peer_id: String,
    pub evm_address: Address,
    pub mx_public_key: B256,
}

/// One relayer's EVM signature over an action hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub message_hash: B256,
    pub signer: Address,
    pub signature: Bytes,
}

pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).wrap_err("Failed to encode payload")
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RelayerError> {
    serde_json::from_slice(bytes)
        .map_err(|e| RelayerError::InvalidMessage(format!("malformed payload: {}", e)))
}
