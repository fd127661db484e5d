//! MultiversX transactions and the relayer's ed25519 key
//!
//! The signature covers the JSON serialization of the transaction without its
//! `signature` field, with fields in the order declared below.

use base64::{engine::general_purpose::STANDARD, Engine};
use eyre::{eyre, Result, WrapErr};
use libp2p_identity::ed25519;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::address_codec::encode_mx_address;
use crate::redact::Redacted;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub nonce: u64,
    pub value: String,
    pub receiver: String,
    pub sender: String,
    pub gas_price: u64,
    pub gas_limit: u64,
    /// Base64 of the `function@args` data field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "chainID")]
    pub chain_id: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Transaction {
    /// Unsigned transaction carrying `data` to `receiver`
    pub fn new_call(
        nonce: u64,
        sender: &str,
        receiver: &str,
        data: &str,
        gas_limit: u64,
        network: &NetworkConfig,
    ) -> Self {
        Self {
            nonce,
            value: "0".to_string(),
            receiver: receiver.to_string(),
            sender: sender.to_string(),
            gas_price: network.min_gas_price,
            gas_limit,
            data: (!data.is_empty()).then(|| STANDARD.encode(data.as_bytes())),
            chain_id: network.chain_id.clone(),
            version: network.min_transaction_version,
            signature: None,
        }
    }

    /// Bytes covered by the signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = Transaction {
            signature: None,
            ..self.clone()
        };
        serde_json::to_vec(&unsigned).wrap_err("Failed to serialize transaction")
    }

    /// Decoded data field, for logs
    pub fn data_string(&self) -> String {
        self.data
            .as_deref()
            .and_then(|d| STANDARD.decode(d).ok())
            .map(|d| String::from_utf8_lossy(&d).into_owned())
            .unwrap_or_default()
    }
}

/// Network parameters from `/network/config`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub chain_id: String,
    pub min_gas_price: u64,
    pub min_transaction_version: u32,
}

/// Relayer ed25519 key for transactions and gossip envelopes
pub struct MxKey {
    keypair: Redacted<ed25519::Keypair>,
    public_key: [u8; 32],
    address: String,
}

impl MxKey {
    /// Build from the 32-byte ed25519 seed
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let mut seed = seed.to_vec();
        let secret = ed25519::SecretKey::try_from_bytes(&mut seed)
            .map_err(|e| eyre!("Invalid ed25519 seed: {}", e))?;
        let keypair = ed25519::Keypair::from(secret);
        let public_key = keypair.public().to_bytes();
        let address = encode_mx_address(&public_key)?;

        Ok(Self {
            keypair: Redacted(keypair),
            public_key,
            address,
        })
    }

    /// Parse a wallet PEM: base64 of the hex encoding of `seed ‖ public key`
    pub fn from_pem(pem: &str) -> Result<Self> {
        let body: String = pem
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("-----"))
            .collect();
        let hex_key = STANDARD
            .decode(body.as_bytes())
            .wrap_err("PEM body is not valid base64")?;
        let raw = hex::decode(&hex_key).wrap_err("PEM body is not hex encoded")?;
        if raw.len() != 64 && raw.len() != 32 {
            return Err(eyre!("Unexpected key length in PEM: {} bytes", raw.len()));
        }

        let key = Self::from_seed(&raw[..32])?;
        if raw.len() == 64 && raw[32..] != key.public_key {
            return Err(eyre!("PEM public key does not match its seed"));
        }
        Ok(key)
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read MultiversX key file {}", path.display()))?;
        let key = Self::from_pem(&contents)?;
        info!(address = %key.address, "MultiversX relayer key loaded");
        Ok(key)
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Bech32 address of the key
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.expose().sign(message)
    }

    /// Fill in the hex signature of `tx`
    pub fn sign_transaction(&self, tx: &mut Transaction) -> Result<()> {
        let bytes = tx.signing_bytes()?;
        tx.signature = Some(hex::encode(self.sign(&bytes)));
        Ok(())
    }
}

/// Check an ed25519 signature made by `public_key`
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match ed25519::PublicKey::try_from_bytes(public_key) {
        Ok(key) => key.verify(message, signature),
        Err(_) => false,
    }
}
