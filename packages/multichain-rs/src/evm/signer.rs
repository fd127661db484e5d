//! Relayer EVM key: message signing and signature recovery
//!
//! Relayers never sign transactions through this type directly; it produces the
//! 65-byte `r‖s‖v` signatures gossiped to peers and later handed to
//! `executeTransfer` / `finishCurrentPendingBatch`.

use alloy::{
    network::EthereumWallet,
    primitives::{Address, PrimitiveSignature, B256},
    signers::{local::PrivateKeySigner, SignerSync},
};
use eyre::{eyre, Result, WrapErr};
use std::path::Path;
use tracing::info;

use crate::redact::Redacted;

pub struct EvmCryptoHandler {
    signer: Redacted<PrivateKeySigner>,
    address: Address,
}

impl EvmCryptoHandler {
    /// Create from a hex private key (with or without 0x prefix)
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| eyre!("Invalid private key: {}", e))?;
        let address = signer.address();

        info!(address = %address, "EVM relayer key loaded");

        Ok(Self {
            signer: Redacted(signer),
            address,
        })
    }

    /// Load a hex private key from a file
    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read EVM key file {}", path.display()))?;
        Self::from_private_key(&contents)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Wallet used by the provider to sign outgoing transactions
    pub fn wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.expose().clone())
    }

    /// Sign an already prefixed 32-byte message hash
    pub fn sign(&self, message_hash: &[u8; 32]) -> Result<Vec<u8>> {
        let signature = self
            .signer
            .expose()
            .sign_hash_sync(&B256::from(*message_hash))
            .map_err(|e| eyre!("Failed to sign message hash: {}", e))?;
        Ok(signature.as_bytes().to_vec())
    }
}

/// Recover the address that produced `signature` over `message_hash`
pub fn recover_signer(message_hash: &[u8; 32], signature: &[u8]) -> Result<Address> {
    if signature.len() != 65 {
        return Err(eyre!(
            "Invalid signature length: expected 65 bytes, got {}",
            signature.len()
        ));
    }
    let signature = PrimitiveSignature::try_from(signature)
        .map_err(|e| eyre!("Malformed signature: {}", e))?;
    signature
        .recover_address_from_prehash(&B256::from(*message_hash))
        .map_err(|e| eyre!("Signature recovery failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{keccak256, to_eth_signed_message_hash};

    // anvil account #0
    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_address_from_key() {
        let handler = EvmCryptoHandler::from_private_key(KEY).unwrap();
        assert_eq!(
            handler.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
                .parse::<Address>()
                .unwrap()
        );
    }

    #[test]
    fn test_sign_and_recover() {
        let handler = EvmCryptoHandler::from_private_key(KEY).unwrap();
        let hash = to_eth_signed_message_hash(&keccak256(b"batch"));

        let signature = handler.sign(&hash).unwrap();
        assert_eq!(signature.len(), 65);
        assert_eq!(recover_signer(&hash, &signature).unwrap(), handler.address());

        let other = to_eth_signed_message_hash(&keccak256(b"other"));
        assert_ne!(recover_signer(&other, &signature).unwrap(), handler.address());
    }

    #[test]
    fn test_recover_rejects_short_signature() {
        assert!(recover_signer(&[0u8; 32], &[1u8; 64]).is_err());
    }

    #[test]
    fn test_debug_output_hides_key() {
        let handler = EvmCryptoHandler::from_private_key(KEY).unwrap();
        assert_eq!(format!("{:?}", handler.signer), "<redacted>");
    }
}
