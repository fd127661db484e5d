//! Address encoding for both bridge chains
//!
//! MultiversX addresses are 32-byte public keys rendered as bech32 with the `erd`
//! prefix. Smart-contract addresses are recognised by eight leading zero bytes.
//! EVM addresses are 20 bytes rendered as 0x-prefixed hex.

use bech32::{self, FromBase32, ToBase32, Variant};
use eyre::{eyre, Result};

/// Human readable part of MultiversX addresses
pub const MX_HRP: &str = "erd";

/// Length of a MultiversX address / public key
pub const MX_ADDRESS_LEN: usize = 32;

/// Leading zero bytes reserved for smart-contract addresses
const SC_ADDRESS_ZERO_PREFIX: usize = 8;

/// Encode a 32-byte public key as an `erd1…` address
pub fn encode_mx_address(bytes: &[u8]) -> Result<String> {
    if bytes.len() != MX_ADDRESS_LEN {
        return Err(eyre!(
            "Invalid MultiversX address length: expected {} bytes, got {}",
            MX_ADDRESS_LEN,
            bytes.len()
        ));
    }
    bech32::encode(MX_HRP, bytes.to_base32(), Variant::Bech32)
        .map_err(|e| eyre!("Failed to encode bech32: {}", e))
}

/// Decode an `erd1…` address into its 32-byte public key
pub fn decode_mx_address(addr: &str) -> Result<[u8; 32]> {
    let (hrp, data, _variant) =
        bech32::decode(addr).map_err(|e| eyre!("Invalid bech32 address: {}", e))?;

    if hrp != MX_HRP {
        return Err(eyre!("Expected '{}' prefix, got '{}'", MX_HRP, hrp));
    }

    let bytes = Vec::<u8>::from_base32(&data).map_err(|e| eyre!("Invalid base32 data: {}", e))?;
    if bytes.len() != MX_ADDRESS_LEN {
        return Err(eyre!(
            "Invalid address length: expected {} bytes, got {}",
            MX_ADDRESS_LEN,
            bytes.len()
        ));
    }

    let mut result = [0u8; 32];
    result.copy_from_slice(&bytes);
    Ok(result)
}

/// Render raw bytes for logs: bech32 when they form a valid MX address, hex otherwise
pub fn display_mx_address(bytes: &[u8]) -> String {
    encode_mx_address(bytes).unwrap_or_else(|_| hex::encode(bytes))
}

/// True for MultiversX smart-contract addresses
pub fn is_mx_smart_contract(bytes: &[u8]) -> bool {
    bytes.len() == MX_ADDRESS_LEN && bytes[..SC_ADDRESS_ZERO_PREFIX].iter().all(|b| *b == 0)
}

/// Parse a 0x-prefixed hex EVM address to 20 bytes
pub fn parse_evm_address(addr: &str) -> Result<[u8; 20]> {
    let hex_str = addr.strip_prefix("0x").unwrap_or(addr);

    if hex_str.len() != 40 {
        return Err(eyre!(
            "Invalid EVM address length: expected 40 hex chars, got {}",
            hex_str.len()
        ));
    }

    let bytes = hex::decode(hex_str)?;
    let mut result = [0u8; 20];
    result.copy_from_slice(&bytes);
    Ok(result)
}

/// Encode 20 bytes to EVM hex string with 0x prefix
pub fn encode_evm_address(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTISIG: &str = "erd1qqqqqqqqqqqqqpgqzyuaqg3dl7rqlkudrsnm5ek0j3a97qevd8sszj0glf";

    #[test]
    fn test_mx_address_roundtrip() {
        let raw = decode_mx_address(MULTISIG).unwrap();
        assert_eq!(encode_mx_address(&raw).unwrap(), MULTISIG);
    }

    #[test]
    fn test_contract_address_detection() {
        let raw = decode_mx_address(MULTISIG).unwrap();
        assert!(is_mx_smart_contract(&raw));

        let wallet = [0x11u8; 32];
        assert!(!is_mx_smart_contract(&wallet));
        assert!(!is_mx_smart_contract(&[0u8; 20]));
    }

    #[test]
    fn test_decode_rejects_foreign_prefix() {
        let terra = "terra1x46rqay4d3cssq8gxxvqz8xt6nwlz4td20k38v";
        assert!(decode_mx_address(terra).is_err());
    }

    #[test]
    fn test_display_falls_back_to_hex() {
        assert_eq!(display_mx_address(&[0xab, 0xcd]), "abcd");
        assert!(display_mx_address(&[1u8; 32]).starts_with("erd1"));
    }

    #[test]
    fn test_evm_address_parse() {
        let addr = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
        let raw = parse_evm_address(addr).unwrap();
        assert_eq!(encode_evm_address(&raw), addr.to_lowercase());
        assert!(parse_evm_address("0x1234").is_err());
    }
}
