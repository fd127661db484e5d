//! Mock Deposit Helpers
//!
//! Builders for deposits and batches in either direction.

use alloy::primitives::U256;

use crate::address_codec::{display_mx_address, encode_evm_address};
use crate::types::{Deposit, Direction, TransferBatch};

/// Builder for creating mock deposits
pub struct MockDepositBuilder {
    direction: Direction,
    nonce: u64,
    from: Vec<u8>,
    to: Vec<u8>,
    token: Vec<u8>,
    converted_token: Vec<u8>,
    amount: U256,
    sc_call_data: Option<Vec<u8>>,
}

impl MockDepositBuilder {
    /// Defaults to an EVM to MultiversX deposit
    pub fn new(direction: Direction) -> Self {
        let (from, to, token, converted_token) = match direction {
            Direction::EthToMx => (
                vec![0xaa; 20],
                vec![0x01; 32],
                vec![0x11; 20],
                b"TKN-111111".to_vec(),
            ),
            Direction::MxToEth => (
                vec![0x01; 32],
                vec![0xaa; 20],
                b"TKN-111111".to_vec(),
                vec![0x11; 20],
            ),
        };
        Self {
            direction,
            nonce: 1,
            from,
            to,
            token,
            converted_token,
            amount: U256::from(1_000_000u64),
            sc_call_data: None,
        }
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn amount(mut self, amount: u64) -> Self {
        self.amount = U256::from(amount);
        self
    }

    pub fn to(mut self, to: Vec<u8>) -> Self {
        self.to = to;
        self
    }

    /// Source and destination token identifiers
    pub fn tokens(mut self, token: Vec<u8>, converted: Vec<u8>) -> Self {
        self.token = token;
        self.converted_token = converted;
        self
    }

    pub fn sc_call_data(mut self, data: Vec<u8>) -> Self {
        self.sc_call_data = Some(data);
        self
    }

    pub fn build(self) -> Deposit {
        let (display_from, display_to, display_token) = match self.direction {
            Direction::EthToMx => (
                encode_evm_address(&self.from),
                display_mx_address(&self.to),
                encode_evm_address(&self.token),
            ),
            Direction::MxToEth => (
                display_mx_address(&self.from),
                encode_evm_address(&self.to),
                String::from_utf8_lossy(&self.token).into_owned(),
            ),
        };
        Deposit {
            nonce: self.nonce,
            from_bytes: self.from,
            display_from,
            to_bytes: self.to,
            display_to,
            token_bytes: self.token,
            display_token,
            converted_token_bytes: self.converted_token,
            amount: self.amount,
            sc_call_data: self.sc_call_data,
        }
    }
}

/// A batch of `count` deposits with consecutive nonces starting at `first_nonce`
pub fn mock_batch(direction: Direction, id: u64, first_nonce: u64, count: u64) -> TransferBatch {
    let deposits = (0..count)
        .map(|i| {
            MockDepositBuilder::new(direction)
                .nonce(first_nonce + i)
                .amount(1_000 * (i + 1))
                .build()
        })
        .collect();
    TransferBatch::new(id, deposits)
}

/// Smart-contract address on MultiversX (eight leading zero bytes)
pub fn mock_mx_contract_address(tag: u8) -> Vec<u8> {
    let mut address = vec![0u8; 32];
    address[8..].iter_mut().for_each(|b| *b = tag);
    address
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_codec::is_mx_smart_contract;

    #[test]
    fn test_mock_batch() {
        let batch = mock_batch(Direction::EthToMx, 346, 772635, 2);
        assert_eq!(batch.id, 346);
        assert!(batch.verify_nonces_follow(772634).is_ok());
        assert_eq!(batch.deposits[1].amount, U256::from(2_000u64));
    }

    #[test]
    fn test_directional_defaults() {
        let deposit = MockDepositBuilder::new(Direction::MxToEth).build();
        assert!(deposit.display_from.starts_with("erd1"));
        assert_eq!(deposit.converted_token_bytes.len(), 20);
    }

    #[test]
    fn test_contract_address() {
        assert!(is_mx_smart_contract(&mock_mx_contract_address(5)));
    }
}
