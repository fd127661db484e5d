//! Batch and deposit model shared by both halves of the bridge
//!
//! A [`TransferBatch`] is read from the source chain, proposed and executed on the
//! destination chain, then finalized on the source chain with a status vector.

use alloy::primitives::U256;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::keccak256;

// ============================================================================
// Direction
// ============================================================================

/// One half of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    EthToMx,
    MxToEth,
}

impl Direction {
    /// Name used for status handlers, metrics labels and log spans
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::EthToMx => "EthToMultiversX",
            Direction::MxToEth => "MultiversXToEth",
        }
    }

    /// Suffix of the `sign/<direction>` gossip topic
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            Direction::EthToMx => "eth-to-mx",
            Direction::MxToEth => "mx-to-eth",
        }
    }

    pub fn source_chain(&self) -> ChainKind {
        match self {
            Direction::EthToMx => ChainKind::Evm,
            Direction::MxToEth => ChainKind::Mx,
        }
    }

    pub fn destination_chain(&self) -> ChainKind {
        match self {
            Direction::EthToMx => ChainKind::Mx,
            Direction::MxToEth => ChainKind::Evm,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two chain families the relayer talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainKind {
    Evm,
    Mx,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Evm => "Ethereum",
            ChainKind::Mx => "MultiversX",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Deposit status
// ============================================================================

/// Final state of a deposit as reported by the destination chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DepositStatus {
    Pending = 0,
    Executed = 3,
    Rejected = 4,
}

impl DepositStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DepositStatus {
    type Error = eyre::Report;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DepositStatus::Pending),
            3 => Ok(DepositStatus::Executed),
            4 => Ok(DepositStatus::Rejected),
            other => Err(eyre!("Unknown deposit status code: {}", other)),
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepositStatus::Pending => write!(f, "pending"),
            DepositStatus::Executed => write!(f, "executed"),
            DepositStatus::Rejected => write!(f, "rejected"),
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Kind of multisig proposal derived from a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Transfer,
    SetStatus,
}

impl ActionKind {
    fn tag(&self) -> &'static [u8] {
        match self {
            ActionKind::Transfer => b"transfer",
            ActionKind::SetStatus => b"set-status",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Transfer => write!(f, "transfer"),
            ActionKind::SetStatus => write!(f, "set status"),
        }
    }
}

/// A proposal registered (or about to be registered) on a multisig.
///
/// `action_id` is `None` on chains that do not assign ids and instead collect
/// off-chain signatures over `fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub batch_id: u64,
    pub action_id: Option<u64>,
    pub fingerprint: [u8; 32],
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action_id {
            Some(id) => write!(f, "{} action {} for batch {}", self.kind, id, self.batch_id),
            None => write!(
                f,
                "{} action 0x{} for batch {}",
                self.kind,
                hex::encode(self.fingerprint),
                self.batch_id
            ),
        }
    }
}

// ============================================================================
// Deposit & batch
// ============================================================================

/// A single cross-chain transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub nonce: u64,
    pub from_bytes: Vec<u8>,
    pub display_from: String,
    pub to_bytes: Vec<u8>,
    pub display_to: String,
    pub token_bytes: Vec<u8>,
    pub display_token: String,
    /// Token identifier as registered on the destination chain
    pub converted_token_bytes: Vec<u8>,
    pub amount: U256,
    /// Raw call data (protocol marker included) for smart-contract recipients
    pub sc_call_data: Option<Vec<u8>>,
}

impl fmt::Display for Deposit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "to: {}, from: {}, token: {}, amount: {}, deposit nonce: {}",
            self.display_to, self.display_from, self.display_token, self.amount, self.nonce
        )
    }
}

/// An ordered group of deposits sharing one source-chain batch id
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferBatch {
    pub id: u64,
    pub deposits: Vec<Deposit>,
    pub statuses: Vec<u8>,
}

impl TransferBatch {
    pub fn new(id: u64, deposits: Vec<Deposit>) -> Self {
        let statuses = vec![DepositStatus::Pending.as_u8(); deposits.len()];
        Self {
            id,
            deposits,
            statuses,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deposits.is_empty()
    }

    /// Resize the status vector to the deposit count observed on the source chain.
    ///
    /// Entries added to reach `new_num` are `Rejected`; entries past `new_num` are dropped.
    pub fn resolve_new_deposits(&mut self, new_num: usize) {
        let old_num = self.statuses.len();
        if new_num == old_num {
            return;
        }

        self.statuses
            .resize(new_num, DepositStatus::Rejected.as_u8());

        tracing::debug!(
            batch_id = self.id,
            old_num,
            new_num,
            "Resolved status vector against source deposit count"
        );
    }

    /// Deposit nonces must be strictly increasing
    pub fn verify_nonces(&self) -> Result<()> {
        for pair in self.deposits.windows(2) {
            if pair[1].nonce <= pair[0].nonce {
                return Err(eyre!(
                    "Batch {} has non-increasing deposit nonces: {} then {}",
                    self.id,
                    pair[0].nonce,
                    pair[1].nonce
                ));
            }
        }
        Ok(())
    }

    /// Deposit nonces must continue right after the last executed one
    pub fn verify_nonces_follow(&self, last_executed_nonce: u64) -> Result<()> {
        self.verify_nonces()?;

        let mut last = last_executed_nonce;
        for deposit in &self.deposits {
            let expected = last.checked_add(1).ok_or_else(|| {
                eyre!(
                    "Batch {} deposit nonce {} overflows after {}",
                    self.id,
                    deposit.nonce,
                    last
                )
            })?;
            if deposit.nonce != expected {
                return Err(eyre!(
                    "Batch {} has invalid deposit nonce {}, expected {}",
                    self.id,
                    deposit.nonce,
                    expected
                ));
            }
            last = expected;
        }
        Ok(())
    }

    pub fn statuses_match_deposits(&self) -> bool {
        self.statuses.len() == self.deposits.len()
    }

    /// Per-token sums keyed by destination token, in first-seen order
    pub fn cumulated_transfers(&self) -> Vec<(Vec<u8>, U256)> {
        let mut totals: Vec<(Vec<u8>, U256)> = Vec::new();
        for deposit in &self.deposits {
            match totals
                .iter_mut()
                .find(|(token, _)| token == &deposit.converted_token_bytes)
            {
                Some((_, sum)) => *sum = sum.saturating_add(deposit.amount),
                None => totals.push((deposit.converted_token_bytes.clone(), deposit.amount)),
            }
        }
        totals
    }

    /// Deterministic hash of the proposal contents for `kind`
    pub fn fingerprint(&self, kind: ActionKind) -> [u8; 32] {
        let mut data = Vec::with_capacity(64 + self.deposits.len() * 128);
        data.extend_from_slice(kind.tag());
        data.extend_from_slice(&self.id.to_be_bytes());
        match kind {
            ActionKind::Transfer => {
                for deposit in &self.deposits {
                    data.extend_from_slice(&deposit.nonce.to_be_bytes());
                    push_len_prefixed(&mut data, &deposit.from_bytes);
                    push_len_prefixed(&mut data, &deposit.to_bytes);
                    push_len_prefixed(&mut data, &deposit.converted_token_bytes);
                    data.extend_from_slice(&deposit.amount.to_be_bytes::<32>());
                    push_len_prefixed(&mut data, deposit.sc_call_data.as_deref().unwrap_or(&[]));
                }
            }
            ActionKind::SetStatus => data.extend_from_slice(&self.statuses),
        }
        keccak256(&data)
    }
}

fn push_len_prefixed(data: &mut Vec<u8>, bytes: &[u8]) {
    data.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    data.extend_from_slice(bytes);
}

impl fmt::Display for TransferBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch id {}:", self.id)?;
        for deposit in &self.deposits {
            write!(f, "\n  {}", deposit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn deposit(nonce: u64, token: u8, amount: u64) -> Deposit {
        Deposit {
            nonce,
            from_bytes: vec![1; 20],
            display_from: "from".to_string(),
            to_bytes: vec![2; 32],
            display_to: "to".to_string(),
            token_bytes: vec![token; 20],
            display_token: format!("token-{}", token),
            converted_token_bytes: vec![token; 10],
            amount: U256::from(amount),
            sc_call_data: None,
        }
    }

    #[test]
    fn test_new_batch_starts_pending() {
        let batch = TransferBatch::new(1, vec![deposit(1, 1, 10), deposit(2, 1, 20)]);
        assert_eq!(batch.statuses, vec![0, 0]);
        assert!(batch.statuses_match_deposits());
    }

    #[test]
    fn test_resolve_new_deposits_grows_with_rejected() {
        let mut batch = TransferBatch::new(1, vec![deposit(1, 1, 10), deposit(2, 1, 20)]);
        batch.statuses = vec![3, 3];

        batch.resolve_new_deposits(3);
        assert_eq!(batch.statuses, vec![3, 3, 4]);

        batch.resolve_new_deposits(3);
        assert_eq!(batch.statuses, vec![3, 3, 4]);
    }

    #[test]
    fn test_resolve_new_deposits_shrinks() {
        let mut batch = TransferBatch::new(1, vec![]);
        batch.statuses = vec![3, 4, 3];
        batch.resolve_new_deposits(2);
        assert_eq!(batch.statuses, vec![3, 4]);
    }

    #[test]
    fn test_verify_nonces() {
        let batch = TransferBatch::new(7, vec![deposit(5, 1, 1), deposit(6, 1, 1)]);
        assert!(batch.verify_nonces().is_ok());
        assert!(batch.verify_nonces_follow(4).is_ok());
        assert!(batch.verify_nonces_follow(3).is_err());

        let bad = TransferBatch::new(7, vec![deposit(6, 1, 1), deposit(6, 1, 1)]);
        assert!(bad.verify_nonces().is_err());
    }

    #[test]
    fn test_verify_nonces_follow_at_u64_max() {
        let batch = TransferBatch::new(7, vec![deposit(1, 1, 1)]);
        let err = batch.verify_nonces_follow(u64::MAX).unwrap_err();
        assert!(err.to_string().contains("overflows"));

        let last = TransferBatch::new(7, vec![deposit(u64::MAX, 1, 1)]);
        assert!(last.verify_nonces_follow(u64::MAX - 1).is_ok());
    }

    #[test]
    fn test_cumulated_transfers_keeps_first_seen_order() {
        let batch = TransferBatch::new(
            1,
            vec![deposit(1, 9, 10), deposit(2, 3, 5), deposit(3, 9, 7)],
        );
        let totals = batch.cumulated_transfers();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0], (vec![9; 10], U256::from(17)));
        assert_eq!(totals[1], (vec![3; 10], U256::from(5)));
    }

    #[test]
    fn test_fingerprint_depends_on_kind_and_statuses() {
        let mut batch = TransferBatch::new(1, vec![deposit(1, 1, 10)]);
        let transfer = batch.fingerprint(ActionKind::Transfer);
        let status = batch.fingerprint(ActionKind::SetStatus);
        assert_ne!(transfer, status);

        batch.statuses = vec![3];
        assert_ne!(status, batch.fingerprint(ActionKind::SetStatus));
        assert_eq!(transfer, batch.fingerprint(ActionKind::Transfer));
    }

    #[test]
    fn test_deposit_status_codes() {
        assert_eq!(DepositStatus::try_from(3).unwrap(), DepositStatus::Executed);
        assert_eq!(DepositStatus::try_from(4).unwrap(), DepositStatus::Rejected);
        assert!(DepositStatus::try_from(2).is_err());
    }

    proptest! {
        #[test]
        fn test_status_vector_matches_source_count(
            initial in proptest::collection::vec(prop_oneof![Just(3u8), Just(4u8)], 0..20),
            source_count in 0usize..30,
        ) {
            let mut batch = TransferBatch::new(1, vec![]);
            batch.statuses = initial.clone();
            batch.resolve_new_deposits(source_count);

            prop_assert_eq!(batch.statuses.len(), source_count);
            for (i, status) in batch.statuses.iter().enumerate() {
                if i < initial.len() {
                    prop_assert_eq!(*status, initial[i]);
                } else {
                    prop_assert_eq!(*status, DepositStatus::Rejected.as_u8());
                }
            }
        }
    }
}
