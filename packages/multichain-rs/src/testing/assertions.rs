//! Common Test Assertions
//!
//! Helpers for checking batch outcomes in scenario tests.

use crate::types::{DepositStatus, TransferBatch};
use eyre::{eyre, Result};

/// Assert that a status vector matches the expected one
pub fn assert_statuses_eq(actual: &[u8], expected: &[DepositStatus]) -> Result<()> {
    let expected: Vec<u8> = expected.iter().map(|s| s.as_u8()).collect();
    if actual != expected.as_slice() {
        return Err(eyre!(
            "Status mismatch: expected {:?}, got {:?}",
            expected,
            actual
        ));
    }
    Ok(())
}

/// Assert that no deposit of a finished batch is left pending
pub fn assert_batch_final(batch: &TransferBatch) -> Result<()> {
    if !batch.statuses_match_deposits() {
        return Err(eyre!(
            "Batch {} has {} statuses for {} deposits",
            batch.id,
            batch.statuses.len(),
            batch.deposits.len()
        ));
    }
    if let Some(index) = batch
        .statuses
        .iter()
        .position(|s| *s == DepositStatus::Pending.as_u8())
    {
        return Err(eyre!("Batch {} deposit {} still pending", batch.id, index));
    }
    Ok(())
}

/// Assert that a hash matches expected
pub fn assert_hash_eq(actual: &[u8; 32], expected: &[u8; 32]) -> Result<()> {
    if actual != expected {
        return Err(eyre!(
            "Hash mismatch: expected 0x{}, got 0x{}",
            hex::encode(expected),
            hex::encode(actual)
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock_batch;
    use crate::types::Direction;

    #[test]
    fn test_assert_statuses_eq() {
        assert!(assert_statuses_eq(&[3, 4], &[DepositStatus::Executed, DepositStatus::Rejected]).is_ok());
        assert!(assert_statuses_eq(&[3], &[DepositStatus::Rejected]).is_err());
    }

    #[test]
    fn test_assert_batch_final() {
        let mut batch = mock_batch(Direction::MxToEth, 1, 1, 2);
        assert!(assert_batch_final(&batch).is_err());
        batch.statuses = vec![3, 4];
        assert!(assert_batch_final(&batch).is_ok());
    }
}
