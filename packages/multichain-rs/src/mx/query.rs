//! VM query responses from the MultiversX gateway
//!
//! A query answers with an ordered list of byte vectors; these helpers turn
//! them into typed values with the conventions the bridge contracts use.

use alloy::primitives::U256;
use thiserror::Error;

use crate::address_codec::{display_mx_address, encode_evm_address};
use crate::types::{Deposit, TransferBatch};

pub const OK_RETURN_CODE: &str = "ok";

/// Number of vectors per deposit in `getCurrentTxBatch`
const FIELDS_PER_DEPOSIT: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query {function} failed with code {code}: {message}")]
    NotOk {
        function: String,
        code: String,
        message: String,
    },
    #[error("empty response for {0}")]
    EmptyResponse(&'static str),
    #[error("value is not a valid uint64: 0x{0}")]
    NotUint64(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("batch {0} not finished")]
    BatchNotFinished(u64),
}

impl QueryError {
    /// The queried state does not exist yet; callers poll again later
    pub fn is_not_ready(&self) -> bool {
        matches!(self, QueryError::EmptyResponse(_) | QueryError::BatchNotFinished(_))
    }
}

/// Minimal big-endian bytes of `value`; zero encodes as no bytes
pub fn u64_to_min_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

pub fn u256_to_min_bytes(value: U256) -> Vec<u8> {
    let bytes = value.to_be_bytes::<32>();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

pub fn parse_u64(buff: &[u8]) -> Result<u64, QueryError> {
    let first = buff.iter().position(|b| *b != 0).unwrap_or(buff.len());
    let significant = &buff[first..];
    if significant.len() > 8 {
        return Err(QueryError::NotUint64(hex::encode(buff)));
    }
    let mut padded = [0u8; 8];
    padded[8 - significant.len()..].copy_from_slice(significant);
    Ok(u64::from_be_bytes(padded))
}

pub fn parse_u256(buff: &[u8]) -> Result<U256, QueryError> {
    let first = buff.iter().position(|b| *b != 0).unwrap_or(buff.len());
    let significant = &buff[first..];
    if significant.len() > 32 {
        return Err(QueryError::Malformed(format!(
            "amount uses {} bytes",
            significant.len()
        )));
    }
    Ok(U256::from_be_slice(significant))
}

/// First byte of the first vector equals 1; an empty answer is `false`
pub fn bool_from_response(response: &[Vec<u8>]) -> bool {
    response
        .first()
        .and_then(|first| first.first())
        .map_or(false, |b| *b == 1)
}

pub fn u64_from_response(response: &[Vec<u8>]) -> Result<u64, QueryError> {
    match response.first() {
        None => Ok(0),
        Some(first) => parse_u64(first),
    }
}

pub fn u256_from_response(response: &[Vec<u8>]) -> Result<U256, QueryError> {
    match response.first() {
        None => Ok(U256::ZERO),
        Some(first) => parse_u256(first),
    }
}

pub fn is_empty_response(response: &[Vec<u8>]) -> bool {
    response.is_empty() || (response.len() == 1 && response[0].is_empty())
}

/// `getStatusesAfterExecution`: `[isFinished, status...]`
pub fn statuses_from_response(batch_id: u64, response: &[Vec<u8>]) -> Result<Vec<u8>, QueryError> {
    let (finished, rest) = response
        .split_first()
        .ok_or(QueryError::EmptyResponse("getStatusesAfterExecution"))?;
    if !finished.first().map_or(false, |b| *b == 1) {
        return Err(QueryError::BatchNotFinished(batch_id));
    }
    if rest.is_empty() {
        return Err(QueryError::Malformed(
            "status is finished, no results are given".to_string(),
        ));
    }
    rest.iter()
        .enumerate()
        .map(|(i, buff)| {
            buff.last()
                .copied()
                .ok_or_else(|| QueryError::Malformed(format!("empty status at index {}", i)))
        })
        .collect()
}

/// `getAllStakedRelayers`: one 32-byte public key per vector
pub fn relayers_from_response(response: &[Vec<u8>]) -> Result<Vec<[u8; 32]>, QueryError> {
    response
        .iter()
        .map(|buff| {
            <[u8; 32]>::try_from(buff.as_slice()).map_err(|_| {
                QueryError::Malformed(format!("relayer key has {} bytes", buff.len()))
            })
        })
        .collect()
}

/// `getCurrentTxBatch`: `[batch_id, (block_nonce, deposit_nonce, from, to, token, amount)...]`.
///
/// Returns `Ok(None)` when there is no batch. Token conversion is left to the caller.
pub fn batch_from_response(response: &[Vec<u8>]) -> Result<Option<TransferBatch>, QueryError> {
    if is_empty_response(response) {
        return Ok(None);
    }
    let (id, fields) = response.split_first().ok_or(QueryError::EmptyResponse("getCurrentTxBatch"))?;
    if fields.is_empty() || fields.len() % FIELDS_PER_DEPOSIT != 0 {
        return Err(QueryError::Malformed(format!(
            "got {} argument(s) for getCurrentTxBatch",
            response.len()
        )));
    }
    let id = parse_u64(id)?;

    let deposits = fields
        .chunks(FIELDS_PER_DEPOSIT)
        .map(|chunk| {
            // chunk[0] is the block nonce
            Ok(Deposit {
                nonce: parse_u64(&chunk[1])?,
                from_bytes: chunk[2].clone(),
                display_from: display_mx_address(&chunk[2]),
                to_bytes: chunk[3].clone(),
                display_to: encode_evm_address(&chunk[3]),
                token_bytes: chunk[4].clone(),
                display_token: String::from_utf8_lossy(&chunk[4]).into_owned(),
                converted_token_bytes: Vec::new(),
                amount: parse_u256(&chunk[5])?,
                sc_call_data: None,
            })
        })
        .collect::<Result<Vec<_>, QueryError>>()?;

    Ok(Some(TransferBatch::new(id, deposits)))
}
