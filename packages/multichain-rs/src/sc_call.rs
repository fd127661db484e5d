//! Smart-contract call data attached to deposits
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! 0x00                                     no call
//! 0x01 | u32 len | endpoint | u64 len | gas (<= 8 bytes) | u32 argc | (u32 len | arg)*
//! ```

use thiserror::Error;

pub const MISSING_DATA_PROTOCOL_MARKER: u8 = 0x00;
pub const DATA_PRESENT_PROTOCOL_MARKER: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScCallError {
    #[error("callData too short for protocol indicator")]
    TooShort,
    #[error("callData unexpected protocol indicator: {0}")]
    UnexpectedProtocolIndicator(u8),
    #[error("callData too short while extracting {0}")]
    Truncated(&'static str),
    #[error("callData gas limit uses {0} bytes, at most 8 allowed")]
    GasLimitTooLong(usize),
}

/// Decoded call request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScCallData {
    pub endpoint: String,
    pub gas_limit: u64,
    pub arguments: Vec<Vec<u8>>,
}

impl ScCallData {
    /// Decode raw call data; `Ok(None)` for the "no call" marker
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ScCallError> {
        let (marker, mut rest) = data.split_first().ok_or(ScCallError::TooShort)?;
        match *marker {
            MISSING_DATA_PROTOCOL_MARKER => return Ok(None),
            DATA_PRESENT_PROTOCOL_MARKER => {}
            other => return Err(ScCallError::UnexpectedProtocolIndicator(other)),
        }

        let endpoint = take_len_prefixed(&mut rest, "endpoint")?;

        let gas_len = take_u64(&mut rest, "gas limit length")? as usize;
        if gas_len > 8 {
            return Err(ScCallError::GasLimitTooLong(gas_len));
        }
        let gas_bytes = take(&mut rest, gas_len, "gas limit")?;
        let mut padded = [0u8; 8];
        padded[8 - gas_len..].copy_from_slice(gas_bytes);
        let gas_limit = u64::from_be_bytes(padded);

        let argc = take_u32(&mut rest, "numArguments length")?;
        let mut arguments = Vec::new();
        for _ in 0..argc {
            arguments.push(take_len_prefixed(&mut rest, "argument")?.to_vec());
        }

        Ok(Some(Self {
            endpoint: String::from_utf8_lossy(endpoint).into_owned(),
            gas_limit,
            arguments,
        }))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![DATA_PRESENT_PROTOCOL_MARKER];
        out.extend_from_slice(&(self.endpoint.len() as u32).to_be_bytes());
        out.extend_from_slice(self.endpoint.as_bytes());
        out.extend_from_slice(&8u64.to_be_bytes());
        out.extend_from_slice(&self.gas_limit.to_be_bytes());
        out.extend_from_slice(&(self.arguments.len() as u32).to_be_bytes());
        for arg in &self.arguments {
            out.extend_from_slice(&(arg.len() as u32).to_be_bytes());
            out.extend_from_slice(arg);
        }
        out
    }
}

/// Human readable form used in logs; empty string when no call is attached
pub fn display_sc_call_data(data: &[u8]) -> Result<String, ScCallError> {
    Ok(match ScCallData::decode(data)? {
        None => String::new(),
        Some(call) => {
            let args: Vec<String> = call
                .arguments
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect();
            format!(
                "Endpoint: {}, Gas: {}, Arguments: {}",
                call.endpoint,
                call.gas_limit,
                args.join("@")
            )
        }
    })
}

/// Gas requested by the call, zero when the data is absent or malformed
pub fn extra_gas(data: &[u8]) -> u64 {
    ScCallData::decode(data)
        .ok()
        .flatten()
        .map(|c| c.gas_limit)
        .unwrap_or(0)
}

fn take<'a>(rest: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8], ScCallError> {
    if rest.len() < n {
        return Err(ScCallError::Truncated(what));
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

fn take_u32(rest: &mut &[u8], what: &'static str) -> Result<u32, ScCallError> {
    let bytes = take(rest, 4, what)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_u64(rest: &mut &[u8], what: &'static str) -> Result<u64, ScCallError> {
    let bytes = take(rest, 8, what)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

fn take_len_prefixed<'a>(
    rest: &mut &'a [u8],
    what: &'static str,
) -> Result<&'a [u8], ScCallError> {
    let len = take_u32(rest, what)? as usize;
    take(rest, len, what)
}
