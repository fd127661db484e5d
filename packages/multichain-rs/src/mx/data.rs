//! `function@arg@arg` call data and gas budgeting for the MultiversX multisig

use alloy::primitives::U256;

use super::query::{u256_to_min_bytes, u64_to_min_bytes};
use crate::address_codec::is_mx_smart_contract;
use crate::sc_call::extra_gas;
use crate::types::TransferBatch;

pub const PROPOSE_TRANSFER_FUNC: &str = "proposeMultiTransferEsdtBatch";
pub const PROPOSE_SET_STATUS_FUNC: &str = "proposeEsdtSafeSetCurrentTransactionBatchStatus";
pub const SIGN_FUNC: &str = "sign";
pub const PERFORM_ACTION_FUNC: &str = "performAction";

/// Ordered hex arguments of a call or query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxDataBuilder {
    function: String,
    args: Vec<String>,
}

impl TxDataBuilder {
    pub fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg_u64(mut self, value: u64) -> Self {
        self.args.push(hex::encode(u64_to_min_bytes(value)));
        self
    }

    pub fn arg_u256(mut self, value: U256) -> Self {
        self.args.push(hex::encode(u256_to_min_bytes(value)));
        self
    }

    pub fn arg_bytes(mut self, value: &[u8]) -> Self {
        self.args.push(hex::encode(value));
        self
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Hex arguments, as sent in a VM query
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Transaction data field: `function@arg1@arg2…`
    pub fn to_data_string(&self) -> String {
        let mut out = self.function.clone();
        for arg in &self.args {
            out.push('@');
            out.push_str(arg);
        }
        out
    }
}

/// Deposit arguments shared by the transfer proposal and its lookup queries
pub fn add_transfer_args(mut builder: TxDataBuilder, batch: &TransferBatch) -> TxDataBuilder {
    builder = builder.arg_u64(batch.id);
    for deposit in &batch.deposits {
        builder = builder
            .arg_bytes(&deposit.from_bytes)
            .arg_bytes(&deposit.to_bytes)
            .arg_bytes(&deposit.converted_token_bytes)
            .arg_u256(deposit.amount)
            .arg_u64(deposit.nonce);
        if let Some(data) = sc_data_for(deposit) {
            builder = builder.arg_bytes(data).arg_u64(extra_gas(data));
        }
    }
    builder
}

/// Batch id followed by one single-byte argument per status
pub fn add_status_args(mut builder: TxDataBuilder, batch: &TransferBatch) -> TxDataBuilder {
    builder = builder.arg_u64(batch.id);
    for status in &batch.statuses {
        builder = builder.arg_bytes(&[*status]);
    }
    builder
}

fn sc_data_for(deposit: &crate::types::Deposit) -> Option<&[u8]> {
    if !is_mx_smart_contract(&deposit.to_bytes) {
        return None;
    }
    deposit.sc_call_data.as_deref()
}

/// Gas budget per MultiversX multisig operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasMap {
    pub sign: u64,
    pub propose_transfer_base: u64,
    pub propose_transfer_for_each: u64,
    pub propose_status_base: u64,
    pub propose_status_for_each: u64,
    pub perform_action_base: u64,
    pub perform_action_for_each: u64,
    pub sc_call_per_byte: u64,
    pub sc_call_perform_for_each: u64,
}

impl Default for GasMap {
    fn default() -> Self {
        Self {
            sign: 8_000_000,
            propose_transfer_base: 11_000_000,
            propose_transfer_for_each: 5_500_000,
            propose_status_base: 10_000_000,
            propose_status_for_each: 7_000_000,
            perform_action_base: 40_000_000,
            perform_action_for_each: 5_500_000,
            sc_call_per_byte: 100_000,
            sc_call_perform_for_each: 10_000_000,
        }
    }
}

impl GasMap {
    /// Name of the first zero entry, if any
    pub fn first_zero_entry(&self) -> Option<&'static str> {
        [
            ("sign", self.sign),
            ("propose_transfer_base", self.propose_transfer_base),
            ("propose_transfer_for_each", self.propose_transfer_for_each),
            ("propose_status_base", self.propose_status_base),
            ("propose_status_for_each", self.propose_status_for_each),
            ("perform_action_base", self.perform_action_base),
            ("perform_action_for_each", self.perform_action_for_each),
            ("sc_call_per_byte", self.sc_call_per_byte),
            ("sc_call_perform_for_each", self.sc_call_perform_for_each),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0)
        .map(|(name, _)| name)
    }

    pub fn propose_transfer(&self, batch: &TransferBatch) -> u64 {
        self.propose_transfer_base
            + batch.deposits.len() as u64 * self.propose_transfer_for_each
            + self.sc_calls_gas(batch, false)
    }

    pub fn propose_status(&self, batch: &TransferBatch) -> u64 {
        self.propose_status_base + batch.deposits.len() as u64 * self.propose_status_for_each
    }

    pub fn perform_action(&self, batch: &TransferBatch) -> u64 {
        self.perform_action_base
            + batch.statuses.len() as u64 * self.perform_action_for_each
            + self.sc_calls_gas(batch, true)
    }

    fn sc_calls_gas(&self, batch: &TransferBatch, perform: bool) -> u64 {
        batch
            .deposits
            .iter()
            .filter_map(sc_data_for)
            .map(|data| {
                // separator plus hex-doubled payload
                let len = 1 + 2 * data.len() as u64;
                let mut gas = len * self.sc_call_per_byte;
                if perform {
                    gas += self.sc_call_perform_for_each;
                }
                gas
            })
            .sum()
    }
}
