//! Relayer error taxonomy
//!
//! Every failure that reaches a step boundary is mapped onto an [`ErrorKind`],
//! which decides the next step and labels the `relayer_errors_total` counter.

use multichain_rs::mx::{MxClientError, QueryError};
use multichain_rs::{classify_error, ErrorClass};
use thiserror::Error;

/// Policy classes for failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// RPC timeouts, stale nonces, full mempools
    Transient,
    /// Views that report "not yet": batch not final, action id not assigned
    NotReady,
    /// Configuration or contract state that needs an operator
    WrongSetup,
    /// Bad signatures or signers; a missing in-memory batch or action
    Integrity,
    /// Local failures during bootstrap
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::WrongSetup => "wrong_setup",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RelayerError {
    #[error("no batch stored")]
    NilBatch,

    #[error("no action stored")]
    NilAction,

    #[error("batch {batch_id} was already executed on the destination (last executed {last_executed})")]
    BatchAlreadyExecuted { batch_id: u64, last_executed: u64 },

    #[error("batch {0} not found")]
    BatchNotFound(u64),

    #[error("batch {0} has no final statuses yet")]
    NotFinished(u64),

    #[error("invalid action id 0 for batch {0}")]
    InvalidActionId(u64),

    #[error("invalid deposit nonce: {0}")]
    InvalidDepositNonce(String),

    #[error("quorum not reached: have {have} signatures, need {need}")]
    QuorumNotReached { have: usize, need: u64 },

    #[error("{chain} contract is paused")]
    Paused { chain: &'static str },

    #[error("token {token} exceeds max bridged amount: {amount} > {max}")]
    AmountAboveLimit {
        token: String,
        amount: String,
        max: String,
    },

    #[error("invalid setup: {0}")]
    InvalidSetup(String),

    #[error("balance mismatch for {token}: {detail}")]
    BalanceMismatch { token: String, detail: String },

    #[error("{chain} client unavailable: {reason}")]
    ClientUnavailable { chain: &'static str, reason: String },

    #[error("role data for {chain} is stale ({age_secs}s old)")]
    StaleRoles { chain: &'static str, age_secs: u64 },

    #[error("no role data loaded yet for {chain}")]
    RolesUnavailable { chain: &'static str },

    #[error("message rejected: {0}")]
    InvalidMessage(String),

    #[error("signer {0} is not whitelisted")]
    SignerNotWhitelisted(String),

    #[error("signature does not match claimed signer {claimed}, recovered {recovered}")]
    SignerMismatch { claimed: String, recovered: String },

    #[error("message nonce {got} from {peer} already seen or too far below {highest}")]
    ReplayedNonce { peer: String, got: u64, highest: u64 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayerError::BatchNotFound(_)
            | RelayerError::NotFinished(_)
            | RelayerError::InvalidActionId(_)
            | RelayerError::QuorumNotReached { .. }
            | RelayerError::Paused { .. }
            | RelayerError::StaleRoles { .. }
            | RelayerError::RolesUnavailable { .. } => ErrorKind::NotReady,
            RelayerError::BatchAlreadyExecuted { .. }
            | RelayerError::ClientUnavailable { .. } => ErrorKind::Transient,
            RelayerError::InvalidDepositNonce(_)
            | RelayerError::AmountAboveLimit { .. }
            | RelayerError::InvalidSetup(_)
            | RelayerError::BalanceMismatch { .. } => ErrorKind::WrongSetup,
            RelayerError::NilBatch
            | RelayerError::NilAction
            | RelayerError::InvalidMessage(_)
            | RelayerError::SignerNotWhitelisted(_)
            | RelayerError::SignerMismatch { .. }
            | RelayerError::ReplayedNonce { .. } => ErrorKind::Integrity,
            RelayerError::Config(_) => ErrorKind::Fatal,
        }
    }
}

/// Classify any error report that crossed a step boundary
pub fn classify(report: &eyre::Report) -> ErrorKind {
    if let Some(e) = report.downcast_ref::<RelayerError>() {
        return e.kind();
    }
    if let Some(e) = report.downcast_ref::<QueryError>() {
        return if e.is_not_ready() {
            ErrorKind::NotReady
        } else {
            ErrorKind::Transient
        };
    }
    if let Some(e) = report.downcast_ref::<MxClientError>() {
        return match e {
            MxClientError::Paused => ErrorKind::NotReady,
            MxClientError::NotWhitelisted(_) | MxClientError::UnknownToken(_) => {
                ErrorKind::WrongSetup
            }
        };
    }

    match classify_error(&format!("{:#}", report)) {
        ErrorClass::Permanent => ErrorKind::WrongSetup,
        _ => ErrorKind::Transient,
    }
}
