//! Error classification and bounded retries for chain calls
//!
//! Submission errors are classified by message because both the EVM JSON-RPC
//! nodes and the MultiversX gateway only report them as strings.

use eyre::Result;
use std::time::Duration;
use tracing::{debug, warn};

/// Resubmission and backoff settings
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts after the first one
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Gas price increase per resend, in percent of the original price
    pub gas_bump_percent: u32,
    /// Cap on the bumped price, as a multiple of the original price
    pub max_gas_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            gas_bump_percent: 20,
            max_gas_multiplier: 3.0,
        }
    }
}

impl RetryConfig {
    /// Backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(backoff_secs.min(self.max_backoff.as_secs_f64()))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Gas price for the n-th resend of a transaction first sent at `base_gas_price`
    pub fn gas_price_for_attempt(&self, base_gas_price: u128, attempt: u32) -> u128 {
        if attempt == 0 {
            return base_gas_price;
        }

        let multiplier = 1.0 + (self.gas_bump_percent as f64 / 100.0) * (attempt as f64);
        let capped_multiplier = multiplier.min(self.max_gas_multiplier);

        (base_gas_price as f64 * capped_multiplier) as u128
    }
}

/// Classes of chain errors that drive resync and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC timeout, connection reset, throttling
    Transient,
    /// Gas price below what the node accepts
    Underpriced,
    /// The cached nonce is behind the chain; resync required
    NonceTooLow,
    NonceTooHigh,
    /// Node refused the transaction because its pool is saturated
    MempoolFull,
    /// Reverts, bad signatures, insufficient funds
    Permanent,
    Unknown,
}

impl ErrorClass {
    /// Errors after which the local nonce cache can no longer be trusted
    pub fn requires_nonce_resync(&self) -> bool {
        matches!(self, ErrorClass::NonceTooLow | ErrorClass::MempoolFull)
    }
}

pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("nonce too low")
        || error_lower.contains("lowernonceintx")
        || error_lower.contains("already known")
    {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("nonce too high") || error_lower.contains("veryhighnonceintx") {
        return ErrorClass::NonceTooHigh;
    }

    if error_lower.contains("mempool full")
        || error_lower.contains("txpool is full")
        || error_lower.contains("too many transactions")
        || error_lower.contains("insufficient capacity")
    {
        return ErrorClass::MempoolFull;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("insufficient gas price")
    {
        return ErrorClass::Underpriced;
    }

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("already executed")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Run `operation` until it succeeds, retrying transient and unknown failures with backoff
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let class = classify_error(&e.to_string());
                let retriable = matches!(
                    class,
                    ErrorClass::Transient | ErrorClass::Unknown | ErrorClass::MempoolFull
                );
                if !retriable || !config.should_retry(attempt) {
                    debug!(what, attempt, ?class, "Giving up");
                    return Err(e);
                }

                let backoff = config.backoff_for_attempt(attempt);
                warn!(
                    what,
                    attempt,
                    max = config.max_retries,
                    ?backoff,
                    error = %e,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
