//! Per-sender nonce bookkeeping with background resends
//!
//! One handler exists per chain and is shared by both half-bridges. Submissions
//! from the same sender hold that sender's lock from nonce assignment until the
//! node answers, so nonces reach the node in program order.

use async_trait::async_trait;
use eyre::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{classify_error, RetryConfig};

/// Chain-specific submission primitives
#[async_trait]
pub trait TransactionSubmitter: Send + Sync + 'static {
    type Tx: Clone + Send + Sync + 'static;

    /// Next nonce the chain expects from `address`
    async fn account_nonce(&self, address: &str) -> Result<u64>;

    /// Hand a signed transaction to the node, returning its hash
    async fn submit(&self, tx: &Self::Tx) -> Result<String>;

    /// `original` re-priced for the given resend attempt, signed again where needed
    fn bump_gas_price(&self, original: &Self::Tx, attempt: u32) -> Result<Self::Tx>;
}

struct PendingTx<Tx> {
    /// As first submitted; resends re-price from this one
    original: Tx,
    hash: String,
    last_sent: Instant,
    attempts: u32,
}

struct AccountState<Tx> {
    next_nonce: Option<u64>,
    pending: BTreeMap<u64, PendingTx<Tx>>,
}

impl<Tx> Default for AccountState<Tx> {
    fn default() -> Self {
        Self {
            next_nonce: None,
            pending: BTreeMap::new(),
        }
    }
}

pub struct NonceTransactionsHandler<S: TransactionSubmitter> {
    chain: &'static str,
    submitter: Arc<S>,
    accounts: Mutex<HashMap<String, Arc<Mutex<AccountState<S::Tx>>>>>,
    resend_interval: Duration,
    retry: RetryConfig,
}

impl<S: TransactionSubmitter> NonceTransactionsHandler<S> {
    pub fn new(
        chain: &'static str,
        submitter: Arc<S>,
        resend_interval: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            chain,
            submitter,
            accounts: Mutex::new(HashMap::new()),
            resend_interval,
            retry,
        }
    }

    async fn account(&self, address: &str) -> Arc<Mutex<AccountState<S::Tx>>> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccountState::default())))
            .clone()
    }

    async fn cached_or_chain_nonce(
        &self,
        address: &str,
        state: &mut AccountState<S::Tx>,
    ) -> Result<u64> {
        match state.next_nonce {
            Some(nonce) => Ok(nonce),
            None => {
                let nonce = self.submitter.account_nonce(address).await?;
                debug!(chain = self.chain, address, nonce, "Loaded account nonce from chain");
                state.next_nonce = Some(nonce);
                Ok(nonce)
            }
        }
    }

    /// Return the next nonce for `address` and advance the cache
    pub async fn get_nonce(&self, address: &str) -> Result<u64> {
        let account = self.account(address).await;
        let mut state = account.lock().await;
        let nonce = self.cached_or_chain_nonce(address, &mut state).await?;
        state.next_nonce = Some(nonce + 1);
        Ok(nonce)
    }

    /// Reload the nonce from chain, never moving below transactions still in flight
    async fn resync(&self, address: &str, state: &mut AccountState<S::Tx>) -> Result<u64> {
        let chain_nonce = self.submitter.account_nonce(address).await?;
        state.pending = state.pending.split_off(&chain_nonce);
        let next = state
            .pending
            .keys()
            .next_back()
            .map(|highest| (highest + 1).max(chain_nonce))
            .unwrap_or(chain_nonce);
        info!(chain = self.chain, address, chain_nonce, next, "Resynced account nonce");
        state.next_nonce = Some(next);
        Ok(next)
    }

    /// Assign a nonce, build the transaction through `build`, and submit it.
    ///
    /// When the node reports a stale nonce or a full pool the nonce is reloaded
    /// and the transaction rebuilt and submitted one more time.
    pub async fn send_transaction<F>(&self, address: &str, build: F) -> Result<String>
    where
        F: Fn(u64) -> Result<S::Tx> + Send + Sync,
    {
        let account = self.account(address).await;
        let mut state = account.lock().await;

        let nonce = self.cached_or_chain_nonce(address, &mut state).await?;
        let tx = build(nonce)?;

        let (nonce, tx, hash) = match self.submitter.submit(&tx).await {
            Ok(hash) => (nonce, tx, hash),
            Err(e) if classify_error(&e.to_string()).requires_nonce_resync() => {
                warn!(chain = self.chain, address, nonce, error = %e, "Submission rejected, resyncing nonce");
                let nonce = self.resync(address, &mut state).await?;
                let tx = build(nonce)?;
                let hash = self.submitter.submit(&tx).await?;
                (nonce, tx, hash)
            }
            Err(e) => return Err(e),
        };

        state.pending.insert(
            nonce,
            PendingTx {
                original: tx,
                hash: hash.clone(),
                last_sent: Instant::now(),
                attempts: 0,
            },
        );
        state.next_nonce = Some(nonce + 1);

        debug!(chain = self.chain, address, nonce, tx_hash = %hash, "Transaction submitted");
        Ok(hash)
    }

    /// Number of submitted transactions not yet observed as included
    pub async fn pending_count(&self, address: &str) -> usize {
        let account = self.account(address).await;
        let state = account.lock().await;
        state.pending.len()
    }

    /// One pass over every sender: forget included transactions, resend stale ones
    pub async fn resend_pending(&self) -> Result<usize> {
        let accounts: Vec<(String, Arc<Mutex<AccountState<S::Tx>>>)> = {
            let accounts = self.accounts.lock().await;
            accounts
                .iter()
                .map(|(address, state)| (address.clone(), state.clone()))
                .collect()
        };

        let mut resent = 0;
        for (address, account) in accounts {
            let mut state = account.lock().await;
            if state.pending.is_empty() {
                continue;
            }

            let chain_nonce = self.submitter.account_nonce(&address).await?;
            state.pending = state.pending.split_off(&chain_nonce);
            if state.next_nonce.map_or(false, |next| next < chain_nonce) {
                state.next_nonce = Some(chain_nonce);
            }

            let mut dropped = Vec::new();
            for (nonce, pending) in state.pending.iter_mut() {
                if pending.last_sent.elapsed() < self.resend_interval {
                    continue;
                }
                if !self.retry.should_retry(pending.attempts) {
                    warn!(
                        chain = self.chain,
                        address = %address,
                        nonce,
                        tx_hash = %pending.hash,
                        "Dropping transaction after max resend attempts"
                    );
                    dropped.push(*nonce);
                    continue;
                }

                let attempt = pending.attempts + 1;
                let bumped = self.submitter.bump_gas_price(&pending.original, attempt)?;
                match self.submitter.submit(&bumped).await {
                    Ok(hash) => {
                        info!(
                            chain = self.chain,
                            address = %address,
                            nonce,
                            attempt,
                            tx_hash = %hash,
                            "Resent transaction with bumped gas price"
                        );
                        pending.hash = hash;
                        resent += 1;
                    }
                    Err(e) => {
                        warn!(chain = self.chain, address = %address, nonce, attempt, error = %e, "Resend failed");
                    }
                }
                pending.attempts = attempt;
                pending.last_sent = Instant::now();
            }

            for nonce in dropped {
                state.pending.remove(&nonce);
            }
        }

        Ok(resent)
    }

    /// Resend loop, runs until `cancel` fires. `on_resent` sees the count of each non-empty pass.
    pub async fn run_resend_loop<F>(self: Arc<Self>, cancel: CancellationToken, on_resent: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let mut ticker = tokio::time::interval(self.resend_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(chain = self.chain, "Nonce resend loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.resend_pending().await {
                        Ok(0) => {}
                        Ok(resent) => on_resent(resent),
                        Err(e) => warn!(chain = self.chain, error = %e, "Nonce resend pass failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::eyre;
    use proptest::prelude::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Debug)]
    struct FakeTx {
        nonce: u64,
        gas_price: u128,
    }

    #[derive(Default)]
    struct FakeChain {
        confirmed: StdMutex<u64>,
        submitted: StdMutex<Vec<(u64, u128)>>,
        fail_next: StdMutex<Option<String>>,
    }

    impl FakeChain {
        fn confirm_up_to(&self, nonce: u64) {
            let mut confirmed = self.confirmed.lock().unwrap();
            *confirmed = (*confirmed).max(nonce);
        }
    }

    #[async_trait]
    impl TransactionSubmitter for FakeChain {
        type Tx = FakeTx;

        async fn account_nonce(&self, _address: &str) -> Result<u64> {
            Ok(*self.confirmed.lock().unwrap())
        }

        async fn submit(&self, tx: &FakeTx) -> Result<String> {
            if let Some(err) = self.fail_next.lock().unwrap().take() {
                return Err(eyre!(err));
            }
            if tx.nonce < *self.confirmed.lock().unwrap() {
                return Err(eyre!("nonce too low"));
            }
            self.submitted.lock().unwrap().push((tx.nonce, tx.gas_price));
            Ok(format!("0x{:x}", tx.nonce))
        }

        fn bump_gas_price(&self, tx: &FakeTx, attempt: u32) -> Result<FakeTx> {
            Ok(FakeTx {
                nonce: tx.nonce,
                gas_price: RetryConfig::default().gas_price_for_attempt(100, attempt),
            })
        }
    }

    fn handler(chain: Arc<FakeChain>, resend: Duration) -> NonceTransactionsHandler<FakeChain> {
        NonceTransactionsHandler::new("test", chain, resend, RetryConfig::default())
    }

    fn build(nonce: u64) -> Result<FakeTx> {
        Ok(FakeTx {
            nonce,
            gas_price: 100,
        })
    }

    #[tokio::test]
    async fn test_first_use_loads_from_chain() {
        let chain = Arc::new(FakeChain::default());
        chain.confirm_up_to(42);
        let handler = handler(chain.clone(), Duration::from_secs(60));

        assert_eq!(handler.get_nonce("alice").await.unwrap(), 42);
        assert_eq!(handler.get_nonce("alice").await.unwrap(), 43);
        assert_eq!(handler.get_nonce("bob").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_send_assigns_consecutive_nonces() {
        let chain = Arc::new(FakeChain::default());
        let handler = handler(chain.clone(), Duration::from_secs(60));

        handler.send_transaction("alice", build).await.unwrap();
        handler.send_transaction("alice", build).await.unwrap();

        let submitted = chain.submitted.lock().unwrap().clone();
        assert_eq!(submitted, vec![(0, 100), (1, 100)]);
        assert_eq!(handler.pending_count("alice").await, 2);
    }

    #[tokio::test]
    async fn test_nonce_too_low_resyncs_and_retries_once() {
        let chain = Arc::new(FakeChain::default());
        let handler = handler(chain.clone(), Duration::from_secs(60));
        handler.send_transaction("alice", build).await.unwrap();

        // another process with the same key moved the account forward
        chain.confirm_up_to(10);
        handler.send_transaction("alice", build).await.unwrap();

        let submitted = chain.submitted.lock().unwrap().clone();
        assert_eq!(submitted.last().unwrap().0, 10);
        assert_eq!(handler.get_nonce("alice").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_other_errors_do_not_consume_nonce() {
        let chain = Arc::new(FakeChain::default());
        let handler = handler(chain.clone(), Duration::from_secs(60));

        *chain.fail_next.lock().unwrap() = Some("execution reverted".to_string());
        assert!(handler.send_transaction("alice", build).await.is_err());

        handler.send_transaction("alice", build).await.unwrap();
        assert_eq!(chain.submitted.lock().unwrap()[0].0, 0);
    }

    #[tokio::test]
    async fn test_resend_bumps_gas_and_forgets_included() {
        let chain = Arc::new(FakeChain::default());
        let handler = handler(chain.clone(), Duration::ZERO);

        handler.send_transaction("alice", build).await.unwrap();
        handler.send_transaction("alice", build).await.unwrap();
        chain.confirm_up_to(1);

        let resent = handler.resend_pending().await.unwrap();
        assert_eq!(resent, 1);
        assert_eq!(handler.pending_count("alice").await, 1);

        let submitted = chain.submitted.lock().unwrap().clone();
        assert_eq!(submitted.last().unwrap(), &(1, 120));
    }

    #[tokio::test]
    async fn test_resend_drops_after_max_retries() {
        let chain = Arc::new(FakeChain::default());
        let handler = NonceTransactionsHandler::new(
            "test",
            chain.clone(),
            Duration::ZERO,
            RetryConfig {
                max_retries: 2,
                ..RetryConfig::default()
            },
        );

        handler.send_transaction("alice", build).await.unwrap();
        for _ in 0..3 {
            handler.resend_pending().await.unwrap();
        }
        assert_eq!(handler.pending_count("alice").await, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Send,
        Resend,
        Confirm(u64),
        Reject,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Send),
            2 => Just(Op::Resend),
            1 => (0u64..4).prop_map(Op::Confirm),
            1 => Just(Op::Reject),
        ]
    }

    proptest! {
        #[test]
        fn test_fresh_submissions_strictly_increase(ops in proptest::collection::vec(op(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let chain = Arc::new(FakeChain::default());
                let handler = handler(chain.clone(), Duration::ZERO);

                for op in ops {
                    match op {
                        Op::Send => { let _ = handler.send_transaction("alice", build).await; }
                        Op::Resend => { let _ = handler.resend_pending().await; }
                        Op::Confirm(step) => {
                            let top = chain.submitted.lock().unwrap().iter().map(|(n, _)| n + 1).max().unwrap_or(0);
                            let current = *chain.confirmed.lock().unwrap();
                            chain.confirm_up_to((current + step).min(top));
                        }
                        Op::Reject => {
                            *chain.fail_next.lock().unwrap() = Some("txpool is full".to_string());
                        }
                    }
                }

                let submitted = chain.submitted.lock().unwrap().clone();
                let fresh: Vec<u64> = submitted
                    .iter()
                    .filter(|(_, gas)| *gas == 100)
                    .map(|(n, _)| *n)
                    .collect();
                for pair in fresh.windows(2) {
                    assert!(pair[0] < pair[1], "fresh nonces not increasing: {:?}", fresh);
                }
            });
        }
    }
}
