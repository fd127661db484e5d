//! Prometheus metrics for the MX-ETH Bridge Relayer
//!
//! Exposed on `/metrics` by the API server.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, IntCounterVec,
    IntGauge, IntGaugeVec,
};

lazy_static! {
    // State machine
    pub static ref STEPS: IntCounterVec = register_int_counter_vec!(
        "relayer_steps_total",
        "Total number of executed state machine steps",
        &["direction", "step"]
    ).expect("constant metric definition");

    pub static ref ERRORS: IntCounterVec = register_int_counter_vec!(
        "relayer_errors_total",
        "Total number of step errors by kind",
        &["direction", "kind"]
    ).expect("constant metric definition");

    pub static ref CURRENT_BATCH_ID: IntGaugeVec = register_int_gauge_vec!(
        "relayer_current_batch_id",
        "Batch currently being bridged",
        &["direction"]
    ).expect("constant metric definition");

    pub static ref IS_LEADER: IntGaugeVec = register_int_gauge_vec!(
        "relayer_is_leader",
        "Whether this relayer leads the current rotation window",
        &["direction"]
    ).expect("constant metric definition");

    pub static ref SIGNATURES_RECEIVED: IntGaugeVec = register_int_gauge_vec!(
        "relayer_signatures_received",
        "Signatures collected for the current action",
        &["direction"]
    ).expect("constant metric definition");

    // Chains
    pub static ref TRANSACTIONS: IntCounterVec = register_int_counter_vec!(
        "relayer_transactions_total",
        "Transactions submitted by this relayer",
        &["chain", "action"]
    ).expect("constant metric definition");

    pub static ref CLIENT_AVAILABLE: IntGaugeVec = register_int_gauge_vec!(
        "relayer_client_available",
        "Whether the chain client sees the chain advancing",
        &["chain"]
    ).expect("constant metric definition");

    pub static ref LAST_BLOCK_NONCE: IntGaugeVec = register_int_gauge_vec!(
        "relayer_last_block_nonce",
        "Last observed block number / nonce",
        &["chain"]
    ).expect("constant metric definition");

    pub static ref NONCE_RESENDS: IntCounterVec = register_int_counter_vec!(
        "relayer_nonce_resends_total",
        "Transactions resent with a bumped gas price",
        &["chain"]
    ).expect("constant metric definition");

    // P2P
    pub static ref P2P_MESSAGES: IntCounterVec = register_int_counter_vec!(
        "relayer_p2p_messages_total",
        "Inbound peer messages by outcome",
        &["topic", "outcome"]
    ).expect("constant metric definition");

    // Health
    pub static ref UP: IntGauge = register_int_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).expect("constant metric definition");
}

pub fn record_step(direction: &str, step: &str) {
    STEPS.with_label_values(&[direction, step]).inc();
}

pub fn record_error(direction: &str, kind: &str) {
    ERRORS.with_label_values(&[direction, kind]).inc();
}

pub fn set_current_batch(direction: &str, batch_id: u64) {
    CURRENT_BATCH_ID
        .with_label_values(&[direction])
        .set(batch_id as i64);
}

pub fn set_leader(direction: &str, is_leader: bool) {
    IS_LEADER.with_label_values(&[direction]).set(is_leader as i64);
}

pub fn set_signatures_received(direction: &str, count: u64) {
    SIGNATURES_RECEIVED
        .with_label_values(&[direction])
        .set(count as i64);
}

pub fn record_transaction(chain: &str, action: &str) {
    TRANSACTIONS.with_label_values(&[chain, action]).inc();
}

pub fn set_client_available(chain: &str, available: bool) {
    CLIENT_AVAILABLE
        .with_label_values(&[chain])
        .set(available as i64);
}

pub fn set_last_block_nonce(chain: &str, nonce: u64) {
    LAST_BLOCK_NONCE.with_label_values(&[chain]).set(nonce as i64);
}

pub fn record_nonce_resends(chain: &str, count: usize) {
    NONCE_RESENDS
        .with_label_values(&[chain])
        .inc_by(count as u64);
}

pub fn record_p2p_message(topic: &str, outcome: &str) {
    P2P_MESSAGES.with_label_values(&[topic, outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = STEPS.with_label_values(&["test", "get pending"]).get();
        record_step("test", "get pending");
        assert_eq!(STEPS.with_label_values(&["test", "get pending"]).get(), before + 1);
    }

    #[test]
    fn test_gauges_set() {
        set_current_batch("test-dir", 346);
        assert_eq!(CURRENT_BATCH_ID.with_label_values(&["test-dir"]).get(), 346);
        set_leader("test-dir", true);
        assert_eq!(IS_LEADER.with_label_values(&["test-dir"]).get(), 1);
    }
}
