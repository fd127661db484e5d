//! Leader rotation
//!
//! The leader of a window is `sorted_keys[(now / interval) mod N]`. Every relayer
//! computes it locally from the wall clock and the staked relayer list, so no
//! coordination is needed; brief dual-leader windows from clock skew are harmless
//! because proposals are idempotent.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::p2p::Broadcaster;

/// Source of unix time in seconds
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// Settable clock for deterministic tests
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

#[cfg(any(test, feature = "testing"))]
impl ManualClock {
    pub fn new(now: u64) -> Arc<Self> {
        Arc::new(Self {
            now: std::sync::atomic::AtomicU64::new(now),
        })
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now
            .fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "testing"))]
impl Clock for ManualClock {
    fn now_unix(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Index of the leader among `n` sorted keys; `None` when there are no keys
pub fn leader_index(now_unix: u64, interval_secs: u64, n: usize) -> Option<usize> {
    if n == 0 {
        return None;
    }
    let window = now_unix / interval_secs.max(1);
    Some((window % n as u64) as usize)
}

#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn am_i_leader(&self) -> bool;
    /// Flush collected signatures once an action is executed
    async fn clean(&self);
}

pub struct TopologyHandler {
    broadcaster: Arc<Broadcaster>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
}

impl TopologyHandler {
    pub fn new(broadcaster: Arc<Broadcaster>, clock: Arc<dyn Clock>, interval_secs: u64) -> Self {
        Self {
            broadcaster,
            clock,
            interval_secs,
        }
    }
}

#[async_trait]
impl TopologyProvider for TopologyHandler {
    async fn am_i_leader(&self) -> bool {
        let keys = self.broadcaster.sorted_public_keys().await;
        let Some(index) = leader_index(self.clock.now_unix(), self.interval_secs, keys.len()) else {
            return false;
        };
        keys[index] == self.broadcaster.my_public_key()
    }

    async fn clean(&self) {
        self.broadcaster.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_leader_index_rotates_per_window() {
        assert_eq!(leader_index(0, 60, 3), Some(0));
        assert_eq!(leader_index(59, 60, 3), Some(0));
        assert_eq!(leader_index(60, 60, 3), Some(1));
        assert_eq!(leader_index(185, 60, 3), Some(0));
        assert_eq!(leader_index(100, 60, 0), None);
    }

    #[test]
    fn test_zero_interval_does_not_divide_by_zero() {
        assert_eq!(leader_index(7, 0, 4), Some(3));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(20);
        assert_eq!(clock.now_unix(), 120);
        clock.set(5);
        assert_eq!(clock.now_unix(), 5);
    }

    proptest! {
        #[test]
        fn test_every_relayer_leads_within_n_windows(
            n in 1usize..20,
            interval in 1u64..600,
            start in 0u64..1_000_000_000,
        ) {
            let mut seen = vec![false; n];
            let mut t = start;
            while t < start + n as u64 * interval {
                seen[leader_index(t, interval, n).unwrap()] = true;
                t += interval;
            }
            prop_assert!(seen.iter().all(|s| *s));
        }
    }
}
