//! Per-peer message budget over one-second windows

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct AntiFlood {
    max_per_second: u32,
    windows: Mutex<HashMap<String, Window>>,
}

impl AntiFlood {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one message from `peer`; false once the peer is over budget
    pub fn allow(&self, peer: &str) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return true;
        };
        let now = Instant::now();
        // drop idle peers so the map stays bounded by active senders
        windows.retain(|_, w| now.duration_since(w.started) < WINDOW * 10);

        let window = windows.entry(peer.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= self.max_per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_resets_each_second() {
        let flood = AntiFlood::new(3);
        assert!(flood.allow("a"));
        assert!(flood.allow("a"));
        assert!(flood.allow("a"));
        assert!(!flood.allow("a"));
        // other peers are unaffected
        assert!(flood.allow("b"));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(flood.allow("a"));
    }
}
