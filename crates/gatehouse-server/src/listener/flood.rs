//! Per-address connection attempt limiter
//!
//! Each address gets a counting window. The counter is incremented on every
//! attempt and the attempt is rejected once it exceeds the threshold. Peers
//! that keep hammering past `threshold + GRACE_ATTEMPTS` have their window
//! start pushed forward, so the block outlives the original window.

use gatehouse_common::{GatehouseError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Attempts beyond the threshold tolerated before the window is extended
const GRACE_ATTEMPTS: u32 = 10;

/// Window extension per attempt once past the grace
const PENALTY_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodVerdict {
    Admit,
    Reject { attempts: u32 },
}

impl FloodVerdict {
    /// A rejection becomes `RateLimited` for `ip`
    pub fn into_result(self, ip: IpAddr) -> Result<()> {
        match self {
            FloodVerdict::Admit => Ok(()),
            FloodVerdict::Reject { attempts } => Err(GatehouseError::RateLimited(format!(
                "{} connection attempts from {} inside the flood window",
                attempts, ip
            ))),
        }
    }
}

#[derive(Debug)]
pub struct FloodGuard {
    threshold: u32,
    window: Duration,
    attempts: RwLock<HashMap<IpAddr, AttemptWindow>>,
}

impl FloodGuard {
    /// A zero threshold disables the guard
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            attempts: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Record an attempt from `ip` and decide whether to serve it
    pub fn check(&self, ip: IpAddr) -> FloodVerdict {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> FloodVerdict {
        if !self.is_enabled() {
            return FloodVerdict::Admit;
        }

        let mut attempts = self.attempts.write();
        let entry = attempts.entry(ip).or_insert(AttemptWindow {
            count: 0,
            window_start: now,
        });

        // an expired window starts over
        if now.saturating_duration_since(entry.window_start) >= self.window {
            *entry = AttemptWindow {
                count: 0,
                window_start: now,
            };
        }

        entry.count = entry.count.saturating_add(1);
        if entry.count <= self.threshold {
            return FloodVerdict::Admit;
        }

        if entry.count > self.threshold.saturating_add(GRACE_ATTEMPTS) {
            entry.window_start += PENALTY_STEP;
            debug!(peer = %ip, attempts = entry.count, "Extending flood window");
        }
        if entry.count == self.threshold + 1 {
            warn!(peer = %ip, threshold = self.threshold, "Connection flood detected");
        }
        FloodVerdict::Reject {
            attempts: entry.count,
        }
    }

    /// Forget addresses whose window has expired
    pub fn purge_stale(&self) -> usize {
        self.purge_stale_at(Instant::now())
    }

    fn purge_stale_at(&self, now: Instant) -> usize {
        // cheap read first; the accept loop calls this on every cycle
        let any_stale = self
            .attempts
            .read()
            .values()
            .any(|w| now.saturating_duration_since(w.window_start) >= self.window);
        if !any_stale {
            return 0;
        }

        let mut attempts = self.attempts.write();
        let before = attempts.len();
        attempts.retain(|_, w| now.saturating_duration_since(w.window_start) < self.window);
        before - attempts.len()
    }

    /// Number of tracked addresses
    pub fn tracked(&self) -> usize {
        self.attempts.read().len()
    }
}
