//! Global ceiling on simultaneous sessions
//!
//! The accept loop takes a permit before accepting. At the ceiling it blocks
//! until a session drops its permit, and exactly one blocked acquisition
//! proceeds per release.

use crate::metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct AdmissionState {
    active: usize,
    blocked: bool,
    closed: bool,
}

#[derive(Debug)]
pub struct Admission {
    max: usize,
    state: Mutex<AdmissionState>,
    released: Notify,
}

impl Admission {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            state: Mutex::new(AdmissionState::default()),
            released: Notify::new(),
        })
    }

    /// Wait for a free slot; `None` once the admission gate is closed
    pub async fn acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if state.active < self.max {
                    state.active += 1;
                    if state.blocked {
                        state.blocked = false;
                        debug!(active = state.active, "Admission resumed");
                    }
                    return Some(AdmissionPermit {
                        admission: self.clone(),
                    });
                }
                if !state.blocked {
                    state.blocked = true;
                    metrics::record_admission_blocked();
                    info!(max = self.max, "Connection ceiling reached, pausing accepts");
                }
            }

            notified.await;
        }
    }

    /// Take a slot without waiting
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut state = self.state.lock();
        if state.closed || state.active >= self.max {
            return None;
        }
        state.active += 1;
        Some(AdmissionPermit {
            admission: self.clone(),
        })
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    /// Refuse further acquisitions and release a blocked acquirer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.released.notify_waiters();
    }

    fn release(&self) {
        let mut state = self.state.lock();
        let was_full = state.active >= self.max;
        state.active = state.active.saturating_sub(1);
        // anyone waiting saw the ceiling, so only a release from full can unblock them
        if was_full || state.blocked {
            self.released.notify_one();
        }
    }
}

/// One admitted session; the slot is released when this is dropped
#[derive(Debug)]
pub struct AdmissionPermit {
    admission: Arc<Admission>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.admission.release();
    }
}
