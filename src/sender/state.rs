// Per-sender mutable state: failure and redirect counters, the learned
// redirect endpoint, and timer handles.
//
// Counters are atomics and the remaining fields sit behind short-lived
// parking_lot locks that are never held across an await.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use url::Url;

/// Where the sender stands with respect to redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPhase {
    Direct,
    Redirected,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderStats {
    pub consecutive_failures: u32,
    pub consecutive_redirects: u32,
    pub total_requests: u64,
    pub persisted_batches: u64,
}

#[derive(Debug, Default)]
pub struct SenderState {
    consecutive_failures: AtomicU32,
    consecutive_redirects: AtomicU32,
    total_requests: AtomicU64,
    persisted_batches: AtomicU64,
    abandoned: AtomicBool,
    disk_retry: AtomicBool,
    redirect_url: Mutex<Option<Url>>,
    pub(crate) resend_timer: Mutex<Option<JoinHandle<()>>>,
    pub(crate) cleanup_timer: Mutex<Option<JoinHandle<()>>>,
}

impl SenderState {
    pub fn new(disk_retry: bool) -> Self {
        let state = Self::default();
        state.disk_retry.store(disk_retry, Ordering::Relaxed);
        state
    }

    /// The learned redirect endpoint if any, else `configured`.
    pub fn target_url(&self, configured: &Url) -> Url {
        self.redirect_url
            .lock()
            .clone()
            .unwrap_or_else(|| configured.clone())
    }

    pub fn redirect_url(&self) -> Option<Url> {
        self.redirect_url.lock().clone()
    }

    pub fn set_redirect_url(&self, url: Url) {
        *self.redirect_url.lock() = Some(url);
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the failure count including this one.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Returns the redirect count including this one.
    pub fn record_redirect(&self) -> u32 {
        self.consecutive_redirects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn mark_abandoned(&self) {
        self.abandoned.store(true, Ordering::Relaxed);
    }

    /// Any non-redirect response ends the redirect chain. The learned host
    /// is kept for future sends.
    pub fn reset_redirects(&self) {
        self.consecutive_redirects.store(0, Ordering::Relaxed);
        self.abandoned.store(false, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.persisted_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn disk_retry_enabled(&self) -> bool {
        self.disk_retry.load(Ordering::Relaxed)
    }

    pub fn set_disk_retry(&self, enabled: bool) {
        self.disk_retry.store(enabled, Ordering::Relaxed);
    }

    pub fn redirect_phase(&self) -> RedirectPhase {
        if self.abandoned.load(Ordering::Relaxed) {
            RedirectPhase::Abandoned
        } else if self.consecutive_redirects.load(Ordering::Relaxed) > 0 {
            RedirectPhase::Redirected
        } else {
            RedirectPhase::Direct
        }
    }

    pub fn snapshot(&self) -> SenderStats {
        SenderStats {
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            consecutive_redirects: self.consecutive_redirects.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            persisted_batches: self.persisted_batches.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn abort_timers(&self) {
        if let Some(timer) = self.resend_timer.lock().take() {
            timer.abort();
        }
        if let Some(timer) = self.cleanup_timer.lock().take() {
            timer.abort();
        }
    }
}
