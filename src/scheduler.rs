//! Proactive refresh timer: one deferred task, armed per token set.
//!
//! Arming replaces any previously armed timer, so at most one refresh can be
//! pending at a time; refreshes are serialized by construction rather than
//! by a lock.

use crate::token::TokenSet;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// When the refresh for `token_set` should fire: `expires_at - threshold`,
/// clamped to "now" for tokens already inside the threshold.
#[must_use]
pub fn refresh_delay(token_set: &TokenSet, threshold: Duration, now: DateTime<Utc>) -> Duration {
    let due_at = token_set.expires_at()
        - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
    (due_at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Owns the single pending refresh timer.
///
/// The scheduler keeps only the fingerprint of the token set it was armed
/// for, never a copy of the token itself.
#[derive(Debug, Default)]
pub struct RefreshScheduler {
    handle: Option<JoinHandle<()>>,
    fingerprint: Option<String>,
}

impl RefreshScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to run `on_due` after `delay`, cancelling any timer
    /// armed earlier. `on_due` runs at most once.
    pub fn arm<F>(&mut self, delay: Duration, fingerprint: String, on_due: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        debug!(
            delay_secs = delay.as_secs(),
            token = %fingerprint,
            "arming refresh timer"
        );
        self.fingerprint = Some(fingerprint);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_due.await;
        }));
    }

    /// Abort the pending timer, if any. Idempotent; safe on teardown.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("refresh timer cancelled");
        }
        self.fingerprint = None;
    }

    /// Fingerprint of the token set the timer was armed for, for comparison
    /// by the state machine only.
    #[must_use]
    pub fn armed_fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn token_set(expires_in_seconds: u64) -> TokenSet {
        TokenSet {
            access_token: "header.payload.sig".to_string(),
            refresh_token: "refresh-opaque".to_string(),
            token_type: "Bearer".to_string(),
            issued_at: Utc::now(),
            expires_in_seconds,
        }
    }

    #[test]
    fn delay_is_lifetime_minus_threshold() {
        let token_set = token_set(3600);
        let delay = refresh_delay(
            &token_set,
            Duration::from_secs(300),
            token_set.issued_at,
        );
        // 3600s lifetime with a 300s threshold arms 3300s out.
        assert_eq!(delay, Duration::from_secs(3300));
    }

    #[test]
    fn delay_clamps_to_zero_inside_threshold() {
        let token_set = token_set(60);
        let delay = refresh_delay(
            &token_set,
            Duration::from_secs(300),
            token_set.issued_at,
        );
        assert_eq!(delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn armed_timer_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut scheduler = RefreshScheduler::new();

        let counter = Arc::clone(&fired);
        scheduler.arm(Duration::from_millis(20), "fp-1".to_string(), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.armed_fingerprint(), Some("fp-1"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rearming_replaces_the_pending_timer() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut scheduler = RefreshScheduler::new();

        let first = Arc::clone(&fired);
        scheduler.arm(Duration::from_millis(30), "fp-1".to_string(), async move {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = Arc::clone(&fired);
        scheduler.arm(Duration::from_millis(30), "fp-2".to_string(), async move {
            second.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(scheduler.armed_fingerprint(), Some("fp-2"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Only the second callback ran.
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn cancel_prevents_the_callback() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut scheduler = RefreshScheduler::new();

        let counter = Arc::clone(&fired);
        scheduler.arm(Duration::from_millis(20), "fp-1".to_string(), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel();
        assert!(scheduler.armed_fingerprint().is_none());
        assert!(!scheduler.is_armed());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_when_nothing_is_armed() {
        let mut scheduler = RefreshScheduler::new();
        scheduler.cancel();
        scheduler.cancel();
        assert!(!scheduler.is_armed());
    }
}
