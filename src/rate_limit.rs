//! Login throttle: attempts per identity inside a fixed window.
//!
//! State lives in memory for the lifetime of the manager and is cleared on
//! restart. This is a client-side throttle only; the server remains the
//! authoritative rate limiter.

use crate::error::Error;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    started_at: Instant,
    attempts: u32,
}

/// Per-identity fixed-window counter gating every login call.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_attempts: u32,
    windows: Mutex<HashMap<String, AttemptWindow>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            window,
            max_attempts,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record one attempt for `identity` and decide whether it may proceed.
    ///
    /// Identities are normalized (trimmed, lowercased) so `Alice@…` and
    /// `alice@…` share one window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] with the remaining window time once the
    /// attempt count inside the current window exceeds the maximum.
    pub fn check_and_record(&self, identity: &str) -> Result<(), Error> {
        let key = identity.trim().to_lowercase();
        let now = Instant::now();

        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Drop long-expired windows so idle identities do not accumulate.
        windows.retain(|_, entry| now.duration_since(entry.started_at) < self.window * 2);

        let entry = windows.entry(key).or_insert(AttemptWindow {
            started_at: now,
            attempts: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.attempts = 1;
            return Ok(());
        }

        entry.attempts += 1;
        if entry.attempts > self.max_attempts {
            let elapsed = now.duration_since(entry.started_at);
            let retry_after = self.window.saturating_sub(elapsed);
            return Err(Error::RateLimited { retry_after });
        }

        Ok(())
    }
}
