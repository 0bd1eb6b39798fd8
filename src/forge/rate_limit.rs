//! Upstream API rate-limit tracking.
//!
//! Reads `X-RateLimit-Remaining` / `X-RateLimit-Reset` from every API
//! response so the refresh workers can pause before the budget runs out
//! instead of collecting 403s until the window resets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::info;

/// Shared rate-limit state updated after every upstream API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Remaining API calls in the current window; `u64::MAX` until observed.
    remaining: Arc<AtomicU64>,
    /// Unix timestamp at which the window resets.
    reset_at: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    pub fn reset_at(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Record the rate-limit headers of a response. Absent or malformed
    /// headers leave the previous values untouched.
    pub fn observe(&self, headers: &HeaderMap) {
        if let Some(remaining) = header_u64(headers, "X-RateLimit-Remaining") {
            self.remaining.store(remaining, Ordering::Relaxed);
        }
        if let Some(reset) = header_u64(headers, "X-RateLimit-Reset") {
            self.reset_at.store(reset, Ordering::Relaxed);
        }
    }

    /// How long to pause before the next call, given `now` as a Unix
    /// timestamp. `None` while the remaining budget is at or above `buffer`.
    pub fn throttle_delay(&self, buffer: u32, now: u64) -> Option<Duration> {
        let remaining = self.remaining();
        if remaining == u64::MAX || remaining >= u64::from(buffer) {
            return None;
        }
        let reset = self.reset_at();
        (reset > now).then(|| Duration::from_secs(reset - now))
    }

    /// Sleep until the window resets if the budget is below `buffer`.
    pub async fn throttle(&self, buffer: u32) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if let Some(delay) = self.throttle_delay(buffer, now) {
            info!(
                remaining = self.remaining(),
                reset_in_secs = delay.as_secs(),
                buffer,
                "self-throttling: upstream rate limit approaching"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(remaining: &str, reset: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Remaining", remaining.parse().unwrap());
        headers.insert("X-RateLimit-Reset", reset.parse().unwrap());
        headers
    }

    #[test]
    fn unobserved_state_never_throttles() {
        let state = RateLimitState::new();
        assert_eq!(state.remaining(), u64::MAX);
        assert_eq!(state.throttle_delay(100, 0), None);
    }

    #[test]
    fn observe_reads_github_headers() {
        let state = RateLimitState::new();
        state.observe(&headers("42", "1700000000"));
        assert_eq!(state.remaining(), 42);
        assert_eq!(state.reset_at(), 1700000000);
    }

    #[test]
    fn malformed_headers_keep_previous_values() {
        let state = RateLimitState::new();
        state.observe(&headers("42", "1700000000"));
        state.observe(&headers("lots", "soon"));
        assert_eq!(state.remaining(), 42);
        assert_eq!(state.reset_at(), 1700000000);
    }

    #[test]
    fn throttles_below_buffer_until_reset() {
        let state = RateLimitState::new();
        state.observe(&headers("5", "1000"));
        assert_eq!(state.throttle_delay(10, 970), Some(Duration::from_secs(30)));
        // Window already reset: nothing to wait for.
        assert_eq!(state.throttle_delay(10, 1000), None);
        // Enough budget left.
        assert_eq!(state.throttle_delay(5, 970), None);
    }
}
