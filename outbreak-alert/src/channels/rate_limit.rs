//! Per-address sliding-window rate limiter.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_per_window")]
    pub max_per_window: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_max_per_window() -> usize {
    5
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: default_max_per_window(),
            window_secs: default_window_secs(),
        }
    }
}

/// Sliding-window counter keyed by address.
///
/// Shared across concurrent dispatches; the check-and-record step is atomic
/// under one lock and never awaits. Addresses whose sends have all aged out
/// are swept at most once per window, so the map only holds recently active
/// addresses.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    state: Mutex<WindowState>,
}

#[derive(Debug, Default)]
struct WindowState {
    sends: HashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl WindowState {
    fn sweep(&mut self, now: Instant, window: Duration) {
        self.sends.retain(|_, sends| {
            sends
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) < window)
        });
        self.last_sweep = Some(now);
    }
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Record a send for `address` if it is under the limit.
    pub fn try_acquire(&self, address: &str) -> bool {
        self.try_acquire_at(address, Instant::now())
    }

    pub fn try_acquire_at(&self, address: &str, now: Instant) -> bool {
        let window = self.window();
        let mut state = self.state.lock();

        if state
            .last_sweep
            .is_none_or(|last| now.saturating_duration_since(last) >= window)
        {
            state.sweep(now, window);
        }

        let sends = state.sends.entry(address.to_string()).or_default();
        while let Some(&oldest) = sends.front() {
            if now.saturating_duration_since(oldest) >= window {
                sends.pop_front();
            } else {
                break;
            }
        }

        if sends.len() >= self.config.max_per_window {
            return false;
        }
        sends.push_back(now);
        true
    }

    /// Sends recorded for `address` in the current window.
    pub fn current_count(&self, address: &str) -> usize {
        let now = Instant::now();
        let window = self.window();
        self.state
            .lock()
            .sends
            .get(address)
            .map(|sends| {
                sends
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) < window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Addresses currently held in memory.
    pub fn tracked_addresses(&self) -> usize {
        self.state.lock().sends.len()
    }
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixth_send_in_window_is_rejected() {
        let limiter = SlidingWindowRateLimiter::default();
        let start = Instant::now();

        for i in 0..5 {
            assert!(limiter.try_acquire_at("+15550001111", start + Duration::from_secs(i)));
        }
        assert!(!limiter.try_acquire_at("+15550001111", start + Duration::from_secs(10)));
        // Other addresses are independent.
        assert!(limiter.try_acquire_at("+15550002222", start + Duration::from_secs(10)));
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowRateLimiter::default();
        let start = Instant::now();

        for i in 0..5 {
            assert!(limiter.try_acquire_at("+15550001111", start + Duration::from_secs(i)));
        }
        assert!(!limiter.try_acquire_at("+15550001111", start + Duration::from_secs(59)));
        // The first send has aged out.
        assert!(limiter.try_acquire_at("+15550001111", start + Duration::from_secs(60)));
        assert!(!limiter.try_acquire_at("+15550001111", start + Duration::from_secs(60)));
    }

    #[test]
    fn test_rejected_sends_are_not_recorded() {
        let limiter = SlidingWindowRateLimiter::new(RateLimitConfig {
            max_per_window: 1,
            window_secs: 60,
        });
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        assert_eq!(limiter.current_count("a"), 1);
    }

    #[test]
    fn test_idle_addresses_are_forgotten() {
        let limiter = SlidingWindowRateLimiter::default();
        let start = Instant::now();

        for i in 0..10_000 {
            assert!(limiter.try_acquire_at(&format!("+1555{:07}", i), start));
        }
        assert_eq!(limiter.tracked_addresses(), 10_000);

        // Two hours later a single send clears every idle entry.
        assert!(limiter.try_acquire_at("+15559999999", start + Duration::from_secs(7200)));
        assert_eq!(limiter.tracked_addresses(), 1);
    }

    #[test]
    fn test_sweep_keeps_active_addresses() {
        let limiter = SlidingWindowRateLimiter::default();
        let start = Instant::now();

        assert!(limiter.try_acquire_at("old", start));
        assert!(limiter.try_acquire_at("recent", start + Duration::from_secs(30)));
        // Sweep at t=60: "old" aged out, "recent" is still inside its window.
        assert!(limiter.try_acquire_at("new", start + Duration::from_secs(60)));
        assert_eq!(limiter.tracked_addresses(), 2);

        for i in 0..4 {
            assert!(limiter.try_acquire_at("recent", start + Duration::from_secs(61 + i)));
        }
        assert!(!limiter.try_acquire_at("recent", start + Duration::from_secs(70)));
    }

    #[test]
    fn test_concurrent_acquire_respects_limit() {
        let limiter = std::sync::Arc::new(SlidingWindowRateLimiter::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.try_acquire("+15550001111"))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 5);
    }
}
