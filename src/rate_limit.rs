//! Fixed-window request throttle keyed by caller identity.

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    pub count: u32,
    /// Epoch ms after which the window resets.
    pub reset_time: u64,
}

/// Injected, per-instance window map. Check-and-increment for one identifier
/// happens under that identifier's shard lock, so two requests racing on a
/// window boundary cannot both reset it.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, WindowRecord>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false once `identifier` exceeds `max_requests` in the active
    /// window. Never fails.
    pub fn allow(&self, identifier: &str, max_requests: u32, window_ms: u64, now: u64) -> bool {
        let mut record = self
            .windows
            .entry(identifier.to_string())
            .or_insert(WindowRecord { count: 0, reset_time: 0 });
        if record.count == 0 || now > record.reset_time {
            record.count = 1;
            record.reset_time = now.saturating_add(window_ms);
            return max_requests >= 1;
        }
        record.count = record.count.saturating_add(1);
        record.count <= max_requests
    }

    /// Requests left in the active window, `max_requests` if none is open.
    pub fn remaining(&self, identifier: &str, max_requests: u32, now: u64) -> u32 {
        match self.windows.get(identifier) {
            Some(r) if now <= r.reset_time => max_requests.saturating_sub(r.count),
            _ => max_requests,
        }
    }

    /// Drop windows that have already elapsed.
    pub fn cleanup(&self, now: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, r| now <= r.reset_time);
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
