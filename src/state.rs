use std::sync::atomic::{AtomicU64, Ordering};

use crate::reputation::LimitTable;

#[derive(Clone, Debug)]
pub struct Config {
    pub sqlite_path: String,
    /// Requests allowed per identifier per rate-limit window.
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: u64,
    /// Trades loaded for risk scoring (most recent first).
    pub risk_history_len: usize,
    pub high_volume_threshold: f64,
    pub frequent_trading_threshold: usize,
    pub frequent_trading_window_ms: u64,
    pub ratio_high: f64,
    pub ratio_low: f64,
    pub rapid_fire_min_spacing_ms: u64,
    /// Added to the decision score per active flag.
    pub flag_penalty: u8,
    /// Added to the sticky score per active flag on each committed trade.
    pub flag_drift: u8,
    pub ban_threshold: u8,
    pub max_suspicious_activity: u32,
    pub report_risk_penalty: u8,
    pub report_score_penalty: u32,
    pub store_timeout_ms: u64,
    /// Attempts stamped further than this from the engine clock are refused.
    pub max_clock_skew_ms: u64,
    pub limits: LimitTable,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./tradegate.sqlite".to_string()),
            rate_limit_max_requests: env_or("RATE_LIMIT_MAX", 30),
            rate_limit_window_ms: env_or("RATE_LIMIT_WINDOW_MS", 60_000),
            risk_history_len: env_or("RISK_HISTORY_LEN", 20),
            high_volume_threshold: env_or("HIGH_VOLUME_TH", 1000.0),
            frequent_trading_threshold: env_or("FREQUENT_TRADING_TH", 10),
            frequent_trading_window_ms: env_or("FREQUENT_TRADING_WINDOW_MS", 3_600_000),
            ratio_high: env_or("RATIO_HIGH", 3.0),
            ratio_low: env_or("RATIO_LOW", 0.3),
            rapid_fire_min_spacing_ms: env_or("RAPID_FIRE_MS", 2_000),
            flag_penalty: env_or("FLAG_PENALTY", 15),
            flag_drift: env_or("FLAG_DRIFT", 1),
            ban_threshold: env_or("BAN_THRESHOLD", 90),
            max_suspicious_activity: env_or("MAX_SUSPICIOUS", 5),
            report_risk_penalty: env_or("REPORT_RISK_PENALTY", 10),
            report_score_penalty: env_or("REPORT_SCORE_PENALTY", 50),
            store_timeout_ms: env_or("STORE_TIMEOUT_MS", 2_000),
            max_clock_skew_ms: env_or("MAX_CLOCK_SKEW_MS", 30_000),
            limits: LimitTable::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./tradegate.sqlite".to_string(),
            rate_limit_max_requests: 30,
            rate_limit_window_ms: 60_000,
            risk_history_len: 20,
            high_volume_threshold: 1000.0,
            frequent_trading_threshold: 10,
            frequent_trading_window_ms: 3_600_000,
            ratio_high: 3.0,
            ratio_low: 0.3,
            rapid_fire_min_spacing_ms: 2_000,
            flag_penalty: 15,
            flag_drift: 1,
            ban_threshold: 90,
            max_suspicious_activity: 5,
            report_risk_penalty: 10,
            report_score_penalty: 50,
            store_timeout_ms: 2_000,
            max_clock_skew_ms: 30_000,
            limits: LimitTable::default(),
        }
    }
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Source of "now" for windows, cooldowns and risk. Attempt timestamps are
/// client input and only checked against it.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now: AtomicU64::new(start_ms) }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: u64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let c = ManualClock::new(1_000);
        c.advance(500);
        assert_eq!(c.now_ms(), 1_500);
        c.set(10);
        assert_eq!(c.now_ms(), 10);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let a = SystemClock.now_ms();
        let b = SystemClock.now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
