//! Ephemeral per-user trading sessions.
//!
//! Each user has an hour window and a day window. A window resets once it
//! has elapsed; closing a day window yields a summary that the caller folds
//! into the user's reputation when the next trade commits.

use dashmap::DashMap;

pub const HOUR_MS: u64 = 3_600_000;
pub const DAY_MS: u64 = 86_400_000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Window {
    pub trades_count: u32,
    pub volume_traded: f64,
    pub window_start: u64,
}

impl Window {
    fn is_expired(&self, now: u64, len_ms: u64) -> bool {
        self.trades_count > 0 && now >= self.window_start.saturating_add(len_ms)
    }

    fn record(&mut self, value: f64, now: u64) {
        if self.trades_count == 0 {
            self.window_start = now;
        }
        self.trades_count += 1;
        self.volume_traded += value;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSummary {
    pub trades_count: u32,
    pub volume_traded: f64,
    pub window_start: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradingSession {
    pub hour: Window,
    pub day: Window,
    pub last_trade_ts: Option<u64>,
}

impl TradingSession {
    /// Roll elapsed windows forward. Returns the closed day session, if any.
    pub fn roll(&mut self, now: u64) -> Option<SessionSummary> {
        if self.hour.is_expired(now, HOUR_MS) {
            self.hour = Window::default();
        }
        if self.day.is_expired(now, DAY_MS) {
            let closed = SessionSummary {
                trades_count: self.day.trades_count,
                volume_traded: self.day.volume_traded,
                window_start: self.day.window_start,
            };
            self.day = Window::default();
            return Some(closed);
        }
        None
    }

    pub fn record(&mut self, value: f64, now: u64) {
        self.hour.record(value, now);
        self.day.record(value, now);
        self.last_trade_ts = Some(self.last_trade_ts.map_or(now, |t| t.max(now)));
    }
}

/// Sessions keyed by trader (user id, or the person behind several
/// accounts). Callers serialize per key; the map only guards itself.
#[derive(Debug, Default)]
pub struct SessionBook {
    sessions: DashMap<String, TradingSession>,
}

impl SessionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current session for `key` with elapsed windows discarded.
    /// Read-only: the stored session is left for `record` to roll.
    pub fn snapshot(&self, key: &str, now: u64) -> TradingSession {
        let mut session = self.sessions.get(key).map(|s| *s).unwrap_or_default();
        session.roll(now);
        session
    }

    /// Summary of the day window that `now` would close, without mutating.
    pub fn pending_close(&self, key: &str, now: u64) -> Option<SessionSummary> {
        let mut session = self.sessions.get(key).map(|s| *s)?;
        session.roll(now)
    }

    /// Record a committed trade.
    pub fn record(&self, key: &str, value: f64, now: u64) {
        let mut session = self.sessions.entry(key.to_string()).or_default();
        session.roll(now);
        session.record(value, now);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let book = SessionBook::new();
        book.record("u1", 10.0, 1_000);
        book.record("u1", 5.0, 2_000);
        let s = book.snapshot("u1", 3_000);
        assert_eq!(s.hour.trades_count, 2);
        assert_eq!(s.day.volume_traded, 15.0);
        assert_eq!(s.last_trade_ts, Some(2_000));
        assert_eq!(s.hour.window_start, 1_000);
    }

    #[test]
    fn test_hour_window_resets_day_keeps() {
        let book = SessionBook::new();
        book.record("u1", 10.0, 0);
        let s = book.snapshot("u1", HOUR_MS);
        assert_eq!(s.hour.trades_count, 0);
        assert_eq!(s.day.trades_count, 1);
    }

    #[test]
    fn test_day_close_summary() {
        let book = SessionBook::new();
        book.record("u1", 10.0, 0);
        book.record("u1", 30.0, 60_000);
        assert!(book.pending_close("u1", DAY_MS - 1).is_none());
        let closed = book.pending_close("u1", DAY_MS).unwrap();
        assert_eq!(closed.trades_count, 2);
        assert_eq!(closed.volume_traded, 40.0);

        book.record("u1", 1.0, DAY_MS);
        let s = book.snapshot("u1", DAY_MS);
        assert_eq!(s.day.trades_count, 1);
        assert_eq!(s.day.window_start, DAY_MS);
        assert!(book.pending_close("u1", DAY_MS).is_none());
    }

    #[test]
    fn test_unknown_user_empty() {
        let book = SessionBook::new();
        let s = book.snapshot("nobody", 5);
        assert_eq!(s, TradingSession::default());
    }
}
