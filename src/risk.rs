use crate::state::Config;
use crate::types::{Flag, FlagSet, Side, TradeRecord, UserState};

/// Display banding only; decisions never branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=29 => RiskLevel::Low,
            30..=69 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    /// Score used for this decision: sticky score plus per-flag penalty.
    pub score: u8,
    pub flags: FlagSet,
    /// Sticky score to persist if the trade commits.
    pub sticky_after: u8,
    pub avg_trade_size: f64,
    pub buy_sell_ratio: Option<f64>,
}

impl RiskAssessment {
    pub fn level(&self) -> RiskLevel {
        RiskLevel::from_score(self.score)
    }
}

pub struct RiskScorer {
    cfg: Config,
}

impl RiskScorer {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    fn mean_value(trades: &[TradeRecord]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }
        trades.iter().map(|t| t.total_value).sum::<f64>() / trades.len() as f64
    }

    /// buys / max(sells, 1), only when both sides were observed
    fn buy_sell_ratio(trades: &[TradeRecord]) -> Option<f64> {
        let buys = trades.iter().filter(|t| t.side == Side::Buy).count();
        let sells = trades.len() - buys;
        if buys == 0 || sells == 0 {
            return None;
        }
        Some(buys as f64 / sells.max(1) as f64)
    }

    /// Score a user against their recent history.
    ///
    /// `recent` is ordered most recent first; only the first
    /// `risk_history_len` entries are considered.
    pub fn score(&self, user: &UserState, recent: &[TradeRecord], now: u64) -> RiskAssessment {
        let window = &recent[..recent.len().min(self.cfg.risk_history_len)];
        let mut flags = FlagSet::new();

        let avg_trade_size = Self::mean_value(window);
        if avg_trade_size > self.cfg.high_volume_threshold {
            flags.insert(Flag::HighVolume);
        }

        let since = now.saturating_sub(self.cfg.frequent_trading_window_ms);
        let in_window = window.iter().filter(|t| t.timestamp >= since).count();
        if in_window > self.cfg.frequent_trading_threshold {
            flags.insert(Flag::FrequentTrading);
        }

        let buy_sell_ratio = Self::buy_sell_ratio(window);
        if let Some(ratio) = buy_sell_ratio {
            if ratio > self.cfg.ratio_high || ratio < self.cfg.ratio_low {
                flags.insert(Flag::ImbalancedRatio);
            }
        }

        if let [latest, previous, ..] = window {
            let gap = latest.timestamp.abs_diff(previous.timestamp);
            if gap < self.cfg.rapid_fire_min_spacing_ms {
                flags.insert(Flag::RapidFire);
            }
        }

        let active = flags.len() as u32;
        let score = (user.risk_score as u32 + self.cfg.flag_penalty as u32 * active).min(100) as u8;
        let sticky_after = (user.risk_score as u32 + self.cfg.flag_drift as u32 * active).min(100) as u8;

        RiskAssessment {
            score,
            flags,
            sticky_after,
            avg_trade_size,
            buy_sell_ratio,
        }
    }

    /// Upheld reports and moderation nudge the sticky score directly.
    pub fn apply_penalty(&self, user: &mut UserState, points: u8) {
        user.risk_score = user.risk_score.saturating_add(points).min(100);
    }

    pub fn is_ban_level(&self, score: u8) -> bool {
        score >= self.cfg.ban_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> Config {
        Config::default()
    }

    fn trade(side: Side, value: f64, ts: u64) -> TradeRecord {
        TradeRecord {
            user_id: "u1".to_string(),
            token_id: "tok".to_string(),
            side,
            amount: 1,
            price: value,
            total_value: value,
            timestamp: ts,
        }
    }

    /// Most recent first, spaced `gap` ms apart ending at `end`.
    fn history(sides: &[Side], value: f64, end: u64, gap: u64) -> Vec<TradeRecord> {
        sides
            .iter()
            .enumerate()
            .map(|(i, s)| trade(*s, value, end - i as u64 * gap))
            .collect()
    }

    #[test]
    fn test_clean_history_keeps_sticky_score() {
        let scorer = RiskScorer::new(make_config());
        let mut user = UserState::new("u1");
        user.risk_score = 12;
        let recent = history(&[Side::Buy, Side::Sell], 50.0, 10_000_000, 600_000);
        let a = scorer.score(&user, &recent, 10_000_000);
        assert!(a.flags.is_empty(), "unexpected flags {:?}", a.flags);
        assert_eq!(a.score, 12);
        assert_eq!(a.sticky_after, 12);
        assert_eq!(a.level(), RiskLevel::Low);
    }

    #[test]
    fn test_high_volume_and_imbalanced_ratio() {
        // 15 buys / 3 sells = 5.0, avg 1500
        let scorer = RiskScorer::new(make_config());
        let mut user = UserState::new("u1");
        user.risk_score = 20;
        let mut sides = vec![Side::Buy; 15];
        sides.extend(vec![Side::Sell; 3]);
        let recent = history(&sides, 1500.0, 100_000_000, 3_600_000);
        let a = scorer.score(&user, &recent, 100_000_000);

        assert!(a.flags.contains(&Flag::HighVolume));
        assert!(a.flags.contains(&Flag::ImbalancedRatio));
        assert_eq!(a.buy_sell_ratio, Some(5.0));
        assert!(a.score >= 50);
    }

    #[test]
    fn test_score_capped_at_100() {
        let scorer = RiskScorer::new(make_config());
        let mut user = UserState::new("u1");
        user.risk_score = 80;
        let mut sides = vec![Side::Buy; 15];
        sides.extend(vec![Side::Sell; 3]);
        let recent = history(&sides, 1500.0, 100_000_000, 3_600_000);
        let a = scorer.score(&user, &recent, 100_000_000);
        assert_eq!(a.score, 100);
        assert_eq!(a.level(), RiskLevel::High);
    }

    #[test]
    fn test_ratio_skipped_without_both_sides() {
        let scorer = RiskScorer::new(make_config());
        let user = UserState::new("u1");
        let recent = history(&[Side::Buy; 8], 10.0, 100_000_000, 3_600_000);
        let a = scorer.score(&user, &recent, 100_000_000);
        assert!(!a.flags.contains(&Flag::ImbalancedRatio));
        assert_eq!(a.buy_sell_ratio, None);
    }

    #[test]
    fn test_low_ratio_flags() {
        let scorer = RiskScorer::new(make_config());
        let user = UserState::new("u1");
        let mut sides = vec![Side::Buy; 1];
        sides.extend(vec![Side::Sell; 5]);
        let recent = history(&sides, 10.0, 100_000_000, 3_600_000);
        let a = scorer.score(&user, &recent, 100_000_000);
        assert!(a.flags.contains(&Flag::ImbalancedRatio));
    }

    #[test]
    fn test_frequent_trading_counts_only_window() {
        let scorer = RiskScorer::new(make_config());
        let user = UserState::new("u1");
        // 11 trades, 5 minutes apart: all inside the hour window
        let recent = history(&[Side::Buy; 11], 10.0, 100_000_000, 300_000);
        let a = scorer.score(&user, &recent, 100_000_000);
        assert!(a.flags.contains(&Flag::FrequentTrading));

        // Same count spread over 11 hours
        let recent = history(&[Side::Buy; 11], 10.0, 100_000_000, 3_600_000);
        let a = scorer.score(&user, &recent, 100_000_000);
        assert!(!a.flags.contains(&Flag::FrequentTrading));
    }

    #[test]
    fn test_rapid_fire_uses_two_latest() {
        let scorer = RiskScorer::new(make_config());
        let user = UserState::new("u1");
        let mut recent = history(&[Side::Buy; 3], 10.0, 100_000_000, 600_000);
        recent[0].timestamp = recent[1].timestamp + 1_500;
        let a = scorer.score(&user, &recent, 100_000_000);
        assert!(a.flags.contains(&Flag::RapidFire));
        assert_eq!(a.score, 15);
        assert_eq!(a.sticky_after, 1);
    }

    #[test]
    fn test_history_truncated_to_configured_len() {
        let mut cfg = make_config();
        cfg.risk_history_len = 2;
        let scorer = RiskScorer::new(cfg);
        let user = UserState::new("u1");
        let mut recent = history(&[Side::Buy; 2], 10.0, 100_000_000, 600_000);
        recent.extend(history(&[Side::Buy; 5], 5000.0, 50_000_000, 600_000));
        let a = scorer.score(&user, &recent, 100_000_000);
        assert!(!a.flags.contains(&Flag::HighVolume));
        assert_eq!(a.avg_trade_size, 10.0);
    }

    #[test]
    fn test_penalty_saturates() {
        let scorer = RiskScorer::new(make_config());
        let mut user = UserState::new("u1");
        user.risk_score = 95;
        scorer.apply_penalty(&mut user, 10);
        assert_eq!(user.risk_score, 100);
        assert!(scorer.is_ban_level(user.risk_score));
        assert!(!scorer.is_ban_level(89));
    }
}
