//! Reputation ledger: XP, levels, quests, achievements, bans, and the
//! trading-limit table keyed by (verification tier, reputation level).

use crate::risk::RiskScorer;
use crate::session::SessionSummary;
use crate::state::Config;
use crate::types::{
    Achievement, ReputationLevel, TradeRecord, TradingLimits, UserState, VerificationTier,
};

pub const MAX_REPUTATION_SCORE: u32 = 1000;

/// Per-tier base caps scaled by a per-level multiplier.
///
/// Rows must be non-decreasing by tier (cooldown non-increasing) and
/// multipliers non-decreasing by level, each at least 1.0; `derive` is then
/// monotonic in both dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitTable {
    pub tiers: [TradingLimits; 4],
    pub level_multipliers: [f64; 4],
}

impl Default for LimitTable {
    fn default() -> Self {
        Self {
            tiers: [
                // None
                TradingLimits {
                    max_purchase_amount: 1_000,
                    max_daily_volume: 100.0,
                    cooldown_seconds: 30,
                    max_trades_per_hour: 5,
                    max_trades_per_day: 20,
                },
                // Device
                TradingLimits {
                    max_purchase_amount: 10_000,
                    max_daily_volume: 1_000.0,
                    cooldown_seconds: 0,
                    max_trades_per_hour: 10,
                    max_trades_per_day: 50,
                },
                // Phone
                TradingLimits {
                    max_purchase_amount: 100_000,
                    max_daily_volume: 10_000.0,
                    cooldown_seconds: 0,
                    max_trades_per_hour: 30,
                    max_trades_per_day: 200,
                },
                // Orb
                TradingLimits {
                    max_purchase_amount: 1_000_000,
                    max_daily_volume: 100_000.0,
                    cooldown_seconds: 0,
                    max_trades_per_hour: 100,
                    max_trades_per_day: 1_000,
                },
            ],
            level_multipliers: [1.0, 1.5, 2.0, 3.0],
        }
    }
}

fn tier_index(tier: VerificationTier) -> usize {
    match tier {
        VerificationTier::None => 0,
        VerificationTier::Device => 1,
        VerificationTier::Phone => 2,
        VerificationTier::Orb => 3,
    }
}

fn level_index(level: ReputationLevel) -> usize {
    match level {
        ReputationLevel::Bronze => 0,
        ReputationLevel::Silver => 1,
        ReputationLevel::Gold => 2,
        ReputationLevel::Diamond => 3,
    }
}

impl LimitTable {
    pub fn derive(&self, tier: VerificationTier, level: ReputationLevel) -> TradingLimits {
        let base = self.tiers[tier_index(tier)];
        let m = self.level_multipliers[level_index(level)].max(1.0);
        TradingLimits {
            max_purchase_amount: (base.max_purchase_amount as f64 * m).floor() as u64,
            max_daily_volume: base.max_daily_volume * m,
            cooldown_seconds: (base.cooldown_seconds as f64 / m).floor() as u64,
            max_trades_per_hour: (base.max_trades_per_hour as f64 * m).floor() as u32,
            max_trades_per_day: (base.max_trades_per_day as f64 * m).floor() as u32,
        }
    }
}

/// Limits for one launch phase. `below_min_tier` zeroes purchases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchLimits {
    pub limits: TradingLimits,
    pub below_min_tier: bool,
}

pub struct ReputationLedger {
    cfg: Config,
}

impl ReputationLedger {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub fn derive_limits(&self, tier: VerificationTier, level: ReputationLevel) -> TradingLimits {
        self.cfg.limits.derive(tier, level)
    }

    pub fn derive_launch_limits(
        &self,
        tier: VerificationTier,
        level: ReputationLevel,
        min_tier: VerificationTier,
    ) -> LaunchLimits {
        let mut limits = self.derive_limits(tier, level);
        let below_min_tier = tier < min_tier;
        if below_min_tier {
            limits.max_purchase_amount = 0;
        }
        LaunchLimits { limits, below_min_tier }
    }

    /// XP for a trade of `value`, square-root damped so many small trades
    /// earn less than one trade of the same total size.
    pub fn xp_for_value(value: f64) -> u64 {
        if value <= 0.0 || !value.is_finite() {
            return 0;
        }
        value.sqrt().floor() as u64
    }

    fn grant_xp(state: &mut UserState, xp: u64) {
        let rep = &mut state.reputation;
        rep.xp = rep.xp.saturating_add(xp);
        let gained = xp.min(MAX_REPUTATION_SCORE as u64) as u32;
        rep.score = rep.score.saturating_add(gained).min(MAX_REPUTATION_SCORE);
        rep.level = ReputationLevel::from_score(rep.score);
    }

    /// Record a completed trade. Returns achievements unlocked by it.
    pub fn apply_trade_outcome(&self, state: &mut UserState, trade: &TradeRecord) -> Vec<Achievement> {
        {
            let rep = &mut state.reputation;
            rep.trades_completed += 1;
            rep.total_volume += trade.total_value;
            rep.last_activity_timestamp = rep.last_activity_timestamp.max(trade.timestamp);
        }
        Self::grant_xp(state, Self::xp_for_value(trade.total_value));

        let rep = &state.reputation;
        let mut unlocked = Vec::new();
        let milestones = [
            (Achievement::FirstTrade, rep.trades_completed >= 1),
            (Achievement::TenTrades, rep.trades_completed >= 10),
            (Achievement::HundredTrades, rep.trades_completed >= 100),
            (Achievement::VolumeTenThousand, rep.total_volume >= 10_000.0),
        ];
        for (achievement, reached) in milestones {
            if reached && !rep.achievements.contains(&achievement) {
                unlocked.push(achievement);
            }
        }
        for achievement in &unlocked {
            state.reputation.achievements.insert(*achievement);
            Self::grant_xp(state, achievement.xp_bonus());
        }
        unlocked
    }

    /// Grant quest XP once per quest id. Returns false if already completed.
    pub fn apply_quest_completed(&self, state: &mut UserState, quest_id: &str, xp_reward: u64) -> bool {
        if !state.reputation.completed_quests.insert(quest_id.to_string()) {
            return false;
        }
        Self::grant_xp(state, xp_reward);
        true
    }

    /// Upheld reports penalise the reported user; dismissed reports change nothing.
    pub fn apply_report(&self, state: &mut UserState, upheld: bool, scorer: &RiskScorer) {
        if !upheld {
            return;
        }
        let rep = &mut state.reputation;
        rep.community_reports_against += 1;
        rep.suspicious_activity_count += 1;
        rep.score = rep.score.saturating_sub(self.cfg.report_score_penalty);
        rep.level = ReputationLevel::from_score(rep.score);
        scorer.apply_penalty(state, self.cfg.report_risk_penalty);
        self.refresh_ban(state);
    }

    /// Fold a closed session window into the reputation summary.
    pub fn close_session(&self, state: &mut UserState, summary: &SessionSummary) {
        let rep = &mut state.reputation;
        rep.sessions_completed += 1;
        if summary.volume_traded > rep.peak_session_volume {
            rep.peak_session_volume = summary.volume_traded;
        }
    }

    pub fn should_ban(&self, state: &UserState) -> bool {
        state.risk_score >= self.cfg.ban_threshold
            || state.reputation.suspicious_activity_count > self.cfg.max_suspicious_activity
    }

    /// Latch the ban flag. Only moderation (outside this engine) clears it.
    pub fn refresh_ban(&self, state: &mut UserState) -> bool {
        if self.should_ban(state) {
            state.banned = true;
        }
        state.banned
    }

    pub fn is_banned(&self, state: &UserState) -> bool {
        state.banned || self.should_ban(state)
    }
}
