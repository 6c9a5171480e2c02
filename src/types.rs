//! Value types shared by every admission stage.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Trust level asserted by the proof-of-personhood verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTier {
    None,
    Device,
    Phone,
    Orb,
}

impl VerificationTier {
    pub const ALL: [VerificationTier; 4] = [
        VerificationTier::None,
        VerificationTier::Device,
        VerificationTier::Phone,
        VerificationTier::Orb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationTier::None => "none",
            VerificationTier::Device => "device",
            VerificationTier::Phone => "phone",
            VerificationTier::Orb => "orb",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(VerificationTier::None),
            "device" => Some(VerificationTier::Device),
            "phone" => Some(VerificationTier::Phone),
            "orb" => Some(VerificationTier::Orb),
            _ => None,
        }
    }
}

/// Coarse trust bucket derived from reputation score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationLevel {
    Bronze,
    Silver,
    Gold,
    Diamond,
}

impl ReputationLevel {
    pub const ALL: [ReputationLevel; 4] = [
        ReputationLevel::Bronze,
        ReputationLevel::Silver,
        ReputationLevel::Gold,
        ReputationLevel::Diamond,
    ];

    /// Bronze 0-299, Silver 300-599, Gold 600-899, Diamond 900+.
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=299 => ReputationLevel::Bronze,
            300..=599 => ReputationLevel::Silver,
            600..=899 => ReputationLevel::Gold,
            _ => ReputationLevel::Diamond,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReputationLevel::Bronze => "bronze",
            ReputationLevel::Silver => "silver",
            ReputationLevel::Gold => "gold",
            ReputationLevel::Diamond => "diamond",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bronze" => Some(ReputationLevel::Bronze),
            "silver" => Some(ReputationLevel::Silver),
            "gold" => Some(ReputationLevel::Gold),
            "diamond" => Some(ReputationLevel::Diamond),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" | "BUY" => Some(Side::Buy),
            "sell" | "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Snapshot of the caller's session as seen by the API layer. Informational;
/// the engine keeps its own authoritative session book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub trades_count: u32,
    pub volume_traded: f64,
    pub window_start: u64,
}

/// A proposed trade. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAttempt {
    pub user_id: String,
    pub token_id: String,
    pub side: Side,
    pub amount: u64,
    pub quoted_price: f64,
    pub timestamp: u64,
    pub verification_tier: VerificationTier,
    #[serde(default)]
    pub session_snapshot: SessionSnapshot,
}

impl TradeAttempt {
    /// Notional value used for volume limits before the curve is priced.
    pub fn quoted_value(&self) -> f64 {
        self.amount as f64 * self.quoted_price
    }
}

/// An executed trade as held in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub user_id: String,
    pub token_id: String,
    pub side: Side,
    pub amount: u64,
    pub price: f64,
    pub total_value: f64,
    pub timestamp: u64,
}

/// Risk and policy flags attached to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    HighVolume,
    FrequentTrading,
    ImbalancedRatio,
    RapidFire,
    SupplyExceeded,
    BelowMinTier,
    Banned,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::HighVolume => "high_volume",
            Flag::FrequentTrading => "frequent_trading",
            Flag::ImbalancedRatio => "imbalanced_ratio",
            Flag::RapidFire => "rapid_fire",
            Flag::SupplyExceeded => "supply_exceeded",
            Flag::BelowMinTier => "below_min_tier",
            Flag::Banned => "banned",
        }
    }
}

pub type FlagSet = BTreeSet<Flag>;

/// Machine-readable rejection cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    RateLimitExceeded,
    Banned,
    BelowMinTier,
    PurchaseLimitExceeded,
    DailyVolumeExceeded,
    HourlyTradeLimitExceeded,
    DailyTradeLimitExceeded,
    CooldownActive,
    InsufficientSupply,
    Graduated,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            RejectReason::Banned => "BANNED",
            RejectReason::BelowMinTier => "BELOW_MIN_TIER",
            RejectReason::PurchaseLimitExceeded => "PURCHASE_LIMIT_EXCEEDED",
            RejectReason::DailyVolumeExceeded => "DAILY_VOLUME_EXCEEDED",
            RejectReason::HourlyTradeLimitExceeded => "HOURLY_TRADE_LIMIT_EXCEEDED",
            RejectReason::DailyTradeLimitExceeded => "DAILY_TRADE_LIMIT_EXCEEDED",
            RejectReason::CooldownActive => "COOLDOWN_ACTIVE",
            RejectReason::InsufficientSupply => "INSUFFICIENT_SUPPLY",
            RejectReason::Graduated => "GRADUATED",
        }
    }

    pub fn explanation(&self) -> &'static str {
        match self {
            RejectReason::RateLimitExceeded => "Too many requests in the current window; try again shortly.",
            RejectReason::Banned => "This account is suspended from trading.",
            RejectReason::BelowMinTier => "Your verification level is below the minimum required for this launch.",
            RejectReason::PurchaseLimitExceeded => "Amount exceeds the maximum purchase size for your tier and level.",
            RejectReason::DailyVolumeExceeded => "Trade would exceed your daily volume allowance.",
            RejectReason::HourlyTradeLimitExceeded => "You have reached the maximum number of trades for this hour.",
            RejectReason::DailyTradeLimitExceeded => "You have reached the maximum number of trades for today.",
            RejectReason::CooldownActive => "Please wait for the cooldown since your last trade to elapse.",
            RejectReason::InsufficientSupply => "Not enough curve supply remains to fill this trade.",
            RejectReason::Graduated => "This token has graduated and no longer trades on the bonding curve.",
        }
    }

    /// Flag recorded alongside the rejection, if the reason has one.
    pub fn flag(&self) -> Option<Flag> {
        match self {
            RejectReason::Banned => Some(Flag::Banned),
            RejectReason::BelowMinTier => Some(Flag::BelowMinTier),
            RejectReason::InsufficientSupply => Some(Flag::SupplyExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of one trade attempt. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    pub allowed: bool,
    pub risk_score: u8,
    pub flags: FlagSet,
    pub reason: Option<RejectReason>,
    pub explanation: Option<String>,
    /// Average per-unit execution price, present only when allowed.
    pub execution_price: Option<f64>,
    /// Total cost (buy) or proceeds (sell), present only when allowed.
    pub execution_value: Option<f64>,
}

impl TradeDecision {
    pub fn allowed(risk_score: u8, flags: FlagSet, execution_price: f64, execution_value: f64) -> Self {
        Self {
            allowed: true,
            risk_score,
            flags,
            reason: None,
            explanation: None,
            execution_price: Some(execution_price),
            execution_value: Some(execution_value),
        }
    }

    pub fn rejected(reason: RejectReason, risk_score: u8, mut flags: FlagSet) -> Self {
        if let Some(flag) = reason.flag() {
            flags.insert(flag);
        }
        Self {
            allowed: false,
            risk_score,
            flags,
            reason: Some(reason),
            explanation: Some(reason.explanation().to_string()),
            execution_price: None,
            execution_value: None,
        }
    }
}

/// Caps derived from (tier, level). Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradingLimits {
    pub max_purchase_amount: u64,
    pub max_daily_volume: f64,
    pub cooldown_seconds: u64,
    pub max_trades_per_hour: u32,
    pub max_trades_per_day: u32,
}

/// Achievements unlocked by trading milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Achievement {
    FirstTrade,
    TenTrades,
    HundredTrades,
    VolumeTenThousand,
}

impl Achievement {
    pub fn xp_bonus(&self) -> u64 {
        match self {
            Achievement::FirstTrade => 10,
            Achievement::TenTrades => 25,
            Achievement::HundredTrades => 100,
            Achievement::VolumeTenThousand => 50,
        }
    }
}

/// Per-user reputation. Mutated only through ledger events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationState {
    pub score: u32,
    pub level: ReputationLevel,
    pub xp: u64,
    pub trades_completed: u64,
    pub total_volume: f64,
    pub suspicious_activity_count: u32,
    pub community_reports_against: u32,
    pub last_activity_timestamp: u64,
    pub sessions_completed: u32,
    pub peak_session_volume: f64,
    #[serde(default)]
    pub completed_quests: BTreeSet<String>,
    #[serde(default)]
    pub achievements: BTreeSet<Achievement>,
}

impl Default for ReputationState {
    fn default() -> Self {
        Self {
            score: 0,
            level: ReputationLevel::Bronze,
            xp: 0,
            trades_completed: 0,
            total_volume: 0.0,
            suspicious_activity_count: 0,
            community_reports_against: 0,
            last_activity_timestamp: 0,
            sessions_completed: 0,
            peak_session_volume: 0.0,
            completed_quests: BTreeSet::new(),
            achievements: BTreeSet::new(),
        }
    }
}

/// Everything the engine reads about a user from the datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    /// Sticky risk score, 0..=100.
    pub risk_score: u8,
    pub banned: bool,
    pub reputation: ReputationState,
}

impl UserState {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            risk_score: 0,
            banned: false,
            reputation: ReputationState::default(),
        }
    }
}
