//! Trade admission: one pass per attempt through
//! `Received -> RateLimitChecked -> RiskChecked -> ReputationChecked -> Priced -> Decided`.
//!
//! The rate limiter runs before any lock is taken. Every later stage runs
//! while holding the trader's lock and the token lock, so limit checks,
//! supply reservation and the commit are serialized per trader and per token.
//! A trader is the person behind a uniqueness handle when the verifier
//! reports one, otherwise the account itself.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::audit::AuditRecord;
use crate::curve::{BondingCurvePricer, BondingCurveState, QuoteError};
use crate::identity::{IdentityVerifier, Verification};
use crate::locks::{lock_pair, KeyedLocks};
use crate::logging::{
    agg_increment, log, log_audit_append, log_decision, log_graduation, log_rate_limited, log_risk_check,
    log_store_failure, obj, v_str, Domain, Level, ProfileScope,
};
use crate::rate_limit::RateLimiter;
use crate::reputation::ReputationLedger;
use crate::risk::RiskScorer;
use crate::session::{SessionBook, TradingSession};
use crate::state::{Clock, Config, SystemClock};
use crate::storage::{Datastore, StoreError};
use crate::types::{
    FlagSet, RejectReason, Side, TradeAttempt, TradeDecision, TradeRecord, TradingLimits, UserState,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("user_id is empty")]
    EmptyUserId,
    #[error("token_id is empty")]
    EmptyTokenId,
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("quoted_price must be a finite non-negative number")]
    InvalidQuotedPrice,
    #[error("unknown token {0}")]
    UnknownToken(String),
    #[error("timestamp {timestamp} is outside the accepted skew from {now}")]
    TimestampSkew { timestamp: u64, now: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid trade attempt: {0}")]
    Validation(#[from] ValidationError),
    /// Datastore unreachable, timed out or conflicted. Nothing was applied;
    /// the caller may resubmit the whole attempt.
    #[error("persistence failure in {op}: {source}")]
    Persistence {
        op: &'static str,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    RateLimitChecked,
    RiskChecked,
    ReputationChecked,
    Priced,
    Decided,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::RateLimitChecked => "rate_limit_checked",
            Stage::RiskChecked => "risk_checked",
            Stage::ReputationChecked => "reputation_checked",
            Stage::Priced => "priced",
            Stage::Decided => "decided",
        }
    }
}

pub fn validate(attempt: &TradeAttempt) -> Result<(), ValidationError> {
    if attempt.user_id.trim().is_empty() {
        return Err(ValidationError::EmptyUserId);
    }
    if attempt.token_id.trim().is_empty() {
        return Err(ValidationError::EmptyTokenId);
    }
    if attempt.amount == 0 {
        return Err(ValidationError::NonPositiveAmount);
    }
    if !attempt.quoted_price.is_finite() || attempt.quoted_price < 0.0 {
        return Err(ValidationError::InvalidQuotedPrice);
    }
    Ok(())
}

/// Key shared by every account of one person.
pub fn trader_key(user_id: &str, verification: &Verification) -> String {
    match &verification.uniqueness_handle {
        Some(handle) => format!("person:{}", handle),
        None => user_id.to_string(),
    }
}

/// First limit the attempt would break, checked in a fixed order.
///
/// `value` is the curve-priced value of the trade; the client quote is
/// never trusted for volume accounting.
pub fn check_limits(
    attempt: &TradeAttempt,
    value: f64,
    limits: &TradingLimits,
    session: &TradingSession,
    now: u64,
) -> Option<RejectReason> {
    if attempt.side == Side::Buy && attempt.amount > limits.max_purchase_amount {
        log_risk_check("max_purchase_amount", "fail", attempt.amount as f64, limits.max_purchase_amount as f64);
        return Some(RejectReason::PurchaseLimitExceeded);
    }
    let volume = session.day.volume_traded + value;
    if volume > limits.max_daily_volume {
        log_risk_check("max_daily_volume", "fail", volume, limits.max_daily_volume);
        return Some(RejectReason::DailyVolumeExceeded);
    }
    if session.hour.trades_count >= limits.max_trades_per_hour {
        log_risk_check(
            "max_trades_per_hour",
            "fail",
            session.hour.trades_count as f64,
            limits.max_trades_per_hour as f64,
        );
        return Some(RejectReason::HourlyTradeLimitExceeded);
    }
    if session.day.trades_count >= limits.max_trades_per_day {
        log_risk_check(
            "max_trades_per_day",
            "fail",
            session.day.trades_count as f64,
            limits.max_trades_per_day as f64,
        );
        return Some(RejectReason::DailyTradeLimitExceeded);
    }
    if let Some(last) = session.last_trade_ts {
        let ready_at = last.saturating_add(limits.cooldown_seconds.saturating_mul(1000));
        if now < ready_at {
            log_risk_check("cooldown", "fail", (ready_at - now) as f64, limits.cooldown_seconds as f64);
            return Some(RejectReason::CooldownActive);
        }
    }
    None
}

pub struct TradeAdmissionController {
    cfg: Config,
    store: Arc<dyn Datastore>,
    verifier: Arc<dyn IdentityVerifier>,
    clock: Arc<dyn Clock>,
    rate_limiter: RateLimiter,
    scorer: RiskScorer,
    ledger: ReputationLedger,
    sessions: SessionBook,
    user_locks: KeyedLocks,
    token_locks: KeyedLocks,
}

impl TradeAdmissionController {
    pub fn new(cfg: Config, store: Arc<dyn Datastore>, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            scorer: RiskScorer::new(cfg.clone()),
            ledger: ReputationLedger::new(cfg.clone()),
            rate_limiter: RateLimiter::new(),
            sessions: SessionBook::new(),
            user_locks: KeyedLocks::new(),
            token_locks: KeyedLocks::new(),
            clock: Arc::new(SystemClock),
            cfg,
            store,
            verifier,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> &ReputationLedger {
        &self.ledger
    }

    pub fn sessions(&self) -> &SessionBook {
        &self.sessions
    }

    async fn io<T>(
        &self,
        op: &'static str,
        user_id: &str,
        token_id: &str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, AdmissionError> {
        let timeout = Duration::from_millis(self.cfg.store_timeout_ms);
        let source = match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => StoreError::Timeout(self.cfg.store_timeout_ms),
        };
        log_store_failure(op, user_id, token_id, &source.to_string());
        agg_increment("persistence_failure");
        Err(AdmissionError::Persistence { op, source })
    }

    async fn verification(&self, user_id: &str, token_id: &str) -> Result<Verification, AdmissionError> {
        self.io(
            "current_verification",
            user_id,
            token_id,
            self.verifier.current_verification(user_id),
        )
        .await
    }

    fn trace_stage(attempt: &TradeAttempt, stage: Stage) {
        log(
            Level::Trace,
            Domain::Admission,
            "stage",
            obj(&[
                ("user_id", v_str(&attempt.user_id)),
                ("token_id", v_str(&attempt.token_id)),
                ("stage", v_str(stage.as_str())),
            ]),
        );
    }

    fn throttled(&self, key: &str, user_id: &str, now: u64) -> bool {
        if self.rate_limiter.allow(
            key,
            self.cfg.rate_limit_max_requests,
            self.cfg.rate_limit_window_ms,
            now,
        ) {
            return false;
        }
        log_rate_limited(
            user_id,
            if key == user_id { "account" } else { "person" },
            self.rate_limiter.remaining(key, self.cfg.rate_limit_max_requests, now),
        );
        true
    }

    /// Audit and log a policy rejection. An audit write failure is logged
    /// but does not change the decision: nothing was executed.
    async fn reject(&self, attempt: &TradeAttempt, decision: TradeDecision, stage: Stage, now: u64) -> TradeDecision {
        let audit = AuditRecord::from_decision(attempt, &decision, now);
        let persisted = self
            .io("append_audit", &attempt.user_id, &attempt.token_id, self.store.append_audit(audit))
            .await
            .is_ok();
        log_audit_append(&attempt.user_id, &attempt.token_id, false, persisted);
        log(
            Level::Debug,
            Domain::Admission,
            "rejected_at",
            obj(&[
                ("user_id", v_str(&attempt.user_id)),
                ("stage", v_str(stage.as_str())),
            ]),
        );
        log_decision(attempt, &decision);
        agg_increment(if decision.reason == Some(RejectReason::RateLimitExceeded) {
            "rate_limited"
        } else {
            "rejected"
        });
        decision
    }

    /// Decide one trade attempt. Policy rejections are `Ok` decisions;
    /// `Err` is reserved for malformed input and datastore failures.
    pub async fn evaluate_trade(&self, attempt: &TradeAttempt) -> Result<TradeDecision, AdmissionError> {
        let _profile = ProfileScope::new("evaluate_trade", &[("user_id", v_str(&attempt.user_id))]);
        validate(attempt)?;
        let now = self.clock.now_ms();
        if attempt.timestamp.abs_diff(now) > self.cfg.max_clock_skew_ms {
            return Err(ValidationError::TimestampSkew { timestamp: attempt.timestamp, now }.into());
        }
        let user_id = attempt.user_id.as_str();
        let token_id = attempt.token_id.as_str();
        Self::trace_stage(attempt, Stage::Received);

        if self.throttled(user_id, user_id, now) {
            let decision = TradeDecision::rejected(RejectReason::RateLimitExceeded, 0, FlagSet::new());
            return Ok(self.reject(attempt, decision, Stage::Received, now).await);
        }

        let verification = self.verification(user_id, token_id).await?;
        let trader = trader_key(user_id, &verification);
        if trader != user_id && self.throttled(&trader, user_id, now) {
            let decision = TradeDecision::rejected(RejectReason::RateLimitExceeded, 0, FlagSet::new());
            return Ok(self.reject(attempt, decision, Stage::Received, now).await);
        }
        Self::trace_stage(attempt, Stage::RateLimitChecked);

        let _guard = lock_pair(&self.user_locks, &trader, &self.token_locks, token_id).await;

        let curve = self
            .io("load_curve_state", user_id, token_id, self.store.load_curve_state(token_id))
            .await?
            .ok_or_else(|| ValidationError::UnknownToken(token_id.to_string()))?;
        let user = self
            .io("load_user_state", user_id, token_id, self.store.load_user_state(user_id))
            .await?;
        let recent = self
            .io(
                "load_recent_trades",
                user_id,
                token_id,
                self.store.load_recent_trades(user_id, self.cfg.risk_history_len),
            )
            .await?;

        let assessment = self.scorer.score(&user, &recent, now);
        let score = assessment.score;
        let flags = assessment.flags.clone();
        log(
            Level::Debug,
            Domain::Risk,
            "assessment",
            obj(&[
                ("user_id", v_str(user_id)),
                ("score", json!(score)),
                ("level", v_str(assessment.level().as_str())),
                ("flags", json!(flags.iter().map(|f| f.as_str()).collect::<Vec<_>>())),
                ("avg_trade_size", json!(assessment.avg_trade_size)),
            ]),
        );
        Self::trace_stage(attempt, Stage::RiskChecked);

        if self.ledger.is_banned(&user) || self.scorer.is_ban_level(score) {
            let decision = TradeDecision::rejected(RejectReason::Banned, score, flags);
            return Ok(self.reject(attempt, decision, Stage::RiskChecked, now).await);
        }

        if verification.tier != attempt.verification_tier {
            log(
                Level::Warn,
                Domain::Admission,
                "tier_mismatch",
                obj(&[
                    ("user_id", v_str(user_id)),
                    ("claimed", v_str(attempt.verification_tier.as_str())),
                    ("verified", v_str(verification.tier.as_str())),
                ]),
            );
        }
        let launch = self.ledger.derive_launch_limits(
            verification.tier,
            user.reputation.level,
            curve.min_verification_tier,
        );
        if launch.below_min_tier {
            log_risk_check(
                "min_verification_tier",
                "fail",
                verification.tier as u8 as f64,
                curve.min_verification_tier as u8 as f64,
            );
            let decision = TradeDecision::rejected(RejectReason::BelowMinTier, score, flags);
            return Ok(self.reject(attempt, decision, Stage::RiskChecked, now).await);
        }
        Self::trace_stage(attempt, Stage::ReputationChecked);

        // Pure quote first so volume limits see the curve value.
        let priced = BondingCurvePricer::quote(&curve, attempt.side, attempt.amount);
        let value = priced.as_ref().map(|q| q.total).unwrap_or_else(|_| attempt.quoted_value());
        let session = self.sessions.snapshot(&trader, now);
        if let Some(reason) = check_limits(attempt, value, &launch.limits, &session, now) {
            let decision = TradeDecision::rejected(reason, score, flags);
            return Ok(self.reject(attempt, decision, Stage::ReputationChecked, now).await);
        }

        let quote = match priced {
            Ok(q) => q,
            Err(err) => {
                let reason = match err {
                    QuoteError::InsufficientSupply => RejectReason::InsufficientSupply,
                    QuoteError::Graduated => RejectReason::Graduated,
                };
                let decision = TradeDecision::rejected(reason, score, flags);
                return Ok(self.reject(attempt, decision, Stage::ReputationChecked, now).await);
            }
        };
        if attempt.quoted_price > 0.0 && (quote.average_price - attempt.quoted_price).abs() > quote.average_price {
            log(
                Level::Info,
                Domain::Curve,
                "quote_drift",
                obj(&[
                    ("user_id", v_str(user_id)),
                    ("token_id", v_str(token_id)),
                    ("quoted", json!(attempt.quoted_price)),
                    ("curve", json!(quote.average_price)),
                ]),
            );
        }
        Self::trace_stage(attempt, Stage::Priced);

        let trade = TradeRecord {
            user_id: user_id.to_string(),
            token_id: token_id.to_string(),
            side: attempt.side,
            amount: attempt.amount,
            price: quote.average_price,
            total_value: quote.total,
            timestamp: now,
        };

        // Build the post-trade state off to the side; nothing is visible
        // until the datastore commit succeeds.
        let mut next_user = user.clone();
        next_user.risk_score = assessment.sticky_after;
        if let Some(summary) = self.sessions.pending_close(&trader, now) {
            self.ledger.close_session(&mut next_user, &summary);
        }
        let unlocked = self.ledger.apply_trade_outcome(&mut next_user, &trade);
        self.ledger.refresh_ban(&mut next_user);
        let mut next_curve = curve.clone();
        BondingCurvePricer::apply(&mut next_curve, &quote);

        let decision = TradeDecision::allowed(score, flags, quote.average_price, quote.total);
        let audit = AuditRecord::from_decision(attempt, &decision, now);
        self.io(
            "commit_trade_outcome",
            user_id,
            token_id,
            self.store.commit_trade_outcome(&trade, &next_user, &next_curve, audit),
        )
        .await?;
        self.sessions.record(&trader, quote.total, now);
        log_audit_append(user_id, token_id, true, true);
        Self::trace_stage(attempt, Stage::Decided);

        if next_curve.graduated && !curve.graduated {
            log_graduation(token_id, next_curve.current_supply, next_curve.graduation_threshold_supply);
        }
        if next_user.reputation.level != user.reputation.level || !unlocked.is_empty() {
            log(
                Level::Info,
                Domain::Reputation,
                "progress",
                obj(&[
                    ("user_id", v_str(user_id)),
                    ("level", v_str(next_user.reputation.level.as_str())),
                    ("xp", json!(next_user.reputation.xp)),
                    ("achievements", json!(unlocked)),
                ]),
            );
        }
        log_decision(attempt, &decision);
        agg_increment("allowed");
        Ok(decision)
    }

    /// Lock the trader owning `user_id` and load the account.
    async fn lock_user(&self, user_id: &str) -> Result<(crate::locks::KeyGuard, UserState), AdmissionError> {
        let verification = self.verification(user_id, "").await?;
        let guard = self.user_locks.lock(&trader_key(user_id, &verification)).await;
        let user = self
            .io("load_user_state", user_id, "", self.store.load_user_state(user_id))
            .await?;
        Ok((guard, user))
    }

    /// Apply a community report against `user_id`.
    pub async fn apply_report(&self, user_id: &str, upheld: bool) -> Result<UserState, AdmissionError> {
        let (_guard, mut user) = self.lock_user(user_id).await?;
        if !upheld {
            return Ok(user);
        }
        self.ledger.apply_report(&mut user, true, &self.scorer);
        self.io("save_user_state", user_id, "", self.store.save_user_state(&user))
            .await?;
        log(
            Level::Warn,
            Domain::Reputation,
            "report_upheld",
            obj(&[
                ("user_id", v_str(user_id)),
                ("suspicious_activity_count", json!(user.reputation.suspicious_activity_count)),
                ("risk_score", json!(user.risk_score)),
                ("banned", json!(user.banned)),
            ]),
        );
        Ok(user)
    }

    /// Grant quest XP once. Returns false if the quest was already completed.
    pub async fn apply_quest_completed(
        &self,
        user_id: &str,
        quest_id: &str,
        xp_reward: u64,
    ) -> Result<bool, AdmissionError> {
        let (_guard, mut user) = self.lock_user(user_id).await?;
        if !self.ledger.apply_quest_completed(&mut user, quest_id, xp_reward) {
            return Ok(false);
        }
        self.io("save_user_state", user_id, "", self.store.save_user_state(&user))
            .await?;
        log(
            Level::Info,
            Domain::Reputation,
            "quest_completed",
            obj(&[
                ("user_id", v_str(user_id)),
                ("quest_id", v_str(quest_id)),
                ("xp", json!(user.reputation.xp)),
            ]),
        );
        Ok(true)
    }

    /// Moderation override of the sticky risk score. Lowering the score does
    /// not lift an existing ban.
    pub async fn set_risk_score(&self, user_id: &str, score: u8) -> Result<UserState, AdmissionError> {
        let (_guard, mut user) = self.lock_user(user_id).await?;
        user.risk_score = score.min(100);
        self.ledger.refresh_ban(&mut user);
        self.io("save_user_state", user_id, "", self.store.save_user_state(&user))
            .await?;
        log(
            Level::Warn,
            Domain::Risk,
            "moderation_set_score",
            obj(&[("user_id", v_str(user_id)), ("risk_score", json!(user.risk_score))]),
        );
        Ok(user)
    }

    pub async fn curve_state(&self, token_id: &str) -> Result<BondingCurveState, AdmissionError> {
        self.io("load_curve_state", "", token_id, self.store.load_curve_state(token_id))
            .await?
            .ok_or_else(|| ValidationError::UnknownToken(token_id.to_string()).into())
    }

    pub async fn graduation_progress(&self, token_id: &str) -> Result<u8, AdmissionError> {
        let curve = self.curve_state(token_id).await?;
        Ok(BondingCurvePricer::graduation_progress(&curve))
    }

    /// Evict elapsed rate-limit windows and idle lock slots.
    pub fn maintain(&self) {
        let windows = self.rate_limiter.cleanup(self.clock.now_ms());
        let slots = self.user_locks.prune() + self.token_locks.prune();
        log(
            Level::Debug,
            Domain::System,
            "maintenance",
            obj(&[("windows_evicted", json!(windows)), ("lock_slots_pruned", json!(slots))]),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Window;
    use crate::types::VerificationTier;

    fn attempt(side: Side, amount: u64, price: f64) -> TradeAttempt {
        TradeAttempt {
            user_id: "u1".to_string(),
            token_id: "tok".to_string(),
            side,
            amount,
            quoted_price: price,
            timestamp: 1_000_000,
            verification_tier: VerificationTier::Device,
            session_snapshot: Default::default(),
        }
    }

    fn limits() -> TradingLimits {
        TradingLimits {
            max_purchase_amount: 100,
            max_daily_volume: 50.0,
            cooldown_seconds: 10,
            max_trades_per_hour: 3,
            max_trades_per_day: 5,
        }
    }

    #[test]
    fn test_validate() {
        assert_eq!(validate(&attempt(Side::Buy, 1, 1.0)), Ok(()));
        assert_eq!(validate(&attempt(Side::Buy, 0, 1.0)), Err(ValidationError::NonPositiveAmount));
        assert_eq!(validate(&attempt(Side::Buy, 1, f64::NAN)), Err(ValidationError::InvalidQuotedPrice));
        assert_eq!(validate(&attempt(Side::Buy, 1, -1.0)), Err(ValidationError::InvalidQuotedPrice));
        let mut a = attempt(Side::Buy, 1, 1.0);
        a.user_id = " ".to_string();
        assert_eq!(validate(&a), Err(ValidationError::EmptyUserId));
        let mut a = attempt(Side::Buy, 1, 1.0);
        a.token_id = String::new();
        assert_eq!(validate(&a), Err(ValidationError::EmptyTokenId));
    }

    #[test]
    fn test_trader_key_prefers_handle() {
        let mut v = Verification::unverified();
        assert_eq!(trader_key("u1", &v), "u1");
        v.uniqueness_handle = Some("h1".to_string());
        assert_eq!(trader_key("u1", &v), "person:h1");
    }

    #[test]
    fn test_limits_pass_on_empty_session() {
        let s = TradingSession::default();
        assert_eq!(check_limits(&attempt(Side::Buy, 100, 0.1), 10.0, &limits(), &s, 1_000_000), None);
    }

    #[test]
    fn test_purchase_cap_applies_to_buys_only() {
        let s = TradingSession::default();
        assert_eq!(
            check_limits(&attempt(Side::Buy, 101, 0.1), 10.1, &limits(), &s, 1_000_000),
            Some(RejectReason::PurchaseLimitExceeded)
        );
        assert_eq!(check_limits(&attempt(Side::Sell, 101, 0.1), 10.1, &limits(), &s, 1_000_000), None);
    }

    #[test]
    fn test_daily_volume_uses_priced_value() {
        let s = TradingSession {
            day: Window { trades_count: 1, volume_traded: 45.0, window_start: 0 },
            ..Default::default()
        };
        assert_eq!(
            check_limits(&attempt(Side::Buy, 60, 0.1), 6.0, &limits(), &s, 1_000_000),
            Some(RejectReason::DailyVolumeExceeded)
        );
        // A zero client quote does not hide the curve value
        assert_eq!(
            check_limits(&attempt(Side::Buy, 60, 0.0), 6.0, &limits(), &s, 1_000_000),
            Some(RejectReason::DailyVolumeExceeded)
        );
    }

    #[test]
    fn test_trade_counts() {
        let s = TradingSession {
            hour: Window { trades_count: 3, volume_traded: 0.0, window_start: 0 },
            day: Window { trades_count: 3, volume_traded: 0.0, window_start: 0 },
            last_trade_ts: Some(0),
        };
        assert_eq!(
            check_limits(&attempt(Side::Buy, 1, 0.1), 0.1, &limits(), &s, 1_000_000),
            Some(RejectReason::HourlyTradeLimitExceeded)
        );
        let s = TradingSession {
            hour: Window::default(),
            day: Window { trades_count: 5, volume_traded: 0.0, window_start: 0 },
            last_trade_ts: Some(0),
        };
        assert_eq!(
            check_limits(&attempt(Side::Buy, 1, 0.1), 0.1, &limits(), &s, 1_000_000),
            Some(RejectReason::DailyTradeLimitExceeded)
        );
    }

    #[test]
    fn test_cooldown() {
        let s = TradingSession { last_trade_ts: Some(995_000), ..Default::default() };
        assert_eq!(
            check_limits(&attempt(Side::Buy, 1, 0.1), 0.1, &limits(), &s, 1_000_000),
            Some(RejectReason::CooldownActive)
        );
        let s = TradingSession { last_trade_ts: Some(990_000), ..Default::default() };
        assert_eq!(check_limits(&attempt(Side::Buy, 1, 0.1), 0.1, &limits(), &s, 1_000_000), None);
    }
}
