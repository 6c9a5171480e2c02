//! Datastore wrapper that injects failures and latency, for drills and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::audit::AuditRecord;
use crate::curve::BondingCurveState;
use crate::storage::{Datastore, StoreError};
use crate::types::{TradeRecord, UserState};

#[derive(Debug, Clone)]
pub struct FaultProfile {
    pub read_failure_rate: f64,
    pub commit_failure_rate: f64,
    pub delay_ms: u64,
}

impl FaultProfile {
    pub fn disabled() -> Self {
        Self {
            read_failure_rate: 0.0,
            commit_failure_rate: 0.0,
            delay_ms: 0,
        }
    }
}

pub fn should_fault(seed: u64, rate: f64) -> bool {
    let v = (seed % 10_000) as f64 / 10_000.0;
    v < rate
}

pub struct FaultyStore {
    inner: Arc<dyn Datastore>,
    profile: FaultProfile,
    seq: AtomicU64,
    fail_next_commit: AtomicBool,
    commits_attempted: AtomicU64,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn Datastore>, profile: FaultProfile) -> Self {
        Self {
            inner,
            profile,
            seq: AtomicU64::new(0),
            fail_next_commit: AtomicBool::new(false),
            commits_attempted: AtomicU64::new(0),
        }
    }

    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn commits_attempted(&self) -> u64 {
        self.commits_attempted.load(Ordering::SeqCst)
    }

    /// Spread successive calls across the fault range.
    fn next_seed(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst).wrapping_mul(7_919)
    }

    async fn before_call(&self, rate: f64, op: &str) -> Result<(), StoreError> {
        if self.profile.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.profile.delay_ms)).await;
        }
        if should_fault(self.next_seed(), rate) {
            return Err(StoreError::Unavailable(format!("injected fault on {}", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for FaultyStore {
    async fn load_recent_trades(&self, user_id: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        self.before_call(self.profile.read_failure_rate, "load_recent_trades").await?;
        self.inner.load_recent_trades(user_id, limit).await
    }

    async fn load_user_state(&self, user_id: &str) -> Result<UserState, StoreError> {
        self.before_call(self.profile.read_failure_rate, "load_user_state").await?;
        self.inner.load_user_state(user_id).await
    }

    async fn load_curve_state(&self, token_id: &str) -> Result<Option<BondingCurveState>, StoreError> {
        self.before_call(self.profile.read_failure_rate, "load_curve_state").await?;
        self.inner.load_curve_state(token_id).await
    }

    async fn commit_trade_outcome(
        &self,
        trade: &TradeRecord,
        user: &UserState,
        curve: &BondingCurveState,
        audit: AuditRecord,
    ) -> Result<(), StoreError> {
        self.commits_attempted.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Conflict("injected commit conflict".to_string()));
        }
        self.before_call(self.profile.commit_failure_rate, "commit_trade_outcome").await?;
        self.inner.commit_trade_outcome(trade, user, curve, audit).await
    }

    async fn save_user_state(&self, user: &UserState) -> Result<(), StoreError> {
        self.before_call(self.profile.commit_failure_rate, "save_user_state").await?;
        self.inner.save_user_state(user).await
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<(), StoreError> {
        self.inner.append_audit(record).await
    }
}
