//! Concurrent admission: supply, graduation and per-user caps hold under contention.

use std::sync::Arc;
use std::time::Duration;

use tradegate::curve::BondingCurveState;
use tradegate::identity::StaticVerifier;
use tradegate::state::{Config, ManualClock};
use tradegate::storage::{Datastore, SqliteStore};
use tradegate::types::{RejectReason, Side, TradeAttempt, TradeDecision, VerificationTier};
use tradegate::TradeAdmissionController;

const T0: u64 = 1_700_000_000_000;

fn setup(curves: &[BondingCurveState]) -> (Arc<TradeAdmissionController>, Arc<SqliteStore>, Arc<StaticVerifier>) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.init().unwrap();
    for c in curves {
        store.register_curve(c).unwrap();
    }
    let verifier = Arc::new(StaticVerifier::new());
    let engine = Arc::new(
        TradeAdmissionController::new(Config::default(), store.clone(), verifier.clone())
            .with_clock(Arc::new(ManualClock::new(T0))),
    );
    (engine, store, verifier)
}

fn buy(user: &str, token: &str, amount: u64, ts: u64) -> TradeAttempt {
    TradeAttempt {
        user_id: user.to_string(),
        token_id: token.to_string(),
        side: Side::Buy,
        amount,
        quoted_price: 0.001,
        timestamp: ts,
        verification_tier: VerificationTier::Orb,
        session_snapshot: Default::default(),
    }
}

async fn run_all(engine: &Arc<TradeAdmissionController>, attempts: Vec<TradeAttempt>) -> Vec<TradeDecision> {
    let handles: Vec<_> = attempts
        .into_iter()
        .map(|a| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.evaluate_trade(&a).await })
        })
        .collect();
    let mut out = Vec::new();
    for h in handles {
        out.push(h.await.unwrap().unwrap());
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_buys_never_oversell() {
    let mut curve = BondingCurveState::new("tok", 100, 0.01, 0.0001, 100);
    curve.current_supply = 90;
    let (engine, store, verifier) = setup(&[curve]);
    let attempts = (0..10)
        .map(|i| {
            let user = format!("u{}", i);
            verifier.set(&user, VerificationTier::Orb, None);
            buy(&user, "tok", 4, T0)
        })
        .collect();

    let decisions = run_all(&engine, attempts).await;
    let allowed = decisions.iter().filter(|d| d.allowed).count();
    assert_eq!(allowed, 2);
    assert!(decisions
        .iter()
        .filter(|d| !d.allowed)
        .all(|d| d.reason == Some(RejectReason::InsufficientSupply)));

    let curve = store.load_curve_state("tok").await.unwrap().unwrap();
    assert_eq!(curve.current_supply, 98);
    assert!(curve.current_supply <= curve.max_supply);
    assert!(!curve.graduated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graduation_race_admits_exactly_up_to_threshold() {
    let curve = BondingCurveState::new("grad", 100, 0.01, 0.0001, 50);
    let (engine, store, verifier) = setup(&[curve]);
    let attempts = (0..10)
        .map(|i| {
            let user = format!("g{}", i);
            verifier.set(&user, VerificationTier::Orb, None);
            buy(&user, "grad", 10, T0)
        })
        .collect();

    let decisions = run_all(&engine, attempts).await;
    assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 5);
    assert!(decisions
        .iter()
        .filter(|d| !d.allowed)
        .all(|d| d.reason == Some(RejectReason::Graduated)));

    let curve = store.load_curve_state("grad").await.unwrap().unwrap();
    assert_eq!(curve.current_supply, 50);
    assert!(curve.graduated);
    assert_eq!(engine.graduation_progress("grad").await.unwrap(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_user_burst_respects_hourly_cap() {
    let curve = BondingCurveState::new("tok", 1_000_000, 0.001, 0.0, 800_000);
    let (engine, store, verifier) = setup(&[curve]);
    verifier.set("burst", VerificationTier::Device, None);

    let attempts = (0..25).map(|_| buy("burst", "tok", 1, T0)).collect();
    let decisions = run_all(&engine, attempts).await;

    assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 10);
    assert!(decisions
        .iter()
        .filter(|d| !d.allowed)
        .all(|d| d.reason == Some(RejectReason::HourlyTradeLimitExceeded)));
    assert_eq!(store.load_curve_state("tok").await.unwrap().unwrap().current_supply, 10);
    assert_eq!(
        store.load_user_state("burst").await.unwrap().reputation.trades_completed,
        10
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossed_user_token_pairs_complete() {
    let a = BondingCurveState::new("a", 1_000_000, 0.001, 0.0, 800_000);
    let b = BondingCurveState::new("b", 1_000_000, 0.001, 0.0, 800_000);
    let (engine, store, verifier) = setup(&[a, b]);

    let mut attempts = Vec::new();
    for i in 0..8u64 {
        let user = format!("x{}", i);
        verifier.set(&user, VerificationTier::Orb, None);
        let (first, second) = if i % 2 == 0 { ("a", "b") } else { ("b", "a") };
        attempts.push(buy(&user, first, 1, T0 + i));
        attempts.push(buy(&user, second, 1, T0 + i));
    }

    let decisions = tokio::time::timeout(Duration::from_secs(10), run_all(&engine, attempts))
        .await
        .expect("admission stalled");
    assert!(decisions.iter().all(|d| d.allowed));

    let total = store.load_curve_state("a").await.unwrap().unwrap().current_supply
        + store.load_curve_state("b").await.unwrap().unwrap().current_supply;
    assert_eq!(total, 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_accounts_of_one_person_share_cap_under_contention() {
    let curve = BondingCurveState::new("tok", 1_000_000, 0.001, 0.0, 800_000);
    let (engine, store, verifier) = setup(&[curve]);
    let attempts = (0..24)
        .map(|i| {
            let user = format!("alt{}", i % 4);
            verifier.set(&user, VerificationTier::Device, Some("one-person"));
            buy(&user, "tok", 1, T0)
        })
        .collect();

    let decisions = run_all(&engine, attempts).await;
    assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 10);
    assert_eq!(store.load_curve_state("tok").await.unwrap().unwrap().current_supply, 10);
}
