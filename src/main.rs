use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use tradegate::curve::BondingCurveState;
use tradegate::identity::StaticVerifier;
use tradegate::logging::{self, log, obj, tick_aggregator, v_str, Domain, Level};
use tradegate::state::Config;
use tradegate::storage::SqliteStore;
use tradegate::types::{TradeAttempt, VerificationTier};
use tradegate::{AdmissionError, TradeAdmissionController};

/// One JSON object per stdin line, tagged by `cmd`.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    SeedToken {
        token_id: String,
        max_supply: u64,
        initial_price: f64,
        price_increment: f64,
        graduation_threshold_supply: u64,
        #[serde(default = "default_min_tier")]
        min_verification_tier: VerificationTier,
    },
    Verify {
        user_id: String,
        tier: VerificationTier,
        #[serde(default)]
        uniqueness_handle: Option<String>,
    },
    Trade(TradeAttempt),
    Report {
        user_id: String,
        upheld: bool,
    },
    Quest {
        user_id: String,
        quest_id: String,
        xp: u64,
    },
    Progress {
        token_id: String,
    },
}

fn default_min_tier() -> VerificationTier {
    VerificationTier::None
}

fn error_json(err: &AdmissionError) -> Value {
    match err {
        AdmissionError::Validation(e) => json!({"ok": false, "error": "validation", "detail": e.to_string()}),
        AdmissionError::Persistence { op, source } => {
            json!({"ok": false, "error": "persistence_failure", "op": op, "detail": source.to_string()})
        }
    }
}

async fn run(
    cmd: Command,
    engine: &TradeAdmissionController,
    store: &SqliteStore,
    verifier: &StaticVerifier,
) -> Value {
    match cmd {
        Command::SeedToken {
            token_id,
            max_supply,
            initial_price,
            price_increment,
            graduation_threshold_supply,
            min_verification_tier,
        } => {
            let curve = BondingCurveState::new(
                &token_id,
                max_supply,
                initial_price,
                price_increment,
                graduation_threshold_supply,
            )
            .with_min_tier(min_verification_tier);
            match store.register_curve(&curve) {
                Ok(()) => json!({"ok": true, "token_id": token_id}),
                Err(err) => {
                    log(
                        Level::Warn,
                        Domain::Store,
                        "seed_rejected",
                        obj(&[("token_id", v_str(&token_id)), ("error", v_str(&err.to_string()))]),
                    );
                    json!({"ok": false, "error": "store", "detail": err.to_string()})
                }
            }
        }
        Command::Verify { user_id, tier, uniqueness_handle } => {
            verifier.set(&user_id, tier, uniqueness_handle.as_deref());
            json!({"ok": true, "user_id": user_id, "tier": tier})
        }
        Command::Trade(attempt) => match engine.evaluate_trade(&attempt).await {
            Ok(decision) => json!({"ok": true, "decision": decision}),
            Err(err) => error_json(&err),
        },
        Command::Report { user_id, upheld } => match engine.apply_report(&user_id, upheld).await {
            Ok(user) => json!({"ok": true, "user": user}),
            Err(err) => error_json(&err),
        },
        Command::Quest { user_id, quest_id, xp } => {
            match engine.apply_quest_completed(&user_id, &quest_id, xp).await {
                Ok(granted) => json!({"ok": true, "granted": granted}),
                Err(err) => error_json(&err),
            }
        }
        Command::Progress { token_id } => match engine.graduation_progress(&token_id).await {
            Ok(pct) => json!({"ok": true, "token_id": token_id, "progress": pct}),
            Err(err) => error_json(&err),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store = Arc::new(
        SqliteStore::new(&cfg.sqlite_path)
            .with_context(|| format!("opening {}", cfg.sqlite_path))?,
    );
    store.init()?;
    let verifier = Arc::new(StaticVerifier::new());
    let engine = TradeAdmissionController::new(cfg.clone(), store.clone(), verifier.clone());

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[("sqlite_path", v_str(&cfg.sqlite_path))]),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let out = match serde_json::from_str::<Command>(trimmed) {
            Ok(cmd) => run(cmd, &engine, &store, &verifier).await,
            Err(err) => json!({"ok": false, "error": "parse", "detail": err.to_string()}),
        };
        println!("{}", out);
        tick_aggregator();
        engine.maintain();
    }

    logging::flush_aggregator();
    logging::flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(token_id: &str) -> Command {
        Command::SeedToken {
            token_id: token_id.to_string(),
            max_supply: 1_000,
            initial_price: 0.1,
            price_increment: 0.01,
            graduation_threshold_supply: 800,
            min_verification_tier: VerificationTier::None,
        }
    }

    #[tokio::test]
    async fn test_reseeding_a_token_answers_with_an_error_line() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.init().unwrap();
        let verifier = Arc::new(StaticVerifier::new());
        let engine = TradeAdmissionController::new(Config::default(), store.clone(), verifier.clone());

        let first = run(seed("tok"), &engine, &store, &verifier).await;
        assert_eq!(first["ok"], json!(true));
        let second = run(seed("tok"), &engine, &store, &verifier).await;
        assert_eq!(second["ok"], json!(false));
        assert_eq!(second["error"], json!("store"));

        // The loop keeps serving after the failed seed
        let progress = run(Command::Progress { token_id: "tok".to_string() }, &engine, &store, &verifier).await;
        assert_eq!(progress["progress"], json!(0));
    }
}
