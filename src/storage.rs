use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::audit::{AuditRecord, GENESIS_HASH};
use crate::curve::BondingCurveState;
use crate::types::{ReputationState, Side, TradeRecord, UserState, VerificationTier};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
    #[error("commit conflict: {0}")]
    Conflict(String),
    #[error("datastore timed out after {0} ms")]
    Timeout(u64),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Persistence collaborator consulted and updated by the admission engine.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Most recent first.
    async fn load_recent_trades(&self, user_id: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;
    /// Unknown users load as a fresh `UserState`.
    async fn load_user_state(&self, user_id: &str) -> Result<UserState, StoreError>;
    async fn load_curve_state(&self, token_id: &str) -> Result<Option<BondingCurveState>, StoreError>;
    /// Trade row, user row, curve row and audit row land together or not at all.
    async fn commit_trade_outcome(
        &self,
        trade: &TradeRecord,
        user: &UserState,
        curve: &BondingCurveState,
        audit: AuditRecord,
    ) -> Result<(), StoreError>;
    async fn save_user_state(&self, user: &UserState) -> Result<(), StoreError>;
    async fn append_audit(&self, record: AuditRecord) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        Ok(Self { conn: Mutex::new(Connection::open(path)?) })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))
    }

    pub fn init(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                risk_score INTEGER NOT NULL,
                banned INTEGER NOT NULL,
                reputation TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS curves (
                token_id TEXT PRIMARY KEY,
                current_supply INTEGER NOT NULL,
                max_supply INTEGER NOT NULL,
                initial_price REAL NOT NULL,
                price_increment REAL NOT NULL,
                graduation_threshold INTEGER NOT NULL,
                graduated INTEGER NOT NULL,
                min_tier TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                amount INTEGER NOT NULL,
                price REAL NOT NULL,
                total_value REAL NOT NULL,
                ts INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS trades_user_ts ON trades (user_id, ts);
            CREATE TABLE IF NOT EXISTS audit (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                risk_score INTEGER NOT NULL,
                flags TEXT NOT NULL,
                allowed INTEGER NOT NULL,
                reason TEXT,
                execution_price REAL,
                prev_hash TEXT NOT NULL,
                record_hash TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Register a new token's curve. A token is registered once; later
    /// supply and the graduation latch only move through trade commits.
    pub fn register_curve(&self, curve: &BondingCurveState) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO curves (token_id, current_supply, max_supply, initial_price, price_increment,
                                 graduation_threshold, graduated, min_tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(token_id) DO NOTHING",
            params![
                curve.token_id,
                curve.current_supply as i64,
                curve.max_supply as i64,
                curve.initial_price,
                curve.price_increment,
                curve.graduation_threshold_supply as i64,
                curve.graduated as i64,
                curve.min_verification_tier.as_str(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("token {} already registered", curve.token_id)));
        }
        Ok(())
    }

    /// Full audit trail in append order.
    pub fn load_audit(&self) -> Result<Vec<AuditRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts, user_id, token_id, risk_score, flags, allowed, reason, execution_price,
                    prev_hash, record_hash
             FROM audit ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                AuditRecord {
                    timestamp: row.get::<_, i64>(0)? as u64,
                    user_id: row.get(1)?,
                    token_id: row.get(2)?,
                    risk_score: row.get::<_, i64>(3)? as u8,
                    flags: Vec::new(),
                    allowed: row.get::<_, i64>(5)? != 0,
                    reason: row.get(6)?,
                    execution_price: row.get(7)?,
                    prev_hash: row.get(8)?,
                    record_hash: row.get(9)?,
                },
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (mut record, flags) = row?;
            record.flags = serde_json::from_str(&flags)?;
            out.push(record);
        }
        Ok(out)
    }
}

fn write_curve(conn: &Connection, curve: &BondingCurveState) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO curves (token_id, current_supply, max_supply, initial_price, price_increment,
                             graduation_threshold, graduated, min_tier)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(token_id) DO UPDATE SET
            current_supply = excluded.current_supply,
            max_supply = excluded.max_supply,
            initial_price = excluded.initial_price,
            price_increment = excluded.price_increment,
            graduation_threshold = excluded.graduation_threshold,
            graduated = excluded.graduated,
            min_tier = excluded.min_tier",
        params![
            curve.token_id,
            curve.current_supply as i64,
            curve.max_supply as i64,
            curve.initial_price,
            curve.price_increment,
            curve.graduation_threshold_supply as i64,
            curve.graduated as i64,
            curve.min_verification_tier.as_str(),
        ],
    )
}

fn corrupt(column: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, format!("invalid {} {:?}", what, value).into())
}

fn write_user(conn: &Connection, user: &UserState) -> Result<(), StoreError> {
    let reputation = serde_json::to_string(&user.reputation)?;
    conn.execute(
        "INSERT INTO users (user_id, risk_score, banned, reputation) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
            risk_score = excluded.risk_score,
            banned = excluded.banned,
            reputation = excluded.reputation",
        params![user.user_id, user.risk_score as i64, user.banned as i64, reputation],
    )?;
    Ok(())
}

fn write_audit(tx: &Transaction<'_>, mut record: AuditRecord) -> Result<(), StoreError> {
    let prev: Option<String> = tx
        .query_row("SELECT record_hash FROM audit ORDER BY seq DESC LIMIT 1", [], |r| r.get(0))
        .optional()?;
    record.seal(prev.as_deref().unwrap_or(GENESIS_HASH));
    tx.execute(
        "INSERT INTO audit (ts, user_id, token_id, risk_score, flags, allowed, reason,
                            execution_price, prev_hash, record_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.timestamp as i64,
            record.user_id,
            record.token_id,
            record.risk_score as i64,
            serde_json::to_string(&record.flags)?,
            record.allowed as i64,
            record.reason,
            record.execution_price,
            record.prev_hash,
            record.record_hash,
        ],
    )?;
    Ok(())
}

fn read_trade(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    let side: String = row.get(2)?;
    Ok(TradeRecord {
        user_id: row.get(0)?,
        token_id: row.get(1)?,
        side: Side::parse(&side).ok_or_else(|| corrupt(2, "side", &side))?,
        amount: row.get::<_, i64>(3)? as u64,
        price: row.get(4)?,
        total_value: row.get(5)?,
        timestamp: row.get::<_, i64>(6)? as u64,
    })
}

fn read_curve(row: &Row<'_>) -> rusqlite::Result<BondingCurveState> {
    let min_tier: String = row.get(7)?;
    Ok(BondingCurveState {
        token_id: row.get(0)?,
        current_supply: row.get::<_, i64>(1)? as u64,
        max_supply: row.get::<_, i64>(2)? as u64,
        initial_price: row.get(3)?,
        price_increment: row.get(4)?,
        graduation_threshold_supply: row.get::<_, i64>(5)? as u64,
        graduated: row.get::<_, i64>(6)? != 0,
        min_verification_tier: VerificationTier::parse(&min_tier).ok_or_else(|| corrupt(7, "min_tier", &min_tier))?,
    })
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn load_recent_trades(&self, user_id: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, token_id, side, amount, price, total_value, ts
             FROM trades WHERE user_id = ?1 ORDER BY ts DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], read_trade)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn load_user_state(&self, user_id: &str) -> Result<UserState, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT risk_score, banned, reputation FROM users WHERE user_id = ?1",
                params![user_id],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?)),
            )
            .optional()?;
        match row {
            Some((risk_score, banned, reputation)) => Ok(UserState {
                user_id: user_id.to_string(),
                risk_score: risk_score.clamp(0, 100) as u8,
                banned: banned != 0,
                reputation: serde_json::from_str::<ReputationState>(&reputation)?,
            }),
            None => Ok(UserState::new(user_id)),
        }
    }

    async fn load_curve_state(&self, token_id: &str) -> Result<Option<BondingCurveState>, StoreError> {
        let conn = self.conn()?;
        let curve = conn
            .query_row(
                "SELECT token_id, current_supply, max_supply, initial_price, price_increment,
                        graduation_threshold, graduated, min_tier
                 FROM curves WHERE token_id = ?1",
                params![token_id],
                read_curve,
            )
            .optional()?;
        Ok(curve)
    }

    async fn commit_trade_outcome(
        &self,
        trade: &TradeRecord,
        user: &UserState,
        curve: &BondingCurveState,
        audit: AuditRecord,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stored_graduated: Option<i64> = tx
            .query_row(
                "SELECT graduated FROM curves WHERE token_id = ?1",
                params![curve.token_id],
                |r| r.get(0),
            )
            .optional()?;
        match stored_graduated {
            None => return Err(StoreError::Conflict(format!("unknown token {}", curve.token_id))),
            Some(g) if g != 0 && !curve.graduated => {
                return Err(StoreError::Conflict(format!("token {} already graduated", curve.token_id)))
            }
            _ => {}
        }
        tx.execute(
            "INSERT INTO trades (user_id, token_id, side, amount, price, total_value, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                trade.user_id,
                trade.token_id,
                trade.side.as_str(),
                trade.amount as i64,
                trade.price,
                trade.total_value,
                trade.timestamp as i64,
            ],
        )?;
        write_user(&tx, user)?;
        write_curve(&tx, curve)?;
        write_audit(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    async fn save_user_state(&self, user: &UserState) -> Result<(), StoreError> {
        let conn = self.conn()?;
        write_user(&conn, user)
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        write_audit(&tx, record)?;
        tx.commit()?;
        Ok(())
    }
}
