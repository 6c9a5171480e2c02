//! Append-only audit trail of trade decisions.
//!
//! Records are chained: `record_hash = sha256(prev_hash || canonical body)`,
//! so editing or dropping a row breaks every hash after it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::types::{Flag, TradeAttempt, TradeDecision};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: u64,
    pub user_id: String,
    pub token_id: String,
    pub risk_score: u8,
    pub flags: Vec<Flag>,
    pub allowed: bool,
    /// Stable reason code, absent when allowed.
    pub reason: Option<String>,
    pub execution_price: Option<f64>,
    #[serde(default)]
    pub prev_hash: String,
    #[serde(default)]
    pub record_hash: String,
}

impl AuditRecord {
    /// `timestamp` is the engine clock at decision time, not the client stamp.
    pub fn from_decision(attempt: &TradeAttempt, decision: &TradeDecision, timestamp: u64) -> Self {
        Self {
            timestamp,
            user_id: attempt.user_id.clone(),
            token_id: attempt.token_id.clone(),
            risk_score: decision.risk_score,
            flags: decision.flags.iter().copied().collect(),
            allowed: decision.allowed,
            reason: decision.reason.map(|r| r.code().to_string()),
            execution_price: decision.execution_price,
            prev_hash: String::new(),
            record_hash: String::new(),
        }
    }

    fn body(&self) -> String {
        json!({
            "timestamp": self.timestamp,
            "user_id": self.user_id,
            "token_id": self.token_id,
            "risk_score": self.risk_score,
            "flags": self.flags,
            "allowed": self.allowed,
            "reason": self.reason,
            "execution_price": self.execution_price,
        })
        .to_string()
    }

    pub fn compute_hash(&self, prev_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(self.body().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Link this record after `prev_hash`.
    pub fn seal(&mut self, prev_hash: &str) {
        self.prev_hash = prev_hash.to_string();
        self.record_hash = self.compute_hash(prev_hash);
    }
}

/// Index of the first record whose link or hash does not verify.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), usize> {
    let mut prev = GENESIS_HASH.to_string();
    for (i, r) in records.iter().enumerate() {
        if r.prev_hash != prev || r.record_hash != r.compute_hash(&prev) {
            return Err(i);
        }
        prev = r.record_hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: &str, allowed: bool) -> AuditRecord {
        AuditRecord {
            timestamp: 1,
            user_id: user.to_string(),
            token_id: "tok".to_string(),
            risk_score: 15,
            flags: vec![Flag::RapidFire],
            allowed,
            reason: if allowed { None } else { Some("BANNED".to_string()) },
            execution_price: if allowed { Some(0.001) } else { None },
            prev_hash: String::new(),
            record_hash: String::new(),
        }
    }

    fn chain(n: usize) -> Vec<AuditRecord> {
        let mut prev = GENESIS_HASH.to_string();
        (0..n)
            .map(|i| {
                let mut r = record(&format!("u{}", i), i % 2 == 0);
                r.seal(&prev);
                prev = r.record_hash.clone();
                r
            })
            .collect()
    }

    #[test]
    fn test_hash_deterministic() {
        let r = record("u1", true);
        assert_eq!(r.compute_hash(GENESIS_HASH), r.compute_hash(GENESIS_HASH));
        assert_eq!(r.compute_hash(GENESIS_HASH).len(), 64);
    }

    #[test]
    fn test_chain_verifies() {
        assert_eq!(verify_chain(&chain(5)), Ok(()));
    }

    #[test]
    fn test_tamper_detected() {
        let mut records = chain(5);
        records[2].allowed = !records[2].allowed;
        assert_eq!(verify_chain(&records), Err(2));
    }

    #[test]
    fn test_dropped_record_detected() {
        let mut records = chain(5);
        records.remove(1);
        assert_eq!(verify_chain(&records), Err(1));
    }
}
