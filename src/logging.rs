//! Structured JSONL logging for the admission engine.
//!
//! Every record carries a run id, a process-wide sequence number, a level
//! and a domain. Records go to stdout and to `LOG_DIR/<RUN_ID>/events.jsonl`
//! (info and above) or `trace.jsonl` (debug and trace).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::types::{TradeAttempt, TradeDecision};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Admission,  // Stage transitions, final decisions
    RateLimit,  // Throttle denials
    Risk,       // Scoring, flags, guard checks
    Reputation, // XP, levels, reports, bans
    Curve,      // Quotes, supply, graduation
    Store,      // Datastore calls and failures
    Audit,      // Audit trail entries
    System,     // Startup, shutdown, summaries
    Profile,    // Stage timings
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Admission => "admission",
            Domain::RateLimit => "rate_limit",
            Domain::Risk => "risk",
            Domain::Reputation => "reputation",
            Domain::Curve => "curve",
            Domain::Store => "store",
            Domain::Audit => "audit",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["uniqueness_handle", "authorization", "session_token"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["user_id", "token_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(Ok(mut w)) = writer.as_ref().map(|m| m.lock()) {
        let _ = writeln!(w, "{}", line);
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

/// Flush file sinks (call before exit).
pub fn flush() {
    if let Some(ctx) = RUN_CONTEXT.get() {
        for sink in [&ctx.events, &ctx.trace].into_iter().flatten() {
            if let Ok(mut w) = sink.lock() {
                let _ = w.flush();
            }
        }
    }
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

/// One line per decision, mirroring the audit record.
pub fn log_decision(attempt: &TradeAttempt, decision: &TradeDecision) {
    let flags: Vec<Value> = decision.flags.iter().map(|f| v_str(f.as_str())).collect();
    log(
        if decision.allowed { Level::Info } else { Level::Warn },
        Domain::Admission,
        "decision",
        obj(&[
            ("user_id", v_str(&attempt.user_id)),
            ("token_id", v_str(&attempt.token_id)),
            ("side", v_str(attempt.side.as_str())),
            ("amount", json!(attempt.amount)),
            ("allowed", json!(decision.allowed)),
            ("risk_score", json!(decision.risk_score)),
            ("flags", Value::Array(flags)),
            ("reason", decision.reason.map(|r| v_str(r.code())).unwrap_or(Value::Null)),
            ("execution_price", decision.execution_price.map(v_num).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_risk_check(check: &str, result: &str, value: f64, threshold: f64) {
    log(
        Level::Debug,
        Domain::Risk,
        "guard",
        obj(&[
            ("check", v_str(check)),
            ("result", v_str(result)),
            ("value", v_num(value)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_store_failure(op: &str, user_id: &str, token_id: &str, err: &str) {
    log(
        Level::Error,
        Domain::Store,
        "persistence_failure",
        obj(&[
            ("op", v_str(op)),
            ("user_id", v_str(user_id)),
            ("token_id", v_str(token_id)),
            ("error", v_str(err)),
        ]),
    );
}

/// Throttle denial. `scope` is "account" or "person"; the person handle
/// itself never reaches the log.
pub fn log_rate_limited(user_id: &str, scope: &str, remaining: u32) {
    log(Level::Warn, Domain::RateLimit, "denied", rate_limit_fields(user_id, scope, remaining));
}

fn rate_limit_fields(user_id: &str, scope: &str, remaining: u32) -> Map<String, Value> {
    obj(&[
        ("user_id", v_str(user_id)),
        ("scope", v_str(scope)),
        ("remaining", json!(remaining)),
    ])
}

pub fn log_audit_append(user_id: &str, token_id: &str, allowed: bool, persisted: bool) {
    let (level, event) = audit_event(persisted);
    log(
        level,
        Domain::Audit,
        event,
        obj(&[
            ("user_id", v_str(user_id)),
            ("token_id", v_str(token_id)),
            ("allowed", json!(allowed)),
        ]),
    );
}

fn audit_event(persisted: bool) -> (Level, &'static str) {
    if persisted {
        (Level::Debug, "appended")
    } else {
        (Level::Error, "append_failed")
    }
}

pub fn log_graduation(token_id: &str, supply: u64, threshold: u64) {
    log(
        Level::Info,
        Domain::Curve,
        "graduated",
        obj(&[
            ("token_id", v_str(token_id)),
            ("supply", json!(supply)),
            ("threshold", json!(threshold)),
        ]),
    );
}

// =============================================================================
// Utility functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits elapsed time at trace level on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self {
            label,
            context: obj(fields),
            started: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = std::mem::take(&mut self.context);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Aggregated counters
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionCounts {
    pub allowed: u64,
    pub rejected: u64,
    pub rate_limited: u64,
    pub persistence_failures: u64,
}

struct LogAggregator {
    counts: AdmissionCounts,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            counts: AdmissionCounts::default(),
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "allowed" => self.counts.allowed += 1,
            "rejected" => self.counts.rejected += 1,
            "rate_limited" => self.counts.rate_limited += 1,
            "persistence_failure" => self.counts.persistence_failures += 1,
            _ => {}
        }
    }

    fn take(&mut self) -> AdmissionCounts {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.counts)
    }
}

pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}

fn emit_counts(counts: AdmissionCounts) {
    log(
        Level::Info,
        Domain::System,
        "aggregated_stats",
        obj(&[
            ("allowed", json!(counts.allowed)),
            ("rejected", json!(counts.rejected)),
            ("rate_limited", json!(counts.rate_limited)),
            ("persistence_failures", json!(counts.persistence_failures)),
        ]),
    );
}

/// Emit aggregated counts if the flush interval has passed.
pub fn tick_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        if agg.last_flush.elapsed().as_secs() >= agg.flush_interval_secs {
            let counts = agg.take();
            drop(agg);
            emit_counts(counts);
        }
    }
}

/// Emit and reset counts unconditionally (shutdown).
pub fn flush_aggregator() -> AdmissionCounts {
    let counts = match get_aggregator().lock() {
        Ok(mut agg) => agg.take(),
        Err(_) => AdmissionCounts::default(),
    };
    emit_counts(counts);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_handle_redacted() {
        let m = sanitize_fields(obj(&[("uniqueness_handle", v_str("nullifier-123"))]));
        assert_eq!(m.get("uniqueness_handle").unwrap(), "[REDACTED]");
    }

    #[test]
    fn test_split_lifts_ids() {
        let (top, data) = split_fields(obj(&[("user_id", v_str("u1")), ("amount", json!(3))]));
        assert!(top.contains_key("user_id"));
        assert!(data.contains_key("amount"));
    }

    #[test]
    fn test_rate_limit_record_omits_handle() {
        let (top, data) = split_fields(sanitize_fields(rate_limit_fields("u1", "person", 0)));
        assert_eq!(top.get("user_id").unwrap(), "u1");
        assert_eq!(data.get("scope").unwrap(), "person");
        assert_eq!(data.get("remaining").unwrap(), 0);
        assert_eq!(Domain::RateLimit.as_str(), "rate_limit");
        log_rate_limited("u1", "person", 0);
    }

    #[test]
    fn test_failed_audit_append_is_an_error() {
        assert_eq!(audit_event(true), (Level::Debug, "appended"));
        assert_eq!(audit_event(false), (Level::Error, "append_failed"));
        assert_eq!(Domain::Audit.as_str(), "audit");
        log_audit_append("u1", "tok", false, false);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
