//! Append-only audit sink for boundary events. Writes JSON Lines (one event
//! per line) with an optional hash chain for tamper evidence.
//!
//! Every inbound and outbound boundary call produces exactly one
//! [`BoundaryEvent`]. Request and response payloads are redacted before they
//! ever reach the writer: values under PII keys (email, phone, card fields,
//! tokens, secrets, idempotency keys) are replaced with a fixed sentinel.
//!
//! Emission must never fail the request that triggered it; use [`Auditor`],
//! which swallows and logs sink failures.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub const REDACTED: &str = "[REDACTED]";

/// Keys whose values are replaced wherever they appear, at any depth.
/// Matched case-insensitively after stripping `_` so both spellings of a
/// field ("idempotency_key" / "idempotencyKey") hit the same entry.
const PII_KEYS: &[&str] = &[
    "email",
    "phone",
    "card",
    "cardnumber",
    "cvv",
    "expiry",
    "token",
    "secret",
    "password",
    "idempotencykey",
    "apikey",
    "authorization",
];

// ---------------------------------------------------------------------------
// BoundaryEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

/// One boundary crossing: an Agent-facing request handled, or a Source-facing
/// call issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryEvent {
    pub direction: Direction,
    /// Stable endpoint label, e.g. "availability.submit" or "adapter.booking_create".
    pub endpoint: String,
    pub request_id: Uuid,
    pub actor_company_id: Option<Uuid>,
    pub source_id: Option<Uuid>,
    pub agreement_ref: Option<String>,
    pub status_code: u16,
    pub request: Value,
    pub response: Value,
    pub duration_ms: u64,
}

/// The persisted line: the event plus chain bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: Uuid,
    pub seq: u64,
    pub ts_utc: DateTime<Utc>,
    #[serde(flatten)]
    pub event: BoundaryEvent,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Replace values of PII keys with the sentinel, recursively.
pub fn redact(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut new = serde_json::Map::new();
            for (k, val) in map {
                if is_pii_key(k) {
                    new.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    new.insert(k.clone(), redact(val));
                }
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(redact).collect()),
        _ => v.clone(),
    }
}

fn is_pii_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();
    PII_KEYS.iter().any(|k| normalized == *k)
}

// ---------------------------------------------------------------------------
// AuditWriter
// ---------------------------------------------------------------------------

/// Append-only JSONL writer. Not shared directly; wrap in [`Auditor`].
pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    seq: u64,
}

impl AuditWriter {
    /// Creates the audit writer and ensures parent dirs exist.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        Ok(Self {
            path,
            hash_chain,
            last_hash: None,
            seq: 0,
        })
    }

    /// Restore chain state when resuming an existing log after restart.
    /// `seq` is the number of events already written.
    pub fn resume(&mut self, last_hash: Option<String>, seq: u64) {
        self.last_hash = last_hash;
        self.seq = seq;
    }

    /// Append one event. Payloads are redacted here, unconditionally.
    pub fn append(&mut self, event: BoundaryEvent) -> Result<AuditRecord> {
        let mut event = event;
        event.request = redact(&event.request);
        event.response = redact(&event.response);

        let mut rec = AuditRecord {
            event_id: Uuid::new_v4(),
            seq: self.seq,
            ts_utc: Utc::now(),
            event,
            hash_prev: None,
            hash_self: None,
        };
        self.seq += 1;

        if self.hash_chain {
            rec.hash_prev = self.last_hash.clone();
            let self_hash = compute_record_hash(&rec)?;
            rec.hash_self = Some(self_hash.clone());
            self.last_hash = Some(self_hash);
        }

        let line = canonical_json_line(&rec)?;
        append_line(&self.path, &line)?;

        Ok(rec)
    }
}

/// Write a single line to file (with trailing newline).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
/// One event == one JSON line.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit record failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Chain hash is computed from canonical JSON of the record WITHOUT
/// hash_self (to avoid self-reference).
pub fn compute_record_hash(rec: &AuditRecord) -> Result<String> {
    let mut clone = rec.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Verify the hash chain integrity of an audit log file.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;

    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let rec: AuditRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit record at line {}", i + 1))?;

        line_count += 1;

        if rec.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, rec.hash_prev
                ),
            });
        }

        if let Some(ref claimed) = rec.hash_self {
            let recomputed = compute_record_hash(&rec)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!(
                        "hash_self mismatch: claimed {}, recomputed {}",
                        claimed, recomputed
                    ),
                });
            }
        }

        prev_hash = rec.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

/// Result of hash chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

// ---------------------------------------------------------------------------
// Auditor: the shareable, infallible front
// ---------------------------------------------------------------------------

/// Thread-safe audit front handed to every engine. `emit` never returns an
/// error: a failing sink is logged at `warn` and the triggering request
/// proceeds untouched.
pub struct Auditor {
    writer: Option<Mutex<AuditWriter>>,
}

impl Auditor {
    pub fn new(writer: AuditWriter) -> Self {
        Self {
            writer: Some(Mutex::new(writer)),
        }
    }

    /// No-op sink for tests and deployments without an audit path.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn emit(&self, event: BoundaryEvent) {
        let Some(writer) = &self.writer else {
            return;
        };
        let result = match writer.lock() {
            Ok(mut w) => w.append(event).map(|_| ()),
            Err(poisoned) => poisoned.into_inner().append(event).map(|_| ()),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "audit emission failed; request unaffected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(request: Value) -> BoundaryEvent {
        BoundaryEvent {
            direction: Direction::In,
            endpoint: "availability.submit".to_string(),
            request_id: Uuid::new_v4(),
            actor_company_id: Some(Uuid::new_v4()),
            source_id: None,
            agreement_ref: Some("AGR-001".to_string()),
            status_code: 200,
            request,
            response: json!({"ok": true}),
            duration_ms: 12,
        }
    }

    #[test]
    fn redacts_pii_keys_at_any_depth() {
        let v = json!({
            "driver": {"email": "a@b.c", "phone": "+4411", "age": 30},
            "payment": {"card_number": "4111111111111111", "cvv": "123"},
            "idempotencyKey": "k-1",
            "items": [{"token": "t"}]
        });
        let r = redact(&v);
        assert_eq!(r["driver"]["email"], REDACTED);
        assert_eq!(r["driver"]["phone"], REDACTED);
        assert_eq!(r["driver"]["age"], 30);
        assert_eq!(r["payment"]["card_number"], REDACTED);
        assert_eq!(r["payment"]["cvv"], REDACTED);
        assert_eq!(r["idempotencyKey"], REDACTED);
        assert_eq!(r["items"][0]["token"], REDACTED);
    }

    #[test]
    fn append_writes_redacted_lines_and_chain_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = AuditWriter::new(&path, true).unwrap();

        w.append(sample_event(json!({"email": "x@y.z"}))).unwrap();
        w.append(sample_event(json!({"pickup": "PKKHI"}))).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("x@y.z"), "raw PII must not hit disk");
        assert!(content.contains(REDACTED));

        match verify_hash_chain(&path).unwrap() {
            VerifyResult::Valid { lines } => assert_eq!(lines, 2),
            VerifyResult::Broken { line, reason } => {
                panic!("chain broken at {line}: {reason}")
            }
        }
    }

    #[test]
    fn auditor_emit_never_panics_on_missing_sink() {
        let a = Auditor::disabled();
        a.emit(sample_event(json!({})));
    }

    #[test]
    fn tampered_line_breaks_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = AuditWriter::new(&path, true).unwrap();
        w.append(sample_event(json!({}))).unwrap();
        w.append(sample_event(json!({}))).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replace("availability.submit", "availability.TAMPER");
        fs::write(&path, tampered).unwrap();

        assert!(matches!(
            verify_hash_chain(&path).unwrap(),
            VerifyResult::Broken { .. }
        ));
    }
}
