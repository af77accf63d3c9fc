//! Configuration for the RentMesh core: the dispatch, echo, health, and
//! retention knobs every engine reads at construction.
//!
//! Deployments stack YAML layers (a base file, then per-environment, then
//! local overrides) and the merged document is fingerprinted, so a running
//! daemon can always be traced to the exact timeouts and thresholds it
//! booted with. The semantics are fixed by the engines; only the numbers
//! live here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::time::Duration;

/// Load the YAML layers in order, merge them, fingerprint the result, and
/// decode the typed [`CoreConfig`]. Later layers win per key, so an
/// override file can raise `dispatch.sla_ms` for one environment without
/// restating the rest of the dispatch section.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for path in paths {
        let text =
            fs::read_to_string(path).with_context(|| format!("read config layer: {path}"))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parse config layer: {path}"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("config layer is not plain data: {path}"))?;
        merge_layer(&mut merged, layer);
    }

    let config_hash = fingerprint(&merged);
    let core: CoreConfig = serde_json::from_value(merged.clone())
        .context("merged config does not decode into the core knobs")?;

    Ok(LoadedConfig {
        core,
        config_json: merged,
        config_hash,
    })
}

/// The merged configuration: typed knobs for the engines, the raw document
/// for diagnostics, and the fingerprint logged at boot.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub core: CoreConfig,
    pub config_json: Value,
    pub config_hash: String,
}

/// Merge one layer into the accumulated document. Sections (`dispatch`,
/// `echo`, `health`, `retention`, `catalog`) merge key by key; arrays such
/// as `catalog.seed` and scalar knobs are replaced wholesale, never
/// concatenated.
fn merge_layer(dst: &mut Value, layer: Value) {
    match (dst, layer) {
        (Value::Object(sections), Value::Object(layer_sections)) => {
            for (key, value) in layer_sections {
                match sections.get_mut(&key) {
                    Some(slot) => merge_layer(slot, value),
                    None => {
                        sections.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// SHA-256 over a canonical walk of the merged document. Object keys are
/// visited in sorted order, so two layer stacks that merge to the same
/// knobs always produce the same fingerprint regardless of how the YAML
/// files spelled or ordered them.
fn fingerprint(config: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_value(config, &mut hasher);
    hex::encode(hasher.finalize())
}

fn hash_value(v: &Value, hasher: &mut Sha256) {
    match v {
        Value::Object(map) => {
            hasher.update(b"{");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b"=");
                hash_value(&map[key], hasher);
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

// ---------------------------------------------------------------------------
// Typed core config
// ---------------------------------------------------------------------------

/// Typed view of the merged configuration. Every knob has a default so a
/// deployment with no config files at all still boots with the nominal
/// timings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Seed for the in-memory location catalog. Database deployments read the
/// catalog table instead and leave this empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub seed: Vec<String>,
}

/// Availability fan-out knobs. The semantics are fixed by the engine; only
/// the numbers live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// In-flight adapter calls per job.
    #[serde(default = "d_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "d_per_call_timeout_ms")]
    pub per_call_timeout_ms: u64,
    /// Overall wall-clock budget from submit to forced completion.
    #[serde(default = "d_sla_ms")]
    pub sla_ms: u64,
    #[serde(default = "d_recommended_poll_ms")]
    pub recommended_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "e_per_call_timeout_ms")]
    pub per_call_timeout_ms: u64,
    #[serde(default = "e_sla_ms")]
    pub sla_ms: u64,
    #[serde(default = "e_watch_poll_ms")]
    pub watch_poll_ms: u64,
    /// Hard cap on a single watch stream.
    #[serde(default = "e_watch_max_ms")]
    pub watch_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "h_window_size")]
    pub window_size: usize,
    #[serde(default = "h_min_samples")]
    pub min_samples: usize,
    #[serde(default = "h_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// Slow rate at or above which a window registers a strike.
    #[serde(default = "h_strike_rate")]
    pub strike_rate: f64,
    /// Slow rate below which a fresh window decays the backoff level.
    #[serde(default = "h_recover_rate")]
    pub recover_rate: f64,
    /// Consecutive strikes before the backoff level advances.
    #[serde(default = "h_strike_threshold")]
    pub strike_threshold: u32,
    #[serde(default = "h_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "h_max_backoff_level")]
    pub max_backoff_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Availability and echo jobs are evicted this long after completion.
    #[serde(default = "r_job_ttl_secs")]
    pub job_ttl_secs: u64,
    /// Idempotency keys older than this are treated as absent.
    #[serde(default = "r_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
}

impl DispatchConfig {
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }
    pub fn sla(&self) -> Duration {
        Duration::from_millis(self.sla_ms)
    }
}

impl EchoConfig {
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }
    pub fn sla(&self) -> Duration {
        Duration::from_millis(self.sla_ms)
    }
}

fn d_max_concurrency() -> usize {
    10
}
fn d_per_call_timeout_ms() -> u64 {
    10_000
}
fn d_sla_ms() -> u64 {
    120_000
}
fn d_recommended_poll_ms() -> u64 {
    1_500
}
fn e_per_call_timeout_ms() -> u64 {
    5_000
}
fn e_sla_ms() -> u64 {
    30_000
}
fn e_watch_poll_ms() -> u64 {
    1_000
}
fn e_watch_max_ms() -> u64 {
    300_000
}
fn h_window_size() -> usize {
    50
}
fn h_min_samples() -> usize {
    10
}
fn h_slow_threshold_ms() -> u64 {
    3_000
}
fn h_strike_rate() -> f64 {
    0.5
}
fn h_recover_rate() -> f64 {
    0.2
}
fn h_strike_threshold() -> u32 {
    3
}
fn h_backoff_base_ms() -> u64 {
    30_000
}
fn h_max_backoff_level() -> u32 {
    3
}
fn r_job_ttl_secs() -> u64 {
    3_600
}
fn r_idempotency_ttl_secs() -> u64 {
    86_400
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: d_max_concurrency(),
            per_call_timeout_ms: d_per_call_timeout_ms(),
            sla_ms: d_sla_ms(),
            recommended_poll_ms: d_recommended_poll_ms(),
        }
    }
}
impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            per_call_timeout_ms: e_per_call_timeout_ms(),
            sla_ms: e_sla_ms(),
            watch_poll_ms: e_watch_poll_ms(),
            watch_max_ms: e_watch_max_ms(),
        }
    }
}
impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: h_window_size(),
            min_samples: h_min_samples(),
            slow_threshold_ms: h_slow_threshold_ms(),
            strike_rate: h_strike_rate(),
            recover_rate: h_recover_rate(),
            strike_threshold: h_strike_threshold(),
            backoff_base_ms: h_backoff_base_ms(),
            max_backoff_level: h_max_backoff_level(),
        }
    }
}
impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: r_job_ttl_secs(),
            idempotency_ttl_secs: r_idempotency_ttl_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_nominal_timings() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.dispatch.max_concurrency, 10);
        assert_eq!(cfg.dispatch.per_call_timeout_ms, 10_000);
        assert_eq!(cfg.dispatch.sla_ms, 120_000);
        assert_eq!(cfg.health.window_size, 50);
        assert_eq!(cfg.health.strike_threshold, 3);
        assert_eq!(cfg.retention.job_ttl_secs, 3_600);
    }

    #[test]
    fn later_layer_overrides_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        let over = dir.path().join("override.yaml");
        writeln!(
            fs::File::create(&base).unwrap(),
            "dispatch:\n  sla_ms: 5000\n  max_concurrency: 4"
        )
        .unwrap();
        writeln!(fs::File::create(&over).unwrap(), "dispatch:\n  sla_ms: 9000").unwrap();

        let loaded = load_layered_yaml(&[
            base.to_str().unwrap(),
            over.to_str().unwrap(),
        ])
        .unwrap();
        // The override layer restated only sla_ms; max_concurrency survives
        // from the base layer's dispatch section.
        assert_eq!(loaded.core.dispatch.sla_ms, 9_000);
        assert_eq!(loaded.core.dispatch.max_concurrency, 4);
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.yaml");
        let b = dir.path().join("b.yaml");
        writeln!(
            fs::File::create(&a).unwrap(),
            "echo:\n  sla_ms: 1\n  watch_poll_ms: 2"
        )
        .unwrap();
        writeln!(
            fs::File::create(&b).unwrap(),
            "echo:\n  watch_poll_ms: 2\n  sla_ms: 1"
        )
        .unwrap();

        let ha = load_layered_yaml(&[a.to_str().unwrap()]).unwrap().config_hash;
        let hb = load_layered_yaml(&[b.to_str().unwrap()]).unwrap().config_hash;
        assert_eq!(ha, hb);
    }

    #[test]
    fn hash_changes_when_a_knob_changes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.yaml");
        let b = dir.path().join("b.yaml");
        writeln!(fs::File::create(&a).unwrap(), "health:\n  window_size: 50").unwrap();
        writeln!(fs::File::create(&b).unwrap(), "health:\n  window_size: 51").unwrap();

        let ha = load_layered_yaml(&[a.to_str().unwrap()]).unwrap().config_hash;
        let hb = load_layered_yaml(&[b.to_str().unwrap()]).unwrap().config_hash;
        assert_ne!(ha, hb);
    }
}
