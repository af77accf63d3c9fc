//! Source health monitor: rolling verdict on whether a Source is fit to
//! receive traffic.
//!
//! Every adapter call reports `{source_id, latency_ms, success}`. Samples
//! accumulate in a bounded window per Source; a window that fills to
//! `min_samples` with a slow rate at or above `strike_rate` registers a
//! *strike* and starts a fresh window. `strike_threshold` consecutive
//! strikes advance the backoff level and open an exclusion window of
//! `backoff_base · 2^(level-1)`. A fresh window that completes under
//! `recover_rate` decays the level; at level 0 the exclusion clears.
//!
//! All operations are non-blocking; the dispatcher reads `is_excluded`
//! before every scatter and a briefly stale verdict is acceptable.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rmx_config::HealthConfig;
use rmx_schemas::{CompanyId, SourceHealthSnapshot};
use tracing::{debug, info};

/// One adapter call outcome. A failed call counts as slow regardless of
/// how fast it failed.
#[derive(Debug, Clone, Copy)]
pub struct CallMetric {
    pub source_id: CompanyId,
    pub latency_ms: u64,
    pub success: bool,
}

#[derive(Debug, Default)]
struct SourceState {
    /// true = slow sample.
    window: VecDeque<bool>,
    consecutive_strikes: u32,
    backoff_level: u32,
    excluded_until: Option<DateTime<Utc>>,
}

impl SourceState {
    fn slow_count(&self) -> usize {
        self.window.iter().filter(|s| **s).count()
    }

    fn slow_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.slow_count() as f64 / self.window.len() as f64
        }
    }
}

pub struct SourceHealthMonitor {
    cfg: HealthConfig,
    states: Mutex<HashMap<CompanyId, SourceState>>,
}

impl SourceHealthMonitor {
    pub fn new(cfg: HealthConfig) -> Self {
        Self {
            cfg,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, metric: CallMetric) {
        self.record_at(metric, Utc::now());
    }

    /// Record one sample against an explicit clock. The wall-clock variant
    /// above is what production callers use; tests drive this one.
    pub fn record_at(&self, metric: CallMetric, now: DateTime<Utc>) {
        let mut states = self.states.lock().expect("health state lock");
        let st = states.entry(metric.source_id).or_default();

        let slow = !metric.success || metric.latency_ms > self.cfg.slow_threshold_ms;
        st.window.push_back(slow);
        while st.window.len() > self.cfg.window_size {
            st.window.pop_front();
        }

        if st.window.len() < self.cfg.min_samples {
            return;
        }

        let rate = st.slow_rate();
        if rate >= self.cfg.strike_rate {
            // Strike: restart the window so each strike evaluation sees a
            // fresh sample set.
            st.consecutive_strikes += 1;
            st.window.clear();
            debug!(
                source_id = %metric.source_id,
                strikes = st.consecutive_strikes,
                slow_rate = rate,
                "source health strike"
            );

            if st.consecutive_strikes >= self.cfg.strike_threshold {
                st.consecutive_strikes = 0;
                st.backoff_level = (st.backoff_level + 1).min(self.cfg.max_backoff_level);
                let exclusion_ms =
                    self.cfg.backoff_base_ms as i64 * (1i64 << (st.backoff_level - 1));
                st.excluded_until = Some(now + ChronoDuration::milliseconds(exclusion_ms));
                info!(
                    source_id = %metric.source_id,
                    backoff_level = st.backoff_level,
                    excluded_until = ?st.excluded_until,
                    "source excluded from fan-out"
                );
            }
        } else {
            st.consecutive_strikes = 0;
            if st.backoff_level > 0 && rate < self.cfg.recover_rate {
                st.backoff_level -= 1;
                st.window.clear();
                if st.backoff_level == 0 {
                    st.excluded_until = None;
                    info!(source_id = %metric.source_id, "source recovered");
                }
            }
        }
    }

    pub fn is_excluded(&self, source_id: CompanyId) -> bool {
        self.is_excluded_at(source_id, Utc::now())
    }

    pub fn is_excluded_at(&self, source_id: CompanyId, now: DateTime<Utc>) -> bool {
        let states = self.states.lock().expect("health state lock");
        states
            .get(&source_id)
            .and_then(|st| st.excluded_until)
            .map_or(false, |t| t > now)
    }

    pub fn snapshot(&self, source_id: CompanyId) -> Option<SourceHealthSnapshot> {
        let states = self.states.lock().expect("health state lock");
        states.get(&source_id).map(|st| SourceHealthSnapshot {
            source_id,
            sample_count: st.window.len(),
            slow_count: st.slow_count(),
            slow_rate: st.slow_rate(),
            backoff_level: st.backoff_level,
            excluded_until: st.excluded_until,
        })
    }

    pub fn snapshots(&self) -> Vec<SourceHealthSnapshot> {
        let states = self.states.lock().expect("health state lock");
        let mut rows: Vec<SourceHealthSnapshot> = states
            .iter()
            .map(|(id, st)| SourceHealthSnapshot {
                source_id: *id,
                sample_count: st.window.len(),
                slow_count: st.slow_count(),
                slow_rate: st.slow_rate(),
                backoff_level: st.backoff_level,
                excluded_until: st.excluded_until,
            })
            .collect();
        rows.sort_by_key(|r| r.source_id);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cfg() -> HealthConfig {
        HealthConfig {
            window_size: 50,
            min_samples: 10,
            slow_threshold_ms: 3_000,
            strike_rate: 0.5,
            recover_rate: 0.2,
            strike_threshold: 3,
            backoff_base_ms: 30_000,
            max_backoff_level: 3,
        }
    }

    fn fill_window(mon: &SourceHealthMonitor, id: Uuid, slow: usize, fast: usize, now: DateTime<Utc>) {
        for _ in 0..slow {
            mon.record_at(
                CallMetric {
                    source_id: id,
                    latency_ms: 5_000,
                    success: true,
                },
                now,
            );
        }
        for _ in 0..fast {
            mon.record_at(
                CallMetric {
                    source_id: id,
                    latency_ms: 100,
                    success: true,
                },
                now,
            );
        }
    }

    #[test]
    fn fast_successful_calls_never_exclude() {
        let mon = SourceHealthMonitor::new(cfg());
        let id = Uuid::new_v4();
        let now = Utc::now();
        fill_window(&mon, id, 0, 100, now);
        assert!(!mon.is_excluded_at(id, now));
        assert_eq!(mon.snapshot(id).unwrap().backoff_level, 0);
    }

    #[test]
    fn failure_counts_as_slow_sample() {
        let mon = SourceHealthMonitor::new(cfg());
        let id = Uuid::new_v4();
        let now = Utc::now();
        for _ in 0..9 {
            mon.record_at(
                CallMetric {
                    source_id: id,
                    latency_ms: 10,
                    success: false,
                },
                now,
            );
        }
        let snap = mon.snapshot(id).unwrap();
        assert_eq!(snap.slow_count, 9);
    }

    #[test]
    fn three_strike_windows_open_exclusion() {
        let mon = SourceHealthMonitor::new(cfg());
        let id = Uuid::new_v4();
        let now = Utc::now();

        // Each batch of 10 all-slow samples is one strike evaluation.
        fill_window(&mon, id, 10, 0, now);
        assert!(!mon.is_excluded_at(id, now), "one strike is not enough");
        fill_window(&mon, id, 10, 0, now);
        assert!(!mon.is_excluded_at(id, now), "two strikes are not enough");
        fill_window(&mon, id, 10, 0, now);

        assert!(mon.is_excluded_at(id, now));
        let snap = mon.snapshot(id).unwrap();
        assert_eq!(snap.backoff_level, 1);
        let until = snap.excluded_until.unwrap();
        assert_eq!((until - now).num_milliseconds(), 30_000);
    }

    #[test]
    fn backoff_doubles_per_level_and_caps() {
        let mon = SourceHealthMonitor::new(cfg());
        let id = Uuid::new_v4();
        let now = Utc::now();

        // Level 1.
        for _ in 0..3 {
            fill_window(&mon, id, 10, 0, now);
        }
        // Level 2: 30s * 2.
        for _ in 0..3 {
            fill_window(&mon, id, 10, 0, now);
        }
        let snap = mon.snapshot(id).unwrap();
        assert_eq!(snap.backoff_level, 2);
        assert_eq!(
            (snap.excluded_until.unwrap() - now).num_milliseconds(),
            60_000
        );

        // Two more escalations: level caps at 3, window 30s * 4.
        for _ in 0..6 {
            fill_window(&mon, id, 10, 0, now);
        }
        let snap = mon.snapshot(id).unwrap();
        assert_eq!(snap.backoff_level, 3);
        assert_eq!(
            (snap.excluded_until.unwrap() - now).num_milliseconds(),
            120_000
        );
    }

    #[test]
    fn exclusion_expires_with_the_clock() {
        let mon = SourceHealthMonitor::new(cfg());
        let id = Uuid::new_v4();
        let now = Utc::now();
        for _ in 0..3 {
            fill_window(&mon, id, 10, 0, now);
        }
        assert!(mon.is_excluded_at(id, now));
        let later = now + ChronoDuration::milliseconds(30_001);
        assert!(!mon.is_excluded_at(id, later));
    }

    #[test]
    fn clean_window_decays_level_and_clears_exclusion() {
        let mon = SourceHealthMonitor::new(cfg());
        let id = Uuid::new_v4();
        let now = Utc::now();
        for _ in 0..3 {
            fill_window(&mon, id, 10, 0, now);
        }
        assert_eq!(mon.snapshot(id).unwrap().backoff_level, 1);

        // A fresh window of 10 fast samples (rate 0.0 < 0.2) decays to 0.
        fill_window(&mon, id, 0, 10, now);
        let snap = mon.snapshot(id).unwrap();
        assert_eq!(snap.backoff_level, 0);
        assert!(snap.excluded_until.is_none());
    }

    #[test]
    fn mediocre_window_neither_strikes_nor_decays() {
        let mon = SourceHealthMonitor::new(cfg());
        let id = Uuid::new_v4();
        let now = Utc::now();
        for _ in 0..3 {
            fill_window(&mon, id, 10, 0, now);
        }
        assert_eq!(mon.snapshot(id).unwrap().backoff_level, 1);

        // 30% slow: above recover_rate, below strike_rate.
        fill_window(&mon, id, 3, 7, now);
        let snap = mon.snapshot(id).unwrap();
        assert_eq!(snap.backoff_level, 1, "level must hold");
        assert!(snap.excluded_until.is_some());
    }
}
