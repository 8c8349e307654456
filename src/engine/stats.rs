//! Runtime counters, gauges, rolling rates and error aggregation
//!
//! Everything here is fire-and-forget: recording never blocks the loops
//! beyond a short lock, and reporting is interval-gated. Non-critical
//! errors are aggregated and logged in one `error_agg` line per window
//! instead of spamming the log per occurrence.

use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Counter keys that also feed a rolling per-second rate gauge.
const RATE_KEYS: &[&str] = &[
    "supply_cancel",
    "captcha_attempt",
    "captcha_validate_pass",
    "elect_attempt",
    "probe_attempt",
    "net_error_total",
];

struct ErrorAgg {
    counts: HashMap<String, u64>,
    last_flush: Instant,
}

pub struct RuntimeStats {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    rate_window: Duration,
    rate_events: Mutex<HashMap<&'static str, VecDeque<Instant>>>,
    error_agg_interval: Duration,
    error_agg: Mutex<ErrorAgg>,
}

impl RuntimeStats {
    #[must_use]
    pub fn new(rate_window: Duration, error_agg_interval: Duration) -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            rate_window,
            rate_events: Mutex::new(HashMap::new()),
            error_agg_interval,
            error_agg: Mutex::new(ErrorAgg {
                counts: HashMap::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn from_config(cfg: &crate::config::RuntimeConfig) -> Self {
        Self::new(
            Duration::from_secs_f64(cfg.rate_window_seconds.max(0.0)),
            Duration::from_secs_f64(cfg.error_aggregate_interval.max(0.0)),
        )
    }

    pub fn inc(&self, key: &str) {
        self.inc_by(key, 1);
    }

    pub fn inc_by(&self, key: &str, delta: u64) {
        if delta == 0 {
            return;
        }
        *self.counters.entry(key.to_string()).or_insert(0) += delta;
        self.rate_record(key);
    }

    pub fn set_gauge(&self, key: &str, value: f64) {
        self.gauges.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).map_or(0, |v| *v)
    }

    #[must_use]
    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.gauges.get(key).map(|v| *v)
    }

    fn rate_record(&self, key: &str) {
        if self.rate_window.is_zero() {
            return;
        }
        let Some(key) = RATE_KEYS.iter().find(|k| **k == key) else {
            return;
        };
        let now = Instant::now();
        let mut events = self.rate_events.lock();
        let dq = events.entry(*key).or_default();
        dq.push_back(now);
        while dq.front().is_some_and(|t| now.duration_since(*t) > self.rate_window) {
            dq.pop_front();
        }
    }

    /// Events-per-second over the rolling window, per tracked key.
    #[must_use]
    pub fn rate_snapshot(&self) -> HashMap<&'static str, f64> {
        if self.rate_window.is_zero() {
            return HashMap::new();
        }
        let now = Instant::now();
        let mut events = self.rate_events.lock();
        let mut rates = HashMap::new();
        for (key, dq) in events.iter_mut() {
            while dq.front().is_some_and(|t| now.duration_since(*t) > self.rate_window) {
                dq.pop_front();
            }
            rates.insert(*key, dq.len() as f64 / self.rate_window.as_secs_f64());
        }
        rates
    }

    /// Count a non-critical error for the aggregated report.
    pub fn record_error(&self, key: &str) {
        if self.error_agg_interval.is_zero() {
            return;
        }
        let mut agg = self.error_agg.lock();
        *agg.counts.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Flush the error aggregation window if it elapsed, logging one
    /// summary line (`error_agg: <kind> x<n>, …`).
    pub fn maybe_flush_error_agg(&self) {
        if self.error_agg_interval.is_zero() {
            return;
        }
        let snapshot = {
            let mut agg = self.error_agg.lock();
            if agg.last_flush.elapsed() < self.error_agg_interval {
                return;
            }
            agg.last_flush = Instant::now();
            if agg.counts.is_empty() {
                return;
            }
            std::mem::take(&mut agg.counts)
        };
        let mut items: Vec<(String, u64)> = snapshot.into_iter().collect();
        items.sort_by(|a, b| b.1.cmp(&a.1));
        let total = items.len();
        let summary = items
            .iter()
            .take(10)
            .map(|(k, v)| format!("{k} x{v}"))
            .collect::<Vec<_>>()
            .join(", ");
        warn!(
            "error_agg({}s): {summary}",
            self.error_agg_interval.as_secs()
        );
        if total > 10 {
            warn!("error_agg: ... total={total}");
        }
    }

    /// Log counters and gauges grouped by concern, one line per group.
    pub fn report(&self) {
        for (key, rate) in self.rate_snapshot() {
            self.set_gauge(&format!("rate_{key}"), (rate * 10_000.0).round() / 10_000.0);
        }

        let counters: HashMap<String, u64> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        let gauges: HashMap<String, f64> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        if counters.is_empty() && gauges.is_empty() {
            return;
        }

        let counter_groups: &[(&str, &[&str])] = &[
            ("pool", &["pool_", "queue_", "client_"]),
            ("probe", &["probe_"]),
            ("captcha", &["captcha_"]),
            ("offline", &["offline_"]),
            ("net", &["net_error_"]),
            ("html", &["html_"]),
            ("auth", &["auth_"]),
            ("elect", &["elect_", "supply_cancel"]),
        ];
        let gauge_groups: &[(&str, &[&str])] = &[
            (
                "pool",
                &["elective_pool_", "relogin_pool_", "probe_pool_", "pool_reset_"],
            ),
            ("errors", &["elective_consecutive_", "iaaa_consecutive_"]),
            ("rate", &["rate_"]),
            ("offline", &["offline_"]),
            ("not_in_operation", &["not_in_operation_"]),
            ("auth", &["auth_"]),
            ("html", &["html_"]),
        ];

        report_grouped("runtime_stats", &counters, counter_groups, |v| v.to_string());
        report_grouped("runtime_gauges", &gauges, gauge_groups, |v| format!("{v}"));
    }
}

fn report_grouped<V: Copy>(
    label: &str,
    data: &HashMap<String, V>,
    groups: &[(&str, &[&str])],
    fmt: impl Fn(V) -> String,
) {
    let mut remaining: HashMap<&String, V> = data.iter().map(|(k, v)| (k, *v)).collect();
    let mut emit = |group: &str, picked: Vec<(&String, V)>| {
        if picked.is_empty() {
            return;
        }
        let mut picked = picked;
        picked.sort_by(|a, b| a.0.cmp(b.0));
        let line = picked
            .iter()
            .map(|(k, v)| format!("{k}={}", fmt(*v)))
            .collect::<Vec<_>>()
            .join(", ");
        info!("{label}.{group}: {line}");
    };
    for (group, prefixes) in groups {
        let keys: Vec<&String> = remaining
            .keys()
            .filter(|k| prefixes.iter().any(|p| k.starts_with(p)))
            .copied()
            .collect();
        let picked: Vec<(&String, V)> = keys
            .into_iter()
            .filter_map(|k| remaining.remove_entry(&k))
            .collect();
        emit(group, picked);
    }
    let rest: Vec<(&String, V)> = remaining.into_iter().collect();
    emit("other", rest);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> RuntimeStats {
        RuntimeStats::new(Duration::from_secs(60), Duration::from_secs(30))
    }

    #[test]
    fn test_counters_and_gauges() {
        let s = stats();
        s.inc("captcha_attempt");
        s.inc_by("captcha_attempt", 2);
        assert_eq!(s.counter("captcha_attempt"), 3);
        assert_eq!(s.counter("missing"), 0);
        s.set_gauge("offline_active", 1.0);
        assert_eq!(s.gauge("offline_active"), Some(1.0));
    }

    #[test]
    fn test_rate_snapshot_tracks_known_keys() {
        let s = stats();
        s.inc("captcha_attempt");
        s.inc("not_a_rate_key");
        let rates = s.rate_snapshot();
        assert!(rates.contains_key("captcha_attempt"));
        assert!(!rates.contains_key("not_a_rate_key"));
        assert!(rates["captcha_attempt"] > 0.0);
    }

    #[test]
    fn test_error_agg_flush_once_per_window() {
        let s = RuntimeStats::new(Duration::from_secs(60), Duration::from_millis(10));
        s.record_error("Http/502");
        s.record_error("Http/502");
        std::thread::sleep(Duration::from_millis(20));
        s.maybe_flush_error_agg();
        // Window content was taken; an immediate second flush is a no-op.
        let agg_empty = s.error_agg.lock().counts.is_empty();
        assert!(agg_empty);
    }
}
