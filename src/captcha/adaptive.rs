//! Adaptive provider routing
//!
//! Tracks per-provider success and latency with EWMA smoothing and scores
//! each candidate as `p̂ − α·t − β·H`, where `t` is the provider's own
//! recognition latency, `H` the global network round-trip estimate and
//! `p̂ = (success+1)/(count+2)` (Laplace smoothing keeps a two-sample
//! provider away from the 0/1 extremes).
//!
//! The current primary is displaced only when the best candidate's score
//! clears `current·(1+ε)`; during cold start (nobody has `min_samples`
//! yet) a fail-streak on the head rotates it to the back instead.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Exponentially weighted moving average with lazy initialization.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    #[must_use]
    pub fn with_value(alpha: f64, value: Option<f64>) -> Self {
        Self { alpha, value }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            None => x,
            Some(v) => self.alpha * x + (1.0 - self.alpha) * v,
        };
        self.value = Some(next);
        next
    }

    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    fn set(&mut self, value: Option<f64>) {
        self.value = value;
    }
}

#[derive(Debug, Clone)]
struct ProviderStats {
    count: u64,
    success: u64,
    failure: u64,
    fail_streak: u32,
    latency: Ewma,
    h_latency: Ewma,
}

impl ProviderStats {
    fn new(latency_alpha: f64, h_alpha: f64) -> Self {
        Self {
            count: 0,
            success: 0,
            failure: 0,
            fail_streak: 0,
            latency: Ewma::new(latency_alpha),
            h_latency: Ewma::new(h_alpha),
        }
    }

    fn update(&mut self, success: bool, latency: Option<f64>, h_latency: Option<f64>) {
        self.count += 1;
        if success {
            self.success += 1;
            self.fail_streak = 0;
        } else {
            self.failure += 1;
            self.fail_streak += 1;
        }
        if let Some(t) = latency {
            self.latency.update(t);
        }
        if let Some(h) = h_latency {
            self.h_latency.update(h);
        }
    }

    fn p_hat(&self) -> f64 {
        (self.success as f64 + 1.0) / (self.count as f64 + 2.0)
    }
}

/// Per-provider stats in snapshot form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSnapshot {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    pub fail_streak: u32,
    pub latency: Option<f64>,
    pub h_latency: Option<f64>,
    pub p_hat: f64,
    #[serde(default)]
    pub score: Option<f64>,
}

/// The full router state as persisted and reported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveSnapshot {
    pub providers: Vec<String>,
    pub h: Option<f64>,
    pub stats: BTreeMap<String, ProviderSnapshot>,
}

/// Tuning knobs; see [`crate::config::CaptchaConfig`] for sources.
#[derive(Debug, Clone)]
pub struct AdaptiveOptions {
    pub enabled: bool,
    pub min_samples: u64,
    pub epsilon: f64,
    pub latency_alpha: f64,
    pub h_alpha: f64,
    pub update_interval: u64,
    pub fail_streak_degrade: u32,
    pub score_alpha: f64,
    pub score_beta: f64,
}

impl Default for AdaptiveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            min_samples: 10,
            epsilon: 0.1,
            latency_alpha: 0.2,
            h_alpha: 0.2,
            update_interval: 20,
            fail_streak_degrade: 3,
            score_alpha: 0.4,
            score_beta: 0.6,
        }
    }
}

impl AdaptiveOptions {
    #[must_use]
    pub fn from_config(cfg: &crate::config::CaptchaConfig) -> Self {
        Self {
            enabled: cfg.adaptive_enable,
            min_samples: u64::from(cfg.adaptive_min_samples.max(1)),
            epsilon: cfg.adaptive_epsilon.max(0.0),
            latency_alpha: cfg.adaptive_latency_alpha,
            h_alpha: cfg.adaptive_h_alpha,
            update_interval: cfg.adaptive_update_interval,
            fail_streak_degrade: cfg.adaptive_fail_streak_degrade,
            score_alpha: cfg.adaptive_score_alpha.max(0.0),
            score_beta: cfg.adaptive_score_beta.max(0.0),
        }
    }
}

#[derive(Debug)]
struct Inner {
    providers: Vec<String>,
    base_order: Vec<String>,
    stats: BTreeMap<String, ProviderStats>,
    h: Ewma,
    frozen: bool,
    last_update_loop: Option<u64>,
}

/// Result of a reorder decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderDecision {
    pub order: Vec<String>,
    pub switch_primary: bool,
    pub changed: bool,
}

pub struct AdaptiveRouter {
    opts: AdaptiveOptions,
    inner: Mutex<Inner>,
}

impl AdaptiveRouter {
    #[must_use]
    pub fn new(providers: Vec<String>, opts: AdaptiveOptions) -> Self {
        let stats = providers
            .iter()
            .map(|p| {
                (
                    p.clone(),
                    ProviderStats::new(opts.latency_alpha, opts.h_alpha),
                )
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                base_order: providers.clone(),
                providers,
                stats,
                h: Ewma::new(opts.h_alpha),
                frozen: false,
                last_update_loop: None,
            }),
            opts,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.opts.enabled
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.inner.lock().frozen = frozen;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }

    #[must_use]
    pub fn h_estimate(&self) -> Option<f64> {
        self.inner.lock().h.value()
    }

    #[must_use]
    pub fn get_order(&self) -> Vec<String> {
        self.inner.lock().providers.clone()
    }

    /// Adopt an externally applied order, creating stats slots for names
    /// the router has not seen yet.
    pub fn update_order(&self, order: &[String]) {
        let mut inner = self.inner.lock();
        for p in order {
            if !inner.stats.contains_key(p) {
                inner.stats.insert(
                    p.clone(),
                    ProviderStats::new(self.opts.latency_alpha, self.opts.h_alpha),
                );
            }
            if !inner.base_order.contains(p) {
                inner.base_order.push(p.clone());
            }
        }
        inner.providers = order.to_vec();
    }

    /// Record one attempt. `latency` is the recognizer's own time;
    /// `h_latency` the network round-trip component (draw + validate).
    pub fn record_attempt(
        &self,
        provider: &str,
        success: bool,
        latency: Option<f64>,
        h_latency: Option<f64>,
    ) {
        let mut inner = self.inner.lock();
        if !inner.stats.contains_key(provider) {
            inner.stats.insert(
                provider.to_string(),
                ProviderStats::new(self.opts.latency_alpha, self.opts.h_alpha),
            );
            if !inner.base_order.contains(&provider.to_string()) {
                inner.base_order.push(provider.to_string());
            }
        }
        if let Some(st) = inner.stats.get_mut(provider) {
            st.update(success, latency, h_latency);
        }
        if let Some(h) = h_latency {
            inner.h.update(h);
        }
    }

    fn score(&self, st: &ProviderStats, h_global: Option<f64>) -> f64 {
        let t = st.latency.value().unwrap_or(0.0);
        let h = st.h_latency.value().or(h_global).unwrap_or(0.0);
        st.p_hat() - self.opts.score_alpha * t - self.opts.score_beta * h
    }

    /// Possibly produce a new ordering for `current_order`. Honors the
    /// frozen flag and the update-interval gate (in loop ticks).
    #[must_use]
    pub fn maybe_reorder(&self, current_order: &[String], loop_count: Option<u64>) -> ReorderDecision {
        let unchanged = ReorderDecision {
            order: current_order.to_vec(),
            switch_primary: false,
            changed: false,
        };
        if !self.opts.enabled {
            return unchanged;
        }
        let mut inner = self.inner.lock();
        if inner.frozen {
            return unchanged;
        }
        let order: Vec<String> = current_order.to_vec();

        let cold_start = order.iter().all(|p| {
            inner
                .stats
                .get(p)
                .is_none_or(|st| st.count < self.opts.min_samples)
        });
        if cold_start {
            // Restore the configured base order, then apply the fail-streak
            // rotation to its head if warranted.
            let mut base: Vec<String> = inner
                .base_order
                .iter()
                .filter(|p| order.contains(p))
                .cloned()
                .collect();
            for p in &order {
                if !base.contains(p) {
                    base.push(p.clone());
                }
            }
            let (new_order, switch_primary) = self.apply_fail_streak(&inner, base);
            let changed = new_order != order;
            if changed {
                if let Some(lc) = loop_count {
                    inner.last_update_loop = Some(lc);
                }
            }
            return ReorderDecision {
                order: new_order,
                switch_primary,
                changed,
            };
        }

        if self.opts.update_interval > 0 {
            if let (Some(last), Some(lc)) = (inner.last_update_loop, loop_count) {
                if lc.saturating_sub(last) < self.opts.update_interval {
                    return unchanged;
                }
            }
        }

        let h_global = inner.h.value();
        let scored: Vec<(String, f64)> = order
            .iter()
            .filter_map(|p| {
                let st = inner.stats.get(p)?;
                if st.count < self.opts.min_samples {
                    return None;
                }
                Some((p.clone(), self.score(st, h_global)))
            })
            .collect();
        if scored.is_empty() {
            return unchanged;
        }

        let mut ranked = scored.clone();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let scored_names: Vec<String> = ranked.iter().map(|(p, _)| p.clone()).collect();
        let rest: Vec<String> = order
            .iter()
            .filter(|p| !scored_names.contains(p))
            .cloned()
            .collect();
        let new_order: Vec<String> = scored_names.iter().chain(rest.iter()).cloned().collect();

        let mut switch_primary = false;
        if let Some(current) = order.first() {
            let cur_score = ranked.iter().find(|(p, _)| p == current).map(|(_, s)| *s);
            if let (Some(cur_score), Some((best, best_score))) = (cur_score, ranked.first()) {
                if best != current && *best_score >= cur_score * (1.0 + self.opts.epsilon) {
                    switch_primary = true;
                }
            }
        }

        let changed = new_order != order;
        if changed {
            if let Some(lc) = loop_count {
                inner.last_update_loop = Some(lc);
            }
        }
        ReorderDecision {
            order: new_order,
            switch_primary,
            changed,
        }
    }

    fn apply_fail_streak(&self, inner: &Inner, order: Vec<String>) -> (Vec<String>, bool) {
        if self.opts.fail_streak_degrade == 0 || order.is_empty() {
            return (order, false);
        }
        let head = &order[0];
        let streak = inner.stats.get(head).map_or(0, |st| st.fail_streak);
        if streak < self.opts.fail_streak_degrade {
            return (order, false);
        }
        let mut rotated: Vec<String> = order[1..].to_vec();
        rotated.push(order[0].clone());
        (rotated, true)
    }

    /// The provider the probe should exercise next: least samples, ties
    /// broken by chain order.
    #[must_use]
    pub fn select_probe_provider(&self, order: &[String]) -> Option<String> {
        let inner = self.inner.lock();
        order
            .iter()
            .min_by_key(|p| inner.stats.get(*p).map_or(0, |st| st.count))
            .cloned()
    }

    /// Consistent snapshot of order, `H` and per-provider stats.
    #[must_use]
    pub fn snapshot(&self) -> AdaptiveSnapshot {
        let inner = self.inner.lock();
        let h_global = inner.h.value();
        let stats = inner
            .stats
            .iter()
            .map(|(name, st)| {
                let h_latency = st.h_latency.value().or(h_global);
                let score = (st.count >= self.opts.min_samples).then(|| self.score(st, h_global));
                (
                    name.clone(),
                    ProviderSnapshot {
                        count: st.count,
                        success: st.success,
                        failure: st.failure,
                        fail_streak: st.fail_streak,
                        latency: st.latency.value(),
                        h_latency,
                        p_hat: st.p_hat(),
                        score,
                    },
                )
            })
            .collect();
        AdaptiveSnapshot {
            providers: inner.providers.clone(),
            h: h_global,
            stats,
        }
    }

    /// Best-effort restore from a persisted snapshot; shortens cold start
    /// across restarts. Negative and non-finite values are dropped, the
    /// configured provider order is kept.
    pub fn load_snapshot(&self, snap: &AdaptiveSnapshot) -> bool {
        fn clean(v: Option<f64>) -> Option<f64> {
            v.filter(|x| x.is_finite() && *x >= 0.0)
        }
        let mut inner = self.inner.lock();
        if let Some(h) = clean(snap.h) {
            inner.h.set(Some(h));
        }
        for name in snap.providers.iter().chain(snap.stats.keys()) {
            if !inner.stats.contains_key(name) {
                inner.stats.insert(
                    name.clone(),
                    ProviderStats::new(self.opts.latency_alpha, self.opts.h_alpha),
                );
            }
            if !inner.base_order.contains(name) {
                inner.base_order.push(name.clone());
            }
        }
        for (name, data) in &snap.stats {
            if let Some(st) = inner.stats.get_mut(name) {
                st.count = data.count;
                st.success = data.success;
                st.failure = data.failure;
                st.fail_streak = data.fail_streak;
                st.latency.set(clean(data.latency));
                st.h_latency.set(clean(data.h_latency));
            }
        }
        true
    }
}
