//! The coordinated circuit-breaker hierarchy
//!
//! Dozens of failure modes funnel into a handful of policies: a single
//! cooldown gate honored at the top of every round, an OFFLINE state for
//! accumulated network failures, a schedule-aware backoff for "not in
//! operation time", streak breakers for auth and HTML-parse errors, and
//! the captcha degrade window. Breakers record and decide here; the loops
//! own the side effects (pool drains, probes, notifications) so nothing
//! async ever runs under these locks.

use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng as _;

use crate::config::{BackoffConfig, CaptchaConfig, ResilienceConfig};
use crate::parser::schedule::{SchedulePhase, find_next_operation_start};

use super::stats::RuntimeStats;

/// Floor for any computed refresh interval.
pub const MIN_REFRESH_INTERVAL: f64 = 0.1;

/// Wall-clock now in epoch seconds (schedule math is wall-clock).
#[must_use]
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Jittered refresh interval: `base ± base·deviation·U(−1,1)`, floored.
#[must_use]
pub fn jittered_interval(base: f64, deviation: f64) -> f64 {
    if deviation <= 0.0 {
        return base.max(MIN_REFRESH_INTERVAL);
    }
    let u: f64 = rand::rng().random_range(-1.0..=1.0);
    (base + u * deviation * base).max(MIN_REFRESH_INTERVAL)
}

/// Error backoff: below the threshold the base holds; past it the extra
/// grows as `base·(factor^(errors−threshold+1) − 1)`, clamped to
/// `max_extra`.
#[must_use]
pub fn compute_backoff(base: f64, errors: u32, cfg: &BackoffConfig) -> f64 {
    if !cfg.enable || errors == 0 || errors < cfg.threshold {
        return base;
    }
    let exp = i32::try_from(errors - cfg.threshold + 1).unwrap_or(i32::MAX);
    let extra = (base * (cfg.factor.powi(exp) - 1.0)).clamp(0.0, cfg.max_extra);
    base + extra
}

/// What the elective loop should do about OFFLINE this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OfflineAdvice {
    /// Not offline; run the round normally.
    Inactive,
    /// Offline; sleep this long and come back.
    Wait(Duration),
    /// Offline and due: run a health probe now.
    Probe,
}

#[derive(Debug)]
struct OfflineState {
    active: bool,
    error_streak: u32,
    next_probe_at: Option<Instant>,
    observe_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct DegradeState {
    failure_count: u32,
    degrade_until: Option<Instant>,
    last_notify_at: Option<Instant>,
}

#[derive(Debug)]
struct NioState {
    streak: u32,
    min_refresh: f64,
    reason: String,
}

struct ScheduleCache {
    fetched_at: Option<Instant>,
    items: Option<Vec<SchedulePhase>>,
}

pub struct Breakers {
    cfg: ResilienceConfig,
    degrade_failures: u32,
    degrade_cooldown: Duration,
    degrade_notify_interval: Duration,
    stats: Arc<RuntimeStats>,

    cooldown_until: Mutex<Option<Instant>>,
    offline: Mutex<OfflineState>,
    degrade: Mutex<DegradeState>,
    auth_streak: Mutex<u32>,
    html_streak: Mutex<u32>,
    nio: Mutex<NioState>,
    schedule: Mutex<ScheduleCache>,
    last_critical_notify_at: Mutex<Option<Instant>>,
}

/// Whether a triggered breaker wants the session pool drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTrip {
    pub triggered: bool,
    pub drain_pool: bool,
}

impl BreakerTrip {
    const NONE: Self = Self {
        triggered: false,
        drain_pool: false,
    };
}

impl Breakers {
    #[must_use]
    pub fn new(cfg: ResilienceConfig, captcha: &CaptchaConfig, stats: Arc<RuntimeStats>) -> Self {
        let static_min = cfg.not_in_operation_min_refresh;
        Self {
            cfg,
            degrade_failures: captcha.degrade_failures,
            degrade_cooldown: Duration::from_secs_f64(captcha.degrade_cooldown.max(0.0)),
            degrade_notify_interval: Duration::from_secs_f64(
                captcha.degrade_notify_interval.max(0.0),
            ),
            stats,
            cooldown_until: Mutex::new(None),
            offline: Mutex::new(OfflineState {
                active: false,
                error_streak: 0,
                next_probe_at: None,
                observe_until: None,
            }),
            degrade: Mutex::new(DegradeState::default()),
            auth_streak: Mutex::new(0),
            html_streak: Mutex::new(0),
            nio: Mutex::new(NioState {
                streak: 0,
                min_refresh: static_min,
                reason: String::new(),
            }),
            schedule: Mutex::new(ScheduleCache {
                fetched_at: None,
                items: None,
            }),
            last_critical_notify_at: Mutex::new(None),
        }
    }

    // ---------------------------------------------------------------------
    // Cooldown gate
    // ---------------------------------------------------------------------

    pub fn enter_cooldown(&self, reason: &str, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        let until = Instant::now() + Duration::from_secs_f64(seconds);
        let mut slot = self.cooldown_until.lock();
        // Breakers compose: the latest deadline wins.
        if slot.is_none_or(|t| until > t) {
            *slot = Some(until);
        }
        warn!("Enter cooldown for {} s ({reason})", seconds as i64);
    }

    #[must_use]
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let slot = self.cooldown_until.lock();
        let until = (*slot)?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Sleep off up to 5 seconds of an active cooldown (the loop re-checks
    /// each round so shutdown stays responsive).
    pub async fn cooldown_sleep(&self) {
        if let Some(remaining) = self.cooldown_remaining() {
            tokio::time::sleep(remaining.min(Duration::from_secs(5))).await;
        }
    }

    // ---------------------------------------------------------------------
    // OFFLINE
    // ---------------------------------------------------------------------

    /// Count a network-classified failure; returns true when this one
    /// tripped the breaker into OFFLINE.
    pub fn record_network_error(&self, reason: &str) -> bool {
        if !self.cfg.offline_enabled {
            return false;
        }
        let mut offline = self.offline.lock();
        if offline.active {
            return false;
        }
        offline.error_streak += 1;
        if offline.error_streak < self.cfg.offline_error_threshold {
            return false;
        }
        offline.active = true;
        offline.error_streak = 0;
        offline.observe_until = None;
        offline.next_probe_at =
            Some(Instant::now() + Duration::from_secs_f64(self.cfg.offline_cooldown_seconds.max(0.0)));
        drop(offline);
        self.stats.inc("offline_enter");
        self.stats.set_gauge("offline_active", 1.0);
        self.stats.set_gauge("offline_observe_active", 0.0);
        warn!(
            "Enter OFFLINE (reason={reason}, next_probe_in={}s)",
            self.cfg.offline_cooldown_seconds.max(0.0) as i64
        );
        true
    }

    pub fn record_network_success(&self) {
        if !self.cfg.offline_enabled {
            return;
        }
        let mut offline = self.offline.lock();
        if !offline.active {
            offline.error_streak = 0;
        }
    }

    #[must_use]
    pub fn offline_active(&self) -> bool {
        self.offline.lock().active
    }

    /// What to do about OFFLINE right now. `Probe` also claims the probe
    /// slot by pushing the next probe deadline forward.
    #[must_use]
    pub fn offline_advice(&self) -> OfflineAdvice {
        let mut offline = self.offline.lock();
        if !offline.active {
            return OfflineAdvice::Inactive;
        }
        let now = Instant::now();
        match offline.next_probe_at {
            Some(at) if now < at => OfflineAdvice::Wait((at - now).min(Duration::from_secs(1))),
            _ => {
                offline.next_probe_at = Some(
                    now + Duration::from_secs_f64(self.cfg.offline_probe_interval.max(1.0)),
                );
                OfflineAdvice::Probe
            }
        }
    }

    /// Feed a health-probe result back. Returns true when the probe
    /// recovered the breaker (the caller then force-resets the pool).
    pub fn offline_probe_result(&self, ok: bool) -> bool {
        self.stats.inc("offline_probe_attempt");
        if !ok {
            self.stats.inc("offline_probe_fail");
            warn!(
                "OFFLINE probe failed, next in {}s",
                self.cfg.offline_probe_interval.max(1.0) as i64
            );
            return false;
        }
        self.stats.inc("offline_probe_success");
        let mut offline = self.offline.lock();
        offline.active = false;
        offline.error_streak = 0;
        offline.next_probe_at = None;
        offline.observe_until = (self.cfg.offline_observe_seconds > 0.0)
            .then(|| Instant::now() + Duration::from_secs_f64(self.cfg.offline_observe_seconds));
        drop(offline);
        self.stats.inc("offline_recover");
        self.stats.set_gauge("offline_active", 0.0);
        self.stats.set_gauge(
            "offline_observe_active",
            f64::from(u8::from(self.cfg.offline_observe_seconds > 0.0)),
        );
        warn!(
            "OFFLINE probe OK, recover; observe={}s",
            self.cfg.offline_observe_seconds.max(0.0) as i64
        );
        true
    }

    #[must_use]
    pub fn in_observe_window(&self) -> bool {
        let mut offline = self.offline.lock();
        match offline.observe_until {
            None => false,
            Some(until) if Instant::now() >= until => {
                offline.observe_until = None;
                self.stats.set_gauge("offline_observe_active", 0.0);
                false
            }
            Some(_) => true,
        }
    }

    // ---------------------------------------------------------------------
    // Captcha degrade
    // ---------------------------------------------------------------------

    #[must_use]
    pub fn captcha_degraded(&self) -> bool {
        self.degrade
            .lock()
            .degrade_until
            .is_some_and(|t| Instant::now() < t)
    }

    #[must_use]
    pub fn degrade_remaining(&self) -> Option<Duration> {
        let until = self.degrade.lock().degrade_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    pub fn record_captcha_success(&self) {
        self.degrade.lock().failure_count = 0;
    }

    /// Count a recognition/validation failure; returns true when the
    /// degrade window just opened.
    pub fn record_captcha_failure(&self) -> bool {
        if self.degrade_failures == 0 {
            return false;
        }
        let mut degrade = self.degrade.lock();
        degrade.failure_count += 1;
        if degrade.failure_count < self.degrade_failures {
            return false;
        }
        degrade.failure_count = 0;
        degrade.degrade_until = Some(Instant::now() + self.degrade_cooldown);
        drop(degrade);
        warn!(
            "Captcha recognition degraded for {} s",
            self.degrade_cooldown.as_secs()
        );
        true
    }

    /// Rate-limit degrade notifications; true means send one now.
    pub fn should_notify_degrade(&self) -> bool {
        let mut degrade = self.degrade.lock();
        let now = Instant::now();
        if degrade
            .last_notify_at
            .is_some_and(|t| now.duration_since(t) < self.degrade_notify_interval)
        {
            return false;
        }
        degrade.last_notify_at = Some(now);
        true
    }

    // ---------------------------------------------------------------------
    // Auth / HTML streak breakers
    // ---------------------------------------------------------------------

    pub fn record_auth_error(&self) -> BreakerTrip {
        self.stats.inc("auth_error");
        let mut streak = self.auth_streak.lock();
        *streak += 1;
        self.stats.set_gauge("auth_error_streak", f64::from(*streak));
        if self.cfg.auth_error_threshold == 0 || *streak < self.cfg.auth_error_threshold {
            return BreakerTrip::NONE;
        }
        *streak = 0;
        self.stats.set_gauge("auth_error_streak", 0.0);
        drop(streak);
        self.stats.inc("auth_trigger");
        self.enter_cooldown("auth_error", self.cfg.auth_cooldown_seconds);
        BreakerTrip {
            triggered: true,
            drain_pool: self.cfg.auth_reset_sessions,
        }
    }

    pub fn record_auth_success(&self) {
        let mut streak = self.auth_streak.lock();
        if *streak != 0 {
            *streak = 0;
            self.stats.set_gauge("auth_error_streak", 0.0);
        }
    }

    pub fn record_html_parse_error(&self, count_stat: bool) -> BreakerTrip {
        if count_stat {
            self.stats.inc("html_parse_error");
        }
        let mut streak = self.html_streak.lock();
        *streak += 1;
        self.stats.set_gauge("html_parse_streak", f64::from(*streak));
        if self.cfg.html_parse_error_threshold == 0 || *streak < self.cfg.html_parse_error_threshold
        {
            return BreakerTrip::NONE;
        }
        *streak = 0;
        self.stats.set_gauge("html_parse_streak", 0.0);
        drop(streak);
        self.stats.inc("html_parse_trigger");
        self.enter_cooldown("html_parse", self.cfg.html_parse_cooldown_seconds);
        BreakerTrip {
            triggered: true,
            drain_pool: self.cfg.html_parse_reset_sessions,
        }
    }

    pub fn record_html_parse_success(&self) {
        let mut streak = self.html_streak.lock();
        if *streak != 0 {
            *streak = 0;
            self.stats.set_gauge("html_parse_streak", 0.0);
        }
    }

    // ---------------------------------------------------------------------
    // Critical
    // ---------------------------------------------------------------------

    /// Long cooldown for CaughtCheating / IAAAForbidden. Returns whether
    /// the pool should also be drained.
    pub fn critical(&self, reason: &str) -> BreakerTrip {
        self.enter_cooldown(reason, self.cfg.critical_cooldown_seconds);
        BreakerTrip {
            triggered: true,
            drain_pool: self.cfg.critical_reset_sessions,
        }
    }

    #[must_use]
    pub fn critical_reset_cache(&self) -> bool {
        self.cfg.critical_reset_cache
    }

    /// Rate-limit failure/critical notifications; true means notify now.
    pub fn should_notify_failure(&self, consecutive_errors: u32) -> bool {
        if self.cfg.failure_notify_threshold == 0
            || consecutive_errors < self.cfg.failure_notify_threshold
            || self.cfg.failure_notify_interval <= 0.0
        {
            return false;
        }
        let mut last = self.last_critical_notify_at.lock();
        let now = Instant::now();
        let interval = Duration::from_secs_f64(self.cfg.failure_notify_interval);
        if last.is_some_and(|t| now.duration_since(t) < interval) {
            return false;
        }
        *last = Some(now);
        true
    }

    // ---------------------------------------------------------------------
    // Not-in-operation backoff
    // ---------------------------------------------------------------------

    /// Cached schedule if fresh, None when a refetch is warranted.
    #[must_use]
    pub fn cached_schedule(&self) -> Option<Vec<SchedulePhase>> {
        if !self.cfg.not_in_operation_dynamic_enable {
            return None;
        }
        let cache = self.schedule.lock();
        let fetched_at = cache.fetched_at?;
        let ttl = self.cfg.schedule_ttl_seconds;
        if ttl > 0.0 && fetched_at.elapsed() > Duration::from_secs_f64(ttl) {
            return None;
        }
        cache.items.clone()
    }

    /// Schedule as last seen, fresh or not (fallback when refetch fails).
    #[must_use]
    pub fn any_schedule(&self) -> Option<Vec<SchedulePhase>> {
        self.schedule.lock().items.clone()
    }

    pub fn store_schedule(&self, items: Vec<SchedulePhase>) {
        if items.is_empty() {
            return;
        }
        let mut cache = self.schedule.lock();
        cache.items = Some(items);
        cache.fetched_at = Some(Instant::now());
    }

    #[must_use]
    pub fn schedule_dynamic_enabled(&self) -> bool {
        self.cfg.not_in_operation_dynamic_enable
    }

    /// Map time-to-next-phase onto a minimum refresh interval.
    fn piecewise_min_refresh(&self, delta: f64) -> f64 {
        let long_max = self.cfg.not_in_operation_long_sleep_max;
        if delta >= 24.0 * 3600.0 {
            long_max.min(1800.0)
        } else if delta >= 6.0 * 3600.0 {
            long_max.min(600.0)
        } else if delta >= 2.0 * 3600.0 {
            120.0
        } else if delta >= 30.0 * 60.0 {
            30.0
        } else if delta >= 5.0 * 60.0 {
            10.0
        } else {
            self.cfg.not_in_operation_min_refresh
        }
    }

    /// Update the dynamic backoff after a NotInOperationTime round.
    /// Returns `(min_refresh, reason)`; the reason names the next phase
    /// when the schedule knows one.
    pub fn update_not_in_operation(&self, schedule: Option<&[SchedulePhase]>, now: i64) -> (f64, String) {
        let mut min_refresh = self.cfg.not_in_operation_min_refresh;
        let mut cooldown = self.cfg.not_in_operation_cooldown_seconds;
        let mut reason = "static".to_string();

        if self.cfg.not_in_operation_dynamic_enable {
            if let Some(next) = schedule.and_then(|s| find_next_operation_start(now, s)) {
                let delta = (next.start_ts - now).max(0) as f64;
                let computed = self.piecewise_min_refresh(delta);
                min_refresh = min_refresh.max(computed);
                cooldown = cooldown.clamp(0.0, min_refresh);
                let start = chrono::DateTime::from_timestamp(next.start_ts, 0)
                    .map_or_else(|| next.start_ts.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
                reason = format!("next={}@{start}, delta={}s", next.name, delta as i64);
            }
        }

        {
            let mut nio = self.nio.lock();
            nio.streak += 1;
            nio.min_refresh = min_refresh;
            nio.reason.clone_from(&reason);
            self.stats.set_gauge("not_in_operation_streak", f64::from(nio.streak));
        }
        self.stats.set_gauge("not_in_operation_min_refresh", min_refresh);
        if cooldown > 0.0 {
            self.enter_cooldown("not_in_operation", cooldown);
        }
        (min_refresh, reason)
    }

    #[must_use]
    pub fn not_in_operation_state(&self) -> (u32, f64, String) {
        let nio = self.nio.lock();
        (nio.streak, nio.min_refresh, nio.reason.clone())
    }

    /// A round that was not NotInOperationTime clears the dynamic state.
    pub fn clear_not_in_operation(&self) {
        let mut nio = self.nio.lock();
        if nio.streak != 0 {
            nio.streak = 0;
            self.stats.set_gauge("not_in_operation_streak", 0.0);
        }
        if (nio.min_refresh - self.cfg.not_in_operation_min_refresh).abs() > f64::EPSILON {
            nio.min_refresh = self.cfg.not_in_operation_min_refresh;
            nio.reason.clear();
            self.stats
                .set_gauge("not_in_operation_min_refresh", nio.min_refresh);
        }
    }

    #[must_use]
    pub fn skip_pool_reset_on_nio(&self) -> bool {
        self.cfg.not_in_operation_skip_pool_reset
    }

    // ---------------------------------------------------------------------
    // Sleep composition
    // ---------------------------------------------------------------------

    /// Breakers compose additively: the effective end-of-round sleep is
    /// the max of the backoff sleep, the operation-window minimum (when
    /// this round hit NotInOperationTime) and the observation minimum.
    #[must_use]
    pub fn effective_sleep(&self, base: f64, had_not_in_operation: bool) -> f64 {
        let mut sleep = base;
        if had_not_in_operation {
            let (_, min_refresh, _) = self.not_in_operation_state();
            if min_refresh > 0.0 {
                sleep = sleep.max(min_refresh);
            }
        }
        if self.in_observe_window() && self.cfg.offline_observe_min_refresh > 0.0 {
            sleep = sleep.max(self.cfg.offline_observe_min_refresh);
        }
        sleep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breakers(cfg: ResilienceConfig, captcha: CaptchaConfig) -> Breakers {
        let stats = Arc::new(RuntimeStats::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
        ));
        Breakers::new(cfg, &captcha, stats)
    }

    fn default_breakers() -> Breakers {
        breakers(ResilienceConfig::default(), CaptchaConfig::default())
    }

    #[test]
    fn test_jittered_interval_bounds() {
        for _ in 0..200 {
            let v = jittered_interval(10.0, 0.2);
            assert!((8.0..=12.0).contains(&v), "{v}");
        }
        // Zero deviation is exactly max(MIN, base).
        assert_eq!(jittered_interval(10.0, 0.0), 10.0);
        assert_eq!(jittered_interval(0.01, 0.0), MIN_REFRESH_INTERVAL);
    }

    #[test]
    fn test_compute_backoff_threshold_and_clamp() {
        let cfg = BackoffConfig {
            enable: true,
            factor: 2.0,
            max_extra: 100.0,
            threshold: 3,
        };
        assert_eq!(compute_backoff(5.0, 0, &cfg), 5.0);
        assert_eq!(compute_backoff(5.0, 2, &cfg), 5.0);
        // errors=3 → exp=1 → extra = 5·(2−1) = 5
        assert_eq!(compute_backoff(5.0, 3, &cfg), 10.0);
        // errors=5 → exp=3 → extra = 5·7 = 35
        assert_eq!(compute_backoff(5.0, 5, &cfg), 40.0);
        // clamp at max_extra
        assert_eq!(compute_backoff(5.0, 20, &cfg), 105.0);
        let disabled = BackoffConfig {
            enable: false,
            ..cfg
        };
        assert_eq!(compute_backoff(5.0, 20, &disabled), 5.0);
    }

    #[test]
    fn test_offline_enters_after_threshold() {
        let cfg = ResilienceConfig {
            offline_error_threshold: 2,
            offline_cooldown_seconds: 0.0,
            ..ResilienceConfig::default()
        };
        let b = breakers(cfg, CaptchaConfig::default());
        assert!(!b.record_network_error("timeout"));
        assert!(!b.offline_active());
        assert!(b.record_network_error("timeout"));
        assert!(b.offline_active());
        // Already offline: further errors don't re-trigger.
        assert!(!b.record_network_error("timeout"));
    }

    #[test]
    fn test_offline_success_resets_streak() {
        let cfg = ResilienceConfig {
            offline_error_threshold: 2,
            ..ResilienceConfig::default()
        };
        let b = breakers(cfg, CaptchaConfig::default());
        assert!(!b.record_network_error("timeout"));
        b.record_network_success();
        assert!(!b.record_network_error("timeout"));
        assert!(!b.offline_active());
    }

    #[test]
    fn test_offline_probe_recovery_opens_observe_window() {
        let cfg = ResilienceConfig {
            offline_error_threshold: 1,
            offline_cooldown_seconds: 0.0,
            offline_observe_seconds: 60.0,
            offline_observe_min_refresh: 10.0,
            ..ResilienceConfig::default()
        };
        let b = breakers(cfg, CaptchaConfig::default());
        assert!(b.record_network_error("timeout"));
        assert_eq!(b.offline_advice(), OfflineAdvice::Probe);
        assert!(!b.offline_probe_result(false));
        assert!(b.offline_active());
        // Second probe succeeds.
        assert!(b.offline_probe_result(true));
        assert!(!b.offline_active());
        assert!(b.in_observe_window());
        assert_eq!(b.effective_sleep(3.0, false), 10.0);
    }

    #[test]
    fn test_degrade_window_opens_after_failures() {
        let captcha = CaptchaConfig {
            degrade_failures: 2,
            degrade_cooldown: 60.0,
            ..CaptchaConfig::default()
        };
        let b = breakers(ResilienceConfig::default(), captcha);
        assert!(!b.record_captcha_failure());
        assert!(b.record_captcha_failure());
        assert!(b.captcha_degraded());
        // Success resets the counter but not the open window.
        b.record_captcha_success();
        assert!(b.captcha_degraded());
    }

    #[test]
    fn test_degrade_notify_rate_limited() {
        let captcha = CaptchaConfig {
            degrade_notify_interval: 3600.0,
            ..CaptchaConfig::default()
        };
        let b = breakers(ResilienceConfig::default(), captcha);
        assert!(b.should_notify_degrade());
        assert!(!b.should_notify_degrade());
    }

    #[test]
    fn test_auth_breaker_trips_at_threshold() {
        let cfg = ResilienceConfig {
            auth_error_threshold: 3,
            auth_reset_sessions: true,
            auth_cooldown_seconds: 30.0,
            ..ResilienceConfig::default()
        };
        let b = breakers(cfg, CaptchaConfig::default());
        assert!(!b.record_auth_error().triggered);
        assert!(!b.record_auth_error().triggered);
        let trip = b.record_auth_error();
        assert!(trip.triggered && trip.drain_pool);
        assert!(b.cooldown_remaining().is_some());
        // Streak restarted after the trip.
        assert!(!b.record_auth_error().triggered);
    }

    #[test]
    fn test_html_breaker_success_clears_streak() {
        let cfg = ResilienceConfig {
            html_parse_error_threshold: 2,
            ..ResilienceConfig::default()
        };
        let b = breakers(cfg, CaptchaConfig::default());
        assert!(!b.record_html_parse_error(true).triggered);
        b.record_html_parse_success();
        assert!(!b.record_html_parse_error(true).triggered);
        assert!(b.record_html_parse_error(true).triggered);
    }

    #[test]
    fn test_nio_mapping_thresholds() {
        let b = default_breakers();
        let now = 1_000_000;
        let phase = |offset: i64| {
            vec![SchedulePhase {
                name: "补退选".to_string(),
                start_ts: now + offset,
                end_ts: now + offset + 3600,
            }]
        };
        let cases: &[(i64, f64)] = &[
            (25 * 3600, 1800.0),
            (24 * 3600, 1800.0),
            (6 * 3600, 600.0),
            (2 * 3600, 120.0),
            (30 * 60, 30.0),
            (5 * 60, 10.0),
            (60, 10.0), // below 5m: the configured static minimum (10s default)
        ];
        for (offset, expected) in cases {
            let (mr, _) = b.update_not_in_operation(Some(&phase(*offset)), now);
            assert_eq!(mr, *expected, "offset {offset}");
            b.clear_not_in_operation();
        }
    }

    #[test]
    fn test_nio_reason_string() {
        let b = default_breakers();
        let now = 1_700_000_000;
        let phases = vec![SchedulePhase {
            name: "补退选第二轮".to_string(),
            start_ts: now + 11_400,
            end_ts: now + 20_000,
        }];
        let (mr, reason) = b.update_not_in_operation(Some(&phases), now);
        assert_eq!(mr, 120.0);
        assert!(reason.contains("next=补退选第二轮@"));
        assert!(reason.contains("delta=11400s"), "{reason}");
    }

    #[test]
    fn test_nio_cleared_state_restores_static_minimum() {
        let b = default_breakers();
        let now = 1_000_000;
        let phases = vec![SchedulePhase {
            name: "补退选".to_string(),
            start_ts: now + 7 * 3600,
            end_ts: now + 8 * 3600,
        }];
        b.update_not_in_operation(Some(&phases), now);
        assert_eq!(b.effective_sleep(3.0, true), 600.0);
        b.clear_not_in_operation();
        let (_, mr, reason) = b.not_in_operation_state();
        assert_eq!(mr, 10.0);
        assert!(reason.is_empty());
        // Without a NIO round the minimum no longer applies.
        assert_eq!(b.effective_sleep(3.0, false), 3.0);
    }

    #[test]
    fn test_schedule_cache_ttl() {
        let cfg = ResilienceConfig {
            schedule_ttl_seconds: 0.001,
            ..ResilienceConfig::default()
        };
        let b = breakers(cfg, CaptchaConfig::default());
        assert!(b.cached_schedule().is_none());
        b.store_schedule(vec![SchedulePhase {
            name: "补退选".to_string(),
            start_ts: 1,
            end_ts: 2,
        }]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(b.cached_schedule().is_none());
        assert!(b.any_schedule().is_some());
    }

    #[test]
    fn test_failure_notify_threshold_and_interval() {
        let cfg = ResilienceConfig {
            failure_notify_threshold: 3,
            failure_notify_interval: 3600.0,
            ..ResilienceConfig::default()
        };
        let b = breakers(cfg, CaptchaConfig::default());
        assert!(!b.should_notify_failure(2));
        assert!(b.should_notify_failure(3));
        assert!(!b.should_notify_failure(5));
    }
}
