//! Configuration types for the election agent
//!
//! The configuration is grouped into sections mirroring the INI file the
//! tool is driven by. Every field carries a default so a sparse file (or a
//! test fixture) only needs to override what it cares about.

use serde::{Deserialize, Serialize};

use crate::course::Course;

/// Credentials and identity of the student this process works for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub student_id: String,
    pub password: String,
    /// Dual-degree accounts need an extra SSO hop after login.
    pub dual_degree: bool,
    /// `bzx` (major) or `bfx` (minor); only meaningful for dual degree.
    pub identity: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            student_id: String::new(),
            password: String::new(),
            dual_degree: false,
            identity: "bzx".to_string(),
        }
    }
}

/// Upstream hosts. Overridable so tests can point at a mock server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    pub iaaa_base_url: String,
    pub elective_base_url: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            iaaa_base_url: "https://iaaa.pku.edu.cn/iaaa".to_string(),
            elective_base_url: "https://elective.pku.edu.cn/elective2008".to_string(),
        }
    }
}

/// Exponential backoff knobs shared by the refresh and IAAA loops. The two
/// loops carry independent instances on purpose; their cadences are tuned
/// separately in the field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub enable: bool,
    pub factor: f64,
    pub max_extra: f64,
    pub threshold: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enable: true,
            factor: 1.5,
            max_extra: 60.0,
            threshold: 3,
        }
    }
}

/// Session, polling and pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Listing page to watch: 1 uses `SupplyCancel`, others `Supplement`.
    pub supply_cancel_page: u32,
    pub refresh_interval: f64,
    pub refresh_random_deviation: f64,
    pub iaaa_timeout: f64,
    pub elective_timeout: f64,
    pub login_loop_interval: f64,
    pub pool_size: usize,
    /// Seconds a session stays usable after login; -1 means forever.
    pub max_life: i64,
    pub refresh_backoff: BackoffConfig,
    pub iaaa_backoff: BackoffConfig,
    pub pool_reset_threshold: u32,
    pub pool_reset_cooldown: f64,
    pub print_mutex_rules: bool,
    /// Prefetch the help schedule right after each login.
    pub warmup_after_login: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            supply_cancel_page: 1,
            refresh_interval: 5.0,
            refresh_random_deviation: 0.1,
            iaaa_timeout: 10.0,
            elective_timeout: 10.0,
            login_loop_interval: 2.0,
            pool_size: 1,
            max_life: -1,
            refresh_backoff: BackoffConfig::default(),
            iaaa_backoff: BackoffConfig::default(),
            pool_reset_threshold: 10,
            pool_reset_cooldown: 60.0,
            print_mutex_rules: false,
            warmup_after_login: false,
        }
    }
}

/// CAPTCHA provider chain, degrade policy and adaptive router knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    pub provider: String,
    pub fallback_providers: Vec<String>,
    pub code_length_min: usize,
    pub code_length_max: usize,

    pub baidu_api_key: String,
    pub baidu_secret_key: String,
    pub baidu_timeout: f64,

    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_timeout: f64,
    pub gemini_max_output_tokens: u32,

    pub dashscope_api_key: String,
    pub dashscope_base_url: String,
    pub dashscope_timeout: f64,
    pub dashscope_max_output_tokens: u32,
    pub dashscope_model: String,
    pub dashscope_model_flash: String,
    pub dashscope_model_plus: String,

    pub degrade_failures: u32,
    pub degrade_cooldown: f64,
    pub degrade_monitor_only: bool,
    pub degrade_notify: bool,
    pub degrade_notify_interval: f64,
    pub switch_on_degrade: bool,

    pub adaptive_enable: bool,
    pub adaptive_min_samples: u32,
    pub adaptive_epsilon: f64,
    pub adaptive_latency_alpha: f64,
    pub adaptive_h_alpha: f64,
    /// Reorder at most once per this many loop ticks.
    pub adaptive_update_interval: u64,
    pub adaptive_fail_streak_degrade: u32,
    pub adaptive_score_alpha: f64,
    pub adaptive_score_beta: f64,
    /// Report adaptive state every N rounds; 0 disables.
    pub adaptive_report_interval: u64,
    pub adaptive_persist_enable: bool,
    pub adaptive_persist_path: String,
    pub adaptive_persist_interval: f64,

    pub probe_enabled: bool,
    pub probe_interval: f64,
    pub probe_backoff: f64,
    pub probe_random_deviation: f64,
    pub probe_pool_size: usize,
    pub probe_share_pool: bool,

    pub sample_enable: bool,
    pub sample_rate: f64,
    pub sample_dir: String,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            provider: "dummy".to_string(),
            fallback_providers: Vec::new(),
            code_length_min: 4,
            code_length_max: 4,
            baidu_api_key: String::new(),
            baidu_secret_key: String::new(),
            baidu_timeout: 10.0,
            gemini_api_key: String::new(),
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_timeout: 15.0,
            gemini_max_output_tokens: 64,
            dashscope_api_key: String::new(),
            dashscope_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            dashscope_timeout: 15.0,
            dashscope_max_output_tokens: 64,
            dashscope_model: String::new(),
            dashscope_model_flash: String::new(),
            dashscope_model_plus: String::new(),
            degrade_failures: 3,
            degrade_cooldown: 60.0,
            degrade_monitor_only: true,
            degrade_notify: true,
            degrade_notify_interval: 300.0,
            switch_on_degrade: false,
            adaptive_enable: true,
            adaptive_min_samples: 10,
            adaptive_epsilon: 0.1,
            adaptive_latency_alpha: 0.2,
            adaptive_h_alpha: 0.2,
            adaptive_update_interval: 20,
            adaptive_fail_streak_degrade: 3,
            adaptive_score_alpha: 0.4,
            adaptive_score_beta: 0.6,
            adaptive_report_interval: 50,
            adaptive_persist_enable: false,
            adaptive_persist_path: "runtime/adaptive_stats.json".to_string(),
            adaptive_persist_interval: 60.0,
            probe_enabled: false,
            probe_interval: 30.0,
            probe_backoff: 60.0,
            probe_random_deviation: 0.1,
            probe_pool_size: 0,
            probe_share_pool: true,
            sample_enable: false,
            sample_rate: 1.0,
            sample_dir: "runtime/captcha_samples".to_string(),
        }
    }
}

impl CaptchaConfig {
    /// `(min, max)` code length with the pair swapped if misordered.
    #[must_use]
    pub fn code_length_range(&self) -> (usize, usize) {
        if self.code_length_min <= self.code_length_max {
            (self.code_length_min, self.code_length_max)
        } else {
            (self.code_length_max, self.code_length_min)
        }
    }

    /// Configured chain: primary followed by deduplicated fallbacks.
    #[must_use]
    pub fn chain(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |names: &mut Vec<String>, name: &str| {
            let n = name.trim().to_lowercase();
            if !n.is_empty() && !names.contains(&n) {
                names.push(n);
            }
        };
        push(&mut names, &self.provider);
        for fb in &self.fallback_providers {
            push(&mut names, fb);
        }
        names
    }
}

/// Circuit-breaker hierarchy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub offline_enabled: bool,
    pub offline_error_threshold: u32,
    pub offline_cooldown_seconds: f64,
    pub offline_probe_interval: f64,
    pub offline_probe_timeout: f64,
    pub offline_observe_seconds: f64,
    pub offline_observe_min_refresh: f64,

    pub not_in_operation_cooldown_seconds: f64,
    pub not_in_operation_min_refresh: f64,
    pub not_in_operation_skip_pool_reset: bool,
    pub not_in_operation_dynamic_enable: bool,
    pub schedule_ttl_seconds: f64,
    pub not_in_operation_long_sleep_max: f64,

    pub html_parse_error_threshold: u32,
    pub html_parse_cooldown_seconds: f64,
    pub html_parse_reset_sessions: bool,

    pub auth_error_threshold: u32,
    pub auth_cooldown_seconds: f64,
    pub auth_reset_sessions: bool,

    pub critical_cooldown_seconds: f64,
    pub critical_notify_interval: f64,
    pub critical_reset_cache: bool,
    pub critical_reset_sessions: bool,

    pub failure_notify_threshold: u32,
    pub failure_notify_interval: f64,
    pub failure_cooldown_seconds: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            offline_enabled: true,
            offline_error_threshold: 3,
            offline_cooldown_seconds: 30.0,
            offline_probe_interval: 30.0,
            offline_probe_timeout: 5.0,
            offline_observe_seconds: 120.0,
            offline_observe_min_refresh: 10.0,
            not_in_operation_cooldown_seconds: 10.0,
            not_in_operation_min_refresh: 10.0,
            not_in_operation_skip_pool_reset: true,
            not_in_operation_dynamic_enable: true,
            schedule_ttl_seconds: 6.0 * 3600.0,
            not_in_operation_long_sleep_max: 1800.0,
            html_parse_error_threshold: 3,
            html_parse_cooldown_seconds: 30.0,
            html_parse_reset_sessions: true,
            auth_error_threshold: 3,
            auth_cooldown_seconds: 60.0,
            auth_reset_sessions: true,
            critical_cooldown_seconds: 600.0,
            critical_notify_interval: 600.0,
            critical_reset_cache: true,
            critical_reset_sessions: true,
            failure_notify_threshold: 5,
            failure_notify_interval: 600.0,
            failure_cooldown_seconds: 60.0,
        }
    }
}

/// Token-bucket safety net for outbound traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enable: bool,
    pub global_rps: f64,
    pub global_burst: f64,
    pub elective_rps: f64,
    pub elective_burst: f64,
    pub iaaa_rps: f64,
    pub iaaa_burst: f64,
}

/// Runtime reporting, debugging and test-harness knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Report grouped runtime stats every N rounds; 0 disables.
    pub stat_report_interval: u64,
    pub rate_window_seconds: f64,
    pub error_aggregate_interval: f64,
    /// Dump unparseable responses here (per-user subdirectory).
    pub web_log_dir: String,
    pub debug_dump_request: bool,
    /// Stop the elective loop after N rounds. Used by the soak harness and
    /// the scenario tests; None runs until the goal set drains.
    pub max_rounds: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stat_report_interval: 50,
            rate_window_seconds: 60.0,
            error_aggregate_interval: 30.0,
            web_log_dir: "runtime/weblog".to_string(),
            debug_dump_request: false,
            max_rounds: None,
        }
    }
}

/// Push-notification transport settings. The transport itself is an
/// external collaborator; only its switch and endpoint live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub disable_push: bool,
    pub bark_url: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            disable_push: true,
            bark_url: String::new(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub user: UserConfig,
    pub net: NetConfig,
    pub client: ClientConfig,
    pub captcha: CaptchaConfig,
    pub resilience: ResilienceConfig,
    pub rate_limit: RateLimitConfig,
    pub runtime: RuntimeConfig,
    pub notify: NotifyConfig,

    /// Ordered goal courses as declared.
    pub courses: Vec<Course>,
    /// Mutex groups as indices into `courses`.
    pub mutexes: Vec<Vec<usize>>,
    /// Delay rules `(course index, threshold)`.
    pub delays: Vec<(usize, i32)>,
}

impl Config {
    /// Consult provider key env vars for keys left blank in the file.
    pub fn apply_env_fallbacks(&mut self) {
        fn fill(slot: &mut String, var: &str) {
            if slot.trim().is_empty() {
                if let Ok(v) = std::env::var(var) {
                    *slot = v;
                }
            }
        }
        fill(&mut self.captcha.gemini_api_key, "GEMINI_API_KEY");
        fill(&mut self.captcha.dashscope_api_key, "DASHSCOPE_API_KEY");
        fill(&mut self.captcha.baidu_api_key, "BAIDU_OCR_API_KEY");
        fill(&mut self.captcha.baidu_secret_key, "BAIDU_OCR_SECRET_KEY");
    }

    /// Per-user subdirectory for response dumps.
    #[must_use]
    pub fn user_web_log_dir(&self) -> std::path::PathBuf {
        let user = if self.user.student_id.is_empty() {
            "anonymous"
        } else {
            self.user.student_id.as_str()
        };
        std::path::Path::new(&self.runtime.web_log_dir).join(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_dedup_and_order() {
        let cfg = CaptchaConfig {
            provider: "Gemini".to_string(),
            fallback_providers: vec!["dummy".to_string(), "gemini".to_string(), String::new()],
            ..CaptchaConfig::default()
        };
        assert_eq!(cfg.chain(), vec!["gemini", "dummy"]);
    }

    #[test]
    fn test_code_length_range_swaps() {
        let cfg = CaptchaConfig {
            code_length_min: 6,
            code_length_max: 4,
            ..CaptchaConfig::default()
        };
        assert_eq!(cfg.code_length_range(), (4, 6));
    }
}
