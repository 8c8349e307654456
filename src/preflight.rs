//! Static configuration validation
//!
//! Pure functions over the loaded `Config`: no network, no recognizer
//! instantiation (instantiating one may talk to an OCR vendor). The CLI
//! runs this before the loops start and refuses to launch on errors.

use crate::captcha::registry::{is_known_provider, required_key_paths};
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    Error,
    Warn,
}

impl std::fmt::Display for IssueLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => f.write_str("ERROR"),
            Self::Warn => f.write_str("WARN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreflightIssue {
    pub level: IssueLevel,
    pub code: &'static str,
    pub message: String,
    pub key_path: Option<&'static str>,
}

fn key_value<'a>(cfg: &'a Config, key_path: &str) -> Option<&'a str> {
    match key_path {
        "captcha.baidu_api_key" => Some(&cfg.captcha.baidu_api_key),
        "captcha.baidu_secret_key" => Some(&cfg.captcha.baidu_secret_key),
        "captcha.gemini_api_key" => Some(&cfg.captcha.gemini_api_key),
        "captcha.dashscope_api_key" => Some(&cfg.captcha.dashscope_api_key),
        _ => None,
    }
}

/// Validate a configuration, returning every issue found (never failing
/// fast: the operator should see the whole list at once).
#[must_use]
pub fn run_preflight(cfg: &Config) -> Vec<PreflightIssue> {
    let mut issues = Vec::new();
    let mut add = |level, code, message: String, key_path| {
        issues.push(PreflightIssue {
            level,
            code,
            message,
            key_path,
        });
    };

    // [captcha] code length range
    if cfg.captcha.code_length_min > cfg.captcha.code_length_max {
        add(
            IssueLevel::Error,
            "captcha_code_length_range_invalid",
            format!(
                "captcha.code_length_min ({}) > captcha.code_length_max ({})",
                cfg.captcha.code_length_min, cfg.captcha.code_length_max
            ),
            Some("captcha.code_length_min"),
        );
    }

    // [client] refresh / deviation / pool size
    let refresh = cfg.client.refresh_interval;
    if refresh <= 0.0 {
        add(
            IssueLevel::Error,
            "refresh_interval_invalid",
            format!("client.refresh_interval must be > 0, got {refresh}"),
            Some("client.refresh_interval"),
        );
    } else if refresh < 1.0 {
        add(
            IssueLevel::Warn,
            "refresh_interval_low",
            format!("client.refresh_interval is {refresh}s (< 1.0s). This may be too aggressive."),
            Some("client.refresh_interval"),
        );
    }
    if cfg.client.refresh_random_deviation < 0.0 {
        add(
            IssueLevel::Error,
            "random_deviation_invalid",
            format!(
                "client.random_deviation must be >= 0, got {}",
                cfg.client.refresh_random_deviation
            ),
            Some("client.random_deviation"),
        );
    }
    if cfg.client.pool_size == 0 {
        add(
            IssueLevel::Error,
            "elective_client_pool_size_invalid",
            "client.elective_client_pool_size must be > 0, got 0".to_string(),
            Some("client.elective_client_pool_size"),
        );
    }

    // Provider + key requirements
    let provider = cfg.captcha.provider.trim().to_lowercase();
    if !provider.is_empty() && !is_known_provider(&provider) {
        add(
            IssueLevel::Error,
            "captcha_provider_unknown",
            format!("Unknown captcha provider: {provider:?}. Allowed: dummy/baidu/gemini/qwen*"),
            Some("captcha.provider"),
        );
    }
    if !provider.is_empty() {
        for key_path in required_key_paths(&provider) {
            let blank = key_value(cfg, key_path).is_none_or(|v| v.trim().is_empty());
            if blank {
                add(
                    IssueLevel::Error,
                    "captcha_key_missing",
                    format!("Missing required credential for provider {provider:?}: {key_path}"),
                    Some(key_path),
                );
            }
        }
    }

    // Fallback providers: must be known and must have required keys.
    for fallback in &cfg.captcha.fallback_providers {
        let fallback = fallback.trim().to_lowercase();
        if fallback.is_empty() {
            continue;
        }
        if !is_known_provider(&fallback) {
            add(
                IssueLevel::Error,
                "captcha_fallback_unknown",
                format!(
                    "Unknown fallback captcha provider: {fallback:?}. Allowed: dummy/baidu/gemini/qwen*"
                ),
                Some("captcha.fallback_providers"),
            );
            continue;
        }
        for key_path in required_key_paths(&fallback) {
            let blank = key_value(cfg, key_path).is_none_or(|v| v.trim().is_empty());
            if blank {
                add(
                    IssueLevel::Error,
                    "captcha_fallback_key_missing",
                    format!("Missing required credential for fallback {fallback:?}: {key_path}"),
                    Some(key_path),
                );
            }
        }
    }

    // Probe warnings: extra background requests, extra session slots.
    if cfg.captcha.probe_enabled {
        add(
            IssueLevel::Warn,
            "captcha_probe_enabled",
            "captcha.probe_enabled=true will add low-frequency background captcha requests."
                .to_string(),
            Some("captcha.probe_enabled"),
        );
        if !cfg.captcha.probe_share_pool {
            add(
                IssueLevel::Warn,
                "captcha_probe_share_pool_false",
                "captcha.probe_share_pool=false may occupy extra login/session slots. \
                 Prefer sharing the main pool unless you have quota."
                    .to_string(),
                Some("captcha.probe_share_pool"),
            );
        }
    }

    // Rate limit safety net may slow down the burst if misconfigured.
    if cfg.rate_limit.enable {
        add(
            IssueLevel::Warn,
            "rate_limit_enabled",
            "rate_limit.enable=true may slow burst; enable only as a safety net.".to_string(),
            Some("rate_limit.enable"),
        );
    }

    issues
}

/// Whether the issue list blocks a launch.
#[must_use]
pub fn has_errors(issues: &[PreflightIssue]) -> bool {
    issues.iter().any(|i| i.level == IssueLevel::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(issues: &[PreflightIssue]) -> Vec<&'static str> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_default_config_with_dummy_is_clean() {
        let cfg = Config::default();
        let issues = run_preflight(&cfg);
        assert!(!has_errors(&issues), "{issues:?}");
    }

    #[test]
    fn test_code_length_range_error() {
        let mut cfg = Config::default();
        cfg.captcha.code_length_min = 6;
        cfg.captcha.code_length_max = 4;
        assert!(codes(&run_preflight(&cfg)).contains(&"captcha_code_length_range_invalid"));
    }

    #[test]
    fn test_refresh_interval_rules() {
        let mut cfg = Config::default();
        cfg.client.refresh_interval = 0.0;
        assert!(codes(&run_preflight(&cfg)).contains(&"refresh_interval_invalid"));
        cfg.client.refresh_interval = 0.5;
        let issues = run_preflight(&cfg);
        assert!(!has_errors(&issues));
        assert!(codes(&issues).contains(&"refresh_interval_low"));
    }

    #[test]
    fn test_pool_size_zero_is_error() {
        let mut cfg = Config::default();
        cfg.client.pool_size = 0;
        assert!(codes(&run_preflight(&cfg)).contains(&"elective_client_pool_size_invalid"));
    }

    #[test]
    fn test_provider_key_requirements() {
        let mut cfg = Config::default();
        cfg.captcha.provider = "gemini".to_string();
        let issues = run_preflight(&cfg);
        assert!(has_errors(&issues));
        assert!(codes(&issues).contains(&"captcha_key_missing"));

        cfg.captcha.gemini_api_key = "k".to_string();
        assert!(!has_errors(&run_preflight(&cfg)));
    }

    #[test]
    fn test_unknown_provider_and_fallback() {
        let mut cfg = Config::default();
        cfg.captcha.provider = "tesseract".to_string();
        cfg.captcha.fallback_providers = vec!["nope".to_string()];
        let issues = run_preflight(&cfg);
        let cs = codes(&issues);
        assert!(cs.contains(&"captcha_provider_unknown"));
        assert!(cs.contains(&"captcha_fallback_unknown"));
    }

    #[test]
    fn test_fallback_key_missing() {
        let mut cfg = Config::default();
        cfg.captcha.fallback_providers = vec!["qwen3_vl_flash".to_string()];
        let issues = run_preflight(&cfg);
        assert!(codes(&issues).contains(&"captcha_fallback_key_missing"));
    }

    #[test]
    fn test_probe_and_rate_limit_warnings() {
        let mut cfg = Config::default();
        cfg.captcha.probe_enabled = true;
        cfg.captcha.probe_share_pool = false;
        cfg.rate_limit.enable = true;
        let issues = run_preflight(&cfg);
        assert!(!has_errors(&issues));
        let cs = codes(&issues);
        assert!(cs.contains(&"captcha_probe_enabled"));
        assert!(cs.contains(&"captcha_probe_share_pool_false"));
        assert!(cs.contains(&"rate_limit_enabled"));
    }
}
