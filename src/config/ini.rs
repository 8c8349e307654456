//! INI file loading
//!
//! The agent is driven by a small INI file. Loading is deliberately dumb:
//! sections and `key = value` pairs, `#`/`;` comments, no interpolation.
//! Course/mutex/delay declarations use namespaced sections
//! (`[course:c1]`, `[mutex:m1]`, `[delay:d1]`) whose order is preserved.

use std::collections::HashMap;
use std::path::Path;

use crate::course::Course;

use super::types::Config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("config line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("config {section}.{key}: {message}")]
    Value {
        section: String,
        key: String,
        message: String,
    },

    #[error("{message}")]
    Invalid { message: String },
}

/// One parsed section, keys in file order.
#[derive(Debug, Default, Clone)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn split_sections(text: &str) -> Result<Vec<Section>, ConfigError> {
    let mut sections: Vec<Section> = Vec::new();
    for (ix, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix('[') {
            let name = stripped
                .strip_suffix(']')
                .ok_or_else(|| ConfigError::Parse {
                    line: ix + 1,
                    message: format!("unterminated section header: {line:?}"),
                })?;
            sections.push(Section {
                name: name.trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }
        let Some(eq) = line.find('=') else {
            return Err(ConfigError::Parse {
                line: ix + 1,
                message: format!("expected `key = value`, got {line:?}"),
            });
        };
        let key = line[..eq].trim().to_lowercase();
        let value = line[eq + 1..].trim().to_string();
        let Some(section) = sections.last_mut() else {
            return Err(ConfigError::Parse {
                line: ix + 1,
                message: "key/value pair before any section header".to_string(),
            });
        };
        section.entries.push((key, value));
    }
    Ok(sections)
}

fn value_err(section: &str, key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Value {
        section: section.to_string(),
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_bool(section: &str, key: &str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(value_err(section, key, format!("invalid boolean {other:?}"))),
    }
}

fn parse_f64(section: &str, key: &str, v: &str) -> Result<f64, ConfigError> {
    v.trim()
        .parse::<f64>()
        .map_err(|e| value_err(section, key, format!("invalid number: {e}")))
}

fn parse_u32(section: &str, key: &str, v: &str) -> Result<u32, ConfigError> {
    v.trim()
        .parse::<u32>()
        .map_err(|e| value_err(section, key, format!("invalid integer: {e}")))
}

fn parse_u64(section: &str, key: &str, v: &str) -> Result<u64, ConfigError> {
    v.trim()
        .parse::<u64>()
        .map_err(|e| value_err(section, key, format!("invalid integer: {e}")))
}

fn parse_usize(section: &str, key: &str, v: &str) -> Result<usize, ConfigError> {
    v.trim()
        .parse::<usize>()
        .map_err(|e| value_err(section, key, format!("invalid integer: {e}")))
}

fn parse_i64(section: &str, key: &str, v: &str) -> Result<i64, ConfigError> {
    v.trim()
        .parse::<i64>()
        .map_err(|e| value_err(section, key, format!("invalid integer: {e}")))
}

fn parse_i32(section: &str, key: &str, v: &str) -> Result<i32, ConfigError> {
    v.trim()
        .parse::<i32>()
        .map_err(|e| value_err(section, key, format!("invalid integer: {e}")))
}

fn parse_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Load the configuration from INI text.
#[allow(clippy::too_many_lines)]
pub fn from_ini_str(text: &str) -> Result<Config, ConfigError> {
    let sections = split_sections(text)?;
    let mut cfg = Config::default();

    // course-id -> goal index, filled while walking namespaced sections.
    let mut course_index: HashMap<String, usize> = HashMap::new();

    for section in &sections {
        let sname = section.name.as_str();
        if let Some(course_id) = sname.strip_prefix("course:") {
            let name = section
                .get("name")
                .ok_or_else(|| value_err(sname, "name", "missing"))?;
            let class_no = section
                .get("class_no")
                .ok_or_else(|| value_err(sname, "class_no", "missing"))?;
            let school = section
                .get("school")
                .ok_or_else(|| value_err(sname, "school", "missing"))?;
            course_index.insert(course_id.trim().to_string(), cfg.courses.len());
            cfg.courses.push(Course::new(name, class_no, school));
            continue;
        }
        if let Some(mutex_id) = sname.strip_prefix("mutex:") {
            let raw = section
                .get("courses")
                .ok_or_else(|| value_err(sname, "courses", "missing"))?;
            let mut ixs = Vec::new();
            for cid in parse_list(raw) {
                let ix = course_index.get(&cid).ok_or_else(|| ConfigError::Invalid {
                    message: format!("in 'mutex:{mutex_id}', course {cid:?} is not defined"),
                })?;
                ixs.push(*ix);
            }
            cfg.mutexes.push(ixs);
            continue;
        }
        if let Some(delay_id) = sname.strip_prefix("delay:") {
            let cid = section
                .get("course")
                .ok_or_else(|| value_err(sname, "course", "missing"))?
                .trim()
                .to_string();
            let ix = *course_index.get(&cid).ok_or_else(|| ConfigError::Invalid {
                message: format!("in 'delay:{delay_id}', course {cid:?} is not defined"),
            })?;
            let threshold = parse_i32(
                sname,
                "threshold",
                section
                    .get("threshold")
                    .ok_or_else(|| value_err(sname, "threshold", "missing"))?,
            )?;
            cfg.delays.push((ix, threshold));
            continue;
        }

        for (key, value) in &section.entries {
            apply_entry(&mut cfg, sname, key, value)?;
        }
    }

    cfg.apply_env_fallbacks();
    Ok(cfg)
}

/// Load the configuration from a file path. `AUTOELECTIVE_CONFIG_INI`
/// overrides the path when set.
pub fn from_ini_path(path: &Path) -> Result<Config, ConfigError> {
    let effective = std::env::var("AUTOELECTIVE_CONFIG_INI")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf());
    let text = std::fs::read_to_string(&effective).map_err(|e| ConfigError::Io {
        path: effective.display().to_string(),
        message: e.to_string(),
    })?;
    from_ini_str(&text)
}

#[allow(clippy::too_many_lines)]
fn apply_entry(cfg: &mut Config, section: &str, key: &str, v: &str) -> Result<(), ConfigError> {
    match (section, key) {
        ("user", "student_id") => cfg.user.student_id = v.to_string(),
        ("user", "password") => cfg.user.password = v.to_string(),
        ("user", "dual_degree") => cfg.user.dual_degree = parse_bool(section, key, v)?,
        ("user", "identity") => cfg.user.identity = v.to_lowercase(),

        ("net", "iaaa_base_url") => cfg.net.iaaa_base_url = v.trim_end_matches('/').to_string(),
        ("net", "elective_base_url") => {
            cfg.net.elective_base_url = v.trim_end_matches('/').to_string();
        }

        ("client", "supply_cancel_page") => {
            cfg.client.supply_cancel_page = parse_u32(section, key, v)?;
        }
        ("client", "refresh_interval") => cfg.client.refresh_interval = parse_f64(section, key, v)?,
        ("client", "random_deviation" | "refresh_random_deviation") => {
            cfg.client.refresh_random_deviation = parse_f64(section, key, v)?;
        }
        ("client", "iaaa_client_timeout") => cfg.client.iaaa_timeout = parse_f64(section, key, v)?,
        ("client", "elective_client_timeout") => {
            cfg.client.elective_timeout = parse_f64(section, key, v)?;
        }
        ("client", "login_loop_interval") => {
            cfg.client.login_loop_interval = parse_f64(section, key, v)?;
        }
        ("client", "elective_client_pool_size") => {
            cfg.client.pool_size = parse_usize(section, key, v)?;
        }
        ("client", "elective_client_max_life") => cfg.client.max_life = parse_i64(section, key, v)?,
        ("client", "refresh_backoff_enable") => {
            cfg.client.refresh_backoff.enable = parse_bool(section, key, v)?;
        }
        ("client", "refresh_backoff_factor") => {
            cfg.client.refresh_backoff.factor = parse_f64(section, key, v)?;
        }
        ("client", "refresh_backoff_max") => {
            cfg.client.refresh_backoff.max_extra = parse_f64(section, key, v)?;
        }
        ("client", "refresh_backoff_threshold") => {
            cfg.client.refresh_backoff.threshold = parse_u32(section, key, v)?;
        }
        ("client", "iaaa_backoff_enable") => {
            cfg.client.iaaa_backoff.enable = parse_bool(section, key, v)?;
        }
        ("client", "iaaa_backoff_factor") => {
            cfg.client.iaaa_backoff.factor = parse_f64(section, key, v)?;
        }
        ("client", "iaaa_backoff_max") => {
            cfg.client.iaaa_backoff.max_extra = parse_f64(section, key, v)?;
        }
        ("client", "iaaa_backoff_threshold") => {
            cfg.client.iaaa_backoff.threshold = parse_u32(section, key, v)?;
        }
        ("client", "client_pool_reset_threshold") => {
            cfg.client.pool_reset_threshold = parse_u32(section, key, v)?;
        }
        ("client", "client_pool_reset_cooldown") => {
            cfg.client.pool_reset_cooldown = parse_f64(section, key, v)?;
        }
        ("client", "print_mutex_rules") => {
            cfg.client.print_mutex_rules = parse_bool(section, key, v)?;
        }
        ("client", "warmup_after_login") => {
            cfg.client.warmup_after_login = parse_bool(section, key, v)?;
        }

        ("captcha", "provider") => cfg.captcha.provider = v.to_lowercase(),
        ("captcha", "fallback_providers") => cfg.captcha.fallback_providers = parse_list(v),
        ("captcha", "code_length_min") => {
            cfg.captcha.code_length_min = parse_usize(section, key, v)?;
        }
        ("captcha", "code_length_max") => {
            cfg.captcha.code_length_max = parse_usize(section, key, v)?;
        }
        ("captcha", "code_length") => {
            let n = parse_usize(section, key, v)?;
            cfg.captcha.code_length_min = n;
            cfg.captcha.code_length_max = n;
        }
        ("captcha", "baidu_api_key") => cfg.captcha.baidu_api_key = v.to_string(),
        ("captcha", "baidu_secret_key") => cfg.captcha.baidu_secret_key = v.to_string(),
        ("captcha", "baidu_timeout") => cfg.captcha.baidu_timeout = parse_f64(section, key, v)?,
        ("captcha", "gemini_api_key") => cfg.captcha.gemini_api_key = v.to_string(),
        ("captcha", "gemini_model") => cfg.captcha.gemini_model = v.to_string(),
        ("captcha", "gemini_timeout") => cfg.captcha.gemini_timeout = parse_f64(section, key, v)?,
        ("captcha", "gemini_max_output_tokens") => {
            cfg.captcha.gemini_max_output_tokens = parse_u32(section, key, v)?;
        }
        ("captcha", "dashscope_api_key") => cfg.captcha.dashscope_api_key = v.to_string(),
        ("captcha", "dashscope_base_url") => {
            cfg.captcha.dashscope_base_url = v.trim_end_matches('/').to_string();
        }
        ("captcha", "dashscope_timeout") => {
            cfg.captcha.dashscope_timeout = parse_f64(section, key, v)?;
        }
        ("captcha", "dashscope_max_output_tokens") => {
            cfg.captcha.dashscope_max_output_tokens = parse_u32(section, key, v)?;
        }
        ("captcha", "dashscope_model") => cfg.captcha.dashscope_model = v.to_string(),
        ("captcha", "dashscope_model_flash") => cfg.captcha.dashscope_model_flash = v.to_string(),
        ("captcha", "dashscope_model_plus") => cfg.captcha.dashscope_model_plus = v.to_string(),
        ("captcha", "degrade_failures") => {
            cfg.captcha.degrade_failures = parse_u32(section, key, v)?;
        }
        ("captcha", "degrade_cooldown") => {
            cfg.captcha.degrade_cooldown = parse_f64(section, key, v)?;
        }
        ("captcha", "degrade_monitor_only") => {
            cfg.captcha.degrade_monitor_only = parse_bool(section, key, v)?;
        }
        ("captcha", "degrade_notify") => cfg.captcha.degrade_notify = parse_bool(section, key, v)?,
        ("captcha", "degrade_notify_interval") => {
            cfg.captcha.degrade_notify_interval = parse_f64(section, key, v)?;
        }
        ("captcha", "switch_on_degrade") => {
            cfg.captcha.switch_on_degrade = parse_bool(section, key, v)?;
        }
        ("captcha", "adaptive_enable") => {
            cfg.captcha.adaptive_enable = parse_bool(section, key, v)?;
        }
        ("captcha", "adaptive_min_samples") => {
            cfg.captcha.adaptive_min_samples = parse_u32(section, key, v)?;
        }
        ("captcha", "adaptive_epsilon") => {
            cfg.captcha.adaptive_epsilon = parse_f64(section, key, v)?;
        }
        ("captcha", "adaptive_latency_alpha") => {
            cfg.captcha.adaptive_latency_alpha = parse_f64(section, key, v)?;
        }
        ("captcha", "adaptive_h_alpha") => {
            cfg.captcha.adaptive_h_alpha = parse_f64(section, key, v)?;
        }
        ("captcha", "adaptive_update_interval") => {
            cfg.captcha.adaptive_update_interval = parse_u64(section, key, v)?;
        }
        ("captcha", "adaptive_fail_streak_degrade") => {
            cfg.captcha.adaptive_fail_streak_degrade = parse_u32(section, key, v)?;
        }
        ("captcha", "adaptive_score_alpha") => {
            cfg.captcha.adaptive_score_alpha = parse_f64(section, key, v)?;
        }
        ("captcha", "adaptive_score_beta") => {
            cfg.captcha.adaptive_score_beta = parse_f64(section, key, v)?;
        }
        ("captcha", "adaptive_report_interval") => {
            cfg.captcha.adaptive_report_interval = parse_u64(section, key, v)?;
        }
        ("captcha", "adaptive_persist_enable") => {
            cfg.captcha.adaptive_persist_enable = parse_bool(section, key, v)?;
        }
        ("captcha", "adaptive_persist_path") => {
            cfg.captcha.adaptive_persist_path = v.to_string();
        }
        ("captcha", "adaptive_persist_interval") => {
            cfg.captcha.adaptive_persist_interval = parse_f64(section, key, v)?;
        }
        ("captcha", "probe_enabled") => cfg.captcha.probe_enabled = parse_bool(section, key, v)?,
        ("captcha", "probe_interval") => cfg.captcha.probe_interval = parse_f64(section, key, v)?,
        ("captcha", "probe_backoff") => cfg.captcha.probe_backoff = parse_f64(section, key, v)?,
        ("captcha", "probe_random_deviation") => {
            cfg.captcha.probe_random_deviation = parse_f64(section, key, v)?;
        }
        ("captcha", "probe_pool_size") => {
            cfg.captcha.probe_pool_size = parse_usize(section, key, v)?;
        }
        ("captcha", "probe_share_pool") => {
            cfg.captcha.probe_share_pool = parse_bool(section, key, v)?;
        }
        ("captcha", "sample_enable") => cfg.captcha.sample_enable = parse_bool(section, key, v)?,
        ("captcha", "sample_rate") => cfg.captcha.sample_rate = parse_f64(section, key, v)?,
        ("captcha", "sample_dir") => cfg.captcha.sample_dir = v.to_string(),

        ("resilience", "offline_enabled") => {
            cfg.resilience.offline_enabled = parse_bool(section, key, v)?;
        }
        ("resilience", "offline_error_threshold") => {
            cfg.resilience.offline_error_threshold = parse_u32(section, key, v)?;
        }
        ("resilience", "offline_cooldown_seconds") => {
            cfg.resilience.offline_cooldown_seconds = parse_f64(section, key, v)?;
        }
        ("resilience", "offline_probe_interval") => {
            cfg.resilience.offline_probe_interval = parse_f64(section, key, v)?;
        }
        ("resilience", "offline_probe_timeout") => {
            cfg.resilience.offline_probe_timeout = parse_f64(section, key, v)?;
        }
        ("resilience", "offline_observe_seconds") => {
            cfg.resilience.offline_observe_seconds = parse_f64(section, key, v)?;
        }
        ("resilience", "offline_observe_min_refresh") => {
            cfg.resilience.offline_observe_min_refresh = parse_f64(section, key, v)?;
        }
        ("resilience", "not_in_operation_cooldown_seconds") => {
            cfg.resilience.not_in_operation_cooldown_seconds = parse_f64(section, key, v)?;
        }
        ("resilience", "not_in_operation_min_refresh") => {
            cfg.resilience.not_in_operation_min_refresh = parse_f64(section, key, v)?;
        }
        ("resilience", "not_in_operation_skip_pool_reset") => {
            cfg.resilience.not_in_operation_skip_pool_reset = parse_bool(section, key, v)?;
        }
        ("resilience", "not_in_operation_dynamic_enable") => {
            cfg.resilience.not_in_operation_dynamic_enable = parse_bool(section, key, v)?;
        }
        ("resilience", "schedule_ttl_seconds") => {
            cfg.resilience.schedule_ttl_seconds = parse_f64(section, key, v)?;
        }
        ("resilience", "not_in_operation_long_sleep_max") => {
            cfg.resilience.not_in_operation_long_sleep_max = parse_f64(section, key, v)?;
        }
        ("resilience", "html_parse_error_threshold") => {
            cfg.resilience.html_parse_error_threshold = parse_u32(section, key, v)?;
        }
        ("resilience", "html_parse_cooldown_seconds") => {
            cfg.resilience.html_parse_cooldown_seconds = parse_f64(section, key, v)?;
        }
        ("resilience", "html_parse_reset_sessions") => {
            cfg.resilience.html_parse_reset_sessions = parse_bool(section, key, v)?;
        }
        ("resilience", "auth_error_threshold") => {
            cfg.resilience.auth_error_threshold = parse_u32(section, key, v)?;
        }
        ("resilience", "auth_cooldown_seconds") => {
            cfg.resilience.auth_cooldown_seconds = parse_f64(section, key, v)?;
        }
        ("resilience", "auth_reset_sessions") => {
            cfg.resilience.auth_reset_sessions = parse_bool(section, key, v)?;
        }
        ("resilience", "critical_cooldown_seconds") => {
            cfg.resilience.critical_cooldown_seconds = parse_f64(section, key, v)?;
        }
        ("resilience", "critical_notify_interval") => {
            cfg.resilience.critical_notify_interval = parse_f64(section, key, v)?;
        }
        ("resilience", "critical_reset_cache") => {
            cfg.resilience.critical_reset_cache = parse_bool(section, key, v)?;
        }
        ("resilience", "critical_reset_sessions") => {
            cfg.resilience.critical_reset_sessions = parse_bool(section, key, v)?;
        }
        ("resilience", "failure_notify_threshold") => {
            cfg.resilience.failure_notify_threshold = parse_u32(section, key, v)?;
        }
        ("resilience", "failure_notify_interval") => {
            cfg.resilience.failure_notify_interval = parse_f64(section, key, v)?;
        }
        ("resilience", "failure_cooldown_seconds") => {
            cfg.resilience.failure_cooldown_seconds = parse_f64(section, key, v)?;
        }

        ("rate_limit", "enable") => cfg.rate_limit.enable = parse_bool(section, key, v)?,
        ("rate_limit", "global_rps") => cfg.rate_limit.global_rps = parse_f64(section, key, v)?,
        ("rate_limit", "global_burst") => cfg.rate_limit.global_burst = parse_f64(section, key, v)?,
        ("rate_limit", "elective_rps") => {
            cfg.rate_limit.elective_rps = parse_f64(section, key, v)?;
        }
        ("rate_limit", "elective_burst") => {
            cfg.rate_limit.elective_burst = parse_f64(section, key, v)?;
        }
        ("rate_limit", "iaaa_rps") => cfg.rate_limit.iaaa_rps = parse_f64(section, key, v)?,
        ("rate_limit", "iaaa_burst") => cfg.rate_limit.iaaa_burst = parse_f64(section, key, v)?,

        ("runtime", "stat_report_interval") => {
            cfg.runtime.stat_report_interval = parse_u64(section, key, v)?;
        }
        ("runtime", "rate_window_seconds") => {
            cfg.runtime.rate_window_seconds = parse_f64(section, key, v)?;
        }
        ("runtime", "error_aggregate_interval") => {
            cfg.runtime.error_aggregate_interval = parse_f64(section, key, v)?;
        }
        ("runtime", "web_log_dir") => cfg.runtime.web_log_dir = v.to_string(),
        ("runtime", "debug_dump_request") => {
            cfg.runtime.debug_dump_request = parse_bool(section, key, v)?;
        }
        ("runtime", "max_rounds") => cfg.runtime.max_rounds = Some(parse_u64(section, key, v)?),

        ("notification", "disable_push") => {
            cfg.notify.disable_push = parse_bool(section, key, v)?;
        }
        ("notification", "bark_url") => cfg.notify.bark_url = v.to_string(),

        // Unknown keys are ignored so old config files keep loading.
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
# sample config
[user]
student_id = 2200012345
password = hunter2
dual_degree = false

[client]
refresh_interval = 3
elective_client_pool_size = 2
refresh_backoff_threshold = 4

[captcha]
provider = gemini
fallback_providers = qwen3_vl_flash, dummy
code_length = 4

[course:c1]
name = algorithm design
class_no = 1
school = EECS

[course:c2]
name = topology
class_no = 2
school = SMS

[mutex:m1]
courses = c1, c2

[delay:d1]
course = c2
threshold = 3
";

    #[test]
    fn test_parse_sample() {
        let cfg = from_ini_str(SAMPLE).unwrap();
        assert_eq!(cfg.user.student_id, "2200012345");
        assert_eq!(cfg.client.pool_size, 2);
        assert_eq!(cfg.client.refresh_backoff.threshold, 4);
        assert_eq!(cfg.captcha.provider, "gemini");
        assert_eq!(
            cfg.captcha.fallback_providers,
            vec!["qwen3_vl_flash", "dummy"]
        );
        assert_eq!(cfg.captcha.code_length_range(), (4, 4));
        assert_eq!(cfg.courses.len(), 2);
        assert_eq!(cfg.mutexes, vec![vec![0, 1]]);
        assert_eq!(cfg.delays, vec![(1, 3)]);
    }

    #[test]
    fn test_mutex_unknown_course_rejected() {
        let bad = "[mutex:m1]\ncourses = nope\n";
        assert!(from_ini_str(bad).is_err());
    }

    #[test]
    fn test_key_before_section_rejected() {
        assert!(from_ini_str("a = b\n").is_err());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let cfg = from_ini_str("[client]\nfuture_knob = 1\n").unwrap();
        assert_eq!(cfg.client.pool_size, 1);
    }
}
