//! Provider registry
//!
//! Maps configured provider names to recognizer instances. The name set is
//! also consulted by the preflight validator, which must not instantiate
//! anything, so the knowledge checks are separate pure functions.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CaptchaConfig;
use crate::error::RecognizerError;

use super::providers::{baidu::BaiduRecognizer, gemini::GeminiRecognizer, qwen::QwenRecognizer};
use super::{Captcha, Recognizer};

/// Fixed-code recognizer for tests and rehearsals.
#[derive(Debug)]
pub struct DummyRecognizer {
    code: String,
}

impl DummyRecognizer {
    #[must_use]
    pub fn new(code_len: usize) -> Self {
        Self {
            code: "0".repeat(code_len.max(1)),
        }
    }
}

#[async_trait]
impl Recognizer for DummyRecognizer {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn recognize(&self, _raw: &[u8]) -> Result<Captcha, RecognizerError> {
        Ok(Captcha::new(self.code.clone()))
    }
}

/// Whether `name` is a provider this build knows how to construct. All
/// Qwen variants and aliases start with `qwen`.
#[must_use]
pub fn is_known_provider(name: &str) -> bool {
    let n = name.trim().to_lowercase();
    if n.is_empty() {
        return false;
    }
    matches!(n.as_str(), "dummy" | "baidu" | "gemini") || n.starts_with("qwen")
}

/// Credential key paths a provider requires, as `section.key` strings.
#[must_use]
pub fn required_key_paths(name: &str) -> Vec<&'static str> {
    let n = name.trim().to_lowercase();
    if n == "baidu" {
        vec!["captcha.baidu_api_key", "captcha.baidu_secret_key"]
    } else if n == "gemini" {
        vec!["captcha.gemini_api_key"]
    } else if n.starts_with("qwen") {
        vec!["captcha.dashscope_api_key"]
    } else {
        Vec::new()
    }
}

/// Instantiate a recognizer by name.
pub fn build_recognizer(
    name: &str,
    cfg: &CaptchaConfig,
) -> Result<Arc<dyn Recognizer>, RecognizerError> {
    let n = name.trim().to_lowercase();
    match n.as_str() {
        "dummy" => Ok(Arc::new(DummyRecognizer::new(cfg.code_length_range().0))),
        "baidu" => Ok(Arc::new(BaiduRecognizer::from_config(cfg)?)),
        "gemini" => Ok(Arc::new(GeminiRecognizer::from_config(cfg)?)),
        _ if n.starts_with("qwen") => Ok(Arc::new(QwenRecognizer::from_config(&n, cfg)?)),
        _ => Err(RecognizerError::UnknownProvider(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_providers() {
        assert!(is_known_provider("dummy"));
        assert!(is_known_provider("Baidu"));
        assert!(is_known_provider("qwen3_vl_flash"));
        assert!(is_known_provider("qwen-vl-ocr"));
        assert!(!is_known_provider(""));
        assert!(!is_known_provider("tesseract"));
    }

    #[test]
    fn test_required_key_paths() {
        assert_eq!(
            required_key_paths("baidu"),
            vec!["captcha.baidu_api_key", "captcha.baidu_secret_key"]
        );
        assert_eq!(required_key_paths("qwen3_vl_plus"), vec!["captcha.dashscope_api_key"]);
        assert!(required_key_paths("dummy").is_empty());
    }

    #[tokio::test]
    async fn test_dummy_recognizer_fixed_code() {
        let d = DummyRecognizer::new(4);
        let c = d.recognize(b"whatever").await.unwrap();
        assert_eq!(c.code, "0000");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = build_recognizer("tesseract", &CaptchaConfig::default()).unwrap_err();
        assert!(matches!(err, RecognizerError::UnknownProvider(_)));
    }
}
