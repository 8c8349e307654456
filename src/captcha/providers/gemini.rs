//! Gemini vision recognizer (generateContent endpoint)

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;

use crate::captcha::{Captcha, Recognizer, image_mime};
use crate::config::CaptchaConfig;
use crate::error::RecognizerError;

use super::{finalize_code, send_with_retry};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug)]
pub struct GeminiRecognizer {
    api_key: String,
    model: String,
    timeout: Duration,
    max_output_tokens: u32,
    min_len: usize,
    max_len: usize,
    base_url: String,
    http: reqwest::Client,
}

impl GeminiRecognizer {
    pub fn from_config(cfg: &CaptchaConfig) -> Result<Self, RecognizerError> {
        let api_key = cfg.gemini_api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(RecognizerError::Misconfigured(
                "Gemini API key not configured; set captcha.gemini_api_key or GEMINI_API_KEY"
                    .to_string(),
            ));
        }
        let timeout = Duration::from_secs_f64(cfg.gemini_timeout.max(1.0));
        let (min_len, max_len) = cfg.code_length_range();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognizerError::Misconfigured(e.to_string()))?;
        Ok(Self {
            api_key,
            model: cfg.gemini_model.trim().to_string(),
            timeout,
            max_output_tokens: cfg.gemini_max_output_tokens,
            min_len,
            max_len,
            base_url: DEFAULT_BASE_URL.to_string(),
            http,
        })
    }
}

fn extract_text(data: &serde_json::Value) -> String {
    data.get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[async_trait]
impl Recognizer for GeminiRecognizer {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn recognize(&self, raw: &[u8]) -> Result<Captcha, RecognizerError> {
        let len_rule = if self.min_len == self.max_len {
            format!("exactly {} characters", self.min_len)
        } else {
            format!("between {} and {} characters", self.min_len, self.max_len)
        };
        let payload = json!({
            "contents": [{
                "parts": [
                    {"inline_data": {"mime_type": image_mime(raw), "data": BASE64.encode(raw)}},
                    {"text": format!(
                        "Read the captcha in the image. Reply with ONLY the code, \
                         {len_rule}, characters A-Z and 0-9."
                    )},
                ],
            }],
            "generationConfig": {
                "temperature": 0,
                "maxOutputTokens": self.max_output_tokens,
            },
        });
        let builder = self
            .http
            .post(format!(
                "{}/models/{}:generateContent?key={}",
                self.base_url, self.model, self.api_key
            ))
            .json(&payload);
        let (status, body) = send_with_retry(builder, self.timeout).await?;

        let data: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| RecognizerError::Rejected("invalid JSON response".to_string()))?;
        if !status.is_success() {
            let err = data
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(RecognizerError::Rejected(format!("HTTP {status}: {err}")));
        }
        let text = extract_text(&data);
        finalize_code(&text, &text, self.min_len, self.max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_joins_parts() {
        let data = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "AB"}, {"text": "3D"}]}}]
        });
        assert_eq!(extract_text(&data), "AB3D");
    }

    #[test]
    fn test_missing_key_is_misconfigured() {
        assert!(matches!(
            GeminiRecognizer::from_config(&CaptchaConfig::default()),
            Err(RecognizerError::Misconfigured(_))
        ));
    }
}
