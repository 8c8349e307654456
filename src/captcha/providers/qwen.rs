//! Qwen vision recognizers (DashScope OpenAI-compatible endpoint)
//!
//! The qwen* family shares one implementation parameterized by model name.
//! Aliases like `qwen3_vl_flash` map to their default models; the generic
//! `dashscope_model` key overrides all of them.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;

use crate::captcha::{Captcha, Recognizer, image_mime};
use crate::config::CaptchaConfig;
use crate::error::RecognizerError;

use super::{finalize_code, send_with_retry};

#[derive(Debug)]
pub struct QwenRecognizer {
    name: String,
    model: String,
    api_key: String,
    base_url: String,
    timeout: Duration,
    max_output_tokens: u32,
    min_len: usize,
    max_len: usize,
    http: reqwest::Client,
}

impl QwenRecognizer {
    pub fn from_config(name: &str, cfg: &CaptchaConfig) -> Result<Self, RecognizerError> {
        let api_key = cfg.dashscope_api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(RecognizerError::Misconfigured(
                "DashScope API key not configured; set captcha.dashscope_api_key or DASHSCOPE_API_KEY"
                    .to_string(),
            ));
        }
        // Per-provider override first, then the generic key, then default.
        let default_model = match name {
            "qwen3_vl_plus" => "qwen3-vl-plus",
            _ => "qwen3-vl-flash",
        };
        let mut model = cfg.dashscope_model.trim().to_string();
        let specific = match name {
            "qwen3_vl_flash" => cfg.dashscope_model_flash.trim(),
            "qwen3_vl_plus" => cfg.dashscope_model_plus.trim(),
            _ => "",
        };
        if !specific.is_empty() {
            model = specific.to_string();
        }
        if model.is_empty() {
            model = default_model.to_string();
        }
        let timeout = Duration::from_secs_f64(cfg.dashscope_timeout.max(1.0));
        let (min_len, max_len) = cfg.code_length_range();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognizerError::Misconfigured(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            model,
            api_key,
            base_url: cfg.dashscope_base_url.trim_end_matches('/').to_string(),
            timeout,
            max_output_tokens: cfg.dashscope_max_output_tokens,
            min_len,
            max_len,
            http,
        })
    }

    fn prompt(&self) -> String {
        let len_rule = if self.min_len == self.max_len {
            format!("exactly {} characters", self.min_len)
        } else {
            format!("between {} and {} characters", self.min_len, self.max_len)
        };
        format!(
            "You are an OCR engine. Read the captcha text from the image.\n\
             Return STRICT JSON with a single key 'text'.\n\
             The value must be {len_rule} (A-Z, 0-9) with no spaces.\n\
             If uncertain, make your best guess.\n"
        )
    }
}

fn extract_text(data: &serde_json::Value) -> String {
    let Some(content) = data
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
    else {
        return String::new();
    };
    match content {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string(),
        _ => String::new(),
    }
}

#[async_trait]
impl Recognizer for QwenRecognizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, raw: &[u8]) -> Result<Captcha, RecognizerError> {
        let payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", image_mime(raw), BASE64.encode(raw)),
                        },
                    },
                    {"type": "text", "text": self.prompt()},
                ],
            }],
            "temperature": 0,
            "max_tokens": self.max_output_tokens,
        });
        let builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
        // Models sometimes return the JSON as a string; unwrap one level.
        let mut code_src = text.clone();
        if let Ok(obj) = serde_json::from_str::<serde_json::Value>(&text) {
            for key in ["text", "captcha", "code", "result"] {
                if let Some(v) = obj.get(key).and_then(|v| v.as_str()) {
                    if !v.trim().is_empty() {
                        code_src = v.to_string();
                        break;
                    }
                }
            }
            if let Some(s) = obj.as_str() {
                code_src = s.to_string();
            }
        }
        finalize_code(&code_src, &text, self.min_len, self.max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_string_content() {
        let data = serde_json::json!({
            "choices": [{"message": {"content": " {\"text\": \"AB3D\"} "}}]
        });
        assert_eq!(extract_text(&data), "{\"text\": \"AB3D\"}");
    }

    #[test]
    fn test_extract_text_part_list() {
        let data = serde_json::json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "AB"},
                {"type": "text", "text": "3D"}
            ]}}]
        });
        assert_eq!(extract_text(&data), "AB3D");
    }

    #[test]
    fn test_missing_key_is_misconfigured() {
        let cfg = CaptchaConfig::default();
        assert!(matches!(
            QwenRecognizer::from_config("qwen3_vl_flash", &cfg),
            Err(RecognizerError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_model_resolution() {
        let cfg = CaptchaConfig {
            dashscope_api_key: "k".to_string(),
            dashscope_model_plus: "my-plus".to_string(),
            ..CaptchaConfig::default()
        };
        let flash = QwenRecognizer::from_config("qwen3_vl_flash", &cfg).unwrap();
        assert_eq!(flash.model, "qwen3-vl-flash");
        let plus = QwenRecognizer::from_config("qwen3_vl_plus", &cfg).unwrap();
        assert_eq!(plus.model, "my-plus");
    }
}
