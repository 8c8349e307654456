//! Baidu OCR recognizer (accurate_basic endpoint)
//!
//! Baidu wants an OAuth access token first, then a form-urlencoded POST
//! with the base64 image. The token is cached until shortly before its
//! reported expiry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::Mutex;

use crate::captcha::{Captcha, Recognizer};
use crate::config::CaptchaConfig;
use crate::error::RecognizerError;

use super::{finalize_code, send_with_retry};

const TOKEN_URL: &str = "https://aip.baidubce.com/oauth/2.0/token";
const OCR_URL: &str = "https://aip.baidubce.com/rest/2.0/ocr/v1/accurate_basic";

#[derive(Debug)]
pub struct BaiduRecognizer {
    api_key: String,
    secret_key: String,
    timeout: Duration,
    min_len: usize,
    max_len: usize,
    http: reqwest::Client,
    token: Mutex<Option<(String, Instant)>>,
}

impl BaiduRecognizer {
    pub fn from_config(cfg: &CaptchaConfig) -> Result<Self, RecognizerError> {
        let api_key = cfg.baidu_api_key.trim().to_string();
        let secret_key = cfg.baidu_secret_key.trim().to_string();
        if api_key.is_empty() || secret_key.is_empty() {
            return Err(RecognizerError::Misconfigured(
                "Baidu OCR keys not configured; set captcha.baidu_api_key / baidu_secret_key"
                    .to_string(),
            ));
        }
        let timeout = Duration::from_secs_f64(cfg.baidu_timeout.max(1.0));
        let (min_len, max_len) = cfg.code_length_range();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognizerError::Misconfigured(e.to_string()))?;
        Ok(Self {
            api_key,
            secret_key,
            timeout,
            min_len,
            max_len,
            http,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, RecognizerError> {
        let mut slot = self.token.lock().await;
        if let Some((token, expires_at)) = slot.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }
        let builder = self.http.post(TOKEN_URL).query(&[
            ("grant_type", "client_credentials"),
            ("client_id", self.api_key.as_str()),
            ("client_secret", self.secret_key.as_str()),
        ]);
        let (status, body) = send_with_retry(builder, self.timeout).await?;
        let data: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| RecognizerError::Rejected("invalid token response".to_string()))?;
        if !status.is_success() {
            return Err(RecognizerError::Rejected(format!(
                "token endpoint HTTP {status}"
            )));
        }
        let Some(token) = data.get("access_token").and_then(|t| t.as_str()) else {
            return Err(RecognizerError::Rejected(
                "token response without access_token".to_string(),
            ));
        };
        let ttl = data
            .get("expires_in")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(3600);
        // Refresh a minute early to dodge clock skew at the edge.
        let expires_at = Instant::now() + Duration::from_secs(ttl.saturating_sub(60).max(60));
        *slot = Some((token.to_string(), expires_at));
        Ok(token.to_string())
    }
}

#[async_trait]
impl Recognizer for BaiduRecognizer {
    fn name(&self) -> &str {
        "baidu"
    }

    async fn recognize(&self, raw: &[u8]) -> Result<Captcha, RecognizerError> {
        let token = self.access_token().await?;
        let builder = self
            .http
            .post(format!("{OCR_URL}?access_token={token}"))
            .header("Accept", "application/json")
            .form(&[
                ("image", BASE64.encode(raw)),
                ("detect_direction", "true".to_string()),
                ("paragraph", "false".to_string()),
                ("probability", "false".to_string()),
            ]);
        let (status, body) = send_with_retry(builder, self.timeout).await?;
        let data: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| RecognizerError::Rejected("invalid JSON response".to_string()))?;
        if !status.is_success() {
            return Err(RecognizerError::Rejected(format!("HTTP {status}")));
        }
        if let Some(err) = data.get("error_msg").and_then(|m| m.as_str()) {
            return Err(RecognizerError::Rejected(err.to_string()));
        }
        let words = data
            .get("words_result")
            .and_then(|w| w.get(0))
            .and_then(|w| w.get("words"))
            .and_then(|w| w.as_str())
            .unwrap_or("");
        if words.is_empty() {
            return Err(RecognizerError::EmptyResult);
        }
        finalize_code(words, words, self.min_len, self.max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_is_misconfigured() {
        assert!(matches!(
            BaiduRecognizer::from_config(&CaptchaConfig::default()),
            Err(RecognizerError::Misconfigured(_))
        ));
    }
}
