//! Vendor OCR backends
//!
//! All vendors speak JSON-over-HTTPS with a base64 image payload. The
//! shared retry discipline lives here: up to 3 attempts, exponential
//! backoff capped at 8 seconds, `Retry-After` honored on 429/5xx.

pub mod baidu;
pub mod gemini;
pub mod qwen;

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;

use crate::error::RecognizerError;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// POST a JSON-bodied request with the shared retry policy. The builder is
/// cloned per attempt; a non-cloneable builder fails fast.
pub(crate) async fn send_with_retry(
    builder: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<(StatusCode, String), RecognizerError> {
    let mut backoff = Duration::from_secs(1);
    let mut last_err: Option<RecognizerError> = None;

    for attempt in 0..MAX_ATTEMPTS {
        let Some(req) = builder.try_clone() else {
            return Err(RecognizerError::Misconfigured(
                "recognizer request is not retryable".to_string(),
            ));
        };
        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                    .map(Duration::from_secs_f64);
                let body = resp.text().await.unwrap_or_default();
                let transient = matches!(status.as_u16(), 429 | 500 | 503);
                if transient && attempt + 1 < MAX_ATTEMPTS {
                    let sleep = retry_after.unwrap_or(backoff).min(BACKOFF_CAP);
                    tokio::time::sleep(sleep).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    last_err = Some(RecognizerError::Rejected(format!(
                        "HTTP {status}: {}",
                        body_excerpt(&body)
                    )));
                    continue;
                }
                return Ok((status, body));
            }
            Err(e) if e.is_timeout() => {
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    last_err = Some(RecognizerError::Timeout(timeout));
                    continue;
                }
                return Err(RecognizerError::Timeout(timeout));
            }
            Err(e) => {
                if e.is_connect() && attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    last_err = Some(RecognizerError::Unreachable(e.to_string()));
                    continue;
                }
                return Err(RecognizerError::Unreachable(e.to_string()));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        RecognizerError::Unreachable("recognizer retries exhausted".to_string())
    }))
}

fn body_excerpt(body: &str) -> &str {
    let mut end = body.len().min(200);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

static RE_JSON_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""text"\s*:\s*"([A-Za-z0-9]+)""#).expect("static regex"));
static RE_JSON_TEXT_SQ: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'text'\s*:\s*'([A-Za-z0-9]+)'").expect("static regex"));
static RE_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9]+").expect("static regex"));

/// Pull a plausible code out of free-form model output: an explicit
/// `"text": "..."` field first, otherwise the last alnum token within the
/// expected length range.
#[must_use]
pub(crate) fn extract_code_candidate(text: &str, min_len: usize, max_len: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    for re in [&*RE_JSON_TEXT, &*RE_JSON_TEXT_SQ] {
        if let Some(caps) = re.captures(text) {
            return caps[1].to_string();
        }
    }
    let candidates: Vec<&str> = RE_ALNUM
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|t| (min_len..=max_len).contains(&t.len()))
        .collect();
    candidates.last().copied().unwrap_or("").to_string()
}

/// Normalize `code_src`, falling back to candidate extraction from the
/// whole `text` when the direct value is empty or the wrong length.
pub(crate) fn finalize_code(
    code_src: &str,
    text: &str,
    min_len: usize,
    max_len: usize,
) -> Result<super::Captcha, RecognizerError> {
    let code = super::normalize_code(code_src);
    if code.is_empty() {
        let fallback = super::normalize_code(&extract_code_candidate(text, min_len, max_len));
        if fallback.is_empty() {
            return Err(RecognizerError::EmptyResult);
        }
        return finalize_len(fallback, text, min_len, max_len);
    }
    finalize_len(code, text, min_len, max_len)
}

fn finalize_len(
    code: String,
    text: &str,
    min_len: usize,
    max_len: usize,
) -> Result<super::Captcha, RecognizerError> {
    if (min_len..=max_len).contains(&code.len()) {
        return Ok(super::Captcha::new(code));
    }
    let fallback = super::normalize_code(&extract_code_candidate(text, min_len, max_len));
    if (min_len..=max_len).contains(&fallback.len()) && !fallback.is_empty() {
        return Ok(super::Captcha::new(fallback));
    }
    Err(RecognizerError::BadCodeLength { code })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_code_prefers_text_field() {
        let out = r#"The captcha reads {"text": "AB3D"} probably"#;
        assert_eq!(extract_code_candidate(out, 4, 4), "AB3D");
    }

    #[test]
    fn test_extract_code_last_token_in_range() {
        let out = "I believe the answer is abcde or XY2Z";
        assert_eq!(extract_code_candidate(out, 4, 4), "XY2Z");
        // Several candidates in range: the last one wins.
        assert_eq!(extract_code_candidate("abcde then fghij", 5, 5), "fghij");
    }

    #[test]
    fn test_finalize_code_normalizes() {
        let c = finalize_code(" ab3d ", "", 4, 4).unwrap();
        assert_eq!(c.code, "AB3D");
    }

    #[test]
    fn test_finalize_code_falls_back_on_length() {
        let c = finalize_code("toolongcode", "model answered W9XY", 4, 4).unwrap();
        assert_eq!(c.code, "W9XY");
        assert!(matches!(
            finalize_code("toolongcode", "completely inscrutable", 4, 4),
            Err(RecognizerError::BadCodeLength { .. })
        ));
    }

    #[test]
    fn test_finalize_code_empty() {
        assert!(matches!(
            finalize_code("", "", 4, 4),
            Err(RecognizerError::EmptyResult)
        ));
    }
}
