//! CAPTCHA recognition: providers, adaptive routing, persistence
//!
//! A provider is anything that turns image bytes into a candidate code.
//! The chain (primary + fallbacks) is owned by [`chain::RecognizerChain`];
//! the [`adaptive`] router reorders it from observed success rates and
//! latencies.

pub mod adaptive;
pub mod chain;
pub mod providers;
pub mod registry;
pub mod samples;
pub mod snapshot;

use async_trait::async_trait;

use crate::error::RecognizerError;

/// A recognized candidate code, already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captcha {
    pub code: String,
}

impl Captcha {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// One OCR backend. Implementations retry their own transport hiccups;
/// a returned error is final for this attempt.
#[async_trait]
pub trait Recognizer: Send + Sync + std::fmt::Debug {
    /// Registry name of this provider.
    fn name(&self) -> &str;

    /// Recognize the captcha in `raw` image bytes.
    async fn recognize(&self, raw: &[u8]) -> Result<Captcha, RecognizerError>;
}

/// Keep `[A-Za-z0-9]`, uppercased. The site's codes never contain
/// anything else; whatever the vendor wraps around them is noise.
#[must_use]
pub fn normalize_code(text: &str) -> String {
    text.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Sniff the image container from magic bytes. Used for sample file
/// extensions and vendor payload mime types.
#[must_use]
pub fn guess_image_ext(raw: &[u8]) -> &'static str {
    if raw.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if raw.starts_with(b"\xff\xd8") {
        "jpg"
    } else if raw.starts_with(b"GIF87a") || raw.starts_with(b"GIF89a") {
        "gif"
    } else if raw.starts_with(b"BM") {
        "bmp"
    } else {
        "bin"
    }
}

#[must_use]
pub fn image_mime(raw: &[u8]) -> &'static str {
    match guess_image_ext(raw) {
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" ab 1c\n"), "AB1C");
        assert_eq!(normalize_code("{\"text\": \"x9z\"}"), "TEXTX9Z");
        assert_eq!(normalize_code("码"), "");
    }

    #[test]
    fn test_guess_image_ext() {
        assert_eq!(guess_image_ext(b"\xff\xd8\xff\xe0rest"), "jpg");
        assert_eq!(guess_image_ext(b"GIF89a..."), "gif");
        assert_eq!(guess_image_ext(b"\x89PNG\r\n\x1a\nrest"), "png");
        assert_eq!(guess_image_ext(b"junk"), "bin");
    }
}
