//! Capturing and sanitizing live responses into shareable fixtures
//!
//! Kept small and dependency-light so both the CLI utilities and the
//! offline tests can use it. Sanitization is idempotent and never grows a
//! sensitive substring: replacement markers are truncated to the length of
//! the value they replace.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_SIDA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(sida=)([0-9a-f]{32})").expect("static regex"));
static RE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(token=)([^&\s]+)").expect("static regex"));
static RE_JSESSIONID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(JSESSIONID=)([^;\s]+)").expect("static regex"));
static RE_PHPSESSID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(PHPSESSID=)([^;\s]+)").expect("static regex"));
static RE_XH_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\bxh=)(\d+)").expect("static regex"));

/// Marker truncated so it never exceeds the replaced value's length. A
/// marker prefix is itself mapped to the same prefix, which is what makes
/// a second pass a no-op.
fn marker_for(marker: &str, original_len: usize) -> String {
    let take = marker.len().min(original_len);
    marker.chars().take(take).collect()
}

fn replace_value(re: &Regex, s: &str, marker: &str) -> String {
    re.replace_all(s, |caps: &regex::Captures<'_>| {
        let prefix = &caps[1];
        let value = &caps[2];
        format!("{prefix}{}", marker_for(marker, value.len()))
    })
    .into_owned()
}

/// Redact the sensitive values a fixture must never carry: the student id
/// (both verbatim and as the `xh` parameter), SSO `sida`, IAAA `token`,
/// and session cookies.
#[must_use]
pub fn sanitize_text(text: &str, student_id: Option<&str>) -> String {
    let mut s = text.to_string();
    if let Some(id) = student_id {
        if !id.is_empty() {
            s = s.replace(id, &marker_for("STUDENT_ID", id.len()));
        }
    }
    s = replace_value(&RE_XH_PARAM, &s, "STUDENT_ID");
    s = replace_value(&RE_SIDA, &s, "SIDA");
    s = replace_value(&RE_TOKEN, &s, "TOKEN");
    s = replace_value(&RE_JSESSIONID, &s, "JSESSIONID");
    s = replace_value(&RE_PHPSESSID, &s, "PHPSESSID");
    s
}

/// Redact sensitive query parameters from a URL, dropping the fragment.
/// Falls back to plain text sanitization when the URL does not parse.
#[must_use]
pub fn redact_url(raw: &str, student_id: Option<&str>) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return sanitize_text(raw, student_id);
    };
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        let mut rewritten = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            let lk = k.to_lowercase();
            let redacted = if matches!(lk.as_str(), "token" | "sida" | "xh" | "student_id")
                || student_id.is_some_and(|id| !id.is_empty() && v == id)
            {
                "REDACTED".to_string()
            } else {
                sanitize_text(&v, student_id)
            };
            rewritten.push((k, redacted));
        }
        parsed
            .query_pairs_mut()
            .clear()
            .extend_pairs(rewritten.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    parsed.set_fragment(None);
    parsed.to_string()
}

fn looks_like_text(raw: &[u8], content_type: Option<&str>) -> bool {
    let ct = content_type.unwrap_or("").to_lowercase();
    if ["text/", "application/json", "application/javascript", "xml"]
        .iter()
        .any(|x| ct.contains(x))
    {
        return true;
    }
    if raw.is_empty() {
        return true;
    }
    let head: &[u8] = &raw[..raw.len().min(64)];
    let trimmed = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |ix| &head[ix..]);
    trimmed.first().is_some_and(|b| matches!(b, b'<' | b'{' | b'['))
}

/// Sanitize a raw response body. Binary payloads (captcha images) pass
/// through untouched; textual ones are decoded lossily and redacted.
#[must_use]
pub fn sanitize_bytes(raw: &[u8], content_type: Option<&str>, student_id: Option<&str>) -> Vec<u8> {
    if !looks_like_text(raw, content_type) {
        return raw.to_vec();
    }
    let text = String::from_utf8_lossy(raw);
    sanitize_text(&text, student_id).into_bytes()
}

/// Scan a (supposedly sanitized) fixture for residual secrets. Returns one
/// finding per leak class; an empty result means the fixture is shareable.
#[must_use]
pub fn scan_for_leaks(text: &str, student_id: Option<&str>) -> Vec<String> {
    let mut findings = Vec::new();
    if let Some(id) = student_id {
        if !id.is_empty() && text.contains(id) {
            findings.push("student id appears verbatim".to_string());
        }
    }
    if RE_SIDA.is_match(text) {
        findings.push("raw sida value".to_string());
    }
    for caps in RE_XH_PARAM.captures_iter(text) {
        if !caps[2].is_empty() {
            findings.push("raw xh parameter".to_string());
            break;
        }
    }
    for (re, marker, label) in [
        (&*RE_TOKEN, "TOKEN", "raw token value"),
        (&*RE_JSESSIONID, "JSESSIONID", "raw JSESSIONID cookie"),
        (&*RE_PHPSESSID, "PHPSESSID", "raw PHPSESSID cookie"),
    ] {
        for caps in re.captures_iter(text) {
            let value = &caps[2];
            if marker_for(marker, value.len()) != value {
                findings.push(label.to_string());
                break;
            }
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_student_id_and_params() {
        let raw = "GET /SupplyCancel?xh=2200012345 HTTP/1.1\nCookie: JSESSIONID=ABCDEF123456!99";
        let clean = sanitize_text(raw, Some("2200012345"));
        assert!(!clean.contains("2200012345"));
        assert!(clean.contains("xh=STUDENT_ID"));
        assert!(clean.contains("JSESSIONID=JSESSIONID"));
    }

    #[test]
    fn test_sanitize_idempotent() {
        let raw = "token=deadbeefcafe&sida=0123456789abcdef0123456789abcdef&xh=2200012345";
        let once = sanitize_text(raw, Some("2200012345"));
        let twice = sanitize_text(&once, Some("2200012345"));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_sanitize_never_lengthens_short_values() {
        // A 2-char token must not grow into a 5-char marker.
        let raw = "token=ab";
        let clean = sanitize_text(raw, None);
        assert_eq!(clean.len(), raw.len());
        assert_eq!(clean, "token=TO");
        assert_eq!(sanitize_text(&clean, None), clean);
    }

    #[test]
    fn test_redact_url_params_and_fragment() {
        let url = "https://elective.example.edu/SupplyCancel?xh=2200012345&page=2#frag";
        let clean = redact_url(url, Some("2200012345"));
        assert!(clean.contains("xh=REDACTED"));
        assert!(clean.contains("page=2"));
        assert!(!clean.contains('#'));
    }

    #[test]
    fn test_sanitize_bytes_passes_binary() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        assert_eq!(sanitize_bytes(&jpeg, None, Some("22")), jpeg.to_vec());
        let html = b"<html>xh=123</html>";
        let clean = sanitize_bytes(html, Some("text/html"), None);
        assert!(String::from_utf8(clean).unwrap().contains("xh=STU"));
    }

    #[test]
    fn test_scan_for_leaks() {
        let dirty = "sida=0123456789abcdef0123456789abcdef&xh=123";
        assert!(!scan_for_leaks(dirty, None).is_empty());
        let clean = sanitize_text(dirty, None);
        assert!(scan_for_leaks(&clean, None).is_empty());
    }
}
