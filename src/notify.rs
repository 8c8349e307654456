//! Push notifications
//!
//! The transport is an external collaborator; the core only needs a
//! fire-and-forget `Notifier`. Pushes must never fail a round, so every
//! implementation swallows its own errors.

use async_trait::async_trait;
use log::{debug, info};

use crate::config::NotifyConfig;
use std::sync::Arc;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn push(&self, title: &str, body: &str);
}

/// Default transport: the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn push(&self, title: &str, body: &str) {
        info!("notify: {title} — {body}");
    }
}

/// Bark-style push endpoint (`GET <base>/<title>/<body>`).
pub struct BarkNotifier {
    base_url: String,
    http: reqwest::Client,
}

impl BarkNotifier {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for BarkNotifier {
    async fn push(&self, title: &str, body: &str) {
        let url = format!(
            "{}/{}/{}",
            self.base_url,
            urlencode(title),
            urlencode(body)
        );
        if let Err(e) = self.http.get(&url).send().await {
            debug!("push failed: {e}");
        }
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Resolve the configured transport.
#[must_use]
pub fn from_config(cfg: &NotifyConfig) -> Arc<dyn Notifier> {
    if cfg.disable_push || cfg.bark_url.trim().is_empty() {
        Arc::new(LogNotifier)
    } else {
        Arc::new(BarkNotifier::new(cfg.bark_url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("a b"), "a+b");
        assert_eq!(urlencode("代数"), "%E4%BB%A3%E6%95%B0");
    }
}
