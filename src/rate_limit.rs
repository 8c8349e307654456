//! Outbound request throttling
//!
//! A safety net, not a scheduler: token buckets for the whole process and
//! per host, consulted once per outbound request. Buckets with a
//! non-positive rate are disabled. `consume` reports how long it had to
//! block so the caller can surface the wait in runtime stats.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{NetConfig, RateLimitConfig};
use crate::net::Endpoints;

/// A single token bucket. The lock is only held for the refill-and-take
/// bookkeeping; waiting happens outside it.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(rate: f64, burst: f64) -> Self {
        let rate = rate.max(0.0);
        let capacity = burst.max(0.0);
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last: Instant::now(),
            }),
        }
    }

    /// Take `tokens` from the bucket, sleeping as needed. Returns the total
    /// time spent blocked (zero when a token was immediately available or
    /// the bucket is disabled).
    pub async fn consume(&self, tokens: f64) -> Duration {
        if self.rate <= 0.0 || tokens <= 0.0 {
            return Duration::ZERO;
        }
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut st = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(st.last).as_secs_f64();
                st.tokens = (st.tokens + elapsed * self.rate).min(self.capacity);
                st.last = now;
                if st.tokens >= tokens {
                    st.tokens -= tokens;
                    return waited;
                }
                let missing = tokens - st.tokens;
                st.tokens = 0.0;
                Duration::from_secs_f64(missing / self.rate)
            };
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }
}

/// Global + per-host buckets resolved from configuration.
#[derive(Default)]
pub struct RateLimiter {
    enabled: bool,
    global: Option<TokenBucket>,
    hosts: HashMap<String, Arc<TokenBucket>>,
    stats: Option<Arc<crate::engine::stats::RuntimeStats>>,
}

impl RateLimiter {
    /// A limiter that never blocks.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(cfg: &RateLimitConfig, net: &NetConfig) -> Self {
        if !cfg.enable {
            return Self::disabled();
        }
        fn bucket(rate: f64, burst: f64) -> Option<TokenBucket> {
            if rate <= 0.0 {
                return None;
            }
            let burst = if burst > 0.0 { burst } else { rate.max(1.0) };
            Some(TokenBucket::new(rate, burst))
        }

        let endpoints = Endpoints::new(net);
        let mut hosts = HashMap::new();
        if let (Some(host), Some(b)) = (
            endpoints.elective_host(),
            bucket(cfg.elective_rps, cfg.elective_burst),
        ) {
            hosts.insert(host, Arc::new(b));
        }
        if let (Some(host), Some(b)) = (endpoints.iaaa_host(), bucket(cfg.iaaa_rps, cfg.iaaa_burst))
        {
            hosts.insert(host, Arc::new(b));
        }
        Self {
            enabled: true,
            global: bucket(cfg.global_rps, cfg.global_burst),
            hosts,
            stats: None,
        }
    }

    /// Attach the runtime stats registry so blocked time is reported.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<crate::engine::stats::RuntimeStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Throttle one outbound request to `url`. Returns total blocked time.
    pub async fn throttle(&self, url: &str) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let mut waited = Duration::ZERO;
        if let Some(global) = &self.global {
            waited += global.consume(1.0).await;
        }
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        if let Some(host) = host {
            if let Some(bucket) = self.hosts.get(&host) {
                waited += bucket.consume(1.0).await;
            }
        }
        if !waited.is_zero() {
            if let Some(stats) = &self.stats {
                stats.inc("rate_limit_sleep");
                stats.set_gauge("rate_limit_last_sleep", waited.as_secs_f64());
            }
        }
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_then_wait() {
        let bucket = TokenBucket::new(10.0, 3.0);
        // The first `burst` consumes return without blocking.
        for _ in 0..3 {
            assert_eq!(bucket.consume(1.0).await, Duration::ZERO);
        }
        // The next one waits at least 1/rate.
        let waited = bucket.consume(1.0).await;
        assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_disabled_bucket_never_blocks() {
        let bucket = TokenBucket::new(0.0, 0.0);
        for _ in 0..100 {
            assert_eq!(bucket.consume(1.0).await, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_limiter_disabled_by_config() {
        let limiter = RateLimiter::from_config(
            &RateLimitConfig {
                enable: false,
                global_rps: 1.0,
                ..RateLimitConfig::default()
            },
            &NetConfig::default(),
        );
        assert!(!limiter.is_enabled());
        assert_eq!(limiter.throttle("https://x.example/a").await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_limiter_per_host_bucket() {
        let net = NetConfig {
            iaaa_base_url: "https://iaaa.test/iaaa".to_string(),
            elective_base_url: "https://elective.test/e".to_string(),
        };
        let limiter = RateLimiter::from_config(
            &RateLimitConfig {
                enable: true,
                elective_rps: 100.0,
                elective_burst: 1.0,
                ..RateLimitConfig::default()
            },
            &net,
        );
        assert!(limiter.is_enabled());
        // First hit free, second waits on the elective bucket.
        assert_eq!(limiter.throttle("https://elective.test/e/x").await, Duration::ZERO);
        let waited = limiter.throttle("https://elective.test/e/y").await;
        assert!(waited > Duration::ZERO);
        // Unrelated hosts are untouched.
        assert_eq!(limiter.throttle("https://other.test/z").await, Duration::ZERO);
    }
}
