//! Explicit engine context
//!
//! Everything the loops share travels in one `Arc<Context>` threaded
//! through constructors: configuration, pools, breakers, the recognizer
//! chain and its adaptive router, stats and the notifier. No module-level
//! state anywhere.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::captcha::adaptive::{AdaptiveOptions, AdaptiveRouter};
use crate::captcha::chain::RecognizerChain;
use crate::captcha::samples::SampleWriter;
use crate::captcha::snapshot::AdaptivePersistence;
use crate::client::PoolManager;
use crate::config::Config;
use crate::error::RecognizerError;
use crate::net::Endpoints;
use crate::notify::Notifier;
use crate::rate_limit::RateLimiter;

use super::breakers::Breakers;
use super::stats::RuntimeStats;

pub struct Context {
    pub config: Arc<Config>,
    pub endpoints: Endpoints,
    pub stats: Arc<RuntimeStats>,
    pub breakers: Arc<Breakers>,
    pub adaptive: Arc<AdaptiveRouter>,
    pub chain: Arc<RecognizerChain>,
    pub pools: Arc<PoolManager>,
    pub rate: Arc<RateLimiter>,
    pub notifier: Arc<dyn Notifier>,
    pub samples: Arc<SampleWriter>,
    pub persistence: Option<Arc<AdaptivePersistence>>,

    /// Elective round counter (loop ticks for the adaptive gate).
    pub round: AtomicU64,
    /// Login loop iteration counter.
    pub login_round: AtomicU64,
    /// Raised by the elective loop around bursts and OFFLINE; the probe
    /// loop idles while set.
    pub probe_pause: AtomicBool,
    /// Tells the probe loop to exit.
    pub probe_stop: AtomicBool,
}

impl Context {
    pub fn new(config: Config) -> Result<Arc<Self>, RecognizerError> {
        Self::with_notifier(config, None)
    }

    pub fn with_notifier(
        config: Config,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Arc<Self>, RecognizerError> {
        let config = Arc::new(config);
        let stats = Arc::new(RuntimeStats::from_config(&config.runtime));
        let rate = Arc::new(
            RateLimiter::from_config(&config.rate_limit, &config.net).with_stats(Arc::clone(&stats)),
        );
        let chain = Arc::new(RecognizerChain::from_config(&config.captcha)?);
        let adaptive = Arc::new(AdaptiveRouter::new(
            chain.names(),
            AdaptiveOptions::from_config(&config.captcha),
        ));
        let breakers = Arc::new(Breakers::new(
            config.resilience.clone(),
            &config.captcha,
            Arc::clone(&stats),
        ));
        let pools = Arc::new(PoolManager::new(&config, Arc::clone(&rate)));
        let notifier = notifier.unwrap_or_else(|| crate::notify::from_config(&config.notify));
        let samples = Arc::new(SampleWriter::from_config(&config.captcha));
        let persistence = config.captcha.adaptive_persist_enable.then(|| {
            Arc::new(AdaptivePersistence::new(
                PathBuf::from(&config.captcha.adaptive_persist_path),
                Duration::from_secs_f64(config.captcha.adaptive_persist_interval.max(0.0)),
            ))
        });
        let endpoints = Endpoints::new(&config.net);
        Ok(Arc::new(Self {
            config,
            endpoints,
            stats,
            breakers,
            adaptive,
            chain,
            pools,
            rate,
            notifier,
            samples,
            persistence,
            round: AtomicU64::new(0),
            login_round: AtomicU64::new(0),
            probe_pause: AtomicBool::new(false),
            probe_stop: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn current_round(&self) -> u64 {
        self.round.load(Ordering::Relaxed)
    }

    pub fn pause_probe(&self, paused: bool) {
        self.probe_pause.store(paused, Ordering::Relaxed);
    }

    #[must_use]
    pub fn probe_paused(&self) -> bool {
        self.probe_pause.load(Ordering::Relaxed)
    }

    pub fn stop_probe(&self) {
        self.probe_stop.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn probe_stopped(&self) -> bool {
        self.probe_stop.load(Ordering::Relaxed)
    }
}
