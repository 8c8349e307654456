//! Optional captcha sample capture
//!
//! When enabled, a configurable fraction of fetched captcha images is kept
//! on disk for offline benchmarking of recognizers. Each image gets a
//! sidecar JSON with the provider and context that saw it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use log::debug;
use rand::Rng as _;
use serde::Serialize;
use sha1::{Digest as _, Sha1};

use super::guess_image_ext;

#[derive(Debug, Serialize)]
struct SampleMeta<'a> {
    ts: String,
    provider: Option<&'a str>,
    context: &'a str,
    round: u64,
    draw_dt: Option<f64>,
    size: usize,
}

pub struct SampleWriter {
    enabled: bool,
    rate: f64,
    dir: PathBuf,
    seq: AtomicU64,
    dir_ready: AtomicBool,
}

impl SampleWriter {
    #[must_use]
    pub fn new(enabled: bool, rate: f64, dir: PathBuf) -> Self {
        Self {
            enabled,
            rate: rate.clamp(0.0, 1.0),
            dir,
            seq: AtomicU64::new(0),
            dir_ready: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn from_config(cfg: &crate::config::CaptchaConfig) -> Self {
        Self::new(cfg.sample_enable, cfg.sample_rate, PathBuf::from(&cfg.sample_dir))
    }

    fn ensure_dir(&self) -> bool {
        if self.dir_ready.load(Ordering::Relaxed) {
            return true;
        }
        match std::fs::create_dir_all(&self.dir) {
            Ok(()) => {
                self.dir_ready.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!("sample dir unavailable ({}): {e}", self.dir.display());
                false
            }
        }
    }

    /// Possibly write `raw` and its sidecar. Returns true when a sample
    /// was saved; failures are swallowed (sampling must never disturb the
    /// burst path).
    pub fn maybe_save(
        &self,
        raw: &[u8],
        provider: Option<&str>,
        context: &str,
        round: u64,
        draw_dt: Option<f64>,
    ) -> bool {
        if !self.enabled || raw.is_empty() {
            return false;
        }
        if self.rate < 1.0 && rand::rng().random::<f64>() > self.rate {
            return false;
        }
        if !self.ensure_dir() {
            return false;
        }
        let ts = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let digest = Sha1::digest(raw);
        let prefix = hex::encode(&digest[..6]);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let base = format!("{ts}_{prefix}_{seq}");
        let img_path = self.dir.join(format!("{base}.{}", guess_image_ext(raw)));
        let meta_path = self.dir.join(format!("{base}.json"));

        let meta = SampleMeta {
            ts,
            provider,
            context,
            round,
            draw_dt,
            size: raw.len(),
        };
        let ok = std::fs::write(&img_path, raw).is_ok()
            && serde_json::to_vec(&meta)
                .ok()
                .and_then(|body| std::fs::write(&meta_path, body).ok())
                .is_some();
        if !ok {
            debug!("sample write failed: {}", img_path.display());
        }
        ok
    }
}
