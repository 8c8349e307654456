//! Read-only rehearsal driver
//!
//! Exercises the whole login → schedule → listing (→ captcha) path against
//! the live site without ever touching the election endpoint, and drops
//! sanitized artifacts into a cache directory for offline fixtures. Used
//! before an election window opens to prove the account and config work.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::client::{IaaaClient, PoolKind, Session, random_user_agent};
use crate::config::Config;
use crate::error::ElectiveError;
use crate::fixtures::sanitize_text;
use crate::net::Endpoints;
use crate::rate_limit::RateLimiter;

static RE_OP_WINDOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"([0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2}).*?([0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2})",
    )
    .expect("static regex")
});

/// Best-effort extraction of the operation window bounds from a
/// NotInOperationTime message.
#[must_use]
pub fn extract_operation_window(message: &str) -> Option<String> {
    let caps = RE_OP_WINDOW.captures(message)?;
    Some(format!("{} -> {}", &caps[1], &caps[2]))
}

/// Classify a rehearsal failure. `strict_only` failures (the site simply
/// being outside its operation window) only fail the run under `--strict`.
#[must_use]
pub fn classify_rehearsal_error(e: &ElectiveError) -> (&'static str, bool) {
    match e {
        ElectiveError::NotInOperationTime { .. } => ("not_in_operation", true),
        ElectiveError::Auth { .. } => ("session", false),
        ElectiveError::CaughtCheating { .. } => ("caught_cheating", false),
        ElectiveError::ServerError { .. } | ElectiveError::StatusCodeError { .. } => {
            ("http_status", false)
        }
        ElectiveError::Network { .. } => ("network", false),
        ElectiveError::IaaaIncorrectPassword { .. }
        | ElectiveError::IaaaForbidden { .. }
        | ElectiveError::IaaaNotSuccess { .. } => ("iaaa", false),
        _ => ("autoelective", false),
    }
}

#[derive(Debug, Clone)]
pub struct RehearsalOptions {
    pub strict: bool,
    /// Also fetch a captcha image and run a dummy validate.
    pub with_captcha: bool,
    pub cache_dir: PathBuf,
}

impl Default for RehearsalOptions {
    fn default() -> Self {
        Self {
            strict: false,
            with_captcha: false,
            cache_dir: PathBuf::from("runtime/rehearsal"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RehearsalStep {
    pub name: &'static str,
    pub ok: bool,
    pub kind: Option<&'static str>,
    pub detail: Option<String>,
    pub artifact: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RehearsalSummary {
    pub steps: Vec<RehearsalStep>,
    /// All hard failures absent.
    pub ok: bool,
    /// `ok` and no strict-only failures either.
    pub strict_ok: bool,
}

struct Recorder {
    steps: Vec<RehearsalStep>,
    cache_dir: PathBuf,
    student_id: String,
}

impl Recorder {
    fn pass(&mut self, name: &'static str, artifact: Option<String>) {
        self.steps.push(RehearsalStep {
            name,
            ok: true,
            kind: None,
            detail: None,
            artifact,
        });
    }

    fn fail(&mut self, name: &'static str, e: &ElectiveError) {
        let (kind, _) = classify_rehearsal_error(e);
        let mut detail = e.to_string();
        if let ElectiveError::NotInOperationTime { message } = e {
            if let Some(window) = extract_operation_window(message) {
                detail = format!("{detail} (window: {window})");
            }
        }
        self.steps.push(RehearsalStep {
            name,
            ok: false,
            kind: Some(kind),
            detail: Some(sanitize_text(&detail, Some(&self.student_id))),
            artifact: None,
        });
    }

    fn save_text(&self, name: &str, body: &str) -> Option<String> {
        std::fs::create_dir_all(&self.cache_dir).ok()?;
        let path = self.cache_dir.join(name);
        let clean = sanitize_text(body, Some(&self.student_id));
        std::fs::write(&path, clean).ok()?;
        Some(path.display().to_string())
    }

    fn save_bytes(&self, name: &str, body: &[u8]) -> Option<String> {
        std::fs::create_dir_all(&self.cache_dir).ok()?;
        let path = self.cache_dir.join(name);
        std::fs::write(&path, body).ok()?;
        Some(path.display().to_string())
    }
}

/// Run the read-only rehearsal. This function must never call the
/// election endpoint.
pub async fn run_rehearsal(
    cfg: &Config,
    opts: &RehearsalOptions,
) -> anyhow::Result<RehearsalSummary> {
    let endpoints = Endpoints::new(&cfg.net);
    let rate = Arc::new(RateLimiter::from_config(&cfg.rate_limit, &cfg.net));
    let user_agent = random_user_agent();
    let mut recorder = Recorder {
        steps: Vec::new(),
        cache_dir: opts.cache_dir.clone(),
        student_id: cfg.user.student_id.clone(),
    };

    let iaaa = IaaaClient::new(
        user_agent,
        endpoints.clone(),
        Arc::clone(&rate),
        Duration::from_secs_f64(cfg.client.iaaa_timeout.max(1.0)),
    )
    .map_err(|e| anyhow::anyhow!(e.to_string()))
    .context("iaaa client setup")?;

    let mut session = Session::new(
        1,
        0,
        PoolKind::Elective,
        user_agent,
        endpoints,
        rate,
        Duration::from_secs_f64(cfg.client.elective_timeout.max(1.0)),
    )
    .map_err(|e| anyhow::anyhow!(e.to_string()))
    .context("session setup")?;

    // Login
    let login = async {
        iaaa.oauth_home().await?;
        let token = iaaa
            .oauth_login(&cfg.user.student_id, &cfg.user.password)
            .await?;
        let body = session.sso_login(&token).await?;
        if cfg.user.dual_degree {
            let sida = crate::parser::extract_sida(&body).ok_or_else(|| {
                ElectiveError::OperationFailed {
                    message: "dual-degree sida not found".to_string(),
                }
            })?;
            session
                .sso_login_dual_degree(&sida, &cfg.user.identity, "")
                .await?;
        }
        Ok::<(), ElectiveError>(())
    }
    .await;
    match login {
        Ok(()) => recorder.pass("login", None),
        Err(e) => {
            recorder.fail("login", &e);
            return Ok(finish(recorder));
        }
    }
    session.arm(-1);

    // Schedule page
    match session.get_help_controller().await {
        Ok(body) => {
            let artifact = recorder.save_text("help.html", &body);
            recorder.pass("help_schedule", artifact);
        }
        Err(e) => recorder.fail("help_schedule", &e),
    }

    // Listing page
    match session.get_supply_cancel(&cfg.user.student_id).await {
        Ok(body) => {
            let artifact = recorder.save_text("supply_cancel.html", &body);
            match crate::parser::parse_listing(&body) {
                Ok((elected, plans)) => {
                    info!(
                        "rehearsal: listing parsed ({} elected, {} plans)",
                        elected.len(),
                        plans.len()
                    );
                    recorder.pass("listing", artifact);
                }
                Err(e) => recorder.fail("listing_parse", &e),
            }
        }
        Err(e) => recorder.fail("listing", &e),
    }

    // Optional captcha round trip with a throwaway code. A "0" from the
    // validate endpoint is the expected, healthy answer here.
    if opts.with_captcha {
        match session.get_draw_servlet(&cfg.user.student_id).await {
            Ok(raw) => {
                let ext = crate::captcha::guess_image_ext(&raw);
                let artifact = recorder.save_bytes(&format!("captcha.{ext}"), &raw);
                recorder.pass("draw", artifact);
                match session.get_validate(&cfg.user.student_id, "0000").await {
                    Ok(valid) => {
                        info!("rehearsal: dummy validate returned {valid:?}");
                        recorder.pass("validate", None);
                    }
                    Err(e) => recorder.fail("validate", &e),
                }
            }
            Err(e) => recorder.fail("draw", &e),
        }
    }

    Ok(finish(recorder))
}

fn finish(recorder: Recorder) -> RehearsalSummary {
    let hard_fail = recorder.steps.iter().any(|s| {
        !s.ok && s
            .kind
            .is_some_and(|k| k != "not_in_operation")
    });
    let any_fail = recorder.steps.iter().any(|s| !s.ok);
    RehearsalSummary {
        ok: !hard_fail,
        strict_ok: !any_fail,
        steps: recorder.steps,
    }
}
