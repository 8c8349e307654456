//! Background captcha probe
//!
//! Warms the adaptive router's statistics by running Draw → Recognize →
//! Validate against the live server with the least-sampled provider. It
//! steps aside whenever the main loop is bursting, the chain is degraded
//! or the agent is OFFLINE, and it never competes with the burst path for
//! sessions: a missing pool slot just skips the tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng as _;

use crate::client::PoolItem;
use crate::error::ElectiveError;

use super::breakers::now_ts;
use super::context::Context;

fn jittered_probe_interval(ctx: &Context) -> Option<Duration> {
    let base = ctx.config.captcha.probe_interval;
    if base <= 0.0 {
        return None;
    }
    let dev = ctx.config.captcha.probe_random_deviation;
    let interval = if dev <= 0.0 {
        base.max(1.0)
    } else {
        let u: f64 = rand::rng().random_range(-1.0..=1.0);
        (base + u * dev * base).max(1.0)
    };
    Some(Duration::from_secs_f64(interval))
}

pub async fn run_probe_loop(ctx: Arc<Context>) {
    if !ctx.config.captcha.probe_enabled {
        return;
    }
    let Some(pool) = ctx.pools.probe_source().cloned() else {
        warn!("CaptchaProbe disabled: probe pool not configured");
        return;
    };
    let Some(first_interval) = jittered_probe_interval(&ctx) else {
        warn!("CaptchaProbe disabled: non-positive interval");
        return;
    };
    let backoff = Duration::from_secs_f64(ctx.config.captcha.probe_backoff.max(1.0));
    let mut next_probe_at = Instant::now() + first_interval;

    while !ctx.probe_stopped() {
        if ctx.probe_paused() || ctx.breakers.captcha_degraded() || ctx.breakers.offline_active() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            continue;
        }
        let now = Instant::now();
        if now < next_probe_at {
            tokio::time::sleep((next_probe_at - now).min(Duration::from_millis(500))).await;
            continue;
        }
        let interval = jittered_probe_interval(&ctx).unwrap_or(backoff);
        next_probe_at = Instant::now() + interval;

        let order = ctx.adaptive.get_order();
        let Some(provider) = ctx.adaptive.select_probe_provider(&order) else {
            continue;
        };
        let Some(recognizer) = ctx.chain.get(&provider) else {
            continue;
        };

        // Never block on the pool; the burst path owns it.
        let Some(item) = pool.try_get().await else {
            continue;
        };
        let session = match item {
            PoolItem::Killed => {
                // Not ours to consume; put it back for the owner loop.
                pool.put(PoolItem::Killed, &ctx.stats).await;
                return;
            }
            PoolItem::Session(s) => {
                if ctx.pools.is_stale(&s) {
                    ctx.stats.inc("client_stale_drop");
                    continue;
                }
                s
            }
        };
        if !session.is_logged_in() || session.is_expired() {
            ctx.pools.send_to_relogin(session, &ctx.stats).await;
            continue;
        }

        let student_id = ctx.config.user.student_id.clone();

        let t_draw = Instant::now();
        let raw = match session.get_draw_servlet(&student_id).await {
            Ok(raw) => raw,
            Err(e) => {
                match &e {
                    ElectiveError::Auth { .. } => {
                        ctx.stats.inc("probe_auth_error");
                        let trip = ctx.breakers.record_auth_error();
                        if trip.drain_pool {
                            ctx.pools.reset("auth_error", false, &ctx.stats).await;
                        }
                        ctx.pools.send_to_relogin(session, &ctx.stats).await;
                        next_probe_at = Instant::now() + backoff;
                        continue;
                    }
                    ElectiveError::NotInOperationTime { .. } => {
                        ctx.stats.inc("probe_not_in_operation");
                        let schedule = ctx.breakers.cached_schedule();
                        let (min_refresh, reason) = ctx
                            .breakers
                            .update_not_in_operation(schedule.as_deref(), now_ts());
                        warn!(
                            "Not in operation time (probe): min_refresh={}s ({reason})",
                            min_refresh as i64
                        );
                        ctx.pools.return_home(session, &ctx.stats).await;
                        next_probe_at = Instant::now()
                            + backoff.max(Duration::from_secs_f64(min_refresh.max(0.0)));
                        continue;
                    }
                    _ => {
                        debug!("probe draw failed: {e}");
                        ctx.stats.inc("probe_error");
                        ctx.pools.return_home(session, &ctx.stats).await;
                        next_probe_at = Instant::now() + backoff;
                        continue;
                    }
                }
            }
        };
        let draw_dt = t_draw.elapsed().as_secs_f64();
        ctx.samples.maybe_save(
            &raw,
            Some(provider.as_str()),
            "probe",
            ctx.current_round(),
            Some(draw_dt),
        );

        ctx.stats.inc("probe_attempt");
        let t_recog = Instant::now();
        let captcha = match recognizer.recognize(&raw).await {
            Ok(c) => c,
            Err(e) => {
                debug!("probe recognize failed ({provider}): {e}");
                ctx.stats.inc("probe_recognize_error");
                ctx.adaptive.record_attempt(
                    &provider,
                    false,
                    Some(t_recog.elapsed().as_secs_f64()),
                    None,
                );
                ctx.pools.return_home(session, &ctx.stats).await;
                continue;
            }
        };
        let recog_dt = t_recog.elapsed().as_secs_f64();

        let t_val = Instant::now();
        match session.get_validate(&student_id, &captcha.code).await {
            Ok(valid) => {
                let val_dt = t_val.elapsed().as_secs_f64();
                match valid.as_str() {
                    "2" => {
                        ctx.stats.inc("probe_success");
                        ctx.adaptive.record_attempt(
                            &provider,
                            true,
                            Some(recog_dt),
                            Some(draw_dt + val_dt),
                        );
                    }
                    "0" => {
                        ctx.stats.inc("probe_fail");
                        ctx.adaptive.record_attempt(
                            &provider,
                            false,
                            Some(recog_dt),
                            Some(draw_dt + val_dt),
                        );
                    }
                    other => {
                        debug!("probe validate returned unknown result {other:?}");
                        ctx.stats.inc("probe_validate_unknown");
                    }
                }
            }
            Err(e) => {
                debug!("probe validate failed: {e}");
                ctx.stats.inc("probe_validate_parse_error");
                next_probe_at = Instant::now() + backoff;
            }
        }
        ctx.pools.return_home(session, &ctx.stats).await;
    }
}
