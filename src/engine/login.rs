//! The login loop
//!
//! Consumes the relogin pool: every drained or expired session comes
//! through here, gets a fresh User-Agent and cookie jar, runs the IAAA
//! OAuth handshake and the SSO exchange, and goes back to its home pool
//! armed. A failed login requeues the session and retries after a
//! backoff; the `Killed` sentinel ends the loop.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{error, info, warn};

use crate::client::{IaaaClient, PoolItem, Session, random_user_agent};
use crate::error::ElectiveError;
use crate::parser;

use super::breakers::{OfflineAdvice, compute_backoff};
use super::context::Context;
use super::elective::offline_probe_tick;

pub async fn run_login_loop(ctx: Arc<Context>) {
    let mut consecutive_errors: u32 = 0;

    loop {
        ctx.breakers.cooldown_sleep().await;

        // The elective loop may be parked on an empty pool, so this loop
        // drives OFFLINE probing too; whoever sees the deadline first wins.
        // Once the elective loop has finished (probe stop raised), skip the
        // offline wait so the Killed sentinel still gets consumed.
        if !ctx.probe_stopped() {
            match ctx.breakers.offline_advice() {
                OfflineAdvice::Inactive => {}
                OfflineAdvice::Wait(d) => {
                    tokio::time::sleep(d).await;
                    continue;
                }
                OfflineAdvice::Probe => {
                    offline_probe_tick(&ctx).await;
                    continue;
                }
            }
        }

        let mut session = match ctx.pools.relogin.get().await {
            PoolItem::Killed => {
                info!("Quit login loop");
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

        ctx.login_round.fetch_add(1, Ordering::Relaxed);
        ctx.stats
            .set_gauge("relogin_pool_qsize", ctx.pools.relogin.len().await as f64);
        ctx.stats
            .set_gauge("iaaa_consecutive_errors", f64::from(consecutive_errors));
        ctx.stats.maybe_flush_error_agg();

        info!("Try to login IAAA (client: {})", session.id);

        let mut network_error = false;
        match login_once(&ctx, &mut session).await {
            Ok(()) => {
                consecutive_errors = 0;
                ctx.pools.return_home(session, &ctx.stats).await;
            }
            Err(e) => {
                consecutive_errors += 1;
                ctx.stats.record_error(&e.agg_key());
                match &e {
                    ElectiveError::Network { .. } => {
                        network_error = true;
                        record_network_error(&ctx, "iaaa_network", &e);
                        warn!("IAAA network error: {e}");
                    }
                    ElectiveError::IaaaIncorrectPassword { .. } => {
                        error!("{e}");
                        if ctx.breakers.should_notify_failure(consecutive_errors) {
                            ctx.notifier
                                .push(
                                    "IAAA incorrect password",
                                    &format!("x{consecutive_errors}"),
                                )
                                .await;
                        }
                    }
                    ElectiveError::IaaaForbidden { .. } => {
                        error!("{e}");
                        let trip = ctx.breakers.critical("iaaa_forbidden");
                        if trip.drain_pool {
                            ctx.pools.reset("iaaa_forbidden", false, &ctx.stats).await;
                        }
                        if ctx.breakers.critical_reset_cache() {
                            ctx.adaptive.set_frozen(false);
                        }
                        if ctx.breakers.should_notify_failure(consecutive_errors) {
                            ctx.notifier.push("IAAA forbidden", "entering cooldown").await;
                        }
                    }
                    ElectiveError::CaughtCheating { .. } => {
                        error!("critical: {e}");
                        let trip = ctx.breakers.critical("caught_cheating");
                        if trip.drain_pool {
                            ctx.pools.reset("caught_cheating", false, &ctx.stats).await;
                        }
                        if ctx.breakers.should_notify_failure(consecutive_errors) {
                            ctx.notifier
                                .push("Caught cheating", "entering long cooldown")
                                .await;
                        }
                    }
                    other => warn!("login failed: {other}"),
                }
                // Back of the relogin queue; the backoff below paces the
                // next attempt, and a Killed sentinel still gets through.
                ctx.pools.send_to_relogin(session, &ctx.stats).await;
            }
        }

        if !network_error {
            ctx.breakers.record_network_success();
        }

        let base = ctx.config.client.login_loop_interval.max(0.0);
        let mut sleep = compute_backoff(base, consecutive_errors, &ctx.config.client.iaaa_backoff);
        sleep = ctx.breakers.effective_sleep(sleep, false);
        info!("Login loop sleep {sleep:.1} s");
        tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
    }
}

fn record_network_error(ctx: &Context, reason: &str, e: &ElectiveError) {
    if let Some(kind) = e.network_kind() {
        ctx.stats.inc(&format!("net_error_{}", kind.as_str()));
    }
    ctx.stats.inc("net_error_total");
    ctx.breakers.record_network_error(reason);
}

async fn login_once(ctx: &Context, session: &mut Box<Session>) -> Result<(), ElectiveError> {
    let user_agent = random_user_agent();
    info!("User-Agent: {user_agent}");

    let iaaa = IaaaClient::new(
        user_agent,
        ctx.endpoints.clone(),
        Arc::clone(&ctx.rate),
        Duration::from_secs_f64(ctx.config.client.iaaa_timeout.max(1.0)),
    )?;

    // Home first: collects the cookies the login endpoint insists on.
    iaaa.oauth_home().await?;
    let token = iaaa
        .oauth_login(&ctx.config.user.student_id, &ctx.config.user.password)
        .await?;

    session.rearm(user_agent)?;
    let body = session.sso_login(&token).await?;

    if ctx.config.user.dual_degree {
        let sida = parser::extract_sida(&body).ok_or_else(|| ElectiveError::OperationFailed {
            message: "dual-degree sida not found in SSO landing page".to_string(),
        })?;
        let referer = ctx.endpoints.sso_login();
        session
            .sso_login_dual_degree(&sida, &ctx.config.user.identity, &referer)
            .await?;
    }

    session.arm(ctx.config.client.max_life);
    info!("Login success (client: {})", session.id);

    if ctx.config.client.warmup_after_login && ctx.breakers.schedule_dynamic_enabled() {
        match session.get_help_controller().await {
            Ok(body) => {
                let phases =
                    parser::schedule::parse_help_schedule(&body, super::breakers::now_ts());
                ctx.breakers.store_schedule(phases);
            }
            Err(e) => warn!("schedule warmup failed: {e}"),
        }
    }
    Ok(())
}
