//! The elective loop: one enrollment cycle per round
//!
//! Single writer for the goal/ignored state. Each round borrows a session,
//! refreshes the listing, reconciles goals against it, and — only when at
//! least one goal is actually available — enters the captcha burst path
//! (Draw → Recognize → Validate → Elect). Every failure mode is routed
//! through the breakers; the composed policies decide how long the round
//! sleeps and whether the pool is drained.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::client::{IaaaClient, PoolItem, Session, random_user_agent};
use crate::course::{Course, CourseId, GoalSet, NO_DELAY};
use crate::error::{ElectOutcome, ElectiveError, IgnoreReason};
use crate::parser;

use super::breakers::{OfflineAdvice, compute_backoff, jittered_interval, now_ts};
use super::context::Context;

/// Captcha attempts per course per burst.
pub const RECOGNIZER_MAX_ATTEMPTS: usize = 15;

#[derive(Debug, Default)]
struct RoundFlags {
    /// Reason string when the round counts as a loop error.
    loop_error: Option<String>,
    network_error: bool,
    not_in_operation: bool,
    auth_error: bool,
    /// Session goes to the relogin pool instead of home.
    to_relogin: bool,
    /// Skip the end-of-round sleep (session handoff rounds).
    no_wait: bool,
}

pub struct ElectiveLoop {
    ctx: Arc<Context>,
    goals: GoalSet,
    ignored: HashMap<CourseId, IgnoreReason>,
    consecutive_errors: u32,
}

impl ElectiveLoop {
    pub fn new(ctx: Arc<Context>) -> Result<Self, ElectiveError> {
        let goals = GoalSet::build(
            ctx.config.courses.clone(),
            &ctx.config.mutexes,
            &ctx.config.delays,
        )
        .map_err(|message| ElectiveError::UserInput { message })?;
        if let Some(persistence) = &ctx.persistence {
            persistence.load_into(&ctx.adaptive);
        }
        Ok(Self {
            ctx,
            goals,
            ignored: HashMap::new(),
            consecutive_errors: 0,
        })
    }

    /// Drive rounds until every goal is elected or ignored (or the
    /// configured round budget runs out).
    pub async fn run(mut self) {
        self.ctx.pools.seed(&self.ctx.stats).await;
        self.print_header();

        loop {
            self.ctx.breakers.cooldown_sleep().await;

            if self.goals.pending(&self.ignored).is_empty() {
                info!("No tasks");
                self.terminate("all goals resolved").await;
                return;
            }

            match self.ctx.breakers.offline_advice() {
                OfflineAdvice::Inactive => {}
                OfflineAdvice::Wait(d) => {
                    self.ctx.pause_probe(true);
                    tokio::time::sleep(d).await;
                    continue;
                }
                OfflineAdvice::Probe => {
                    offline_probe_tick(&self.ctx).await;
                    continue;
                }
            }

            let mut session = loop {
                match self.ctx.pools.elective.get().await {
                    PoolItem::Killed => continue,
                    PoolItem::Session(s) => {
                        if self.ctx.pools.is_stale(&s) {
                            self.ctx.stats.inc("client_stale_drop");
                            continue;
                        }
                        break s;
                    }
                }
            };

            let round = self.ctx.round.fetch_add(1, Ordering::Relaxed) + 1;
            info!("======== Loop {round} ========");
            self.ctx.stats.maybe_flush_error_agg();
            self.ctx.pools.publish_gauges(&self.ctx.stats).await;
            self.ctx
                .stats
                .set_gauge("elective_consecutive_errors", f64::from(self.consecutive_errors));
            self.periodic_reports(round);
            self.print_tasks();

            let mut flags = RoundFlags::default();
            if let Err(e) = self.run_round(&mut session, round, &mut flags).await {
                self.handle_round_error(e, &session, &mut flags).await;
            }

            // Round epilogue, in the original's `finally` order.
            self.ctx.adaptive.set_frozen(false);
            if !self.ctx.breakers.offline_active() {
                self.ctx.pause_probe(false);
            }
            if flags.to_relogin {
                self.ctx.pools.send_to_relogin(session, &self.ctx.stats).await;
            } else {
                self.ctx.pools.return_home(session, &self.ctx.stats).await;
            }

            if let Some(reason) = flags.loop_error.clone() {
                self.consecutive_errors += 1;
                let resilience = &self.ctx.config.resilience;
                if resilience.failure_cooldown_seconds > 0.0
                    && resilience.failure_notify_threshold > 0
                    && self.consecutive_errors >= resilience.failure_notify_threshold
                {
                    self.ctx
                        .breakers
                        .enter_cooldown("consecutive_failures", resilience.failure_cooldown_seconds);
                }
                let reset_threshold = self.ctx.config.client.pool_reset_threshold;
                if reset_threshold > 0 && self.consecutive_errors >= reset_threshold {
                    if flags.not_in_operation && self.ctx.breakers.skip_pool_reset_on_nio() {
                        self.ctx.stats.inc("pool_reset_skipped_not_in_operation");
                    } else if self.ctx.pools.reset(&reason, false, &self.ctx.stats).await {
                        self.consecutive_errors = 0;
                    }
                }
            } else {
                self.consecutive_errors = 0;
            }

            if !flags.network_error {
                self.ctx.breakers.record_network_success();
            }
            if !flags.not_in_operation {
                self.ctx.breakers.clear_not_in_operation();
            }
            if !flags.auth_error {
                self.ctx.breakers.record_auth_success();
            }
            if let Some(persistence) = &self.ctx.persistence {
                persistence.maybe_persist(&self.ctx.adaptive, false);
            }

            if let Some(max) = self.ctx.config.runtime.max_rounds {
                if round >= max {
                    info!("Round budget reached ({max})");
                    self.terminate("round budget").await;
                    return;
                }
            }

            if !flags.no_wait {
                let base = jittered_interval(
                    self.ctx.config.client.refresh_interval,
                    self.ctx.config.client.refresh_random_deviation,
                );
                let backed = compute_backoff(
                    base,
                    self.consecutive_errors,
                    &self.ctx.config.client.refresh_backoff,
                );
                let sleep = self
                    .ctx
                    .breakers
                    .effective_sleep(backed, flags.not_in_operation);
                info!("======== END Loop {round} ======== (sleep {sleep:.1} s)");
                tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
            } else {
                info!("======== END Loop {round} ========");
            }
        }
    }

    async fn terminate(&self, reason: &str) {
        info!("Quit elective loop ({reason})");
        self.ctx.stop_probe();
        self.ctx.pools.relogin.put(PoolItem::Killed, &self.ctx.stats).await;
        if let Some(persistence) = &self.ctx.persistence {
            persistence.maybe_persist(&self.ctx.adaptive, true);
        }
    }

    fn periodic_reports(&self, round: u64) {
        let report_interval = self.ctx.config.captcha.adaptive_report_interval;
        if report_interval > 0 && self.ctx.adaptive.enabled() && round % report_interval == 0 {
            self.report_adaptive_state();
        }
        let stat_interval = self.ctx.config.runtime.stat_report_interval;
        if stat_interval > 0 && round % stat_interval == 0 {
            self.ctx.stats.report();
        }
    }

    fn print_header(&self) {
        let cfg = &self.ctx.config;
        info!("> Config");
        info!("refresh_interval: {}", cfg.client.refresh_interval);
        info!(
            "refresh_random_deviation: {}",
            cfg.client.refresh_random_deviation
        );
        info!("supply_cancel_page: {}", cfg.client.supply_cancel_page);
        info!("pool_size: {}", cfg.client.pool_size);
        info!("captcha_chain: {}", self.ctx.chain.names().join(","));
        info!("captcha_adaptive_enable: {}", self.ctx.adaptive.enabled());
        info!("captcha_probe_enabled: {}", cfg.captcha.probe_enabled);

        let rules: Vec<(usize, usize)> = (0..self.goals.len())
            .flat_map(|a| self.goals.mutex[a].iter().map(move |b| (a, *b)))
            .filter(|(a, b)| a < b)
            .collect();
        if !rules.is_empty() {
            if cfg.client.print_mutex_rules {
                for (ix, (a, b)) in rules.iter().enumerate() {
                    info!(
                        "{:02}. {} --x-- {}",
                        ix + 1,
                        self.goals.goals[*a],
                        self.goals.goals[*b]
                    );
                }
            } else {
                info!("{} mutex rules", rules.len());
            }
        }
        for (ix, threshold) in self.goals.delays.iter().enumerate() {
            if *threshold != NO_DELAY {
                info!("delay: {} --- {threshold}", self.goals.goals[ix]);
            }
        }
    }

    fn print_tasks(&self) {
        let pending = self.goals.pending(&self.ignored);
        if !pending.is_empty() {
            info!("> Current tasks");
            for (ix, goal_ix) in pending.iter().enumerate() {
                info!("{:02}. {}", ix + 1, self.goals.goals[*goal_ix]);
            }
        }
        if !self.ignored.is_empty() {
            info!("> Ignored tasks");
            for (ix, (id, reason)) in self.ignored.iter().enumerate() {
                info!("{:02}. {id}  {reason}", ix + 1);
            }
        }
    }

    fn report_adaptive_state(&self) {
        let snap = self.ctx.adaptive.snapshot();
        info!("Adaptive order: {}", snap.providers.join(","));
        if let Some(h) = snap.h {
            info!("Adaptive H: {h:.3}");
        }
        info!("  provider | count | succ | fail | streak | p_hat | t_hat | score");
        for name in &snap.providers {
            let Some(st) = snap.stats.get(name) else { continue };
            let fmt = |v: Option<f64>| v.map_or("--".to_string(), |x| format!("{x:.3}"));
            info!(
                "  {name:<10} | {:>5} | {:>4} | {:>4} | {:>6} | {:.3} | {} | {}",
                st.count,
                st.success,
                st.failure,
                st.fail_streak,
                st.p_hat,
                fmt(st.latency),
                fmt(st.score),
            );
        }
    }

    fn ignore(&mut self, goal_ix: usize, reason: IgnoreReason) {
        let id = self.goals.goals[goal_ix].id();
        self.ignored.entry(id).or_insert(reason);
    }

    fn maybe_adaptive_reorder(&self, reason: &str) {
        if !self.ctx.adaptive.enabled() {
            return;
        }
        let names = self.ctx.chain.names();
        let decision = self
            .ctx
            .adaptive
            .maybe_reorder(&names, Some(self.ctx.current_round()));
        if decision.changed
            && self
                .ctx
                .chain
                .apply_order(&decision.order, decision.switch_primary, reason)
        {
            self.ctx.adaptive.update_order(&self.ctx.chain.names());
        }
    }

    async fn safe_parse(
        &mut self,
        body: &str,
        context: &str,
    ) -> Option<(Vec<Course>, Vec<Course>)> {
        match parser::parse_listing(body) {
            Ok(parsed) => {
                self.ctx.breakers.record_html_parse_success();
                Some(parsed)
            }
            Err(e) => {
                warn!("HTML parse failed ({context}): {e}");
                self.ctx.stats.inc("html_parse_error");
                self.ctx.stats.record_error(&e.agg_key());
                self.dump_response(body, context);
                let trip = self.ctx.breakers.record_html_parse_error(false);
                if trip.drain_pool {
                    self.ctx.pools.reset("html_parse", false, &self.ctx.stats).await;
                }
                None
            }
        }
    }

    fn dump_response(&self, body: &str, context: &str) {
        let dir = self.ctx.config.user_web_log_dir();
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        let name = format!(
            "elective.parse_fail_{}_{}.html",
            context.replace('/', "_"),
            chrono::Utc::now().timestamp_millis()
        );
        let path = dir.join(name);
        if std::fs::write(&path, body).is_ok() {
            warn!("HTML parse failed ({context}), dump {}", path.display());
        }
    }

    async fn fetch_listing(
        &mut self,
        session: &Session,
        flags: &mut RoundFlags,
    ) -> Result<Option<(Vec<Course>, Vec<Course>)>, ElectiveError> {
        let student_id = self.ctx.config.user.student_id.clone();
        let page = self.ctx.config.client.supply_cancel_page;
        self.ctx.stats.inc("supply_cancel");

        if page <= 1 {
            info!("Get SupplyCancel page 1");
            let body = session.get_supply_cancel(&student_id).await?;
            match self.safe_parse(&body, "SupplyCancel_1").await {
                Some(parsed) => Ok(Some(parsed)),
                None => {
                    flags.loop_error = Some("html_parse".to_string());
                    Ok(None)
                }
            }
        } else {
            // The first request for a non-first page can render empty; the
            // site needs a SupplyCancel touch before it serves it properly.
            for attempt in 1..=3 {
                info!("Get Supplement page {page} (attempt {attempt})");
                let body = session.get_supplement(&student_id, page).await?;
                if let Some(parsed) = self.safe_parse(&body, &format!("Supplement_{page}")).await {
                    return Ok(Some(parsed));
                }
                warn!("HTML parse failed, try SupplyCancel first");
                let _ = session.get_supply_cancel(&student_id).await;
            }
            Err(ElectiveError::OperationFailed {
                message: format!("unable to get a normal Supplement page {page}"),
            })
        }
    }

    async fn run_round(
        &mut self,
        session: &mut Box<Session>,
        round: u64,
        flags: &mut RoundFlags,
    ) -> Result<(), ElectiveError> {
        let ctx = Arc::clone(&self.ctx);

        if !session.is_logged_in() {
            info!("client {} needs login", session.id);
            flags.to_relogin = true;
            flags.no_wait = true;
            return Ok(());
        }
        if session.is_expired() {
            info!("client {} expired, logout", session.id);
            if let Err(e) = session.logout().await {
                debug!("logout failed: {e}");
            }
            flags.to_relogin = true;
            flags.no_wait = true;
            return Ok(());
        }

        let Some((elected, plans)) = self.fetch_listing(session, flags).await? else {
            return Ok(());
        };
        let plan_map: HashMap<CourseId, Course> =
            plans.into_iter().map(|c| (c.id(), c)).collect();
        let elected_ids: HashSet<CourseId> = elected.iter().map(Course::id).collect();

        // Reconcile goals against the fresh listing.
        let mut tasks: VecDeque<(usize, Course)> = VecDeque::new();
        for ix in 0..self.goals.len() {
            let goal_id = self.goals.goals[ix].id();
            if self.ignored.contains_key(&goal_id) {
                continue;
            }
            if elected_ids.contains(&goal_id) {
                info!("{} is elected, ignored", self.goals.goals[ix]);
                self.ignore(ix, IgnoreReason::Elected);
                for mix in self.goals.mutex[ix].clone() {
                    let mc_id = self.goals.goals[mix].id();
                    if !self.ignored.contains_key(&mc_id) {
                        info!(
                            "{} is simultaneously ignored by mutex rules",
                            self.goals.goals[mix]
                        );
                        self.ignore(mix, IgnoreReason::MutexRules);
                    }
                }
                continue;
            }
            let Some(course) = plan_map.get(&goal_id) else {
                return Err(ElectiveError::UserInput {
                    message: format!(
                        "{} is not in your course plan, please check your config",
                        self.goals.goals[ix]
                    ),
                });
            };
            if !course.is_available() {
                continue;
            }
            let delay = self.goals.delays[ix];
            if delay != NO_DELAY && i64::from(course.remaining_quota()) > i64::from(delay) {
                info!("{course} hasn't reached the delay threshold {delay}, skip");
                continue;
            }
            info!("{course} is AVAILABLE now !");
            tasks.push_back((ix, course.clone()));
        }
        let mut tasks: VecDeque<(usize, Course)> = tasks
            .into_iter()
            .filter(|(_, c)| !self.ignored.contains_key(&c.id()))
            .collect();

        ctx.adaptive.set_frozen(false);
        if !ctx.breakers.offline_active() {
            ctx.pause_probe(false);
        }

        if tasks.is_empty() {
            info!("No course available");
            self.maybe_adaptive_reorder("idle");
            return Ok(());
        }

        let monitor_only = ctx.config.captcha.degrade_monitor_only;
        if ctx.breakers.captcha_degraded() && monitor_only {
            warn!("Captcha degraded, monitor-only this round");
            self.notify_degraded_available(tasks.iter().map(|(_, c)| c)).await;
            self.maybe_adaptive_reorder("degraded");
            return Ok(());
        }

        self.maybe_adaptive_reorder("active");
        ctx.adaptive.set_frozen(true);
        ctx.pause_probe(true);

        // Elected courses observed inside this burst; a success refreshes
        // it so lower-priority mutex partners are skipped in advance.
        let mut dynamic_elected: Vec<Course> = Vec::new();

        while let Some((ix, course)) = tasks.pop_front() {
            let mutex_hit = self.goals.mutex[ix]
                .iter()
                .find(|mix| dynamic_elected.contains(&self.goals.goals[**mix]))
                .copied();
            if let Some(mix) = mutex_hit {
                info!("{course} --x-- {}", self.goals.goals[mix]);
                info!("{course} is ignored by mutex rules in advance");
                self.ignore(ix, IgnoreReason::MutexRules);
                continue;
            }

            if ctx.breakers.captcha_degraded() && monitor_only {
                let left = ctx.breakers.degrade_remaining().map_or(0, |d| d.as_secs());
                warn!("Captcha degraded, skip electing for {left} s (course: {course})");
                self.notify_degraded_available(std::iter::once(&course)).await;
                break;
            }

            info!("Try to elect {course}");
            let validated = self.validate_captcha(session, round).await?;
            if !validated {
                warn!(
                    "Validation failed after {RECOGNIZER_MAX_ATTEMPTS} attempts, skip {course} for now"
                );
                continue;
            }

            let Some(href) = course.href.clone() else {
                continue;
            };
            ctx.stats.inc("elect_attempt");
            match session
                .elect_supplement(&ctx.config.user.student_id, &href)
                .await?
            {
                ElectOutcome::Success { body } => {
                    info!("{course} is ELECTED !");
                    ctx.notifier.push("Elected", &course.to_string()).await;
                    // The ignored entry waits for the next listing; only the
                    // dynamic elected set is refreshed here.
                    match parser::parse_elected(&body) {
                        Ok(refreshed) => dynamic_elected = refreshed,
                        Err(e) => {
                            debug!("elected refresh parse failed: {e}");
                            ctx.stats.inc("html_parse_error");
                        }
                    }
                }
                ElectOutcome::Skip(reason) => {
                    warn!("{course} skipped: {reason}");
                    ctx.notifier
                        .push(&reason.to_string(), &course.to_string())
                        .await;
                    self.ignore(ix, reason);
                    ctx.stats.record_error(&format!("Elect/{reason}"));
                }
                ElectOutcome::QuotaLimited => {
                    ctx.stats.inc("elect_quota_limited");
                    if course.used_quota() == 0 {
                        warn!("QuotaLimited but used_quota==0 (possible elective race): {course}");
                    } else {
                        info!("QuotaLimited (competition): {course}");
                    }
                }
                ElectOutcome::Failed { body } => {
                    warn!("election failed for {course}, cause unknown; retry later");
                    ctx.stats.record_error("ElectionFailed");
                    if ctx.config.runtime.debug_dump_request {
                        self.dump_response(&body, "electSupplement");
                    }
                }
            }
        }
        Ok(())
    }

    /// Draw → Recognize → Validate, up to the attempt budget. Returns
    /// whether a code validated. Transport/auth failures bubble up.
    async fn validate_captcha(
        &self,
        session: &Session,
        round: u64,
    ) -> Result<bool, ElectiveError> {
        let ctx = &self.ctx;
        let student_id = &ctx.config.user.student_id;

        for _ in 0..RECOGNIZER_MAX_ATTEMPTS {
            let (provider, recognizer) = ctx.chain.current();

            let t_draw = Instant::now();
            let raw = session.get_draw_servlet(student_id).await?;
            let draw_dt = t_draw.elapsed().as_secs_f64();
            ctx.samples
                .maybe_save(&raw, Some(provider.as_str()), "main", round, Some(draw_dt));

            ctx.stats.inc("captcha_attempt");
            let t_recog = Instant::now();
            let captcha = match recognizer.recognize(&raw).await {
                Ok(c) => {
                    ctx.stats.inc("captcha_recognize_ok");
                    c
                }
                Err(e) => {
                    warn!("Captcha recognize failed ({provider}): {e}");
                    ctx.stats.inc("captcha_recognize_error");
                    ctx.stats.record_error("Recognizer");
                    ctx.adaptive.record_attempt(
                        &provider,
                        false,
                        Some(t_recog.elapsed().as_secs_f64()),
                        None,
                    );
                    self.record_captcha_failure().await;
                    if ctx.breakers.captcha_degraded() {
                        break;
                    }
                    continue;
                }
            };
            let recog_dt = t_recog.elapsed().as_secs_f64();
            info!("Recognition result: {}", captcha.code);

            let t_val = Instant::now();
            let valid = match session.get_validate(student_id, &captcha.code).await {
                Ok(v) => v,
                Err(e @ ElectiveError::JsonDecode { .. }) => {
                    warn!("Captcha validate parse failed: {e}");
                    ctx.stats.inc("captcha_validate_parse_error");
                    self.record_captcha_failure().await;
                    if ctx.breakers.captcha_degraded() {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let val_dt = t_val.elapsed().as_secs_f64();

            match valid.as_str() {
                "2" => {
                    info!("Validation passed");
                    ctx.stats.inc("captcha_validate_pass");
                    ctx.adaptive.record_attempt(
                        &provider,
                        true,
                        Some(recog_dt),
                        Some(draw_dt + val_dt),
                    );
                    ctx.breakers.record_captcha_success();
                    return Ok(true);
                }
                "0" => {
                    info!("Validation failed, try again");
                    ctx.stats.inc("captcha_validate_fail");
                    ctx.adaptive.record_attempt(
                        &provider,
                        false,
                        Some(recog_dt),
                        Some(draw_dt + val_dt),
                    );
                    self.record_captcha_failure().await;
                    if ctx.breakers.captcha_degraded() {
                        break;
                    }
                }
                other => {
                    warn!("Unknown validation result: {other:?}");
                    ctx.stats.inc("captcha_validate_unknown");
                }
            }
        }
        Ok(false)
    }

    /// Count a captcha failure; when the degrade window opens, apply the
    /// configured side effects (rotation, notification).
    async fn record_captcha_failure(&self) {
        let ctx = &self.ctx;
        if !ctx.breakers.record_captcha_failure() {
            return;
        }
        ctx.stats.inc("captcha_degrade_trigger");
        if ctx.config.captcha.switch_on_degrade {
            ctx.chain.rotate("degraded");
        }
        if ctx.config.captcha.degrade_notify && ctx.breakers.should_notify_degrade() {
            ctx.stats.inc("captcha_degrade_notify");
            ctx.notifier
                .push("Captcha degraded", "recognition temporarily untrusted")
                .await;
        }
    }

    async fn notify_degraded_available<'a>(
        &self,
        courses: impl Iterator<Item = &'a Course>,
    ) -> bool {
        if !self.ctx.config.captcha.degrade_notify {
            return false;
        }
        let names: Vec<String> = courses
            .take(5)
            .map(|c| format!("{}[{}]", c.name, c.class_no))
            .collect();
        if names.is_empty() || !self.ctx.breakers.should_notify_degrade() {
            return false;
        }
        self.ctx.stats.inc("captcha_degrade_available_notify");
        self.ctx
            .notifier
            .push("Available (degraded)", &names.join(", "))
            .await;
        true
    }

    async fn handle_round_error(
        &mut self,
        e: ElectiveError,
        session: &Session,
        flags: &mut RoundFlags,
    ) {
        self.ctx.stats.record_error(&e.agg_key());
        match &e {
            ElectiveError::Auth { .. } => {
                warn!("auth error, client {} needs relogin: {e}", session.id);
                flags.auth_error = true;
                flags.to_relogin = true;
                flags.no_wait = true;
                let trip = self.ctx.breakers.record_auth_error();
                if trip.drain_pool {
                    self.ctx.pools.reset("auth_error", false, &self.ctx.stats).await;
                }
            }
            ElectiveError::NotInOperationTime { .. } => {
                flags.not_in_operation = true;
                self.update_not_in_operation(session).await;
            }
            ElectiveError::CaughtCheating { .. } => {
                error!("critical: {e}");
                flags.loop_error = Some("caught_cheating".to_string());
                let trip = self.ctx.breakers.critical("caught_cheating");
                if trip.drain_pool {
                    self.ctx.pools.reset("caught_cheating", false, &self.ctx.stats).await;
                }
                if self.ctx.breakers.critical_reset_cache() {
                    self.ctx.adaptive.set_frozen(false);
                }
                if self
                    .ctx
                    .breakers
                    .should_notify_failure(self.consecutive_errors + 1)
                {
                    self.ctx
                        .notifier
                        .push("Caught cheating", "entering long cooldown")
                        .await;
                }
            }
            ElectiveError::Network { .. } => {
                warn!("network error: {e}");
                flags.loop_error = Some(e.agg_key());
                flags.network_error = true;
                if let Some(kind) = e.network_kind() {
                    self.ctx.stats.inc(&format!("net_error_{}", kind.as_str()));
                }
                self.ctx.stats.inc("net_error_total");
                self.ctx.breakers.record_network_error("elective_network");
            }
            ElectiveError::UnexpectedHtmlFormat { .. } => {
                warn!("{e}");
                flags.loop_error = Some("unexpected_html".to_string());
                let trip = self.ctx.breakers.record_html_parse_error(true);
                if trip.drain_pool {
                    self.ctx.pools.reset("html_parse", false, &self.ctx.stats).await;
                }
            }
            ElectiveError::JsonDecode { .. } => {
                warn!("{e}");
                flags.loop_error = Some("json_decode".to_string());
                let trip = self.ctx.breakers.record_html_parse_error(true);
                if trip.drain_pool {
                    self.ctx.pools.reset("json_decode", false, &self.ctx.stats).await;
                }
            }
            ElectiveError::UserInput { .. } => {
                error!("{e}");
                flags.loop_error = Some("user_input".to_string());
            }
            other => {
                warn!("{other}");
                flags.loop_error = Some(other.agg_key());
            }
        }
    }

    /// Refresh the schedule cache if needed, then raise the dynamic
    /// minimum refresh for the operation-window backoff.
    async fn update_not_in_operation(&self, session: &Session) {
        let breakers = &self.ctx.breakers;
        let (_, old_min, old_reason) = breakers.not_in_operation_state();
        let mut schedule = breakers.cached_schedule();
        if schedule.is_none() && breakers.schedule_dynamic_enabled() {
            match session.get_help_controller().await {
                Ok(body) => {
                    let phases = parser::schedule::parse_help_schedule(&body, now_ts());
                    breakers.store_schedule(phases);
                }
                Err(e) => debug!("schedule refresh failed: {e}"),
            }
            schedule = breakers.any_schedule();
        }
        let (min_refresh, reason) = breakers.update_not_in_operation(schedule.as_deref(), now_ts());
        if reason != old_reason || (min_refresh - old_min).abs() > f64::EPSILON {
            warn!(
                "Not in operation time: min_refresh={}s ({reason})",
                min_refresh as i64
            );
        }
    }
}

/// Health probe + recovery shared by the elective and login loops. The
/// breaker already claimed the probe slot via `OfflineAdvice::Probe`.
pub(crate) async fn offline_probe_tick(ctx: &Arc<Context>) {
    ctx.pause_probe(true);
    let ok = offline_health_probe(ctx).await;
    if ctx.breakers.offline_probe_result(ok) {
        ctx.pools.reset("offline_recover", true, &ctx.stats).await;
        ctx.pause_probe(false);
    }
}

async fn offline_health_probe(ctx: &Arc<Context>) -> bool {
    let timeout = Duration::from_secs_f64(ctx.config.resilience.offline_probe_timeout.max(1.0));
    match IaaaClient::new(
        random_user_agent(),
        ctx.endpoints.clone(),
        Arc::clone(&ctx.rate),
        timeout,
    ) {
        Ok(client) => client.oauth_home().await.is_ok(),
        Err(_) => false,
    }
}
