//! Bounded session pools and the generation-stamped pool manager
//!
//! Three FIFO queues move sessions between the loops: `elective` (the
//! round borrows from here), `probe` (optional, for the captcha probe) and
//! `relogin` (drained/expired sessions waiting for the login loop). A
//! `Killed` sentinel through the relogin pool tells the login loop to
//! exit.
//!
//! A pool reset bumps the generation; any in-flight session of an older
//! generation is dropped at its next enqueue or dequeue instead of being
//! trusted again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::{Mutex, Notify};

use crate::config::Config;
use crate::net::Endpoints;
use crate::rate_limit::RateLimiter;

use super::session::{PoolKind, Session};
use super::useragent::random_user_agent;
use crate::engine::stats::RuntimeStats;

/// Queue element: a real session or the kill sentinel.
#[derive(Debug)]
pub enum PoolItem {
    Session(Box<Session>),
    Killed,
}

/// One bounded FIFO queue with async blocking dequeue.
pub struct SessionPool {
    name: &'static str,
    capacity: usize,
    queue: Mutex<VecDeque<PoolItem>>,
    notify: Notify,
}

impl SessionPool {
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Dequeue, waiting until an item arrives.
    pub async fn get(&self) -> PoolItem {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut q = self.queue.lock().await;
                if let Some(item) = q.pop_front() {
                    return item;
                }
            }
            notified.await;
        }
    }

    /// Dequeue without waiting.
    pub async fn try_get(&self) -> Option<PoolItem> {
        self.queue.lock().await.pop_front()
    }

    /// Enqueue without waiting; hands the item back when full.
    pub async fn try_put(&self, item: PoolItem) -> Result<(), PoolItem> {
        let mut q = self.queue.lock().await;
        if q.len() >= self.capacity {
            return Err(item);
        }
        q.push_back(item);
        drop(q);
        self.notify.notify_one();
        Ok(())
    }

    /// Enqueue with a short grace period, then drop with a warning. The
    /// sentinel always squeezes in regardless of capacity.
    pub async fn put(&self, item: PoolItem, stats: &RuntimeStats) {
        if matches!(item, PoolItem::Killed) {
            let mut q = self.queue.lock().await;
            q.push_back(item);
            drop(q);
            self.notify.notify_one();
            return;
        }
        let mut item = item;
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            match self.try_put(item).await {
                Ok(()) => return,
                Err(back) => item = back,
            }
            if Instant::now() >= deadline {
                let id = match &item {
                    PoolItem::Session(s) => s.id.to_string(),
                    PoolItem::Killed => "killed".to_string(),
                };
                stats.inc("queue_full_drop");
                warn!("Queue {} is full, drop client {id}", self.name);
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Remove every queued session. `Killed` sentinels survive a drain so
    /// a pool reset can never cancel a shutdown in flight.
    pub async fn drain(&self) -> usize {
        let mut q = self.queue.lock().await;
        let before = q.len();
        q.retain(|item| matches!(item, PoolItem::Killed));
        let kept = q.len();
        drop(q);
        if kept > 0 {
            self.notify.notify_one();
        }
        before - kept
    }
}

/// Owns the three pools, the generation counter and the reset policy.
pub struct PoolManager {
    pub elective: Arc<SessionPool>,
    /// None when no probe pool is configured; in shared mode the probe
    /// borrows from `elective` instead.
    pub probe: Option<Arc<SessionPool>>,
    pub relogin: Arc<SessionPool>,
    probe_shared: bool,
    generation: AtomicU64,
    reset_gate: Mutex<()>,
    last_reset: parking_lot::Mutex<Option<Instant>>,
    reset_cooldown: Duration,
    pool_size: usize,
    probe_pool_size: usize,
    session_timeout: Duration,
    endpoints: Endpoints,
    rate: Arc<RateLimiter>,
}

impl PoolManager {
    #[must_use]
    pub fn new(cfg: &Config, rate: Arc<RateLimiter>) -> Self {
        let pool_size = cfg.client.pool_size.max(1);
        let probe_shared = cfg.captcha.probe_share_pool;
        let probe_pool_size = if probe_shared { 0 } else { cfg.captcha.probe_pool_size };
        let probe = (probe_pool_size > 0)
            .then(|| Arc::new(SessionPool::new("probePool", probe_pool_size)));
        Self {
            elective: Arc::new(SessionPool::new("electivePool", pool_size)),
            probe,
            relogin: Arc::new(SessionPool::new(
                "reloginPool",
                pool_size + probe_pool_size + 1,
            )),
            probe_shared,
            generation: AtomicU64::new(0),
            reset_gate: Mutex::new(()),
            last_reset: parking_lot::Mutex::new(None),
            reset_cooldown: Duration::from_secs_f64(cfg.client.pool_reset_cooldown.max(0.0)),
            pool_size,
            probe_pool_size,
            session_timeout: Duration::from_secs_f64(cfg.client.elective_timeout.max(1.0)),
            endpoints: Endpoints::new(&cfg.net),
            rate,
        }
    }

    /// The pool the probe loop draws from: its own, or the elective pool
    /// in shared mode.
    #[must_use]
    pub fn probe_source(&self) -> Option<&Arc<SessionPool>> {
        if self.probe_shared {
            Some(&self.elective)
        } else {
            self.probe.as_ref()
        }
    }

    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_stale(&self, session: &Session) -> bool {
        session.generation != self.current_generation()
    }

    fn make_session(&self, id: usize, kind: PoolKind) -> Option<Session> {
        Session::new(
            id,
            self.current_generation(),
            kind,
            random_user_agent(),
            self.endpoints.clone(),
            Arc::clone(&self.rate),
            self.session_timeout,
        )
        .ok()
    }

    /// Seed the elective (and probe) pools with fresh un-authenticated
    /// sessions. They flow into the relogin pool on first borrow.
    pub async fn seed(&self, stats: &RuntimeStats) {
        for ix in 1..=self.pool_size {
            if let Some(s) = self.make_session(ix, PoolKind::Elective) {
                self.elective.put(PoolItem::Session(Box::new(s)), stats).await;
            }
        }
        if let Some(probe) = &self.probe {
            for ix in 1..=self.probe_pool_size {
                if let Some(s) = self.make_session(ix, PoolKind::Probe) {
                    probe.put(PoolItem::Session(Box::new(s)), stats).await;
                }
            }
        }
        self.publish_gauges(stats).await;
    }

    /// Return a session to its home pool. Stale generations are dropped
    /// and counted instead of re-queued.
    pub async fn return_home(&self, session: Box<Session>, stats: &RuntimeStats) {
        if self.is_stale(&session) {
            stats.inc("client_stale_drop");
            return;
        }
        let pool = match session.kind {
            PoolKind::Probe if !self.probe_shared => {
                self.probe.as_ref().unwrap_or(&self.elective)
            }
            _ => &self.elective,
        };
        pool.put(PoolItem::Session(session), stats).await;
    }

    /// Send a session to the relogin pool (stale ones are dropped).
    pub async fn send_to_relogin(&self, session: Box<Session>, stats: &RuntimeStats) {
        if self.is_stale(&session) {
            stats.inc("client_stale_drop");
            return;
        }
        self.relogin.put(PoolItem::Session(session), stats).await;
    }

    /// Reset all pools: drain, bump generation, re-seed. Skipped (and
    /// counted) when another reset is running or the cooldown has not
    /// elapsed; `force` overrides the cooldown but never the lock.
    pub async fn reset(&self, reason: &str, force: bool, stats: &RuntimeStats) -> bool {
        let Ok(_gate) = self.reset_gate.try_lock() else {
            stats.inc("pool_reset_skipped_lock");
            return false;
        };
        if !force && !self.reset_cooldown.is_zero() {
            let last = *self.last_reset.lock();
            if last.is_some_and(|t| t.elapsed() < self.reset_cooldown) {
                stats.inc("pool_reset_skipped_cooldown");
                return false;
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.last_reset.lock() = Some(Instant::now());
        stats.inc("pool_reset_count");
        stats.set_gauge("pool_reset_generation", self.current_generation() as f64);
        warn!("Reset elective client pool ({reason})");

        self.elective.drain().await;
        if let Some(probe) = &self.probe {
            probe.drain().await;
        }
        self.relogin.drain().await;
        self.seed(stats).await;
        true
    }

    /// Refresh the queue-size gauges.
    pub async fn publish_gauges(&self, stats: &RuntimeStats) {
        stats.set_gauge("elective_pool_qsize", self.elective.len().await as f64);
        stats.set_gauge("relogin_pool_qsize", self.relogin.len().await as f64);
        if let Some(probe) = &self.probe {
            stats.set_gauge("probe_pool_qsize", probe.len().await as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stats() -> RuntimeStats {
        RuntimeStats::new(Duration::from_secs(60), Duration::from_secs(30))
    }

    fn manager(pool_size: usize) -> PoolManager {
        let mut cfg = Config::default();
        cfg.client.pool_size = pool_size;
        cfg.client.pool_reset_cooldown = 0.0;
        PoolManager::new(&cfg, Arc::new(RateLimiter::disabled()))
    }

    #[tokio::test]
    async fn test_pool_fifo_and_capacity() {
        let stats = stats();
        let pool = SessionPool::new("test", 1);
        let mgr = manager(1);
        let a = mgr.make_session(1, PoolKind::Elective).unwrap();
        let b = mgr.make_session(2, PoolKind::Elective).unwrap();
        pool.put(PoolItem::Session(Box::new(a)), &stats).await;
        // Second put overflows capacity 1 and is dropped after the grace.
        pool.put(PoolItem::Session(Box::new(b)), &stats).await;
        assert_eq!(stats.counter("queue_full_drop"), 1);
        match pool.get().await {
            PoolItem::Session(s) => assert_eq!(s.id, 1),
            PoolItem::Killed => panic!("unexpected sentinel"),
        }
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn test_killed_sentinel_bypasses_capacity() {
        let stats = stats();
        let pool = SessionPool::new("test", 1);
        let mgr = manager(1);
        let a = mgr.make_session(1, PoolKind::Elective).unwrap();
        pool.put(PoolItem::Session(Box::new(a)), &stats).await;
        pool.put(PoolItem::Killed, &stats).await;
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let stats = stats();
        let pool = Arc::new(SessionPool::new("test", 2));
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        pool.put(PoolItem::Killed, &stats).await;
        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("join");
        assert!(matches!(item, PoolItem::Killed));
    }

    #[tokio::test]
    async fn test_reset_bumps_generation_and_reseeds() {
        let stats = stats();
        let mgr = manager(2);
        mgr.seed(&stats).await;
        assert_eq!(mgr.elective.len().await, 2);
        let old_generation = mgr.current_generation();

        assert!(mgr.reset("test", false, &stats).await);
        assert_eq!(mgr.current_generation(), old_generation + 1);
        assert_eq!(mgr.elective.len().await, 2);
        assert_eq!(stats.counter("pool_reset_count"), 1);
    }

    #[tokio::test]
    async fn test_reset_cooldown_skips() {
        let stats = stats();
        let mut cfg = Config::default();
        cfg.client.pool_size = 1;
        cfg.client.pool_reset_cooldown = 3600.0;
        let mgr = PoolManager::new(&cfg, Arc::new(RateLimiter::disabled()));
        assert!(mgr.reset("first", false, &stats).await);
        assert!(!mgr.reset("second", false, &stats).await);
        assert_eq!(stats.counter("pool_reset_skipped_cooldown"), 1);
        // Force overrides the cooldown.
        assert!(mgr.reset("forced", true, &stats).await);
    }

    #[tokio::test]
    async fn test_stale_session_dropped_on_return() {
        let stats = stats();
        let mgr = manager(1);
        mgr.seed(&stats).await;
        let PoolItem::Session(session) = mgr.elective.get().await else {
            panic!("expected a session");
        };
        assert!(mgr.reset("invalidate", false, &stats).await);
        mgr.return_home(session, &stats).await;
        assert_eq!(stats.counter("client_stale_drop"), 1);
        // The reseeded pool still holds exactly the new generation.
        assert_eq!(mgr.elective.len().await, 1);
    }

    #[tokio::test]
    async fn test_probe_source_shared_vs_dedicated() {
        let mut cfg = Config::default();
        cfg.captcha.probe_share_pool = true;
        cfg.captcha.probe_pool_size = 2;
        let shared = PoolManager::new(&cfg, Arc::new(RateLimiter::disabled()));
        assert!(shared.probe.is_none());
        assert!(Arc::ptr_eq(shared.probe_source().unwrap(), &shared.elective));

        cfg.captcha.probe_share_pool = false;
        let dedicated = PoolManager::new(&cfg, Arc::new(RateLimiter::disabled()));
        assert!(dedicated.probe.is_some());
        assert!(!Arc::ptr_eq(
            dedicated.probe_source().unwrap(),
            &dedicated.elective
        ));
    }
}
