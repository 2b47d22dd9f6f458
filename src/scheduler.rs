//! Hierarchical admission control: a global limiter chained under
//! per-principal limiters.
//!
//! Each limiter meters two resources over a bounded FIFO queue of waiters:
//! a reservoir of requests per refill window (hard-reset every interval, not
//! a leaky bucket) and a concurrent in-flight count. A submission that finds
//! the queue at its high-water mark is rejected synchronously
//! (drop-newest). Admission debits the reservoir; enqueueing does not.
//!
//! Chaining: a request is admitted by its principal's limiter first, then by
//! the global limiter; both slots are held for the duration of the work and
//! released in reverse order through the RAII [`AdmissionPermit`], so a
//! panic inside the work still releases. Per-principal limiters are created
//! on first use and garbage-collected after an idle TTL.

use crate::config::{LimiterSettings, RateLimitSettings};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Default idle TTL before a per-principal limiter is destroyed.
const IDLE_TTL: Duration = Duration::from_secs(3600);

/// How often the idle-limiter GC pass runs.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// How often drain polls for quiescence.
const DRAIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The bounded waiter queue was full; the submission was rejected
    /// without being enqueued.
    #[error("rate limit queue overflow")]
    QueueOverflow,
    /// Drain has begun; no new submissions are accepted.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    pub refresh_amount: u32,
    pub refresh_interval: Duration,
    pub max_concurrent: usize,
    /// Queue high-water mark; a submission finding the queue at this length
    /// overflows.
    pub queue_size: usize,
}

impl LimiterConfig {
    pub fn from_settings(settings: &LimiterSettings) -> Self {
        Self {
            refresh_amount: settings.requests_per_minute,
            refresh_interval: Duration::from_secs(60),
            max_concurrent: settings.concurrent_limit,
            queue_size: settings.queue_size,
        }
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<LimiterPermit>,
}

struct LimiterState {
    reservoir: u32,
    running: usize,
    queue: VecDeque<Waiter>,
    last_activity: Instant,
}

pub struct Limiter {
    level: &'static str,
    config: LimiterConfig,
    state: Mutex<LimiterState>,
    next_waiter_id: AtomicU64,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Limiter")
            .field("level", &self.level)
            .field("running", &snapshot.running)
            .field("queued", &snapshot.queued)
            .field("reservoir", &snapshot.reservoir)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimiterSnapshot {
    pub running: usize,
    pub queued: usize,
    pub reservoir: u32,
}

impl Limiter {
    fn new(level: &'static str, config: LimiterConfig) -> Arc<Self> {
        let limiter = Arc::new(Self {
            level,
            config,
            state: Mutex::new(LimiterState {
                reservoir: config.refresh_amount,
                running: 0,
                queue: VecDeque::new(),
                last_activity: Instant::now(),
            }),
            next_waiter_id: AtomicU64::new(0),
        });
        Self::spawn_refill(&limiter);
        limiter
    }

    /// One ticker per limiter performs the hard reservoir reset. The task
    /// holds a weak reference so dropping the limiter stops the ticker.
    fn spawn_refill(limiter: &Arc<Self>) {
        let weak = Arc::downgrade(limiter);
        let interval = limiter.config.refresh_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; the
            // reservoir starts full, so consume it.
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.refill();
            }
        });
    }

    fn refill(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        state.reservoir = self.config.refresh_amount;
        self.admit_waiters(&mut state);
    }

    /// Admit queued waiters while capacity and reservoir allow, FIFO. Called
    /// with the state lock held.
    fn admit_waiters(self: &Arc<Self>, state: &mut LimiterState) {
        while state.running < self.config.max_concurrent && state.reservoir > 0 {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.reservoir -= 1;
            state.running += 1;
            let permit = LimiterPermit {
                limiter: Arc::clone(self),
                active: true,
            };
            if let Err(mut unclaimed) = waiter.tx.send(permit) {
                // The waiter was cancelled between dequeue and delivery:
                // undo the admission without routing through release().
                unclaimed.active = false;
                state.reservoir += 1;
                state.running -= 1;
            }
        }
    }

    /// Acquire one admission slot: immediately when there is capacity and
    /// the queue is empty, otherwise by joining the bounded FIFO queue.
    /// Dropping the returned future while queued removes the waiter without
    /// debiting the reservoir.
    pub async fn acquire(self: &Arc<Self>) -> Result<LimiterPermit, ScheduleError> {
        let (id, rx) = {
            let mut state = self.state.lock().expect("limiter lock poisoned");
            state.last_activity = Instant::now();

            if state.queue.is_empty()
                && state.running < self.config.max_concurrent
                && state.reservoir > 0
            {
                state.reservoir -= 1;
                state.running += 1;
                return Ok(LimiterPermit {
                    limiter: Arc::clone(self),
                    active: true,
                });
            }

            if state.queue.len() >= self.config.queue_size {
                crate::metrics::record_queue_overflow(self.level);
                return Err(ScheduleError::QueueOverflow);
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            state.queue.push_back(Waiter { id, tx });
            (id, rx)
        };

        let mut queue_slot = QueueSlot {
            limiter: self,
            id,
            waiting: true,
        };
        match rx.await {
            Ok(permit) => {
                queue_slot.waiting = false;
                Ok(permit)
            }
            Err(_) => {
                // The sender only disappears if the limiter is torn down
                // while we wait, which drain prevents for queued work.
                queue_slot.waiting = false;
                Err(ScheduleError::ShuttingDown)
            }
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        state.running = state.running.saturating_sub(1);
        state.last_activity = Instant::now();
        self.admit_waiters(&mut state);
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.state.lock().expect("limiter lock poisoned");
        LimiterSnapshot {
            running: state.running,
            queued: state.queue.len(),
            reservoir: state.reservoir,
        }
    }

    fn is_idle_since(&self, ttl: Duration) -> bool {
        let state = self.state.lock().expect("limiter lock poisoned");
        state.running == 0 && state.queue.is_empty() && state.last_activity.elapsed() >= ttl
    }
}

/// Removes a cancelled waiter from the queue on drop.
struct QueueSlot<'a> {
    limiter: &'a Arc<Limiter>,
    id: u64,
    waiting: bool,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if !self.waiting {
            return;
        }
        let mut state = self.limiter.state.lock().expect("limiter lock poisoned");
        state.queue.retain(|w| w.id != self.id);
    }
}

/// One admission slot at one limiter. Dropping it releases the slot and
/// wakes queued waiters.
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: Arc<Limiter>,
    active: bool,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        if self.active {
            self.limiter.release();
        }
    }
}

/// A chained admission: per-principal slot plus global slot.
#[derive(Debug, Default)]
pub struct AdmissionPermit {
    // Field order is drop order: the global slot releases before the
    // per-principal slot, the reverse of acquisition.
    _global: Option<LimiterPermit>,
    _user: Option<LimiterPermit>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueSnapshot {
    pub running: usize,
    pub queued: usize,
    pub reservoir: u32,
    #[serde(rename = "totalUsers")]
    pub total_users: usize,
}

#[derive(Debug)]
pub struct Scheduler {
    enabled: bool,
    global: Arc<Limiter>,
    users: DashMap<String, Arc<Limiter>>,
    user_config: LimiterConfig,
    idle_ttl: Duration,
    draining: AtomicBool,
}

impl Scheduler {
    pub fn new(settings: &RateLimitSettings) -> Arc<Self> {
        Self::with_idle_ttl(settings, IDLE_TTL)
    }

    pub fn with_idle_ttl(settings: &RateLimitSettings, idle_ttl: Duration) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            enabled: settings.enabled,
            global: Limiter::new("global", LimiterConfig::from_settings(&settings.global)),
            users: DashMap::new(),
            user_config: LimiterConfig::from_settings(&settings.per_user),
            idle_ttl,
            draining: AtomicBool::new(false),
        });
        Self::spawn_gc(&scheduler);
        scheduler
    }

    fn spawn_gc(scheduler: &Arc<Self>) {
        let weak: Weak<Scheduler> = Arc::downgrade(scheduler);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                scheduler.gc_idle_once();
            }
        });
    }

    /// Drop per-principal limiters that have been idle for the TTL.
    /// Reconstruction on next use is legal and cheap.
    pub fn gc_idle_once(&self) {
        let ttl = self.idle_ttl;
        let before = self.users.len();
        self.users.retain(|_, limiter| !limiter.is_idle_since(ttl));
        let removed = before.saturating_sub(self.users.len());
        if removed > 0 {
            debug!("Garbage-collected {removed} idle per-user limiters");
        }
    }

    fn user_limiter(&self, principal_key: &str) -> Arc<Limiter> {
        self.users
            .entry(principal_key.to_string())
            .or_insert_with(|| Limiter::new("user", self.user_config))
            .clone()
    }

    /// Admit one request for `principal_key`: per-user limiter first, then
    /// the global limiter. Fails synchronously with `QueueOverflow` when
    /// either queue is at its high-water mark, and with `ShuttingDown` once
    /// drain has begun.
    pub async fn admit(&self, principal_key: &str) -> Result<AdmissionPermit, ScheduleError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(ScheduleError::ShuttingDown);
        }
        if !self.enabled {
            return Ok(AdmissionPermit::default());
        }
        let user = self.user_limiter(principal_key);
        let user_permit = user.acquire().await?;
        let global_permit = self.global.acquire().await?;
        Ok(AdmissionPermit {
            _global: Some(global_permit),
            _user: Some(user_permit),
        })
    }

    /// Run `work` under an admission for `principal_key`. The slots are
    /// released when the work future completes or is dropped.
    pub async fn schedule<F>(
        &self,
        principal_key: &str,
        work: F,
    ) -> Result<F::Output, ScheduleError>
    where
        F: Future,
    {
        let _permit = self.admit(principal_key).await?;
        Ok(work.await)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let global = self.global.snapshot();
        crate::metrics::set_queue_depth("global", global.queued);
        QueueSnapshot {
            running: global.running,
            queued: global.queued,
            reservoir: global.reservoir,
            total_users: self.users.len(),
        }
    }

    pub fn user_snapshot(&self, principal_key: &str) -> Option<LimiterSnapshot> {
        self.users.get(principal_key).map(|l| l.snapshot())
    }

    /// Refuse all new submissions from now on. Already-queued waiters are
    /// still admitted and run to completion.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Wait until every limiter is quiescent (nothing running, nothing
    /// queued) or the deadline passes. Returns whether the drain completed.
    pub async fn wait_idle(&self, deadline: Duration) -> bool {
        let started = Instant::now();
        loop {
            let global = self.global.snapshot();
            let users_busy = self.users.iter().any(|entry| {
                let s = entry.value().snapshot();
                s.running > 0 || s.queued > 0
            });
            if global.running == 0 && global.queued == 0 && !users_busy {
                return true;
            }
            if started.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// `begin_drain` + `wait_idle` in one call.
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.begin_drain();
        self.wait_idle(deadline).await
    }
}
