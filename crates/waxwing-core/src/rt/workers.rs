//! Semaphore-bounded worker pool for user handler dispatch.
//!
//! Worker concurrency is a permit count on a tokio semaphore rather
//! than a set of OS threads; the elastic-resize surface (step/period
//! growth and removal) adjusts the permit count from a recurring timed
//! event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::{EventAction, Timer};

/// Shape of the worker pool.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Permits available at startup.
    pub initial: usize,
    /// Hard ceiling on permits.
    pub max_limit: usize,
    /// Permits added per growth step.
    pub add_step: usize,
    /// Minimum interval between growth steps.
    pub add_period: Duration,
    /// Permits removed per shrink step.
    pub remove_step: usize,
    /// Minimum interval between shrink steps.
    pub remove_period: Duration,
    /// Whether idle capacity above `initial` is reclaimed.
    pub auto_remove: bool,
    /// Grow on every autoscaler tick while tasks are starved, instead
    /// of once per `add_period`.
    pub preemptive: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            initial: 5,
            max_limit: 40,
            add_step: 1,
            add_period: Duration::from_secs(2),
            remove_step: 1,
            remove_period: Duration::from_secs(10),
            auto_remove: false,
            preemptive: false,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Tasks currently executing.
    pub running: usize,
    /// Permits free right now.
    pub waiting: usize,
    /// Tasks queued for a permit.
    pub pending: usize,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    sem: Arc<Semaphore>,
    cfg: WorkerPoolConfig,
    permits: Mutex<usize>,
    running: AtomicUsize,
    pending: AtomicUsize,
    autoscaled: AtomicBool,
    last_resize: Mutex<Instant>,
}

impl WorkerPool {
    pub fn new(cfg: WorkerPoolConfig) -> WorkerPool {
        let initial = cfg.initial.max(1);
        WorkerPool {
            inner: Arc::new(PoolInner {
                sem: Arc::new(Semaphore::new(initial)),
                permits: Mutex::new(initial),
                cfg,
                running: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                autoscaled: AtomicBool::new(false),
                last_resize: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Run `f` on a worker once a permit is free. Must be called inside
    /// a tokio runtime.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        inner.pending.fetch_add(1, Ordering::AcqRel);
        let sem = Arc::clone(&inner.sem);
        tokio::spawn(async move {
            let permit = match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // pool closed while queued
                    inner.pending.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };
            inner.pending.fetch_sub(1, Ordering::AcqRel);
            inner.running.fetch_add(1, Ordering::AcqRel);
            f();
            inner.running.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
        });
    }

    /// Add `n` permits, clamped to `max_limit`.
    pub fn add_workers(&self, n: usize) {
        let mut permits = self.inner.permits.lock();
        let room = self.inner.cfg.max_limit.saturating_sub(*permits);
        let added = n.min(room);
        if added > 0 {
            *permits += added;
            self.inner.sem.add_permits(added);
        }
    }

    /// Retire `n` permits as they become free, never dropping below one.
    pub fn remove_workers(&self, n: usize) {
        let to_remove = {
            let permits = self.inner.permits.lock();
            n.min(permits.saturating_sub(1))
        };
        for _ in 0..to_remove {
            let inner = Arc::clone(&self.inner);
            let sem = Arc::clone(&inner.sem);
            tokio::spawn(async move {
                if let Ok(permit) = sem.acquire_owned().await {
                    permit.forget();
                    *inner.permits.lock() -= 1;
                }
            });
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            running: self.inner.running.load(Ordering::Acquire),
            waiting: self.inner.sem.available_permits(),
            pending: self.inner.pending.load(Ordering::Acquire),
        }
    }

    /// Current permit count.
    pub fn worker_count(&self) -> usize {
        *self.inner.permits.lock()
    }

    /// Install the elastic-resize event on `timer`. Safe to call more
    /// than once; only the first call installs.
    pub fn attach_autoscaler(&self, timer: &Timer) {
        if self.inner.autoscaled.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = self.clone();
        let tick = pool
            .inner
            .cfg
            .add_period
            .min(pool.inner.cfg.remove_period)
            .max(Duration::from_millis(100));
        timer.schedule(tick, move || {
            pool.autoscale_tick();
            EventAction::Keep
        });
    }

    fn autoscale_tick(&self) {
        let cfg = &self.inner.cfg;
        let starved = self.inner.pending.load(Ordering::Acquire) > 0
            && self.inner.sem.available_permits() == 0;
        let now = Instant::now();
        let mut last = self.inner.last_resize.lock();

        if starved {
            if cfg.preemptive || now.duration_since(*last) >= cfg.add_period {
                *last = now;
                drop(last);
                self.add_workers(cfg.add_step);
            }
            return;
        }

        if cfg.auto_remove
            && self.worker_count() > cfg.initial
            && now.duration_since(*last) >= cfg.remove_period
        {
            *last = now;
            drop(last);
            self.remove_workers(cfg.remove_step);
        }
    }

    /// Close the pool: queued tasks are dropped, running tasks finish.
    pub fn close(&self) {
        self.inner.sem.close();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new(WorkerPoolConfig::default())
    }
}
