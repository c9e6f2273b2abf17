use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One delivery attempt. Returns `true` once the work is done.
pub type Attempt = Box<dyn FnMut() -> bool + Send>;

/// Fired once when a task runs out of attempts.
pub type GiveUp = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay between two passes over the pending tasks.
    pub tick: Duration,
    /// Failed attempts after which a task is given up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_attempts: 60,
        }
    }
}

struct Task {
    id: u64,
    attempt: Attempt,
    on_give_up: Option<GiveUp>,
    attempts: u32,
}

/// Retries queued actions on a fixed tick until they succeed.
///
/// A single worker drains the pending set on every tick, so one task never
/// has two attempts running at once. Attempts run outside the lock and may
/// queue further tasks; those are picked up on the next tick.
pub struct RetryScheduler {
    policy: RetryPolicy,
    pending: Mutex<Vec<Task>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue `attempt` for the next tick. Returns the task id.
    pub fn add<F>(&self, attempt: F, on_give_up: Option<GiveUp>) -> u64
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self.is_stopped() {
            tracing::debug!(task_id = id, "retry scheduler stopped, dropping task");
            return id;
        }

        self.pending.lock().push(Task {
            id,
            attempt: Box::new(attempt),
            on_give_up,
            attempts: 0,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run one attempt of every pending task. Returns how many completed.
    pub fn tick(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }

        let mut completed = 0;
        let mut retry = Vec::with_capacity(batch.len());

        for mut task in batch {
            if self.is_stopped() {
                break;
            }

            task.attempts += 1;
            if (task.attempt)() {
                completed += 1;
                continue;
            }

            if task.attempts >= self.policy.max_attempts {
                tracing::warn!(
                    task_id = task.id,
                    attempts = task.attempts,
                    "giving up on task"
                );
                if let Some(on_give_up) = task.on_give_up.take() {
                    on_give_up();
                }
                continue;
            }

            retry.push(task);
        }

        if self.is_stopped() {
            return completed;
        }

        let mut pending = self.pending.lock();
        retry.append(&mut pending);
        *pending = retry;

        completed
    }

    /// Spawn the worker that ticks until [`shutdown`](Self::shutdown).
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.policy.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if scheduler.is_stopped() {
                    break;
                }
                scheduler.tick();
            }
            tracing::info!("retry scheduler stopped");
        })
    }

    /// Stop retrying. Pending tasks are dropped without firing their give-up.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = std::mem::take(&mut *self.pending.lock()).len();
        tracing::info!(dropped, "shutting down retry scheduler");
    }
}
