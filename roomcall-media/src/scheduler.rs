//! Timer scheduling for delayed work
//!
//! Retries are driven through the [`Scheduler`] trait so the session can run
//! on tokio timers in production and on a manually advanced clock in tests.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::trace;

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId;

    /// Cancel a timer. Returns false if it already fired or was canceled.
    fn cancel(&self, id: TimerId) -> bool;

    /// Number of timers that have neither fired nor been canceled
    fn pending(&self) -> usize;
}

/// Scheduler backed by tokio timers
#[derive(Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    timers: Arc<DashMap<TimerId, Option<AbortHandle>>>,
}

impl TokioScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // The entry exists before the task can observe it
        self.timers.insert(id, None);

        let timers = Arc::clone(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if timers.remove(&id).is_some() {
                task();
            }
        });

        if let Some(mut entry) = self.timers.get_mut(&id) {
            *entry = Some(handle.abort_handle());
        }
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some((_, handle)) => {
                if let Some(handle) = handle {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    fn pending(&self) -> usize {
        self.timers.len()
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    queue: BTreeMap<(Duration, TimerId), TimerTask>,
    due: BTreeMap<TimerId, Duration>,
}

/// Scheduler driven by an explicit clock, for deterministic tests
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current virtual time
    #[must_use]
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Move the clock forward, running every timer that falls due.
    /// Returns how many timers fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut fired = 0;

        loop {
            let next = {
                let mut state = self.state.lock();
                let key = state
                    .queue
                    .keys()
                    .next()
                    .copied()
                    .filter(|(due, _)| *due <= target);
                match key {
                    Some(key) => {
                        state.now = key.0;
                        state.due.remove(&key.1);
                        state.queue.remove(&key)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };

            // Tasks run without the lock so they may schedule again
            match next {
                Some(task) => {
                    task();
                    fired += 1;
                }
                None => break,
            }
        }

        trace!(fired, "Manual scheduler advanced");
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId {
        let mut state = self.state.lock();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let due = state.now + delay;
        state.queue.insert((due, id), task);
        state.due.insert(id, due);
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.state.lock();
        match state.due.remove(&id) {
            Some(due) => state.queue.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_scheduler_fires_in_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("b", 200), ("a", 100), ("c", 300)] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || order.lock().push(label)),
            );
        }

        assert_eq!(scheduler.advance(Duration::from_millis(250)), 2);
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.now(), Duration::from_millis(250));
    }

    #[test]
    fn test_manual_scheduler_cancel() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = scheduler.schedule(Duration::from_millis(10), counter_task(&counter));

        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_scheduler_runs_rescheduled_work_within_window() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = Arc::clone(&scheduler);
        let inner_counter = Arc::clone(&counter);
        scheduler.schedule(
            Duration::from_millis(100),
            Box::new(move || {
                inner_counter.fetch_add(1, Ordering::SeqCst);
                inner_scheduler.schedule(Duration::from_millis(100), counter_task(&inner_counter));
            }),
        );

        assert_eq!(scheduler.advance(Duration::from_millis(250)), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires_and_cancels() {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(Duration::from_millis(500), counter_task(&counter));
        let canceled = scheduler.schedule(Duration::from_millis(500), counter_task(&counter));
        assert_eq!(scheduler.pending(), 2);
        assert!(scheduler.cancel(canceled));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }
}
