//! Periodic background tasks with cooperative shutdown.
//!
//! Each component that runs on a timer (cache sweeps, hardware poll) owns a
//! [`TaskSet`]. Tasks hold only a `Weak` reference to their component, so a
//! dropped component ends its own loops.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub(crate) struct TaskSet {
    owner: &'static str,
    shutdown: watch::Sender<bool>,
    state: Mutex<TaskState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopping,
}

struct TaskState {
    phase: Phase,
    handles: Vec<JoinHandle<()>>,
}

impl TaskState {
    fn has_live_task(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }
}

impl std::fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSet")
            .field("owner", &self.owner)
            .field("running", &self.is_running())
            .finish()
    }
}

impl TaskSet {
    pub(crate) fn new(owner: &'static str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            owner,
            shutdown,
            state: Mutex::new(TaskState {
                phase: Phase::Idle,
                handles: Vec::new(),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_running(&self) -> bool {
        let state = self.lock_state();
        state.phase == Phase::Running && state.has_live_task()
    }

    /// Claim the set and clear a previous shutdown signal. Returns `false` if
    /// another caller holds it, tasks are still live, or a stop is draining.
    ///
    /// Check and claim happen under one lock, so of several concurrent
    /// callers exactly one gets `true`.
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.lock_state();
        match state.phase {
            Phase::Stopping => return false,
            // Claimed but nothing spawned yet, or tasks still live.
            Phase::Running if state.handles.is_empty() || state.has_live_task() => return false,
            Phase::Running | Phase::Idle => {}
        }
        state.handles.clear();
        state.phase = Phase::Running;
        self.shutdown.send_replace(false);
        true
    }

    /// Run `tick` every `period` (first run after one period) until shutdown
    /// or until `target` is dropped.
    pub(crate) fn spawn_periodic<T, F, Fut>(
        &self,
        label: &'static str,
        target: Weak<T>,
        period: Duration,
        tick: F,
    ) where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let owner = self.owner;
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        let Some(target) = target.upgrade() else {
                            break;
                        };
                        tick(target).await;
                    }
                }
            }

            tracing::debug!("{}: {} task exited", owner, label);
        });

        self.lock_state().handles.push(handle);
    }

    /// Signal shutdown and wait up to `grace` per task, aborting stragglers.
    ///
    /// A second `stop` issued while one is draining returns immediately.
    pub(crate) async fn stop(&self, grace: Duration) {
        let handles = {
            let mut state = self.lock_state();
            if state.phase == Phase::Stopping {
                return;
            }
            state.phase = Phase::Stopping;
            self.shutdown.send_replace(true);
            std::mem::take(&mut state.handles)
        };

        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(
                    "{}: background task did not stop within {:?}, aborting",
                    self.owner,
                    grace
                );
                handle.abort();
            }
        }

        self.lock_state().phase = Phase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks = TaskSet::new("Test");
        assert!(tasks.begin());

        tasks.spawn_periodic("count", Arc::downgrade(&counter), Duration::from_secs(10), |c| async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(tasks.is_running());
        assert!(!tasks.begin());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        tasks.stop(Duration::from_secs(1)).await;
        assert!(!tasks.is_running());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        // Restartable
        assert!(tasks.begin());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_target_ends_task() {
        let target = Arc::new(());
        let tasks = TaskSet::new("Test");
        tasks.begin();
        tasks.spawn_periodic("noop", Arc::downgrade(&target), Duration::from_secs(1), |_| async {});
        drop(target);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!tasks.is_running());
        assert!(tasks.begin());
    }

    #[test]
    fn test_concurrent_begin_has_one_winner() {
        for _ in 0..50 {
            let tasks = Arc::new(TaskSet::new("Test"));
            let barrier = Arc::new(std::sync::Barrier::new(8));
            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let tasks = tasks.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        tasks.begin()
                    })
                })
                .collect();
            let winners = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }

    #[tokio::test]
    async fn test_stop_releases_claim_without_tasks() {
        let tasks = TaskSet::new("Test");
        assert!(tasks.begin());
        assert!(!tasks.begin());

        tasks.stop(Duration::from_secs(1)).await;
        assert!(tasks.begin());
    }
}
