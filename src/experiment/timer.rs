//! Cancellable background timers.
//!
//! Each [`Timer`] owns one named OS thread which sleeps until the next
//! deadline and then runs its task. Deadlines are computed from the moment the
//! timer was started (fixed rate), so a slow task does not accumulate drift.
//!
//! # Cancellation
//!
//! [`Timer::cancel`] sets a flag under the timer's mutex and wakes the thread.
//! The thread re-checks the flag under the same mutex before every run, so no
//! run *starts* after `cancel` returns. A run that already passed its check
//! is allowed to finish: tasks are plain closures and cannot be interrupted.
//! `cancel` never joins the thread, which makes it safe to call from inside
//! the task itself.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::error::{PlanError, PlanResult};

/// How often a [`Timer`] runs its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Run once, `delay` after start.
    Once(Duration),
    /// Run every `period`, first run one period after start.
    FixedRate(Duration),
}

struct TimerShared {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

/// Handle to a running background timer. Dropping the handle cancels it.
pub struct Timer {
    name: String,
    shared: Arc<TimerShared>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Timer {
    /// Start a timer on a dedicated thread called `name`.
    ///
    /// The task receives the time elapsed since the timer was started.
    pub fn start<F>(name: impl Into<String>, schedule: Schedule, mut task: F) -> PlanResult<Self>
    where
        F: FnMut(Duration) + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(TimerShared {
            cancelled: Mutex::new(false),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let origin = Instant::now();
        let (period, repeat) = match schedule {
            Schedule::Once(delay) => (delay, false),
            Schedule::FixedRate(period) => (period, true),
        };

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut tick: u32 = 1;
                loop {
                    let deadline = origin + period.saturating_mul(tick);
                    {
                        let mut cancelled = thread_shared.cancelled.lock();
                        while !*cancelled && Instant::now() < deadline {
                            thread_shared.wakeup.wait_until(&mut cancelled, deadline);
                        }
                        if *cancelled {
                            return;
                        }
                    }

                    task(origin.elapsed());

                    if !repeat {
                        return;
                    }
                    tick = tick.saturating_add(1);
                }
            })
            .map_err(|source| PlanError::TimerSpawn {
                name: name.clone(),
                source,
            })?;

        trace!(timer = %name, ?schedule, "Timer started");
        Ok(Self { name, shared })
    }

    /// Stop the timer. No task run starts after this returns.
    pub fn cancel(&self) {
        let mut cancelled = self.shared.cancelled.lock();
        if !*cancelled {
            *cancelled = true;
            self.shared.wakeup.notify_all();
            trace!(timer = %self.name, "Timer cancelled");
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.shared.cancelled.lock()
    }

    /// Thread name of this timer.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fixed_rate_timer_runs_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let timer = Timer::start("test.fixed", Schedule::FixedRate(Duration::from_millis(5)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        timer.cancel();
        let after_cancel = runs.load(Ordering::SeqCst);
        assert!(after_cancel >= 3, "expected several runs, got {after_cancel}");

        thread::sleep(Duration::from_millis(40));
        // At most one run may have been past its cancellation check.
        assert!(runs.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    #[test]
    fn one_shot_timer_runs_once_with_elapsed_time() {
        let (tx, rx) = std::sync::mpsc::channel();
        let _timer = Timer::start("test.once", Schedule::Once(Duration::from_millis(20)), move |elapsed| {
            let _ = tx.send(elapsed);
        })
        .unwrap();

        let elapsed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
    }

    #[test]
    fn cancelled_before_deadline_never_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let timer = Timer::start("test.cancel", Schedule::Once(Duration::from_millis(50)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        timer.cancel();
        timer.cancel();
        assert!(timer.is_cancelled());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn task_may_cancel_its_own_timer() {
        let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let runs = Arc::new(AtomicUsize::new(0));
        let (task_slot, counter) = (Arc::clone(&slot), Arc::clone(&runs));

        let timer = Timer::start("test.self", Schedule::FixedRate(Duration::from_millis(5)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(timer) = task_slot.lock().as_ref() {
                timer.cancel();
            }
        })
        .unwrap();
        *slot.lock() = Some(timer);

        thread::sleep(Duration::from_millis(80));
        let runs = runs.load(Ordering::SeqCst);
        assert!((1..=2).contains(&runs), "runs = {runs}");
    }
}
