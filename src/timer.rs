//! Deferred-stop timer (spec.md §4.5).
//!
//! One timer thread per stream. After a detection settles, the stream arms
//! this timer instead of stopping immediately — a client that restarts
//! within the window gets a cheap restart instead of a full teardown. Cancel
//! and re-arm are race-free: a shared `stop_waiting` flag plus a monotonic
//! generation counter stop a stale timer from firing after it has been
//! superseded.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TimerState {
    /// Bumped on every `arm`/`cancel`; a firing timer checks its captured
    /// generation against the current one before calling back.
    generation: u64,
    /// `true` when no fire is pending (cancelled, already fired, or never
    /// armed).
    stop_waiting: bool,
    /// Deadline for the current generation's arm, if any.
    deadline: Option<Instant>,
    shutdown: bool,
}

/// A per-stream deferred-stop timer (spec.md §4.5). `on_fire` runs on the
/// timer's own thread, so it must not block on the same stream mutex the
/// caller might be holding when cancelling.
pub struct DeferredStopTimer {
    state: Arc<Mutex<TimerState>>,
    cv: Arc<Condvar>,
    handle: Option<JoinHandle<()>>,
}

impl DeferredStopTimer {
    /// Spawn the timer thread. It parks immediately and only wakes on
    /// `arm`/`shutdown`.
    pub fn spawn<F>(on_fire: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let state = Arc::new(Mutex::new(TimerState {
            generation: 0,
            stop_waiting: true,
            deadline: None,
            shutdown: false,
        }));
        let cv = Arc::new(Condvar::new());

        let thread_state = Arc::clone(&state);
        let thread_cv = Arc::clone(&cv);
        let handle = std::thread::spawn(move || loop {
            let mut guard = thread_state.lock();
            loop {
                if guard.shutdown {
                    return;
                }
                if guard.stop_waiting {
                    thread_cv.wait(&mut guard);
                    continue;
                }
                let deadline = guard.deadline.expect("armed timer always has a deadline");
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread_cv.wait_for(&mut guard, deadline - now);
            }

            if guard.shutdown || guard.stop_waiting {
                continue;
            }
            // Deadline reached with nothing having cancelled/re-armed since.
            guard.stop_waiting = true;
            drop(guard);
            on_fire();
        });

        Self {
            state,
            cv,
            handle: Some(handle),
        }
    }

    /// Arm the timer for `delay`. Cancels and replaces any prior arm.
    pub fn arm(&self, delay: Duration) {
        let mut guard = self.state.lock();
        guard.generation += 1;
        guard.stop_waiting = false;
        guard.deadline = Some(Instant::now() + delay);
        drop(guard);
        self.cv.notify_all();
    }

    /// Cancel a pending fire. Race-free: a timer thread already past its
    /// condvar wait re-checks `stop_waiting` under the lock before ever
    /// calling back.
    pub fn cancel(&self) {
        let mut guard = self.state.lock();
        guard.generation += 1;
        guard.stop_waiting = true;
        guard.deadline = None;
        drop(guard);
        self.cv.notify_all();
    }

    pub fn is_armed(&self) -> bool {
        !self.state.lock().stop_waiting
    }
}

impl Drop for DeferredStopTimer {
    fn drop(&mut self) {
        {
            let mut guard = self.state.lock();
            guard.shutdown = true;
        }
        self.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
