//! Rest pacing between storage-wiggle rounds.
//!
//! After a wiggle round drains, the next process must not start immediately:
//! the cluster gets a rest to re-absorb the moved data, and a cluster too
//! small to place wiggled data anywhere gets a much longer one. `RestTimer`
//! owns that pacing: one arm yields exactly one elapse, re-arming replaces
//! the pending deadline, and disabling the wiggle cancels it outright.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

/// How much longer an undersized cluster rests between rounds.
const SMALL_CLUSTER_REST_FACTOR: u32 = 4;

/// One-shot, re-armable rest interval.
///
/// The deadline lives in the timer itself, not in any waiting future, so
/// `elapsed()` can sit in a `select!` loop and be dropped and re-created
/// every iteration without losing or double-firing a rest.
#[derive(Debug)]
pub struct RestTimer {
    /// Configured rest between wiggle rounds.
    base: Duration,

    /// Pending deadline; `None` when disarmed or already consumed.
    deadline: Mutex<Option<Instant>>,

    /// Pokes waiters whenever the deadline slot changes.
    rearmed: Arc<Notify>,
}

impl RestTimer {
    pub fn new(base: Duration) -> Self {
        RestTimer {
            base,
            deadline: Mutex::new(None),
            rearmed: Arc::new(Notify::new()),
        }
    }

    fn arm(&self, dur: Duration) {
        let mut slot = self.deadline.lock().unwrap();
        *slot = Some(Instant::now() + dur);
        self.rearmed.notify_one();
    }

    /// Arms the normal rest after a finished round.
    pub fn rest(&self) {
        self.arm(self.base);
    }

    /// Arms the long rest used while the cluster is too small to absorb
    /// wiggled data.
    pub fn long_rest(&self) {
        self.arm(self.base * SMALL_CLUSTER_REST_FACTOR);
    }

    /// Drops any pending rest; no elapse will fire until re-armed.
    pub fn cancel(&self) {
        let mut slot = self.deadline.lock().unwrap();
        *slot = None;
        self.rearmed.notify_one();
    }

    /// Resolves once the pending rest elapses, consuming it. With no rest
    /// armed, waits for one. Suitable as a `select!` branch.
    pub async fn elapsed(&self) {
        loop {
            let armed = *self.deadline.lock().unwrap();
            match armed {
                Some(deadline) => {
                    tokio::select! {
                        () = time::sleep_until(deadline) => {
                            let mut slot = self.deadline.lock().unwrap();
                            // consume only if this is still the armed rest;
                            // a re-arm meanwhile supersedes it
                            if *slot == Some(deadline) {
                                *slot = None;
                                return;
                            }
                        }
                        () = self.rearmed.notified() => {}
                    }
                }
                None => self.rearmed.notified().await,
            }
        }
    }
}
