//! Clocks and the resettable inactivity timer.
//!
//! Every timing decision of the runtime (connection inactivity, client
//! pings) goes through a [`Clock`], so tests can swap real time for
//! [`ManualClock`](crate::testing::ManualClock) and step it explicitly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Source of time for timers.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Future completing once [`now`](Self::now) reaches `deadline`.
    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;
}

/// Real time as seen by the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}

/// A one-shot deadline that can be pushed back with [`reset`](Self::reset).
///
/// On expiry the [`expired`](Self::expired) token fires. The background
/// task is aborted when the timer is dropped.
#[derive(Debug)]
pub struct InactivityTimer {
    clock: Arc<dyn Clock>,
    timeout: Duration,
    deadline: watch::Sender<Instant>,
    expired: CancellationToken,
    task: JoinHandle<()>,
}

impl InactivityTimer {
    /// Start a timer expiring `timeout` from now.
    pub fn start(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        let (deadline, mut rx) = watch::channel(clock.now() + timeout);
        let expired = CancellationToken::new();

        let task = {
            let clock = clock.clone();
            let expired = expired.clone();
            tokio::spawn(async move {
                loop {
                    let current = *rx.borrow_and_update();
                    tokio::select! {
                        _ = clock.sleep_until(current) => {
                            // A reset may have landed while we were waking up
                            if clock.now() >= *rx.borrow() {
                                expired.cancel();
                                return;
                            }
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            })
        };

        Self {
            clock,
            timeout,
            deadline,
            expired,
            task,
        }
    }

    /// Push the deadline to `timeout` from now.
    pub fn reset(&self) {
        if !self.expired.is_cancelled() {
            self.deadline.send_replace(self.clock.now() + self.timeout);
        }
    }

    /// Token fired when the deadline passes.
    pub fn expired(&self) -> CancellationToken {
        self.expired.clone()
    }

    /// Whether the deadline passed.
    pub fn is_expired(&self) -> bool {
        self.expired.is_cancelled()
    }

    /// Current deadline.
    pub fn deadline(&self) -> Instant {
        *self.deadline.borrow()
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
