//! Manually stepped clock.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::time::Clock;

/// A [`Clock`] that only moves when told to.
///
/// Sleepers wake as soon as [`advance`](Self::advance) moves the clock to
/// or past their deadline.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wsrpc::testing::ManualClock;
/// use wsrpc::time::Clock;
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(30));
/// assert_eq!(clock.now() - start, Duration::from_secs(30));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<Instant>,
}

impl ManualClock {
    /// Create a clock starting at the current real instant.
    pub fn new() -> Self {
        let (now, _) = watch::channel(Instant::now());
        Self { now }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        let mut rx = self.now.subscribe();
        Box::pin(async move {
            if rx.wait_for(|now| *now >= deadline).await.is_err() {
                // Clock dropped, time stands still forever
                std::future::pending::<()>().await;
            }
        })
    }
}
