// Time sources for lease deadlines, queue aging, acquire timeouts and usage recency
//
// Every time-dependent decision in the crate goes through a `Clock`, so tests
// can drive deadlines with `ManualClock::advance` instead of sleeping.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A clock shared between the manager, the pool and their timers
pub type SharedClock = Arc<dyn Clock>;

/// Source of the current instant and of timer wake-ups
#[async_trait]
pub trait Clock: Debug + Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Resolve once `now() >= deadline`
    async fn sleep_until(&self, deadline: Instant);

    /// Resolve after `duration` has elapsed on this clock
    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

/// Wall clock backed by `Instant::now` and tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a shared system clock
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Time only moves when [`ManualClock::advance`] is called; sleepers whose
/// deadline has been reached are woken during that call.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    state: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    elapsed: Duration,
    sleepers: Vec<(Instant, oneshot::Sender<()>)>,
}

impl ManualClock {
    /// Create a clock frozen at its creation instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Create a clock wrapped in an `Arc`
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move time forward and wake every sleeper that became due
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.elapsed += by;
            let now = self.origin + state.elapsed;
            let (due, pending): (Vec<_>, Vec<_>) = state
                .sleepers
                .drain(..)
                .partition(|(deadline, _)| *deadline <= now);
            state.sleepers = pending;
            due
        };

        for (_, waker) in due {
            let _ = waker.send(());
        }
    }

    /// Total time advanced since creation
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Number of sleepers still waiting for their deadline
    pub fn pending_sleepers(&self) -> usize {
        let mut state = self.state.lock();
        state.sleepers.retain(|(_, waker)| !waker.is_closed());
        state.sleepers.len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().elapsed
    }

    async fn sleep_until(&self, deadline: Instant) {
        let receiver = {
            let mut state = self.state.lock();
            if deadline <= self.origin + state.elapsed {
                None
            } else {
                // Drop sleepers whose futures were cancelled by a select!
                state.sleepers.retain(|(_, waker)| !waker.is_closed());
                let (waker, receiver) = oneshot::channel();
                state.sleepers.push((deadline, waker));
                Some(receiver)
            }
        };

        if let Some(receiver) = receiver {
            let _ = receiver.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_manual_sleep_wakes_on_advance() {
        let clock = ManualClock::shared();
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(5)).await })
        };

        while clock.pending_sleepers() == 0 {
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::from_secs(4));
        assert_eq!(clock.pending_sleepers(), 1);
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(1));
        sleeper.await.unwrap();
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn test_past_deadline_returns_immediately() {
        let clock = ManualClock::new();
        let deadline = clock.now();
        clock.advance(Duration::from_millis(1));
        clock.sleep_until(deadline).await;
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleep() {
        let clock = SystemClock;
        let before = clock.now();
        clock.sleep(Duration::from_millis(20)).await;
        assert!(tokio::time::Instant::now().into_std() >= before);
    }
}
