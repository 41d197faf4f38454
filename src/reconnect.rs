//! Exponential back-off scheduling for reconnection.
//!
//! [`ReconnectManager`] knows nothing about the transport. It hands out
//! delays, counts attempts and owns at most one pending timer; the caller
//! supplies the future to run when the timer fires.

use std::{future::Future, time::Duration};

use tokio::task::AbortHandle;
use tracing::debug;

/// Configuration for reconnect back-off.
///
/// The first delay is `initial_delay`; each further delay multiplies the
/// previous one by `multiplier`, capped at `max_delay`.
///
/// # Default Values
/// - `initial_delay`: 1 second
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0
/// - `max_attempts`: 0 (unlimited)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Maximum scheduled attempts; zero means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Clamp delays to sane bounds, ensure `initial_delay <= max_delay`, and
    /// force the multiplier to a finite value of at least 1.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use mqttot::reconnect::ReconnectConfig;
    ///
    /// let cfg = ReconnectConfig {
    ///     initial_delay: Duration::from_secs(5),
    ///     max_delay: Duration::from_secs(1),
    ///     multiplier: f64::NAN,
    ///     max_attempts: 3,
    /// };
    ///
    /// let normalized = cfg.normalized();
    /// assert_eq!(normalized.initial_delay, Duration::from_secs(1));
    /// assert_eq!(normalized.max_delay, Duration::from_secs(5));
    /// assert!((normalized.multiplier - 1.0).abs() < f64::EPSILON);
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            self.multiplier = 1.0;
        }
        self
    }
}

/// Snapshot returned by [`ReconnectManager::state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectState {
    /// Delays handed out since the last reset.
    pub attempt: u32,
    /// Most recent delay, if any.
    pub current_delay: Option<Duration>,
    /// Whether a timer is waiting to fire.
    pub pending: bool,
}

/// A reconnect that has been scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledReconnect {
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Delay before the callback runs.
    pub delay: Duration,
}

/// Hands out back-off delays and owns the single pending reconnect timer.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mqttot::reconnect::{ReconnectConfig, ReconnectManager};
///
/// let mut manager = ReconnectManager::new(ReconnectConfig::default());
/// assert_eq!(manager.next_delay(), Duration::from_secs(1));
/// assert_eq!(manager.next_delay(), Duration::from_secs(2));
/// manager.reset();
/// assert_eq!(manager.state().attempt, 0);
/// assert_eq!(manager.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    attempt: u32,
    current_delay: Option<Duration>,
    timer: Option<AbortHandle>,
}

impl ReconnectManager {
    /// Create a manager; the configuration is normalised first.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config: config.normalized(),
            attempt: 0,
            current_delay: None,
            timer: None,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &ReconnectConfig { &self.config }

    /// Return the next delay and count an attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current_delay {
            None => self.config.initial_delay,
            Some(current) => Duration::try_from_secs_f64(current.as_secs_f64() * self.config.multiplier)
                .unwrap_or(self.config.max_delay)
                .min(self.config.max_delay),
        };
        self.current_delay = Some(delay);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Whether the attempt budget is spent.
    #[must_use]
    pub fn is_exhausted(&self) -> bool { self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts }

    /// Schedule `reconnect` after the next delay, replacing any pending
    /// timer. Returns `None` once the attempt budget is spent.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F, Fut>(&mut self, reconnect: F) -> Option<ScheduledReconnect>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_exhausted() {
            debug!(attempt = self.attempt, max = self.config.max_attempts, "reconnect budget exhausted");
            return None;
        }
        self.cancel();
        let delay = self.next_delay();
        let attempt = self.attempt;
        debug!(attempt, ?delay, "scheduling reconnect");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            reconnect().await;
        });
        self.timer = Some(handle.abort_handle());
        Some(ScheduledReconnect { attempt, delay })
    }

    /// Abort the pending timer, keeping attempt and delay state.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Abort the pending timer and forget accumulated attempts and delay.
    pub fn reset(&mut self) {
        self.cancel();
        self.attempt = 0;
        self.current_delay = None;
    }

    /// Current attempt count, last delay and timer status.
    #[must_use]
    pub fn state(&self) -> ReconnectState {
        ReconnectState {
            attempt: self.attempt,
            current_delay: self.current_delay,
            pending: self.timer.as_ref().is_some_and(|t| !t.is_finished()),
        }
    }
}

impl Drop for ReconnectManager {
    fn drop(&mut self) { self.cancel(); }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn config(initial_ms: u64, max_ms: u64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[rstest]
    fn delays_double_until_capped() {
        let mut manager = ReconnectManager::new(config(1_000, 5_000, 0));
        let delays: Vec<u64> = (0..5)
            .map(|_| u64::try_from(manager.next_delay().as_millis()).expect("fits"))
            .collect();
        assert_eq!(delays, [1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(manager.state().attempt, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut manager = ReconnectManager::new(config(100, 1_000, 0));
        let counter = Arc::clone(&fired);
        let scheduled = manager
            .schedule(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("scheduled");
        assert_eq!(scheduled, ScheduledReconnect {
            attempt: 1,
            delay: Duration::from_millis(100),
        });
        assert!(manager.state().pending);

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut manager = ReconnectManager::new(config(100, 1_000, 0));
        for _ in 0..2 {
            let counter = Arc::clone(&fired);
            manager.schedule(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_enforced_and_reset_restores_it() {
        let mut manager = ReconnectManager::new(config(10, 100, 2));
        assert!(manager.schedule(|| async {}).is_some());
        assert!(manager.schedule(|| async {}).is_some());
        assert!(manager.schedule(|| async {}).is_none());
        assert!(manager.is_exhausted());

        manager.reset();
        assert_eq!(manager.state(), ReconnectState {
            attempt: 0,
            current_delay: None,
            pending: false,
        });
        let again = manager.schedule(|| async {}).expect("budget restored");
        assert_eq!(again.delay, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut manager = ReconnectManager::new(config(50, 100, 0));
        let counter = Arc::clone(&fired);
        manager.schedule(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        manager.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state().attempt, 1);
    }

    proptest! {
        #[test]
        fn delays_never_decrease(
            initial in 1u64..5_000,
            max in 1u64..60_000,
            multiplier in 1.0f64..4.0,
            steps in 1usize..40,
        ) {
            let mut manager = ReconnectManager::new(ReconnectConfig {
                initial_delay: Duration::from_millis(initial),
                max_delay: Duration::from_millis(max),
                multiplier,
                max_attempts: 0,
            });
            let cap = manager.config().max_delay;
            let mut previous = Duration::ZERO;
            for _ in 0..steps {
                let delay = manager.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= cap);
                previous = delay;
            }
            manager.reset();
            prop_assert_eq!(manager.next_delay(), manager.config().initial_delay);
        }
    }
}
