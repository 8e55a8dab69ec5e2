use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Monotonically doubling delay, bounded by a cap.
///
/// `next()` hands out the current delay and doubles it for the following
/// call. A zero `max` disables growth entirely and every call returns the
/// initial delay.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl BackoffStrategy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Return the current delay, then double it (capped at `max`).
    pub fn next(&mut self) -> Duration {
        if self.max.is_zero() {
            return self.initial;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Restore the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Wait out the next delay, or return early when `token` fires.
    ///
    /// Returns `false` if the wait was interrupted by cancellation.
    pub async fn sleep(&mut self, token: &CancellationToken) -> bool {
        let delay = self.next();
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = BackoffStrategy::new(Duration::from_millis(200), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        assert_eq!(backoff.next(), Duration::from_millis(800));
        assert_eq!(backoff.next(), Duration::from_millis(1600));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(2));
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = BackoffStrategy::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[rstest]
    #[case(Duration::from_millis(50))]
    #[case(Duration::from_secs(1))]
    fn zero_max_disables_growth(#[case] initial: Duration) {
        let mut backoff = BackoffStrategy::new(initial, Duration::ZERO);
        assert_eq!(backoff.next(), initial);
        assert_eq!(backoff.next(), initial);
        assert_eq!(backoff.next(), initial);
    }

    #[tokio::test]
    async fn sleep_returns_early_on_cancellation() {
        let mut backoff = BackoffStrategy::new(Duration::from_secs(30), Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();
        assert!(!backoff.sleep(&token).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_waits_out_the_delay() {
        let mut backoff = BackoffStrategy::new(Duration::from_millis(10), Duration::from_secs(1));
        let token = CancellationToken::new();
        assert!(backoff.sleep(&token).await);
    }
}
