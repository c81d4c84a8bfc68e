//! Retry timing.
//!
//! Broker reconnection and bus read recovery use fixed intervals. Only
//! re-establishing an RPC operation's consumer backs off.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Delay between a failed bus read step and the next attempt.
pub const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Yield inserted between normal bus consume iterations.
pub const CONSUME_IDLE_DELAY: Duration = Duration::from_millis(50);

/// Backoff for re-establishing an RPC operation's consumer after its
/// delivery stream ends.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unlimited attempts
/// - Jitter enabled
pub fn resubscribe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(usize::MAX)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_resubscribe_backoff_is_unbounded_and_capped() {
        let mut backoff = resubscribe_backoff().build();
        for _ in 0..64 {
            let delay = backoff.next().expect("backoff should never run out");
            // jitter may add up to one extra delay on top of the cap
            assert!(delay <= Duration::from_secs(60));
        }
    }
}
