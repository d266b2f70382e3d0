//! Predicate-driven retry for completed HTTP responses.
//!
//! Transport errors never reach the retry policy: proxy failures are handled
//! by eviction and everything else is surfaced. The policy only decides
//! whether a response that did arrive should be fetched again.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use predator::RetryPolicy;
//!
//! let policy = RetryPolicy::new(3, |resp| resp.status() >= 500)
//!     .with_delay(Duration::from_millis(250));
//! assert_eq!(policy.count(), 3);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::response::Response;

/// Predicate deciding whether a response warrants another attempt.
pub type RetryPredicate = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

/// Bounded retry configuration.
///
/// A request is re-sent while `retry_counter < count` and the predicate
/// returns `true`, so the transport runs at most `count + 1` times.
#[derive(Clone)]
pub struct RetryPolicy {
    count: u32,
    predicate: RetryPredicate,
    delay: Duration,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("count", &self.count)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `count` retries with no delay between them.
    #[must_use]
    pub fn new(count: u32, predicate: impl Fn(&Response) -> bool + Send + Sync + 'static) -> Self {
        Self {
            count,
            predicate: Arc::new(predicate),
            delay: Duration::ZERO,
        }
    }

    /// Policy retrying any non-2xx response.
    #[must_use]
    pub fn on_failure_status(count: u32) -> Self {
        Self::new(count, |resp| !(200..300).contains(&resp.status()))
    }

    /// Sets the pause slept before each retry.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Maximum number of retries.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Pause between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether `response` should be retried given its request's counter.
    #[must_use]
    pub fn should_retry(&self, response: &Response) -> bool {
        let attempts = response.request().retry_counter();
        if attempts >= self.count {
            debug!(attempts, max = self.count, "retry budget exhausted");
            return false;
        }
        (self.predicate)(response)
    }
}
