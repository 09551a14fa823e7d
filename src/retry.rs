use std::time::Duration;

/// Fixed-interval bounded retry.
///
/// ```ignore
/// let mut tries = RetryPolicy::new(10, interval).start();
/// while tries.next().await {
///     if ready().await { break; }
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    pub fn start(self) -> Retry {
        Retry { policy: self, used: 0 }
    }
}

#[derive(Debug)]
pub struct Retry {
    policy: RetryPolicy,
    used: u32,
}

impl Retry {
    /// Wait out the interval (except before the first attempt) and report
    /// whether another attempt is allowed.
    pub async fn next(&mut self) -> bool {
        if self.used >= self.policy.attempts {
            return false;
        }
        if self.used > 0 && !self.policy.interval.is_zero() {
            tokio::time::sleep(self.policy.interval).await;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

/// Result of a bounded wait: the value if one showed up, plus how many
/// attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: Option<T>,
    pub attempts: u32,
}
