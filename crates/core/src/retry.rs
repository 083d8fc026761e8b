use std::time::Duration;

use serde::Serialize;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The registry does not know the SIRET.
    NotFound,
    /// The registry rejected the request as malformed.
    BadRequest,
    /// Anything else: network, timeout, unexpected status or payload.
    Transient,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::Transient => "transient",
        }
    }
}

/// Delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `attempts⁴ + offset`, in seconds.
    Polynomial { offset: Duration },
    Fixed(Duration),
}

impl Backoff {
    fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Polynomial { offset } => {
                let attempt = u64::from(attempt);
                let secs = attempt.saturating_pow(4);
                Duration::from_secs(secs).saturating_add(offset)
            }
            Self::Fixed(delay) => delay,
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after the delay.
    RetryAt(Duration),
    /// Expected failure: stop and do not report.
    Suppress,
    /// Attempts exhausted: stop and report.
    GiveUp,
}

/// Retry strategy applied by the job executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Polynomial backoff capped at one day.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Polynomial {
                offset: Duration::from_secs(5),
            },
            max_delay: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Same curve, different ceiling. Jobs carry the ceiling they were enqueued with.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, class: FailureClass) -> bool {
        matches!(class, FailureClass::Transient)
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt).min(self.max_delay)
    }

    /// Decides what happens after attempt number `attempt` (1-based) failed.
    pub fn decide(&self, attempt: u32, class: FailureClass) -> RetryDecision {
        if !self.is_retryable(class) {
            return RetryDecision::Suppress;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAt(self.delay_after(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}
