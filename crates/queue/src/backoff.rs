//! Retry delay policy.
//!
//! The policy is plain data: an ordered list of delays plus attempt ceilings.
//! The processor asks it two questions after a failed attempt: "may this entry
//! be tried again?" and "how long until then?".

use std::time::Duration;

use memsync_core::{CoreError, CoreResult};

/// Upper bound on generated exponential sequences.
const MAX_GENERATED_STEPS: usize = 32;

/// Backoff sequence with attempt ceilings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    delays: Vec<Duration>,
    /// Dead-letter once this many attempts have been made (`None` retries forever).
    max_attempts: Option<u32>,
    /// Stricter ceiling applied when the failure could not be classified.
    max_unknown_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(120),
            ],
            max_attempts: Some(5),
            max_unknown_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy from an explicit delay sequence.
    ///
    /// The sequence must be non-empty and non-decreasing, and a ceiling (if
    /// any) must allow at least one attempt.
    pub fn new(delays: Vec<Duration>, max_attempts: Option<u32>) -> CoreResult<Self> {
        if delays.is_empty() {
            return Err(CoreError::validation("backoff sequence must not be empty"));
        }
        if delays.windows(2).any(|w| w[1] < w[0]) {
            return Err(CoreError::validation(
                "backoff sequence must be non-decreasing",
            ));
        }
        if max_attempts == Some(0) {
            return Err(CoreError::validation("max_attempts must be at least 1"));
        }

        let max_unknown_attempts = max_attempts.map_or(3, |m| m.min(3));
        Ok(Self {
            delays,
            max_attempts,
            max_unknown_attempts,
        })
    }

    /// Generate `base, base*factor, base*factor^2, ...` capped at `ceiling`.
    pub fn exponential(
        base: Duration,
        factor: u32,
        ceiling: Duration,
        max_attempts: Option<u32>,
    ) -> CoreResult<Self> {
        if factor == 0 {
            return Err(CoreError::validation("backoff factor must be at least 1"));
        }
        if ceiling < base {
            return Err(CoreError::validation("backoff ceiling is below the base delay"));
        }

        let mut delays = vec![base];
        let mut current = base;
        while current < ceiling && factor > 1 && delays.len() < MAX_GENERATED_STEPS {
            current = current.saturating_mul(factor).min(ceiling);
            delays.push(current);
        }

        Self::new(delays, max_attempts)
    }

    /// Override the ceiling used for unclassified failures.
    pub fn with_max_unknown_attempts(mut self, max: u32) -> CoreResult<Self> {
        if max == 0 {
            return Err(CoreError::validation("max_unknown_attempts must be at least 1"));
        }
        self.max_unknown_attempts = max;
        Ok(self)
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn max_unknown_attempts(&self) -> u32 {
        self.max_unknown_attempts
    }

    /// Delay to wait after the `attempt_count`-th failed attempt.
    ///
    /// `attempt_count` is 1-based (the count *after* the failure was recorded).
    /// Past the end of the sequence the last delay repeats.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }
        let idx = (attempt_count as usize - 1).min(self.delays.len() - 1);
        self.delays[idx]
    }

    /// Attempt ceiling for a failure; `unknown` selects the stricter cap.
    pub fn attempt_cap(&self, unknown: bool) -> Option<u32> {
        match (unknown, self.max_attempts) {
            (false, cap) => cap,
            (true, Some(cap)) => Some(cap.min(self.max_unknown_attempts)),
            (true, None) => Some(self.max_unknown_attempts),
        }
    }

    /// Whether another attempt is allowed after `attempt_count` attempts.
    pub fn should_retry(&self, attempt_count: u32, unknown: bool) -> bool {
        self.attempt_cap(unknown)
            .is_none_or(|cap| attempt_count < cap)
    }
}
