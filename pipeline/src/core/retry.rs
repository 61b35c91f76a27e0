//! Bounded retries with repeated-error detection for one plan step.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::error::ConfigError;

/// Error signatures kept per step unless configured otherwise.
pub const DEFAULT_ERROR_HISTORY: usize = 5;

/// Why retrying stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    MaxRetries { max_retries: u32 },
    RepeatedError { threshold: usize },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxRetries { max_retries } => {
                write!(f, "max retries ({max_retries}) reached")
            }
            StopReason::RepeatedError { threshold } => {
                write!(f, "same error repeated {threshold} times in a row")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub reason: Option<StopReason>,
}

impl RetryDecision {
    fn retry() -> Self {
        Self {
            should_retry: true,
            reason: None,
        }
    }

    fn stop(reason: StopReason) -> Self {
        Self {
            should_retry: false,
            reason: Some(reason),
        }
    }
}

/// Attempt counter plus a bounded history of normalized error signatures.
///
/// One manager per plan step. Never shared between steps.
#[derive(Debug, Clone)]
pub struct RetryManager {
    max_retries: u32,
    threshold: usize,
    capacity: usize,
    attempts: u32,
    history: VecDeque<String>,
}

impl RetryManager {
    pub fn new(max_retries: u32, error_repeat_threshold: usize) -> Result<Self, ConfigError> {
        Self::with_history_capacity(max_retries, error_repeat_threshold, DEFAULT_ERROR_HISTORY)
    }

    pub fn with_history_capacity(
        max_retries: u32,
        error_repeat_threshold: usize,
        capacity: usize,
    ) -> Result<Self, ConfigError> {
        if max_retries == 0 {
            return Err(ConfigError::MaxRetries);
        }
        if error_repeat_threshold < 2 {
            return Err(ConfigError::RepeatThreshold(error_repeat_threshold));
        }
        if error_repeat_threshold > capacity {
            return Err(ConfigError::ThresholdExceedsHistory {
                threshold: error_repeat_threshold,
                capacity,
            });
        }
        Ok(Self {
            max_retries,
            threshold: error_repeat_threshold,
            capacity,
            attempts: 0,
            history: VecDeque::with_capacity(capacity),
        })
    }

    /// Start a new attempt and return its 1-based number.
    pub fn next_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record a failure. Whitespace runs collapse to one space so cosmetic
    /// differences do not hide a repeated error.
    pub fn record_error(&mut self, error: &str) {
        let signature = error.split_whitespace().collect::<Vec<_>>().join(" ");
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(signature);
    }

    /// Oldest first.
    pub fn recent_errors(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    pub fn should_retry(&self) -> RetryDecision {
        if self.attempts >= self.max_retries {
            return RetryDecision::stop(StopReason::MaxRetries {
                max_retries: self.max_retries,
            });
        }
        if self.is_repeating() {
            return RetryDecision::stop(StopReason::RepeatedError {
                threshold: self.threshold,
            });
        }
        RetryDecision::retry()
    }

    fn is_repeating(&self) -> bool {
        if self.history.len() < self.threshold {
            return false;
        }
        let mut tail = self.history.iter().rev().take(self.threshold);
        let Some(last) = tail.next() else {
            return false;
        };
        tail.all(|signature| signature == last)
    }
}
