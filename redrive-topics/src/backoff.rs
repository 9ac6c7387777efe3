//! Backoff policies and the per-level delay sequences they generate.
//!
//! Unlike an in-process retry loop, a retry-topic chain fixes its delays at
//! configuration time: each retry level is a topic whose delay is one value
//! of the policy's sequence.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid backoff parameters, rejected at configuration time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackoffError {
    #[error("interval should be >= 1ms")]
    ZeroInterval,

    #[error("multiplier should be > 1")]
    MultiplierTooSmall,

    #[error("max interval {max_ms}ms should be > initial interval {initial_ms}ms")]
    MaxNotAboveInitial { initial_ms: u64, max_ms: u64 },

    #[error("max interval {max_ms}ms should be > min interval {min_ms}ms")]
    MaxNotAboveMin { min_ms: u64, max_ms: u64 },

    #[error("custom backoff needs at least one delay value")]
    EmptyCustomDelays,
}

/// How retry-level delays grow along a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Every retry level is immediate.
    None,
    /// The same delay at every level.
    Fixed { interval_ms: u64 },
    /// `initial * multiplier^level`, capped at `max_ms`. With `random`, each
    /// level is stretched by a uniform factor in `[1, multiplier)`.
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
        random: bool,
    },
    /// Each level drawn uniformly from `[min_ms, max_ms)`.
    UniformRandom { min_ms: u64, max_ms: u64 },
    /// Explicit delays, the last one repeated if the chain is longer.
    Custom { delays_ms: Vec<u64> },
}

impl BackoffPolicy {
    #[must_use]
    pub const fn none() -> Self {
        Self::None
    }

    /// # Errors
    /// When `interval_ms` is zero.
    pub const fn fixed(interval_ms: u64) -> Result<Self, BackoffError> {
        if interval_ms == 0 {
            return Err(BackoffError::ZeroInterval);
        }
        Ok(Self::Fixed { interval_ms })
    }

    /// # Errors
    /// When the parameters are internally inconsistent.
    pub fn exponential(initial_ms: u64, multiplier: f64, max_ms: u64) -> Result<Self, BackoffError> {
        Self::exponential_inner(initial_ms, multiplier, max_ms, false)
    }

    /// Exponential with a random stretch per level.
    ///
    /// # Errors
    /// When the parameters are internally inconsistent.
    pub fn exponential_random(
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    ) -> Result<Self, BackoffError> {
        Self::exponential_inner(initial_ms, multiplier, max_ms, true)
    }

    fn exponential_inner(
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
        random: bool,
    ) -> Result<Self, BackoffError> {
        if initial_ms == 0 {
            return Err(BackoffError::ZeroInterval);
        }
        if multiplier <= 1.0 {
            return Err(BackoffError::MultiplierTooSmall);
        }
        if max_ms <= initial_ms {
            return Err(BackoffError::MaxNotAboveInitial { initial_ms, max_ms });
        }
        Ok(Self::Exponential {
            initial_ms,
            multiplier,
            max_ms,
            random,
        })
    }

    /// # Errors
    /// When `min_ms` is zero or `max_ms` does not exceed it.
    pub const fn uniform_random(min_ms: u64, max_ms: u64) -> Result<Self, BackoffError> {
        if min_ms == 0 {
            return Err(BackoffError::ZeroInterval);
        }
        if max_ms <= min_ms {
            return Err(BackoffError::MaxNotAboveMin { min_ms, max_ms });
        }
        Ok(Self::UniformRandom { min_ms, max_ms })
    }

    /// # Errors
    /// When `delays_ms` is empty.
    pub fn custom(delays_ms: Vec<u64>) -> Result<Self, BackoffError> {
        if delays_ms.is_empty() {
            return Err(BackoffError::EmptyCustomDelays);
        }
        Ok(Self::Custom { delays_ms })
    }

    /// The delay for each retry level of a chain with `max_attempts` total
    /// attempts (one fewer retry levels than attempts).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    #[must_use]
    pub fn delay_values(&self, max_attempts: u32) -> Vec<u64> {
        let levels = max_attempts.saturating_sub(1) as usize;
        match self {
            Self::None => vec![0; levels],
            Self::Fixed { interval_ms } => vec![*interval_ms; levels],
            Self::Exponential {
                initial_ms,
                multiplier,
                max_ms,
                random,
            } => {
                let mut rng = rand::rng();
                (0..levels)
                    .map(|level| {
                        let raw = (*initial_ms as f64) * multiplier.powi(level as i32);
                        let stretch = if *random {
                            rng.random_range(1.0..*multiplier)
                        } else {
                            1.0
                        };
                        ((raw * stretch).min(*max_ms as f64)) as u64
                    })
                    .collect()
            }
            Self::UniformRandom { min_ms, max_ms } => {
                let mut rng = rand::rng();
                (0..levels)
                    .map(|_| rng.random_range(*min_ms..*max_ms))
                    .collect()
            }
            Self::Custom { delays_ms } => {
                let last = delays_ms.last().copied().unwrap_or(0);
                (0..levels)
                    .map(|level| delays_ms.get(level).copied().unwrap_or(last))
                    .collect()
            }
        }
    }
}
