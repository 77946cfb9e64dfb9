// Copyright 2024. The Tari Project

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long to wait before each reconnect attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    Fixed {
        #[serde(with = "duration_ms", rename = "delay_ms")]
        delay: Duration,
    },

    /// Delay grows by `multiplier` per consecutive failure up to `max`, then a
    /// random share of up to `jitter` (0.0..=1.0) is taken off.
    Exponential {
        #[serde(with = "duration_ms", rename = "initial_ms")]
        initial: Duration,
        #[serde(with = "duration_ms", rename = "max_ms")]
        max: Duration,
        multiplier: f64,
        jitter: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(flatten)]
    pub strategy: BackoffStrategy,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                initial: Duration::from_secs(5),
                max: Duration::from_secs(60),
                multiplier: 2.0,
                jitter: 0.2,
            },
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed { delay },
            max_attempts: None,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                initial,
                max,
                multiplier: 2.0,
                jitter: 0.0,
            },
            max_attempts: None,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        if let BackoffStrategy::Exponential { jitter: j, .. } = &mut self.strategy {
            *j = jitter.clamp(0.0, 1.0);
        }
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before reconnect attempt number `attempt` (1 for the first retry
    /// after a failure), or `None` once the attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if attempt > max_attempts {
                return None;
            }
        }

        let delay = match &self.strategy {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Exponential {
                initial,
                max,
                multiplier,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let grown = initial.as_secs_f64() * multiplier.max(1.0).powi(exponent);
                let capped = grown.min(max.as_secs_f64());
                let jitter = jitter.clamp(0.0, 1.0);
                let cut = if jitter > 0.0 {
                    capped * jitter * rand::thread_rng().gen::<f64>()
                } else {
                    0.0
                };
                Duration::from_secs_f64((capped - cut).max(0.0))
            }
        };
        Some(delay)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
