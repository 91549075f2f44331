//! Bounded exponential backoff for calls to remote collaborators.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often, and how patiently, a failed call is repeated.
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first; 0 is treated as 1.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single wait.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor applied to each subsequent wait.
    pub backoff_multiplier: f64,
    /// Stretch each wait by up to a quarter to spread out retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt, never repeated.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Waits between consecutive attempts; yields `max_attempts - 1` items.
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            next: self.initial_delay,
            remaining: self.max_attempts.max(1) - 1,
        }
    }
}

/// Iterator over the waits of a [`RetryConfig`].
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    next: Duration,
    remaining: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base = self.next.min(self.config.max_delay);
        self.next = self
            .next
            .mul_f64(self.config.backoff_multiplier.max(1.0))
            .min(self.config.max_delay);

        if self.config.jitter {
            Some(base + base.mul_f64(jitter_fraction() * 0.25))
        } else {
            Some(base)
        }
    }
}

/// Pseudo-random value in `0.0..1.0` taken from the clock.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    f64::from(nanos % 1_000_000) / 1_000_000.0
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// the attempts in `config` are used up. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut waits = config.backoff();
    let mut attempt = 1u32;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !should_retry(&error) {
            debug!(attempt, error = %error, "Error is not retryable");
            return Err(error);
        }
        let Some(wait) = waits.next() else {
            warn!(attempt, error = %error, "Giving up");
            return Err(error);
        };

        warn!(attempt, error = %error, ?wait, "Attempt failed, retrying");
        sleep(wait).await;
        attempt += 1;
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GameMuseError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let waits: Vec<u128> = config.backoff().map(|d| d.as_millis()).collect();
        assert_eq!(waits, vec![100, 200, 300, 300]);
    }

    #[test]
    fn test_single_attempt_never_waits() {
        assert_eq!(RetryConfig::none().backoff().count(), 0);
        assert_eq!(quick(0).backoff().count(), 0);
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            jitter: true,
            ..quick(2)
        };
        let wait = config.backoff().next().unwrap();
        assert!(wait >= Duration::from_millis(1));
        assert!(wait <= Duration::from_micros(1250));
    }

    #[test]
    fn test_config_deserializes_millis() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 5, "initial_delay": 20}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(20));
        assert_eq!(config.max_delay, RetryConfig::default().max_delay);
    }

    #[tokio::test]
    async fn test_transient_network_errors_are_retried() {
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(&quick(3), GameMuseError::is_retryable, || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call < 3 {
                    Err(GameMuseError::network("connection reset"))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), GameMuseError> =
            retry_with_backoff(&quick(5), GameMuseError::is_retryable, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GameMuseError::sync("mutation rejected")) }
            })
            .await;

        assert_eq!(result.unwrap_err().category(), "sync");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), GameMuseError> =
            retry_with_backoff(&quick(2), GameMuseError::is_retryable, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GameMuseError::network("offline")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
