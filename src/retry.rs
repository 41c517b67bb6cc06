//! Bounded polling with exponential backoff and jitter.
//!
//! ACME servers validate challenges and issue certificates asynchronously, so
//! the client polls authorization and order state until it settles. The poll
//! is expressed as an operation that returns `Err` while the state is still
//! pending; [`retry_with_backoff`] keeps calling it until it succeeds or the
//! attempt budget runs out.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff configuration for polling an external system.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config with a fixed number of attempts and default delays
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Preset for ACME authorization and order polling
    ///
    /// Roughly two minutes in total, the same budget Let's Encrypt clients
    /// commonly give a validation before declaring it stuck.
    pub fn acme_polling() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
        }
    }
}

/// Delay schedule for a hand-written poll loop
///
/// Used where the polled state is borrowed mutably across attempts and so
/// cannot live inside a retry closure.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    /// Start a fresh schedule
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            attempt: 0,
            delay: config.initial_delay,
        }
    }

    /// Attempts recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and return the jittered delay before the next
    /// one, or `None` once the attempt budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts {
            return None;
        }

        // 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        Some(jittered)
    }

    /// Sleep until the next attempt; false once the budget is spent
    pub async fn wait(&mut self, operation_name: &str) -> bool {
        match self.next_delay() {
            Some(delay) => {
                debug!(
                    operation = %operation_name,
                    attempt = self.attempt,
                    delay_ms = delay.as_millis(),
                    "not settled yet, polling again"
                );
                tokio::time::sleep(delay).await;
                true
            }
            None => {
                warn!(
                    operation = %operation_name,
                    attempt = self.attempt,
                    "giving up after max attempts"
                );
                false
            }
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns the first `Ok`, or the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config);

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                debug!(operation = %operation_name, error = %e, "attempt failed");
                if !backoff.wait(operation_name).await {
                    return Err(e);
                }
            }
        }
    }
}
