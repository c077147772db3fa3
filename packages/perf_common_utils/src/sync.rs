use std::{
    cmp::min,
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// Configuration for attempting to retry handing an item over to a bounded container which may be full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// The sleep time in microseconds after the first failed attempt. Grows linearly with every attempt.
    /// - Defaults to 50us.
    pub base_sleep_us: u64,
    /// The max sleep time in microseconds between each retry.
    /// - Defaults to 5ms.
    pub max_sleep_us: u64,
    /// Overall max duration to attempt retries.
    /// - Use `None` to disable this check.
    /// - Defaults to 1 second.
    pub max_retry_duration_ms: Option<u64>,
    /// Overall number of attempts.
    /// - Use `None` to disable this check.
    /// - Defaults to 50 attempts.
    pub max_retry_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_sleep_us: 50,
            max_sleep_us: 5_000,
            max_retry_duration_ms: Some(1_000),
            max_retry_attempts: Some(50),
        }
    }
}

impl RetryConfig {
    fn sleep_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_micros(min(self.base_sleep_us.saturating_mul(attempt as u64), self.max_sleep_us))
    }
}

/// The item could not be handed over within the retry budget. The item is given back to the caller.
#[derive(Debug)]
pub struct RetryExhausted<T> {
    pub item: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Repeatedly calls `attempt` until it accepts the item or the retry budget from `config` is used up.
///
/// `attempt` must hand the item back when it is rejected. Returns the number of attempts made on success.
pub fn retry_with_backoff<T, F>(mut attempt: F, item: T, config: &RetryConfig) -> Result<u32, RetryExhausted<T>>
where
    F: FnMut(T) -> Result<(), T>,
{
    let start = Instant::now();
    let mut counter = 0_u32;
    let mut item = item;

    loop {
        counter += 1;
        match attempt(item) {
            Ok(()) => break Ok(counter),
            Err(rejected) => {
                let sleep_time = config.sleep_for_attempt(counter);

                // If reached max attempts, break.
                if let Some(max_attempts) = config.max_retry_attempts {
                    if counter >= max_attempts {
                        break Err(RetryExhausted {
                            item: rejected,
                            attempts: counter,
                            elapsed: start.elapsed(),
                        });
                    }
                }
                // If reached max allowed duration, break.
                if let Some(max_duration_ms) = config.max_retry_duration_ms {
                    if start.elapsed() + sleep_time >= Duration::from_millis(max_duration_ms) {
                        break Err(RetryExhausted {
                            item: rejected,
                            attempts: counter,
                            elapsed: start.elapsed(),
                        });
                    }
                }

                item = rejected;
                thread::sleep(sleep_time);
            }
        }
    }
}
