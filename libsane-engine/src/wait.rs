//! Readiness polling with a bounded retry budget.

use crate::result::{Result, SaneError};
use std::{
    fmt,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: f64, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay to sleep after the `retry`-th busy reply (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max } => {
                let scaled = self.delay.as_secs_f64() * factor.powi(retry as i32);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
        }
    }
}

/// Source of delays, replaceable in tests.
pub trait Sleeper: Send {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Sleeper recording requested delays instead of sleeping.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper(Arc<Mutex<Vec<Duration>>>);

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.0.lock().map(|delays| delays.clone()).unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) {
        if let Ok(mut delays) = self.0.lock() {
            delays.push(duration);
        }
    }
}

/// What a single readiness probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Busy,
}

/// Probe until ready, sleeping between busy replies. Returns the probe's value
/// and the number of retries performed. Errors other than busy end the wait.
pub fn wait_until_ready<T, F>(
    policy: &RetryPolicy,
    sleeper: &mut dyn Sleeper,
    what: impl fmt::Display,
    mut probe: F,
) -> Result<(T, u32)>
where
    F: FnMut() -> Result<Probe<T>>,
{
    let mut retries = 0;

    loop {
        match probe()? {
            Probe::Ready(value) => {
                if retries > 0 {
                    log::debug!("{what} ready after {retries} retries");
                }
                return Ok((value, retries));
            }
            Probe::Busy if retries + 1 >= policy.attempts => {
                log::warn!("{what} still busy after {} attempts, give up", policy.attempts);
                return Err(SaneError::IO);
            }
            Probe::Busy => {
                let delay = policy.delay_for(retries);
                log::debug!("{what} busy, retry in {delay:?}");
                sleeper.sleep(delay);
                retries += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_busy_then_ready() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(100));
        let mut sleeper = RecordingSleeper::default();
        let mut replies = vec![Probe::Busy, Probe::Busy, Probe::Ready(7)].into_iter();

        let result = wait_until_ready(&policy, &mut sleeper, "device", || {
            Ok(replies.next().unwrap())
        });

        assert_eq!(result, Ok((7, 2)));
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(100); 2]);
    }

    #[test]
    fn test_budget_exhausted() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let mut sleeper = RecordingSleeper::default();
        let mut probes = 0;

        let result: Result<((), u32)> = wait_until_ready(&policy, &mut sleeper, "device", || {
            probes += 1;
            Ok(Probe::Busy)
        });

        assert_eq!(result, Err(SaneError::IO));
        assert_eq!(probes, 3);
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = RetryPolicy {
            attempts: 10,
            delay: Duration::from_millis(100),
            backoff: Backoff::Exponential {
                factor: 2.0,
                max: Duration::from_millis(500),
            },
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn test_error_ends_wait() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let mut sleeper = RecordingSleeper::default();

        let result: Result<((), u32)> =
            wait_until_ready(&policy, &mut sleeper, "device", || Err(SaneError::NoDocs));

        assert_eq!(result, Err(SaneError::NoDocs));
    }
}
