use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

/// Minimum spacing between calls for the same key.
#[derive(Debug)]
pub struct Throttle<K> {
    min_interval: TimeDelta,
    last_call: HashMap<K, DateTime<Utc>>,
}

impl<K: Eq + Hash> Throttle<K> {
    pub fn new(min_interval: TimeDelta) -> Self {
        Self {
            min_interval,
            last_call: HashMap::new(),
        }
    }

    /// Records the call and returns `Ok` when allowed; otherwise returns the
    /// time left until the key opens again.
    pub fn try_acquire(&mut self, key: K, now: DateTime<Utc>) -> Result<(), TimeDelta> {
        if let Some(last) = self.last_call.get(&key) {
            let elapsed = now - *last;
            if elapsed < self.min_interval {
                return Err(self.min_interval - elapsed);
            }
        }
        self.last_call.insert(key, now);
        Ok(())
    }

    pub fn reset(&mut self, key: &K) {
        self.last_call.remove(key);
    }
}

/// Coalesces bursts of triggers into one firing after a quiet period.
#[derive(Debug, Clone)]
pub struct Debouncer {
    quiet: TimeDelta,
    due_at: Option<DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(quiet: TimeDelta) -> Self {
        Self { quiet, due_at: None }
    }

    /// Pushes the firing time back to `now + quiet`.
    pub fn trigger(&mut self, now: DateTime<Utc>) {
        self.due_at = Some(now + self.quiet);
    }

    /// True exactly once per burst, when the quiet period has passed.
    pub fn poll(&mut self, now: DateTime<Utc>) -> bool {
        match self.due_at {
            Some(due) if now >= due => {
                self.due_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.due_at = None;
    }
}

/// At most `max_calls` inside any `window`.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    window: TimeDelta,
    max_calls: usize,
    calls: VecDeque<DateTime<Utc>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_calls: usize, window: TimeDelta) -> Self {
        Self {
            window,
            max_calls,
            calls: VecDeque::with_capacity(max_calls),
        }
    }

    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, TimeDelta::minutes(1))
    }

    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        while let Some(oldest) = self.calls.front() {
            if now - *oldest >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }

        if self.calls.len() >= self.max_calls {
            return false;
        }
        self.calls.push_back(now);
        true
    }

    pub fn in_window(&self) -> usize {
        self.calls.len()
    }
}

/// Capped exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based). `None` once the attempts
    /// are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let millis = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

/// Runs `op` until it succeeds, fails with an error `retryable` refuses, or the
/// backoff policy gives up. The first call is immediate; each failure waits
/// `policy.delay_for(n)` before the next one.
pub async fn retry_with_backoff<T, E, R, F, Fut>(
    policy: Backoff,
    label: &str,
    retryable: R,
    mut op: F,
) -> Result<T, E>
where
    R: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) => {
                debug!(operation = label, error = %err, "call failed; not retryable");
                return Err(err);
            }
            Err(err) => {
                attempt += 1;
                match policy.delay_for(attempt) {
                    Some(delay) => {
                        warn!(
                            operation = label,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "call failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeDelta, Utc};

    use super::{retry_with_backoff, Backoff, Debouncer, SlidingWindowLimiter, Throttle};
    use crate::error::AppError;

    #[test]
    fn throttle_blocks_inside_interval_per_key() {
        let now = Utc::now();
        let mut throttle = Throttle::new(TimeDelta::seconds(5));

        assert!(throttle.try_acquire("sync", now).is_ok());
        let remaining = throttle
            .try_acquire("sync", now + TimeDelta::seconds(2))
            .unwrap_err();
        assert_eq!(remaining, TimeDelta::seconds(3));
        assert!(throttle.try_acquire("location", now).is_ok());
        assert!(throttle.try_acquire("sync", now + TimeDelta::seconds(5)).is_ok());
    }

    #[test]
    fn debounce_fires_once_after_quiet_period() {
        let now = Utc::now();
        let mut debouncer = Debouncer::new(TimeDelta::milliseconds(1500));

        debouncer.trigger(now);
        debouncer.trigger(now + TimeDelta::milliseconds(1000));
        assert!(!debouncer.poll(now + TimeDelta::milliseconds(2000)));
        assert!(debouncer.poll(now + TimeDelta::milliseconds(2500)));
        assert!(!debouncer.poll(now + TimeDelta::milliseconds(5000)));
    }

    #[test]
    fn limiter_slides_its_window() {
        let now = Utc::now();
        let mut limiter = SlidingWindowLimiter::per_minute(2);

        assert!(limiter.try_acquire(now));
        assert!(limiter.try_acquire(now + TimeDelta::seconds(10)));
        assert!(!limiter.try_acquire(now + TimeDelta::seconds(30)));
        assert!(limiter.try_acquire(now + TimeDelta::seconds(60)));
        assert_eq!(limiter.in_window(), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = Backoff {
            initial: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(3),
            max_attempts: 4,
        };

        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for(5), None);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_after_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(Backoff::default(), "test", |_| true, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = Backoff {
            max_attempts: 2,
            ..Backoff::default()
        };

        let result: Result<(), String> = retry_with_backoff(policy, "test", |_| true, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            }
        })
        .await;

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_attempted_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), AppError> =
            retry_with_backoff(Backoff::default(), "test", AppError::is_transient, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Unauthorized("token expired".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
