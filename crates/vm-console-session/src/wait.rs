//! Condition polling: sample an operation until it yields what the caller wants.
//!
//! [`TimeoutSampler`] is the single "retry until condition or timeout"
//! primitive. It is an iterator over sampled values, so callers can either
//! loop over it and `break` when satisfied, or use the one-shot helpers
//! [`TimeoutSampler::wait_for`] and [`TimeoutSampler::wait_until_true`].
//!
//! Errors returned by the sampled operation are transient by default: they
//! are logged and the loop keeps going. [`TimeoutSampler::retry_on`] narrows
//! that set; any other error aborts the wait.

use std::fmt::{Debug, Display};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use vm_console_core::Error;

/// Default pause between samples.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Classification of one call to the sampled operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample<T, E> {
    /// The operation produced a value
    Ready(T),
    /// The operation failed in a way worth retrying
    Transient(E),
    /// The operation failed definitively
    Fatal(E),
}

/// Bookkeeping for the most recent sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollAttempt {
    /// Number of samples taken so far
    pub number: u32,
    /// Time since the first sample
    pub elapsed: Duration,
    /// Debug rendering of the last value
    pub last_value: Option<String>,
    /// Display rendering of the last transient error
    pub last_error: Option<String>,
}

impl PollAttempt {
    /// Most informative description of the last observed state.
    pub fn last_state(&self) -> String {
        match (&self.last_error, &self.last_value) {
            (Some(err), _) => format!("error: {err}"),
            (None, Some(value)) => format!("value: {value}"),
            (None, None) => "no samples".to_string(),
        }
    }
}

/// Why a poll ended without a satisfying value.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The timeout elapsed
    #[error("Timed out after {timeout:?} ({} attempts); last {}", .attempt.number, .attempt.last_state())]
    TimeoutExpired {
        /// Configured timeout
        timeout: Duration,
        /// State at expiry
        attempt: PollAttempt,
    },

    /// The operation returned a non-retryable error
    #[error("Sampled operation failed: {0}")]
    Aborted(E),
}

impl<E: Into<Error>> From<PollError<E>> for Error {
    fn from(err: PollError<E>) -> Self {
        match err {
            PollError::TimeoutExpired { timeout, attempt } => Error::TimeoutExpired {
                timeout_ms: timeout.as_millis() as u64,
                attempts: attempt.number,
                last_state: attempt.last_state(),
            },
            PollError::Aborted(e) => e.into(),
        }
    }
}

/// Tracks a fixed deadline across several blocking steps.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    /// Time since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The total budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

type RetryPredicate<E> = Box<dyn Fn(&E) -> bool + Send>;

/// Repeatedly samples `op` until the caller is satisfied or time runs out.
///
/// The first sample is taken immediately; later ones are `interval` apart.
/// Once the timeout elapses the iterator yields a single
/// [`PollError::TimeoutExpired`] and is exhausted afterwards.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use vm_console_session::TimeoutSampler;
///
/// let mut calls = 0;
/// let value = TimeoutSampler::new(Duration::from_secs(10), || -> Result<u32, String> {
///     calls += 1;
///     Ok(calls)
/// })
/// .with_interval(Duration::from_millis(50))
/// .wait_for(|n| *n >= 3)
/// .unwrap();
/// assert_eq!(value, 3);
/// ```
pub struct TimeoutSampler<T, E, F>
where
    F: FnMut() -> Result<T, E>,
{
    op: F,
    timeout: Duration,
    interval: Duration,
    retry_on: Option<RetryPredicate<E>>,
    start: Option<Instant>,
    attempt: PollAttempt,
    finished: bool,
}

impl<T, E, F> TimeoutSampler<T, E, F>
where
    T: Debug,
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    /// Sample `op` for at most `timeout`.
    pub fn new(timeout: Duration, op: F) -> Self {
        Self {
            op,
            timeout,
            interval: DEFAULT_INTERVAL,
            retry_on: None,
            start: None,
            attempt: PollAttempt::default(),
            finished: false,
        }
    }

    /// Set the pause between samples.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Only retry errors matching `predicate`; others abort the wait.
    pub fn retry_on(mut self, predicate: impl Fn(&E) -> bool + Send + 'static) -> Self {
        self.retry_on = Some(Box::new(predicate));
        self
    }

    /// State of the most recent sample.
    pub fn attempt(&self) -> &PollAttempt {
        &self.attempt
    }

    /// Call the operation once and classify the outcome.
    pub fn sample(&mut self) -> Sample<T, E> {
        match (self.op)() {
            Ok(value) => Sample::Ready(value),
            Err(e) => match &self.retry_on {
                Some(predicate) if !predicate(&e) => Sample::Fatal(e),
                _ => Sample::Transient(e),
            },
        }
    }

    /// Return the first sampled value accepted by `predicate`.
    pub fn wait_for(mut self, mut predicate: impl FnMut(&T) -> bool) -> Result<T, PollError<E>> {
        loop {
            match self.next() {
                Some(Ok(value)) if predicate(&value) => return Ok(value),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e),
                None => return Err(self.expire()),
            }
        }
    }

    fn expire(&mut self) -> PollError<E> {
        self.finished = true;
        warn!(
            "Condition not met after {:?} ({} attempts); last {}",
            self.timeout,
            self.attempt.number,
            self.attempt.last_state()
        );
        PollError::TimeoutExpired {
            timeout: self.timeout,
            attempt: self.attempt.clone(),
        }
    }
}

impl<E, F> TimeoutSampler<bool, E, F>
where
    E: Display,
    F: FnMut() -> Result<bool, E>,
{
    /// Wait until the operation returns `true`.
    pub fn wait_until_true(self) -> Result<(), PollError<E>> {
        self.wait_for(|ready| *ready).map(|_| ())
    }
}

impl<T, E, F> Iterator for TimeoutSampler<T, E, F>
where
    T: Debug,
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    type Item = Result<T, PollError<E>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let start = *self.start.get_or_insert_with(Instant::now);

        loop {
            if self.attempt.number > 0 {
                let elapsed = start.elapsed();
                if elapsed >= self.timeout {
                    return Some(Err(self.expire()));
                }
                std::thread::sleep(self.interval.min(self.timeout - elapsed));
                if start.elapsed() >= self.timeout {
                    return Some(Err(self.expire()));
                }
            }

            self.attempt.number += 1;
            self.attempt.elapsed = start.elapsed();

            match self.sample() {
                Sample::Ready(value) => {
                    debug!("Sample {}: {:?}", self.attempt.number, value);
                    self.attempt.last_value = Some(format!("{value:?}"));
                    self.attempt.last_error = None;
                    return Some(Ok(value));
                }
                Sample::Transient(e) => {
                    warn!("Sample {} failed, retrying: {}", self.attempt.number, e);
                    self.attempt.last_error = Some(e.to_string());
                }
                Sample::Fatal(e) => {
                    warn!("Sample {} failed, giving up: {}", self.attempt.number, e);
                    self.finished = true;
                    return Some(Err(PollError::Aborted(e)));
                }
            }
        }
    }
}
