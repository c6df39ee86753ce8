//! Exponential backoff with jitter.
//!
//! See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing::{info, warn};
use rand::prelude::*;
use snafu::Snafu;
use std::time::Duration;

/// Parameters for [`Backoff`].
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(500),
            base: 3.,
        }
    }
}

/// Error returned once a bounded retry gives up.
#[derive(Debug, Snafu)]
#[snafu(display("'{task_name}' failed permanently after {attempts} attempts: {source}"))]
pub struct RetryError<E>
where
    E: std::error::Error + 'static,
{
    task_name: String,
    attempts: usize,
    source: E,
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of attempts performed before giving up.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Consume the wrapper, returning the last underlying error.
    pub fn into_inner(self) -> E {
        self.source
    }
}

/// Produces a sequence of sleep intervals that grow exponentially with
/// jitter, capped at the configured maximum.
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`.
    ///
    /// Uses [`rand::thread_rng()`] if no rng provided.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for.
    fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }

    /// Perform `operation`, retrying every error with a backoff sleep until
    /// it succeeds.
    pub async fn retry_all_errors<F, F1, B, E>(&mut self, task_name: &str, mut operation: F) -> B
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::error::Error + Send,
    {
        loop {
            // build the future first so `F` does not need to be `Sync`
            let fut = operation();

            let e = match fut.await {
                Ok(b) => break b,
                Err(e) => e,
            };

            let backoff = self.next();
            info!(
                e=%e,
                task_name,
                backoff_secs = backoff.as_secs(),
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Perform `operation` at most `max_attempts` times, sleeping a backoff
    /// interval between attempts. The last error is returned once the
    /// attempt budget is spent.
    pub async fn retry_with_limit<F, F1, B, E>(
        &mut self,
        task_name: &str,
        max_attempts: usize,
        mut operation: F,
    ) -> Result<B, RetryError<E>>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::error::Error + Send + 'static,
    {
        assert!(max_attempts > 0, "max_attempts must be at least 1");

        for attempt in 1..=max_attempts {
            let fut = operation();

            let e = match fut.await {
                Ok(b) => return Ok(b),
                Err(e) => e,
            };

            if attempt == max_attempts {
                warn!(e=%e, task_name, attempts = max_attempts, "request failed permanently");
                return Err(RetryError {
                    task_name: task_name.to_string(),
                    attempts: max_attempts,
                    source: e,
                });
            }

            let backoff = self.next();
            info!(
                e=%e,
                task_name,
                attempt,
                backoff_secs = backoff.as_secs(),
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }

        unreachable!("loop either returns or errors on the last attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_intervals_grow_to_the_cap() {
        let init_backoff_secs = 1.;
        let max_backoff_secs = 500.;
        let base = 3.;

        let config = BackoffConfig {
            init_backoff: Duration::from_secs_f64(init_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            base,
        };

        let assert_fuzzy_eq = |a: f64, b: f64| assert!((b - a).abs() < 0.0001, "{} != {}", a, b);

        // a static rng taking the minimum of the range stays at the floor
        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));
        for _ in 0..20 {
            assert_eq!(backoff.next().as_secs_f64(), init_backoff_secs);
        }

        // a static rng taking the maximum of the range grows by `base` per
        // round until the cap
        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));
        for i in 0..20 {
            let value = (base.powi(i) * init_backoff_secs).min(max_backoff_secs);
            assert_fuzzy_eq(backoff.next().as_secs_f64(), value);
        }
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("flaky"))]
    struct FlakyError;

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_succeeds_midway() {
        let attempts = AtomicUsize::new(0);
        let mut backoff = Backoff::new(&BackoffConfig::default());

        let got = backoff
            .retry_with_limit("flaky-op", 5, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FlakyError)
                    } else {
                        Ok(42_u32)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(got, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_gives_up() {
        let attempts = AtomicUsize::new(0);
        let mut backoff = Backoff::new(&BackoffConfig::default());

        let err = backoff
            .retry_with_limit("always-broken", 3, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FlakyError) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("failed permanently"));
    }
}
