//! Abstraction over the system clock so that every age threshold and
//! timestamp in the sink can be driven deterministically in tests.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::Duration;

/// An instant in wall-clock time with nanosecond precision.
///
/// Wraps a UTC [`DateTime`] so arithmetic never depends on the local
/// timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Create from the number of nanoseconds since the unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Create from the number of milliseconds since the unix epoch.
    ///
    /// # Panics
    ///
    /// Panics if the value is outside the representable date range.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(
            Utc.timestamp_millis_opt(millis)
                .single()
                .expect("timestamp in range"),
        )
    }

    /// Nanoseconds since the unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Milliseconds since the unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The wrapped [`DateTime`].
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }

    /// Elapsed duration since `earlier`, or `None` if `earlier` is in the
    /// future relative to `self`.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }

    /// Add a duration, `None` on overflow.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(duration).map(Self)
    }

    /// Subtract a duration, `None` on overflow.
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_sub_signed(duration).map(Self)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.checked_add(rhs).expect("timestamp overflow")
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        self.checked_sub(rhs).expect("timestamp underflow")
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A source of the current time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// [`TimeProvider`] reporting a manually controlled instant, for tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider frozen at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Replace the reported time.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }

    /// Advance the reported time, returning the new value.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

impl TimeProvider for Arc<MockProvider> {
    fn now(&self) -> Time {
        self.as_ref().now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_conversion_round_trips() {
        let t = Time::from_timestamp_nanos(3_600_000_000_123);
        assert_eq!(t.timestamp_nanos(), 3_600_000_000_123);
        assert_eq!(t.timestamp_millis(), 3_600_000);
        assert_eq!(Time::from_timestamp_millis(3_600_000).timestamp_millis(), 3_600_000);
    }

    #[test]
    fn duration_since_is_directional() {
        let t0 = Time::from_timestamp_nanos(0);
        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(t1.checked_duration_since(t0), Some(Duration::from_secs(5)));
        assert_eq!(t0.checked_duration_since(t1), None);
    }

    #[test]
    fn system_provider_advances() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }

    #[test]
    fn mock_provider_is_frozen_until_moved() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now(), provider.now());

        provider.inc(Duration::from_secs(1));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(1_000_000_000));

        provider.set(Time::from_timestamp_millis(42));
        assert_eq!(provider.now().timestamp_millis(), 42);
    }
}
