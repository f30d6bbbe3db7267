//! Epoch boundaries: clocks, the weekly schedule, and the re-ingestion hook.
//!
//! The engine never reads the system time directly. It asks a [`Clock`],
//! maps the instant to an [`EpochKey`] through the [`WeeklySchedule`], and
//! rotates when the key differs from the active one. Tests drive time with
//! a [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};

use cavern_types::{EpochKey, HistoricalReport};
use chrono::{DateTime, TimeDelta, Utc, Weekday};
use futures::FutureExt as _;
use futures::future::BoxFuture;

/// Source of the current instant.
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Millisecond resolution.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// A clock frozen at `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::Release);
    }

    /// Move forward (or backward, for a negative delta) by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let step = delta.num_milliseconds();
        let _ = self
            .millis
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(step))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::Acquire))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Maps instants to epoch keys: one epoch per UTC calendar week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    starts_on: Weekday,
}

impl WeeklySchedule {
    /// Weeks starting on `starts_on`.
    pub const fn new(starts_on: Weekday) -> Self {
        Self { starts_on }
    }

    /// The configured first day of the week.
    pub const fn starts_on(self) -> Weekday {
        self.starts_on
    }

    /// Key of the epoch containing `now`.
    pub fn key_for(self, now: DateTime<Utc>) -> EpochKey {
        EpochKey::week_containing(now, self.starts_on)
    }
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        Self::new(Weekday::Mon)
    }
}

/// What a rotation did, handed to the [`ReingestHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationDetails {
    /// The epoch that was retired.
    pub previous: EpochKey,
    /// The epoch now active.
    pub current: EpochKey,
    /// Midnight UTC at the start of `current`.
    pub week_start: DateTime<Utc>,
    /// The last-scan marker at the time of rotation.
    pub last_scan: Option<DateTime<Utc>>,
}

/// Supplies historical reports to replay into a freshly rotated epoch.
///
/// Called with the engine's exclusive lock held, so the replay lands before
/// any new traffic. Reports dated before the new epoch's week start are
/// skipped by the engine.
pub trait ReingestHook: Send + Sync + 'static {
    /// Reports to ingest into `rotation.current`.
    fn reports<'a>(&'a self, rotation: &'a RotationDetails) -> BoxFuture<'a, Vec<HistoricalReport>>;
}

/// A hook that replays nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReplay;

impl ReingestHook for NoReplay {
    fn reports<'a>(&'a self, _rotation: &'a RotationDetails) -> BoxFuture<'a, Vec<HistoricalReport>> {
        futures::future::ready(Vec::new()).boxed()
    }
}
