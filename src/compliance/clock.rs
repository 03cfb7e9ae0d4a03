//! Wall-clock sources for the compliance gate.

use std::fmt::Debug;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Supplies the current UTC time.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The host's real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that starts at a fixed instant and advances with tokio's timer.
///
/// Under a paused tokio runtime the wall clock moves only when tokio's clock
/// does, which makes windowed waits deterministic.
#[derive(Debug, Clone)]
pub struct ShiftedClock {
    base: DateTime<Utc>,
    origin: Instant,
}

impl ShiftedClock {
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: Instant::now(),
        }
    }
}

impl Clock for ShiftedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::zero());
        self.base + elapsed
    }
}
