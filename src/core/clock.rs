// src/core/clock.rs

//! A small clock abstraction so that every wall-clock read in the decision
//! path goes through an injectable source. Production uses [`SystemClock`];
//! tests drive the timers with a [`ManualClock`].

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// An immutable view of the clock taken once per decision, so that a single
/// engine invocation sees one consistent `now`.
#[derive(Debug, Clone, Copy)]
pub struct ClockView {
    pub now: Instant,
    pub process_start: Instant,
}

/// Source of the two time references the predicates need: the current time
/// and the coordinator's process start time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    fn process_start(&self) -> Instant;

    fn view(&self) -> ClockView {
        ClockView {
            now: self.now(),
            process_start: self.process_start(),
        }
    }
}

/// The real clock. Process start is captured at construction.
#[derive(Debug)]
pub struct SystemClock {
    started_at: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn process_start(&self) -> Instant {
        self.started_at
    }
}

/// A clock that only moves when told to. Process start is the construction
/// instant, so `advance` also widens the distance from the startup-grace
/// window, exactly as elapsed real time would.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn process_start(&self) -> Instant {
        self.base
    }
}
