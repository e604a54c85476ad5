// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Logical time. There is exactly one clock in the system and it advances
//! by one tick at the start of every operation, so every recorded instant
//! -- transaction start and commit times, version commit times, failure and
//! recovery times, first-access times -- is comparable on a single axis.

use serde::{Deserialize, Serialize};

/// A point on the single logical time axis.
///
/// `Time`s are totally ordered and issued strictly monotonically by
/// [LogicalClock]; no two operations share one. Time zero is reserved for
/// the synthetic initial versions installed before any command runs.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Time(pub u64);

impl Time {
    pub const ZERO: Time = Time(0);
}

impl std::fmt::Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("t{}", self.0))
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// Issues the per-operation ticks. The previously-issued `Time` only ever
/// moves forward; callers observe the current instant with [LogicalClock::now]
/// between ticks.
#[derive(Clone, Debug, Default)]
pub struct LogicalClock {
    prev: Time,
}

impl LogicalClock {
    pub fn new() -> Self {
        LogicalClock { prev: Time::ZERO }
    }

    /// Advance the clock by one and return the new current instant.
    pub fn tick(&mut self) -> Time {
        self.prev = Time(self.prev.0 + 1);
        self.prev
    }

    /// The instant of the operation currently executing (the most recent
    /// tick), or time zero before the first operation.
    pub fn now(&self) -> Time {
        self.prev
    }
}
