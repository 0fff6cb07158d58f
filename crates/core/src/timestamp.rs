// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Timestamps and timestamp bounds.
//!
//! Every packet on a stream carries a [`Timestamp`], and every stream tracks a
//! monotonically non-decreasing *next timestamp bound*: the minimum timestamp
//! any future packet on that stream could possibly carry. The scheduler's
//! readiness decisions are entirely comparisons in this one totally ordered
//! space, so the sentinel values live at the extremes of the `i64` range:
//!
//! `UNSET < UNSTARTED < PRE_STREAM < MIN <= finite <= MAX < POST_STREAM <
//! ONE_OVER_POST_STREAM < DONE`
//!
//! Only range values (`MIN..=MAX`) plus `PRE_STREAM` and `POST_STREAM` are
//! allowed on packets in a stream, and a `PRE_STREAM` or `POST_STREAM` packet
//! must be the only packet on its stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};

/// A point on a stream's totally ordered time axis.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

/// A signed distance between two [`Timestamp`]s, used for per-output offsets.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimestampDiff(i64);

impl Timestamp {
    /// No timestamp assigned. Disallowed on stream packets, required on
    /// stream headers.
    pub const UNSET: Self = Self(i64::MIN);
    /// The bound of a stream before its node has opened.
    pub const UNSTARTED: Self = Self(i64::MIN + 1);
    /// A packet conceptually before the start of the stream. Must be the only
    /// packet on its stream.
    pub const PRE_STREAM: Self = Self(i64::MIN + 2);
    /// The smallest normal stream timestamp.
    pub const MIN: Self = Self(i64::MIN + 3);
    /// The largest normal stream timestamp.
    pub const MAX: Self = Self(i64::MAX - 3);
    /// A packet conceptually after the end of the stream. Must be the only
    /// packet on its stream.
    pub const POST_STREAM: Self = Self(i64::MAX - 2);
    /// The successor of `POST_STREAM`; no packet may carry it.
    pub const ONE_OVER_POST_STREAM: Self = Self(i64::MAX - 1);
    /// Terminal bound: the stream is permanently complete.
    pub const DONE: Self = Self(i64::MAX);

    /// Creates a timestamp from a normal (range) value.
    ///
    /// # Panics
    ///
    /// Panics if `value` collides with one of the sentinel values. Sentinels
    /// are reachable through the associated constants only.
    pub fn new(value: i64) -> Self {
        let ts = Self(value);
        assert!(ts.is_range_value(), "timestamp value {value} collides with a sentinel");
        ts
    }

    /// The raw ordinal. Mostly useful for logging.
    pub const fn value(self) -> i64 {
        self.0
    }

    pub const fn is_unset(self) -> bool {
        self.0 == Self::UNSET.0
    }

    /// True for normal timestamps, i.e. `MIN..=MAX`.
    pub const fn is_range_value(self) -> bool {
        self.0 >= Self::MIN.0 && self.0 <= Self::MAX.0
    }

    /// True for the subset of values a stream packet may carry.
    pub const fn is_allowed_in_stream(self) -> bool {
        self.is_range_value()
            || self.0 == Self::PRE_STREAM.0
            || self.0 == Self::POST_STREAM.0
    }

    /// The smallest timestamp a later packet on the same stream may carry,
    /// given that a packet with this timestamp was just emitted.
    ///
    /// `PRE_STREAM` and `POST_STREAM` packets admit no successor, so both map
    /// to `ONE_OVER_POST_STREAM`.
    pub fn next_allowed_in_stream(self) -> Self {
        if self >= Self::MAX || self == Self::PRE_STREAM {
            Self::ONE_OVER_POST_STREAM
        } else if self < Self::MIN {
            Self::MIN
        } else {
            Self(self.0 + 1)
        }
    }

    /// The largest timestamp an earlier packet on the same stream may have
    /// carried, given that this value is the stream's current bound.
    pub fn previous_allowed_in_stream(self) -> Self {
        if self <= Self::MIN || self == Self::POST_STREAM {
            Self::UNSTARTED
        } else if self > Self::MAX {
            Self::MAX
        } else {
            Self(self.0 - 1)
        }
    }
}

impl TimestampDiff {
    pub const ZERO: Self = Self(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }
}

// Offset arithmetic saturates into the normal range so that a large offset
// near the boundaries yields MIN/MAX rather than wrapping into a sentinel.
impl Add<TimestampDiff> for Timestamp {
    type Output = Self;

    fn add(self, rhs: TimestampDiff) -> Self {
        let v = self.0.saturating_add(rhs.0);
        Self(v.clamp(Self::MIN.0, Self::MAX.0))
    }
}

impl AddAssign<TimestampDiff> for Timestamp {
    fn add_assign(&mut self, rhs: TimestampDiff) {
        *self = *self + rhs;
    }
}

impl Sub<TimestampDiff> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: TimestampDiff) -> Self {
        let v = self.0.saturating_sub(rhs.0);
        Self(v.clamp(Self::MIN.0, Self::MAX.0))
    }
}

impl Sub for Timestamp {
    type Output = TimestampDiff;

    fn sub(self, rhs: Self) -> TimestampDiff {
        TimestampDiff(self.0.saturating_sub(rhs.0))
    }
}

impl Add for TimestampDiff {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Neg for TimestampDiff {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSET => write!(f, "Timestamp::UNSET"),
            Self::UNSTARTED => write!(f, "Timestamp::UNSTARTED"),
            Self::PRE_STREAM => write!(f, "Timestamp::PRE_STREAM"),
            Self::MIN => write!(f, "Timestamp::MIN"),
            Self::MAX => write!(f, "Timestamp::MAX"),
            Self::POST_STREAM => write!(f, "Timestamp::POST_STREAM"),
            Self::ONE_OVER_POST_STREAM => write!(f, "Timestamp::ONE_OVER_POST_STREAM"),
            Self::DONE => write!(f, "Timestamp::DONE"),
            Self(v) => write!(f, "Timestamp({v})"),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Debug for TimestampDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimestampDiff({})", self.0)
    }
}
