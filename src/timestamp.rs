// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};

/// Timestamps are the fundamental timekeeping type in the system.
///
/// They have some interesting properties:
///
///   - They are totally ordered.
///   - They are issued monotonically-increasing by a [crate::CausalClock]:
///     there's an event-counter at the end in case real time moves backwards
///     or stalls, or an observed remote timestamp is ahead of local time.
///   - They are issued at each agent and participant _without_ coordination.
///     Clocks do not need to be synchronized; a participant that sees a
///     timestamp from the future simply merges it and continues from there.
///
/// A transaction's `Timestamp` serves both as its snapshot time and as the
/// total order participants use to detect conflicts. Uniqueness is not
/// required of it: transactions are identified by their
/// [crate::TransactionId].
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub milli_secs: u64,
    pub event: u64,
}

impl std::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}.{}", self.milli_secs, self.event))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl Timestamp {
    pub fn new(milli_secs: u64, event: u64) -> Timestamp {
        Timestamp { milli_secs, event }
    }

    /// The timestamp a bare wall-clock reading corresponds to: the first
    /// event slot of that millisecond.
    pub fn at_milli_sec(milli_secs: u64) -> Timestamp {
        Timestamp::new(milli_secs, 0)
    }

    pub fn with_event(&self, event: u64) -> Timestamp {
        Self { event, ..*self }
    }

    /// The smallest timestamp strictly greater than `self`. This is the "+1"
    /// of the hybrid logical clock. Saturates at the largest representable
    /// timestamp, which is returned unchanged.
    pub fn next_event(&self) -> Timestamp {
        match (self.milli_secs, self.event) {
            (u64::MAX, u64::MAX) => *self,
            (ms, u64::MAX) => Timestamp::new(ms + 1, 0),
            (_, v) => self.with_event(v + 1),
        }
    }

    pub fn prev_event(&self) -> Timestamp {
        match (self.milli_secs, self.event) {
            (0, 0) => *self,
            (ms, 0) => Timestamp::new(ms - 1, u64::MAX),
            (_, v) => self.with_event(v - 1),
        }
    }
}

#[test]
fn test_timestamp_order() {
    let a = Timestamp::new(10, 0);
    let b = Timestamp::new(10, 1);
    let c = Timestamp::new(11, 0);
    assert!(a < b);
    assert!(b < c);
    assert_eq!(a.next_event(), b);
    assert_eq!(b.prev_event(), a);
    assert_eq!(Timestamp::new(10, u64::MAX).next_event(), c);
    assert_eq!(c.prev_event(), Timestamp::new(10, u64::MAX));
    assert_eq!(format!("{:?}", b), "10.1");
}

#[test]
fn test_next_event_saturates() {
    let top = Timestamp::new(u64::MAX, u64::MAX);
    assert_eq!(top.next_event(), top);
    assert_eq!(Timestamp::new(u64::MAX, u64::MAX - 1).next_event(), top);
    assert_eq!(
        Timestamp::new(u64::MAX - 1, u64::MAX).next_event(),
        Timestamp::new(u64::MAX, 0)
    );
}
