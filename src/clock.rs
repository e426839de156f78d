// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Timestamp;
use async_std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Trait to support multiple sorts of clock-source.
pub trait Clock: Send + Sync {
    fn current_time(&self) -> SystemTime;
}

/// An implementation of [Clock] that calls [std::time::SystemTime::now].
pub struct RealClock;
impl Clock for RealClock {
    fn current_time(&self) -> SystemTime {
        std::time::SystemTime::now()
    }
}

/// An implementation of [Clock] that holds a shared [AtomicU64] representing
/// the current millisecond count since the epoch, that increments on each
/// call to `Clock::current_time`.
pub struct TestClock(Arc<AtomicU64>);
impl TestClock {
    pub fn new() -> Self {
        TestClock(Arc::new(AtomicU64::from(0)))
    }
}
impl Clock for TestClock {
    fn current_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// An implementation of [Clock] that only moves when told to. Clones share
/// the same underlying time, so a test can hold one and hand another to the
/// code under test.
#[derive(Clone)]
pub struct ManualClock(Arc<AtomicU64>);
impl ManualClock {
    pub fn new(milli_secs: u64) -> Self {
        ManualClock(Arc::new(AtomicU64::from(milli_secs)))
    }
    pub fn set(&self, milli_secs: u64) {
        self.0.store(milli_secs, Ordering::SeqCst)
    }
    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}
impl Clock for ManualClock {
    fn current_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.0.load(Ordering::SeqCst))
    }
}

/// A hybrid logical clock. Each reading is the maximum of the wall clock and
/// the successor of everything previously issued or merged, so readings are
/// strictly increasing and causally ordered after any merged remote
/// timestamp, without needing synchronized clocks.
///
/// `CausalClock` itself is a plain value; callers that share one across tasks
/// wrap it in a lock and must not hold that lock across an await point.
pub struct CausalClock {
    /// The clock source we'll use to draw system time from.
    clock: Box<dyn Clock>,

    /// The previously-issued or merged Timestamp, will only advance
    /// monotonically regardless of movement of the clock.
    last: Timestamp,
}

impl CausalClock {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        CausalClock {
            clock,
            last: Timestamp::default(),
        }
    }

    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// Reads the wall clock as a [Timestamp]. A wall clock set before the
    /// epoch reads as zero and the logical counter takes over.
    fn wall_time(&self) -> Timestamp {
        let now = self.clock.current_time();
        match now.duration_since(UNIX_EPOCH) {
            Err(_) => Timestamp::default(),
            Ok(dur) => {
                let ms = dur
                    .as_secs()
                    .saturating_mul(1000)
                    .saturating_add(dur.subsec_millis() as u64);
                Timestamp::at_milli_sec(ms)
            }
        }
    }

    /// Issues `max(last + 1, now)` and records it as the new `last`.
    pub fn read_clock(&mut self) -> Timestamp {
        let next = std::cmp::max(self.last.next_event(), self.wall_time());
        self.last = next;
        next
    }

    /// Issues `max(last + 1, external + 1, now)` and records it as the new
    /// `last`.
    pub fn merge_and_read_clock(&mut self, external: Timestamp) -> Timestamp {
        let floor = std::cmp::max(self.last, external).next_event();
        let next = std::cmp::max(floor, self.wall_time());
        self.last = next;
        next
    }

    /// Advances the clock past `external` without issuing a reading.
    pub fn merge(&mut self, external: Timestamp) {
        if external > self.last {
            self.last = external;
        }
    }
}

#[test]
fn test_read_clock_strictly_increasing() {
    // A stalled wall clock must not stall the readings.
    let mut c = CausalClock::new(Box::new(ManualClock::new(1000)));
    let mut prev = c.read_clock();
    assert_eq!(prev, Timestamp::new(1000, 0));
    for _ in 0..100 {
        let t = c.read_clock();
        assert!(t > prev);
        prev = t;
    }
    assert_eq!(prev, Timestamp::new(1000, 100));
}

#[test]
fn test_read_clock_follows_wall_clock() {
    let wall = ManualClock::new(1000);
    let mut c = CausalClock::new(Box::new(wall.clone()));
    c.read_clock();
    c.read_clock();
    wall.set(2000);
    assert_eq!(c.read_clock(), Timestamp::new(2000, 0));

    // Wall clock moving backwards is ignored.
    wall.set(500);
    assert_eq!(c.read_clock(), Timestamp::new(2000, 1));
}

#[test]
fn test_merge_behind_current() {
    let mut c = CausalClock::new(Box::new(ManualClock::new(1000)));
    let current = c.read_clock();
    let t = c.merge_and_read_clock(Timestamp::new(10, 7));
    assert_eq!(t, current.next_event());
}

#[test]
fn test_merge_ahead_of_current() {
    let mut c = CausalClock::new(Box::new(ManualClock::new(1000)));
    c.read_clock();
    let ext = Timestamp::new(5000, 3);
    let t = c.merge_and_read_clock(ext);
    assert_eq!(t, ext.next_event());
    assert!(c.read_clock() > t);
}

#[test]
fn test_merge_without_reading() {
    let mut c = CausalClock::new(Box::new(ManualClock::new(1000)));
    c.merge(Timestamp::new(3000, 0));
    assert_eq!(c.last(), Timestamp::new(3000, 0));
    c.merge(Timestamp::new(10, 0));
    assert_eq!(c.last(), Timestamp::new(3000, 0));
    assert_eq!(c.read_clock(), Timestamp::new(3000, 1));
}

#[test]
fn test_clock_with_test_clock() {
    let mut c = CausalClock::new(Box::new(TestClock::new()));
    let a = c.read_clock();
    let b = c.read_clock();
    assert!(a < b);
}
