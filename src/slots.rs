use std::ops::Range;

use chrono::{DateTime, Duration, Utc};

pub const SLOT_MINUTES: i64 = 30;

const SECS_PER_HOUR: f64 = 60. * 60.;
const SECS_PER_MIN: f64 = 60.;

pub trait DurationExt {
    fn num_hours_f64(&self) -> f64;
    fn num_minutes_f64(&self) -> f64;
}

impl DurationExt for Duration {
    fn num_hours_f64(&self) -> f64 {
        self.num_seconds() as f64 / SECS_PER_HOUR
    }

    fn num_minutes_f64(&self) -> f64 {
        self.num_seconds() as f64 / SECS_PER_MIN
    }
}

/// Fixed half-hour slot grid covering the planning horizon.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotGrid {
    start: DateTime<Utc>,
    len: usize,
}

impl SlotGrid {
    pub fn new(start: DateTime<Utc>, horizon_hours: i64) -> Self {
        Self {
            start,
            len: (horizon_hours * 60 / SLOT_MINUTES).max(0) as usize,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(SLOT_MINUTES * self.len as i64)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot length as a fraction of an hour, for kW ↔ kWh conversion.
    pub fn slot_hours(&self) -> f64 {
        SLOT_MINUTES as f64 / 60.0
    }

    pub fn slot_start(&self, index: usize) -> DateTime<Utc> {
        self.start + Duration::minutes(SLOT_MINUTES * index as i64)
    }

    pub fn slot_range(&self, index: usize) -> Range<DateTime<Utc>> {
        self.slot_start(index)..self.slot_start(index + 1)
    }

    /// Index of the slot containing `time`, if inside the horizon.
    pub fn slot_of(&self, time: DateTime<Utc>) -> Option<usize> {
        if time < self.start || time >= self.end() {
            return None;
        }
        Some(((time - self.start).num_minutes() / SLOT_MINUTES) as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Range<DateTime<Utc>>)> + '_ {
        (0..self.len).map(move |i| (i, self.slot_range(i)))
    }
}
