//! Binary search between time and event index.
//!
//! Both lookups compare on the time component only and run in O(log N).
//! The clamping at the two ends is deliberately asymmetric:
//!
//! - [`TimeIndex::first_at_or_after`] is a lower bound that clamps to the last
//!   index when `t` is past every event.
//! - [`TimeIndex::last_at_or_before`] is one before the upper bound and clamps
//!   to index 0 when `t` precedes every event.

use crate::types::Event;
use thiserror::Error;

/// Errors raised by index queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("index query on an empty event store")]
    EmptyStore,

    #[error("event index {index} out of range for {len} events")]
    OutOfRange { index: usize, len: usize },
}

/// A read-only search view over events sorted by time.
#[derive(Debug, Clone, Copy)]
pub struct TimeIndex<'a> {
    events: &'a [Event],
}

impl<'a> TimeIndex<'a> {
    /// Fails with [`IndexError::EmptyStore`] when `events` is empty.
    pub fn new(events: &'a [Event]) -> Result<Self, IndexError> {
        if events.is_empty() {
            return Err(IndexError::EmptyStore);
        }
        Ok(Self { events })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Index of the first event with time `>= t * norm_factor`.
    pub fn first_at_or_after(&self, t: f32, norm_factor: f32) -> usize {
        let key = t * norm_factor;
        let lower = self.events.partition_point(|e| e.t < key);
        lower.min(self.events.len() - 1)
    }

    /// Index of the last event with time `<= t * norm_factor`.
    pub fn last_at_or_before(&self, t: f32, norm_factor: f32) -> usize {
        let key = t * norm_factor;
        let upper = self.events.partition_point(|e| e.t <= key);
        upper.saturating_sub(1)
    }

    /// Time of event `index` divided by `unit_factor`.
    pub fn timestamp(&self, index: usize, unit_factor: f32) -> Result<f32, IndexError> {
        self.events
            .get(index)
            .map(|e| e.t / unit_factor)
            .ok_or(IndexError::OutOfRange {
                index,
                len: self.events.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn events_at(ts: &[f32]) -> Vec<Event> {
        ts.iter().map(|&t| Event::new(0.0, 0.0, t, true)).collect()
    }

    #[test]
    fn test_empty_store_is_a_precondition_error() {
        assert_eq!(TimeIndex::new(&[]).err(), Some(IndexError::EmptyStore));
    }

    #[test]
    fn test_exact_hits() {
        let events = events_at(&[0.0, 10.0, 20.0, 30.0]);
        let index = TimeIndex::new(&events).unwrap();
        assert_eq!(index.first_at_or_after(10.0, 1.0), 1);
        assert_eq!(index.last_at_or_before(10.0, 1.0), 1);
    }

    #[test]
    fn test_between_events() {
        let events = events_at(&[0.0, 10.0, 20.0, 30.0]);
        let index = TimeIndex::new(&events).unwrap();
        assert_eq!(index.first_at_or_after(5.0, 1.0), 1);
        assert_eq!(index.last_at_or_before(25.0, 1.0), 2);
    }

    #[test]
    fn test_out_of_range_clamping() {
        let events = events_at(&[0.0, 10.0, 20.0, 30.0]);
        let index = TimeIndex::new(&events).unwrap();
        assert_eq!(index.first_at_or_after(99.0, 1.0), 3);
        assert_eq!(index.last_at_or_before(-5.0, 1.0), 0);
        assert_eq!(index.first_at_or_after(-5.0, 1.0), 0);
        assert_eq!(index.last_at_or_before(99.0, 1.0), 3);
    }

    #[test]
    fn test_duplicate_timestamps() {
        let events = events_at(&[0.0, 5.0, 5.0, 5.0, 9.0]);
        let index = TimeIndex::new(&events).unwrap();
        assert_eq!(index.first_at_or_after(5.0, 1.0), 1);
        assert_eq!(index.last_at_or_before(5.0, 1.0), 3);
    }

    #[test]
    fn test_norm_factor_scales_query() {
        let events = events_at(&[0.0, 10.0, 20.0, 30.0]);
        let index = TimeIndex::new(&events).unwrap();
        assert_eq!(index.first_at_or_after(0.5, 20.0), 1);
        assert_eq!(index.timestamp(2, 2.0).unwrap(), 10.0);
        assert!(matches!(
            index.timestamp(4, 1.0),
            Err(IndexError::OutOfRange { index: 4, len: 4 })
        ));
    }

    proptest! {
        #[test]
        fn prop_results_bracket_query(
            mut ts in prop::collection::vec(0.0f32..1000.0, 1..64),
            t in -100.0f32..1100.0,
        ) {
            ts.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let events = events_at(&ts);
            let index = TimeIndex::new(&events).unwrap();

            let first = index.first_at_or_after(t, 1.0);
            let last = index.last_at_or_before(t, 1.0);
            prop_assert!(first < ts.len());
            prop_assert!(last < ts.len());

            if t <= ts[ts.len() - 1] {
                prop_assert!(ts[first] >= t);
                prop_assert!(first == 0 || ts[first - 1] < t);
            } else {
                prop_assert_eq!(first, ts.len() - 1);
            }

            if t >= ts[0] {
                prop_assert!(ts[last] <= t);
                prop_assert!(last == ts.len() - 1 || ts[last + 1] > t);
            } else {
                prop_assert_eq!(last, 0);
            }
        }
    }
}
