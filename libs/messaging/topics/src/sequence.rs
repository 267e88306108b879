//! Per-Origin Sequence Tracking
//!
//! Every relay numbers its publishes 1, 2, 3, ... per incarnation. A receiver
//! remembers, per origin node, the highest contiguous sequence seen plus a
//! bounded window of numbers that arrived ahead of it. Anything at or below
//! the contiguous mark, or already in the window, is a duplicate.

use cluster::NodeAddress;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Next in order
    Fresh,
    /// Arrived ahead of `expected`; still delivered
    Gap { expected: u64, received: u64 },
    Duplicate,
}

#[derive(Debug)]
struct OriginWindow {
    incarnation: Uuid,
    contiguous: u64,
    ahead: BTreeSet<u64>,
}

impl OriginWindow {
    fn new(incarnation: Uuid) -> Self {
        Self {
            incarnation,
            contiguous: 0,
            ahead: BTreeSet::new(),
        }
    }

    fn absorb(&mut self) {
        while self.ahead.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
    }
}

#[derive(Debug)]
pub struct SequenceTracker {
    window: usize,
    origins: HashMap<NodeAddress, OriginWindow>,
}

impl SequenceTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            origins: HashMap::new(),
        }
    }

    pub fn observe(&mut self, origin: &NodeAddress, incarnation: Uuid, sequence: u64) -> SequenceCheck {
        let window = self.window;
        let state = self
            .origins
            .entry(origin.clone())
            .or_insert_with(|| OriginWindow::new(incarnation));
        if state.incarnation != incarnation {
            // the origin's relay restarted and numbers from 1 again
            *state = OriginWindow::new(incarnation);
        }

        if sequence <= state.contiguous || state.ahead.contains(&sequence) {
            return SequenceCheck::Duplicate;
        }
        if sequence == state.contiguous + 1 {
            state.contiguous = sequence;
            state.absorb();
            return SequenceCheck::Fresh;
        }

        let expected = state.contiguous + 1;
        state.ahead.insert(sequence);
        if state.ahead.len() > window {
            // give up on the oldest hole
            if let Some(lowest) = state.ahead.pop_first() {
                state.contiguous = lowest;
                state.absorb();
            }
        }
        SequenceCheck::Gap {
            expected,
            received: sequence,
        }
    }

    pub fn forget(&mut self, origin: &NodeAddress) {
        self.origins.remove(origin);
    }

    pub fn highest_contiguous(&self, origin: &NodeAddress) -> Option<u64> {
        self.origins.get(origin).map(|state| state.contiguous)
    }

    /// Sequence after which `origin` must replay for this receiver to be
    /// complete; 0 for an unknown origin or a new incarnation
    pub fn resume_point(&self, origin: &NodeAddress, incarnation: Uuid) -> u64 {
        self.origins
            .get(origin)
            .filter(|state| state.incarnation == incarnation)
            .map(|state| state.contiguous)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn origin() -> NodeAddress {
        NodeAddress::new("10.0.0.1", 2551)
    }

    #[test]
    fn test_in_order_then_duplicate() {
        let mut tracker = SequenceTracker::new(16);
        let run = Uuid::new_v4();
        assert_eq!(tracker.observe(&origin(), run, 1), SequenceCheck::Fresh);
        assert_eq!(tracker.observe(&origin(), run, 2), SequenceCheck::Fresh);
        assert_eq!(tracker.observe(&origin(), run, 2), SequenceCheck::Duplicate);
        assert_eq!(tracker.observe(&origin(), run, 1), SequenceCheck::Duplicate);
    }

    #[test]
    fn test_gap_is_filled_later() {
        let mut tracker = SequenceTracker::new(16);
        let run = Uuid::new_v4();
        assert_eq!(tracker.observe(&origin(), run, 1), SequenceCheck::Fresh);
        assert_eq!(
            tracker.observe(&origin(), run, 3),
            SequenceCheck::Gap {
                expected: 2,
                received: 3
            }
        );
        assert_eq!(tracker.observe(&origin(), run, 3), SequenceCheck::Duplicate);
        assert_eq!(tracker.observe(&origin(), run, 2), SequenceCheck::Fresh);
        assert_eq!(tracker.highest_contiguous(&origin()), Some(3));
    }

    #[test]
    fn test_window_overflow_skips_hole() {
        let mut tracker = SequenceTracker::new(2);
        let run = Uuid::new_v4();
        tracker.observe(&origin(), run, 3);
        tracker.observe(&origin(), run, 4);
        tracker.observe(&origin(), run, 6);
        // 1 and 2 are abandoned, 3 and 4 become contiguous
        assert_eq!(tracker.highest_contiguous(&origin()), Some(4));
        assert_eq!(tracker.observe(&origin(), run, 2), SequenceCheck::Duplicate);
        assert_eq!(tracker.observe(&origin(), run, 5), SequenceCheck::Fresh);
        assert_eq!(tracker.highest_contiguous(&origin()), Some(6));
    }

    #[test]
    fn test_resume_point_tracks_incarnation() {
        let mut tracker = SequenceTracker::new(16);
        let run = Uuid::new_v4();
        assert_eq!(tracker.resume_point(&origin(), run), 0);
        tracker.observe(&origin(), run, 1);
        tracker.observe(&origin(), run, 2);
        tracker.observe(&origin(), run, 4);
        assert_eq!(tracker.resume_point(&origin(), run), 2);
        assert_eq!(tracker.resume_point(&origin(), Uuid::new_v4()), 0);
    }

    #[test]
    fn test_new_incarnation_restarts_numbering() {
        let mut tracker = SequenceTracker::new(16);
        tracker.observe(&origin(), Uuid::new_v4(), 1);
        assert_eq!(tracker.observe(&origin(), Uuid::new_v4(), 1), SequenceCheck::Fresh);
    }

    proptest! {
        #[test]
        fn prop_each_sequence_accepted_once(order in Just((1u64..=40).collect::<Vec<_>>()).prop_shuffle(),
                                            repeats in proptest::collection::vec(1u64..=40, 0..20)) {
            let mut tracker = SequenceTracker::new(64);
            let run = Uuid::new_v4();
            let mut accepted = 0;
            for sequence in order.iter().chain(repeats.iter()) {
                if tracker.observe(&origin(), run, *sequence) != SequenceCheck::Duplicate {
                    accepted += 1;
                }
            }
            prop_assert_eq!(accepted, 40);
            prop_assert_eq!(tracker.highest_contiguous(&origin()), Some(40));
        }
    }
}
