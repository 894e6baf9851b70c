//! Promotion candidate selection

use std::cmp::Ordering;

use crate::error::{Error, Result};

use super::gtid::GtidPosition;

/// GTID position reported by a reachable replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaPosition {
    pub index: i32,
    pub gtid: GtidPosition,
}

impl ReplicaPosition {
    pub fn new(index: i32, gtid: GtidPosition) -> Self {
        Self { index, gtid }
    }
}

/// Pick the most advanced replica; ties go to the lowest ordinal.
///
/// An empty input yields `Error::NoEligibleCandidate`, which callers treat as
/// terminal for the current cycle.
pub fn select_candidate(replicas: &[ReplicaPosition]) -> Result<i32> {
    replicas
        .iter()
        .max_by(|a, b| match a.gtid.cmp_progress(&b.gtid) {
            Ordering::Equal => b.index.cmp(&a.index),
            decided => decided,
        })
        .map(|r| r.index)
        .ok_or(Error::NoEligibleCandidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(index: i32, gtid: &str) -> ReplicaPosition {
        ReplicaPosition::new(index, gtid.parse().unwrap())
    }

    #[test]
    fn test_most_advanced_wins_with_lowest_index_on_tie() {
        let replicas = vec![replica(0, "0-1-5"), replica(1, "0-1-9"), replica(2, "0-1-9")];
        assert_eq!(select_candidate(&replicas).unwrap(), 1);
    }

    #[test]
    fn test_tie_break_independent_of_input_order() {
        let replicas = vec![replica(2, "0-1-9"), replica(1, "0-1-9"), replica(0, "0-1-5")];
        assert_eq!(select_candidate(&replicas).unwrap(), 1);
    }

    #[test]
    fn test_single_replica() {
        assert_eq!(select_candidate(&[replica(2, "0-1-12")]).unwrap(), 2);
    }

    #[test]
    fn test_no_replicas_is_no_eligible_candidate() {
        assert!(matches!(
            select_candidate(&[]),
            Err(Error::NoEligibleCandidate)
        ));
    }
}
