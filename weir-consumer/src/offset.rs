//! Offset tracking for the intake path.

use crate::config::PartitionAssignment;
use std::collections::HashMap;
use weir_core::{Offset, PartitionId};

/// Tracks the next-fetch position per assigned partition.
///
/// Positions only move forward; the snapshot taken at batch close becomes
/// that batch's commit marks.
#[derive(Debug)]
pub struct OffsetTracker {
    positions: HashMap<PartitionId, Offset>,
}

impl OffsetTracker {
    /// Create a tracker seeded from the partition assignments.
    #[must_use]
    pub fn new(assignments: &[PartitionAssignment]) -> Self {
        Self {
            positions: assignments
                .iter()
                .map(|assignment| (assignment.partition, assignment.start_offset))
                .collect(),
        }
    }

    /// Next offset to fetch for a partition.
    #[must_use]
    pub fn position(&self, partition: PartitionId) -> Offset {
        self.positions.get(&partition).copied().unwrap_or_default()
    }

    /// Advance a partition's position. Stale updates are ignored.
    pub fn advance(&mut self, partition: PartitionId, next: Offset) {
        let entry = self.positions.entry(partition).or_default();
        if next > *entry {
            *entry = next;
        }
    }

    /// Snapshot of all current positions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(PartitionId, Offset)> {
        self.positions.iter().map(|(partition, offset)| (*partition, *offset)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignments() -> Vec<PartitionAssignment> {
        vec![
            PartitionAssignment::new(PartitionId::new(0), Offset::new(10)),
            PartitionAssignment::new(PartitionId::new(1), Offset::new(0)),
        ]
    }

    #[test]
    fn test_seeded_positions() {
        let tracker = OffsetTracker::new(&assignments());
        assert_eq!(tracker.position(PartitionId::new(0)), Offset::new(10));
        assert_eq!(tracker.position(PartitionId::new(1)), Offset::new(0));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut tracker = OffsetTracker::new(&assignments());
        tracker.advance(PartitionId::new(0), Offset::new(15));
        tracker.advance(PartitionId::new(0), Offset::new(12));
        assert_eq!(tracker.position(PartitionId::new(0)), Offset::new(15));
    }

    #[test]
    fn test_snapshot_covers_all_partitions() {
        let tracker = OffsetTracker::new(&assignments());
        let mut snapshot = tracker.snapshot();
        snapshot.sort_by_key(|(partition, _)| partition.value());
        assert_eq!(
            snapshot,
            vec![
                (PartitionId::new(0), Offset::new(10)),
                (PartitionId::new(1), Offset::new(0)),
            ]
        );
    }
}
