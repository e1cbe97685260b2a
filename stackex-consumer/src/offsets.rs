use std::collections::{BTreeMap, HashMap};

use crate::delivery::Verdict;

/// Tracks in-flight offsets for one partition and yields the offset that is
/// safe to commit: one past the longest contiguous run of acknowledged messages.
///
/// Every delivery of an offset gets its own generation, so verdicts from
/// deliveries that a rewind already superseded are told apart from the
/// redelivery's own.
#[derive(Debug, Default)]
pub struct PartitionOffsets {
    in_flight: BTreeMap<i64, Slot>,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    acked: bool,
}

/// What the pull loop must do with the consumer after a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAction {
    /// Store this offset as the next one to consume
    Store(i64),
    /// Rewind the partition to this offset
    Seek(i64),
    Nothing,
    /// The delivery was already rewound past, its verdict must be ignored
    Stale,
}

impl PartitionOffsets {
    /// Starts tracking a delivery of `offset` and returns its generation.
    pub fn track(&mut self, offset: i64) -> u64 {
        self.generation += 1;
        _ = self.in_flight.insert(
            offset,
            Slot {
                generation: self.generation,
                acked: false,
            },
        );
        self.generation
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn resolve(&mut self, offset: i64, generation: u64, verdict: Verdict) -> OffsetAction {
        let Some(slot) = self.in_flight.get_mut(&offset) else {
            return OffsetAction::Stale;
        };
        if slot.generation != generation {
            return OffsetAction::Stale;
        }

        match verdict {
            Verdict::Nack => {
                // Everything from the nacked offset on will be delivered again
                self.in_flight.retain(|tracked, _| *tracked < offset);
                OffsetAction::Seek(offset)
            }
            Verdict::Ack => {
                slot.acked = true;

                let mut next = None;
                while let Some(entry) = self.in_flight.first_entry() {
                    if !entry.get().acked {
                        break;
                    }
                    next = Some(*entry.key() + 1);
                    _ = entry.remove();
                }

                next.map_or(OffsetAction::Nothing, OffsetAction::Store)
            }
        }
    }
}

/// Per-partition offset tracking for a single topic.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn track(&mut self, partition: i32, offset: i64) -> u64 {
        self.partitions.entry(partition).or_default().track(offset)
    }

    pub fn resolve(
        &mut self,
        partition: i32,
        offset: i64,
        generation: u64,
        verdict: Verdict,
    ) -> OffsetAction {
        match self.partitions.get_mut(&partition) {
            Some(offsets) => offsets.resolve(offset, generation, verdict),
            None => OffsetAction::Stale,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(PartitionOffsets::in_flight).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::{OffsetAction, OffsetTracker};
    use crate::delivery::Verdict;

    #[test]
    fn commits_only_the_contiguous_prefix() {
        let mut tracker = OffsetTracker::default();
        let generations: Vec<u64> = (10..14).map(|offset| tracker.track(0, offset)).collect();

        assert_eq!(
            tracker.resolve(0, 11, generations[1], Verdict::Ack),
            OffsetAction::Nothing
        );
        assert_eq!(
            tracker.resolve(0, 12, generations[2], Verdict::Ack),
            OffsetAction::Nothing
        );
        assert_eq!(
            tracker.resolve(0, 10, generations[0], Verdict::Ack),
            OffsetAction::Store(13)
        );
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(
            tracker.resolve(0, 13, generations[3], Verdict::Ack),
            OffsetAction::Store(14)
        );
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn nack_rewinds_and_drops_later_offsets() {
        let mut tracker = OffsetTracker::default();
        let generations: Vec<u64> = (0..4).map(|offset| tracker.track(3, offset)).collect();

        assert_eq!(
            tracker.resolve(3, 0, generations[0], Verdict::Ack),
            OffsetAction::Store(1)
        );
        assert_eq!(
            tracker.resolve(3, 2, generations[2], Verdict::Nack),
            OffsetAction::Seek(2)
        );
        assert_eq!(tracker.in_flight(), 1);

        // Verdicts for rewound offsets are ignored, the redelivery decides
        assert_eq!(
            tracker.resolve(3, 3, generations[3], Verdict::Ack),
            OffsetAction::Stale
        );
        assert_eq!(
            tracker.resolve(3, 1, generations[1], Verdict::Ack),
            OffsetAction::Store(2)
        );

        let redelivered = tracker.track(3, 2);
        assert_eq!(
            tracker.resolve(3, 2, redelivered, Verdict::Ack),
            OffsetAction::Store(3)
        );
    }

    #[test]
    fn out_of_order_nacks_keep_the_earliest_rewind() {
        let mut tracker = OffsetTracker::default();
        let generations: Vec<u64> = (0..4).map(|offset| tracker.track(0, offset)).collect();

        assert_eq!(
            tracker.resolve(0, 0, generations[0], Verdict::Nack),
            OffsetAction::Seek(0)
        );
        // Later offsets were rewound along with 0 and must not seek past it
        assert_eq!(
            tracker.resolve(0, 3, generations[3], Verdict::Nack),
            OffsetAction::Stale
        );
        assert_eq!(
            tracker.resolve(0, 1, generations[1], Verdict::Nack),
            OffsetAction::Stale
        );

        // Redelivery of 1 arrives before 0 settles: nothing may be stored past 0
        let zero = tracker.track(0, 0);
        let one = tracker.track(0, 1);
        assert_eq!(tracker.resolve(0, 1, one, Verdict::Ack), OffsetAction::Nothing);
        assert_eq!(tracker.resolve(0, 0, zero, Verdict::Ack), OffsetAction::Store(2));
    }

    #[test]
    fn verdicts_from_superseded_deliveries_are_stale() {
        let mut tracker = OffsetTracker::default();
        let first = tracker.track(0, 5);
        let six = tracker.track(0, 6);
        assert_eq!(tracker.resolve(0, 5, first, Verdict::Nack), OffsetAction::Seek(5));

        // The old task of 6 is still running when 6 is delivered again
        let retry_five = tracker.track(0, 5);
        let retry_six = tracker.track(0, 6);
        assert_eq!(
            tracker.resolve(0, 6, six, Verdict::Ack),
            OffsetAction::Stale
        );
        assert_eq!(
            tracker.resolve(0, 5, retry_five, Verdict::Ack),
            OffsetAction::Store(6)
        );
        assert_eq!(
            tracker.resolve(0, 6, retry_six, Verdict::Ack),
            OffsetAction::Store(7)
        );
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::default();
        let five = tracker.track(0, 5);
        let seven = tracker.track(1, 7);

        assert_eq!(tracker.resolve(1, 7, seven, Verdict::Ack), OffsetAction::Store(8));
        assert_eq!(tracker.resolve(0, 5, five, Verdict::Nack), OffsetAction::Seek(5));
        assert_eq!(tracker.resolve(2, 0, 1, Verdict::Ack), OffsetAction::Stale);
    }
}
