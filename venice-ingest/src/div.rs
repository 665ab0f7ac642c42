//! Data Integrity Validation: per-producer-segment continuity checking.
//!
//! A segment is the unit of DIV — records from one producer guid with a
//! fixed segment number, sequence numbers starting at 1, terminated by
//! an `EndOfSegment` control message. The validator tracks, per
//! `(guid, segment)`, the next expected sequence number and a running
//! checksum, persisted alongside the partition's other checkpoint state
//! so a restart resumes continuity checking exactly where it left off.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use venice_common::error::{DivError, Result};

/// Outcome of validating one incoming record against its segment's DIV
/// state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DivOutcome {
    /// Apply the record; `next_expected_seq` advances.
    Apply,
    /// A record with this `(guid, segment, seq)` was already applied;
    /// drop it silently.
    DuplicateDropped,
    /// A gap was found ahead of the next expected sequence.
    Gap(DivError),
    /// The segment's head (`seq == 1`, `StartOfSegment`) was never
    /// observed for this guid/segment.
    MissingHead(DivError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentState {
    next_expected_seq: i64,
    running_checksum: u32,
}

/// Per-partition DIV state: one entry per `(producer_guid, segment)`
/// pair ever observed. Serialized into the partition checkpoint's
/// `div_state_blob` so it survives restarts.
#[derive(Debug, Default)]
pub struct DivValidator {
    segments: HashMap<(u128, i32), SegmentState>,
}

impl DivValidator {
    pub fn new() -> Self {
        Self {
            segments: HashMap::new(),
        }
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.is_empty() {
            return Ok(Self::new());
        }
        let segments: HashMap<(u128, i32), SegmentState> = bincode::deserialize(blob)?;
        Ok(Self { segments })
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.segments)?)
    }

    /// Validate a record identified by `(guid, segment, seq)`.
    /// `is_start_of_segment` marks the record carrying the segment's
    /// `StartOfSegment` control.
    pub fn validate(
        &mut self,
        guid: u128,
        segment: i32,
        seq: i64,
        is_start_of_segment: bool,
    ) -> DivOutcome {
        let key = (guid, segment);
        match self.segments.get(&key).cloned() {
            None => {
                if seq == 1 && is_start_of_segment {
                    self.segments.insert(
                        key,
                        SegmentState {
                            next_expected_seq: 2,
                            running_checksum: 0,
                        },
                    );
                    DivOutcome::Apply
                } else {
                    DivOutcome::MissingHead(DivError::MissingHead {
                        guid: guid.to_string(),
                        segment,
                    })
                }
            }
            Some(state) => {
                if seq < state.next_expected_seq {
                    DivOutcome::DuplicateDropped
                } else if seq > state.next_expected_seq {
                    DivOutcome::Gap(DivError::DataMissing {
                        guid: guid.to_string(),
                        segment,
                        expected: state.next_expected_seq,
                        got: seq,
                    })
                } else {
                    self.segments.get_mut(&key).unwrap().next_expected_seq = seq + 1;
                    DivOutcome::Apply
                }
            }
        }
    }

    /// Fold a record's payload bytes into its segment's running
    /// checksum. Called once per accepted, non-duplicate record.
    pub fn update_checksum(&mut self, guid: u128, segment: i32, payload: &[u8]) {
        if let Some(state) = self.segments.get_mut(&(guid, segment)) {
            let mut buf = Vec::with_capacity(4 + payload.len());
            buf.extend_from_slice(&state.running_checksum.to_le_bytes());
            buf.extend_from_slice(payload);
            state.running_checksum = crc32fast::hash(&buf);
        }
    }

    /// Compare a segment's accumulated checksum against the value
    /// carried by its `EndOfSegment` control message.
    pub fn verify_segment_checksum(&self, guid: u128, segment: i32, expected: u32) -> bool {
        self.segments
            .get(&(guid, segment))
            .map_or(true, |s| s.running_checksum == expected)
    }

    /// Drop a segment's DIV state once its `EndOfSegment` has been
    /// processed and verified, bounding memory for long-lived
    /// partitions with many producer restarts.
    pub fn close_segment(&mut self, guid: u128, segment: i32) {
        self.segments.remove(&(guid, segment));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_segment_not_starting_at_one() {
        let mut v = DivValidator::new();
        assert!(matches!(
            v.validate(1, 0, 5, false),
            DivOutcome::MissingHead(_)
        ));
    }

    #[test]
    fn accepts_start_of_segment_at_seq_one() {
        let mut v = DivValidator::new();
        assert_eq!(v.validate(1, 0, 1, true), DivOutcome::Apply);
    }

    #[test]
    fn applies_in_order_records() {
        let mut v = DivValidator::new();
        assert_eq!(v.validate(1, 0, 1, true), DivOutcome::Apply);
        assert_eq!(v.validate(1, 0, 2, false), DivOutcome::Apply);
        assert_eq!(v.validate(1, 0, 3, false), DivOutcome::Apply);
    }

    #[test]
    fn drops_duplicate_silently() {
        let mut v = DivValidator::new();
        v.validate(1, 0, 1, true);
        v.validate(1, 0, 2, false);
        assert_eq!(v.validate(1, 0, 1, true), DivOutcome::DuplicateDropped);
        assert_eq!(v.validate(1, 0, 2, false), DivOutcome::DuplicateDropped);
    }

    #[test]
    fn reports_gap() {
        let mut v = DivValidator::new();
        v.validate(1, 0, 1, true);
        assert!(matches!(v.validate(1, 0, 4, false), DivOutcome::Gap(_)));
    }

    #[test]
    fn new_segment_from_same_guid_is_independent() {
        let mut v = DivValidator::new();
        v.validate(1, 0, 1, true);
        v.validate(1, 0, 2, false);
        // A later segment number from the same producer starts its own
        // continuity tracking, e.g. a restart across a push boundary.
        assert_eq!(v.validate(1, 1, 1, true), DivOutcome::Apply);
    }

    #[test]
    fn checksum_round_trips_through_blob() {
        let mut v = DivValidator::new();
        v.validate(1, 0, 1, true);
        v.update_checksum(1, 0, b"hello");
        let blob = v.to_blob().unwrap();
        let restored = DivValidator::from_blob(&blob).unwrap();
        assert_eq!(
            restored.segments.get(&(1, 0)).unwrap().running_checksum,
            v.segments.get(&(1, 0)).unwrap().running_checksum
        );
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let mut v = DivValidator::new();
        v.validate(1, 0, 1, true);
        v.update_checksum(1, 0, b"hello");
        assert!(!v.verify_segment_checksum(1, 0, 0xdead_beef));
    }
}
