//! Timeline Merge Engine
//!
//! Sent items, received text and received files are produced independently
//! and merged here into one view ordered by local observation time. Records
//! observed in the same millisecond keep the order they were appended in.

use crate::protocol::envelope::{Envelope, EnvelopeKind};
use crate::types::{TimeSource, Timestamp};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

// ----------------------------------------------------------------------------
// Record Identifier
// ----------------------------------------------------------------------------

/// Record id: creation millisecond plus a random tiebreaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    millis: u64,
    tiebreak: u32,
}

impl RecordId {
    pub fn new(millis: u64, tiebreak: u32) -> Self {
        Self { millis, tiebreak }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    pub fn tiebreak(&self) -> u32 {
        self.tiebreak
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:08x}", self.millis, self.tiebreak)
    }
}

/// Issues strictly increasing record ids
///
/// Several records may be created in one millisecond, and the wall clock may
/// step backwards; both cases stay above the last id handed out.
#[derive(Debug, Clone)]
pub struct RecordIdGenerator<R = OsRng> {
    rng: R,
    last: Option<RecordId>,
}

impl RecordIdGenerator<OsRng> {
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }
}

impl Default for RecordIdGenerator<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> RecordIdGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng, last: None }
    }

    /// Next id for a record created at `now`
    pub fn next_id(&mut self, now: Timestamp) -> RecordId {
        let random = self.rng.next_u32();
        let millis = now.as_millis();

        let id = match self.last {
            Some(last) if millis <= last.millis => {
                if last.tiebreak == u32::MAX {
                    RecordId::new(last.millis + 1, random)
                } else {
                    let span = u32::MAX - last.tiebreak;
                    RecordId::new(last.millis, last.tiebreak + 1 + random % span)
                }
            }
            _ => RecordId::new(millis, random),
        };

        self.last = Some(id);
        id
    }
}

// ----------------------------------------------------------------------------
// Timeline Record
// ----------------------------------------------------------------------------

/// Whether the local endpoint sent or received a record's envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// Display-oriented summary of an envelope's payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PayloadSummary {
    File {
        name: String,
        size: u64,
        mime_type: String,
    },
    Text {
        content: String,
    },
}

impl PayloadSummary {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        match envelope {
            Envelope::File(file) => PayloadSummary::File {
                name: file.name.clone(),
                size: file.size,
                mime_type: file.mime_type.clone(),
            },
            Envelope::Text(text) => PayloadSummary::Text {
                content: text.content.clone(),
            },
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            PayloadSummary::File { .. } => EnvelopeKind::File,
            PayloadSummary::Text { .. } => EnvelopeKind::Text,
        }
    }

    /// File name, or `None` for text
    pub fn name(&self) -> Option<&str> {
        match self {
            PayloadSummary::File { name, .. } => Some(name),
            PayloadSummary::Text { .. } => None,
        }
    }

    /// One-line label: file name with human-readable size, or the text itself
    pub fn label(&self) -> String {
        match self {
            PayloadSummary::File { name, size, .. } => {
                format!("{} ({})", name, format_file_size(*size))
            }
            PayloadSummary::Text { content } => content.clone(),
        }
    }
}

/// One sent or received envelope as shown to the user; never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineRecord {
    pub id: RecordId,
    pub direction: Direction,
    pub summary: PayloadSummary,
    pub timestamp: Timestamp,
}

impl TimelineRecord {
    pub fn kind(&self) -> EnvelopeKind {
        self.summary.kind()
    }
}

/// Stamps records with an id and an observation time
pub struct RecordFactory<T: TimeSource, R = OsRng> {
    time_source: T,
    ids: RecordIdGenerator<R>,
}

impl<T: TimeSource> RecordFactory<T, OsRng> {
    pub fn new(time_source: T) -> Self {
        Self {
            time_source,
            ids: RecordIdGenerator::new(),
        }
    }
}

impl<T: TimeSource, R: RngCore> RecordFactory<T, R> {
    pub fn with_ids(time_source: T, ids: RecordIdGenerator<R>) -> Self {
        Self { time_source, ids }
    }

    /// Record for an envelope observed now
    pub fn record(&mut self, direction: Direction, envelope: &Envelope) -> TimelineRecord {
        let timestamp = self.time_source.now();
        TimelineRecord {
            id: self.ids.next_id(timestamp),
            direction,
            summary: PayloadSummary::from_envelope(envelope),
            timestamp,
        }
    }
}

// ----------------------------------------------------------------------------
// Timeline
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TimelineStats {
    pub appended: u64,
    pub duplicates_rejected: u64,
    pub resets: u64,
}

/// Ordered, deduplicated collection of timeline records
#[derive(Debug, Default)]
pub struct Timeline {
    /// Records keyed by observation time, then insertion order
    entries: BTreeMap<(Timestamp, u64), TimelineRecord>,
    ids: HashSet<RecordId>,
    next_sequence: u64,
    stats: TimelineStats,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; returns `false` if its id is already present
    pub fn append(&mut self, record: TimelineRecord) -> bool {
        if !self.ids.insert(record.id) {
            self.stats.duplicates_rejected += 1;
            return false;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert((record.timestamp, sequence), record);
        self.stats.appended += 1;
        true
    }

    /// All records ordered by timestamp, ties in append order
    pub fn snapshot(&self) -> Vec<TimelineRecord> {
        self.entries.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimelineRecord> {
        self.entries.values()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every record; the insertion counter keeps counting
    pub fn reset(&mut self) {
        self.entries.clear();
        self.ids.clear();
        self.stats.resets += 1;
    }

    pub fn stats(&self) -> &TimelineStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Formatting
// ----------------------------------------------------------------------------

/// Human-readable byte count with two decimals above one KB
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualTimeSource;
    use proptest::prelude::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn text_record(id: RecordId, at: u64, direction: Direction, content: &str) -> TimelineRecord {
        TimelineRecord {
            id,
            direction,
            summary: PayloadSummary::Text {
                content: content.to_string(),
            },
            timestamp: Timestamp::new(at),
        }
    }

    #[test]
    fn test_snapshot_orders_by_timestamp() {
        let mut timeline = Timeline::new();
        timeline.append(text_record(RecordId::new(30, 0), 30, Direction::Sent, "c"));
        timeline.append(text_record(RecordId::new(10, 0), 10, Direction::Received, "a"));
        timeline.append(text_record(RecordId::new(20, 0), 20, Direction::Sent, "b"));

        let labels: Vec<_> = timeline.iter().map(|r| r.summary.label()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_same_instant_preserves_append_order() {
        let mut timeline = Timeline::new();
        timeline.append(text_record(RecordId::new(5, 9), 5, Direction::Received, "first"));
        timeline.append(text_record(RecordId::new(5, 1), 5, Direction::Sent, "second"));

        let snapshot = timeline.snapshot();
        assert_eq!(snapshot[0].summary.label(), "first");
        assert_eq!(snapshot[1].summary.label(), "second");
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let mut timeline = Timeline::new();
        let record = text_record(RecordId::new(1, 1), 1, Direction::Sent, "x");
        assert!(timeline.append(record.clone()));
        assert!(!timeline.append(record));
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.stats().duplicates_rejected, 1);
    }

    #[test]
    fn test_snapshot_is_side_effect_free() {
        let mut timeline = Timeline::new();
        timeline.append(text_record(RecordId::new(1, 1), 1, Direction::Sent, "x"));
        assert_eq!(timeline.snapshot(), timeline.snapshot());
        assert_eq!(timeline.stats().appended, 1);
    }

    #[test]
    fn test_reset_clears_records() {
        let mut timeline = Timeline::new();
        let record = text_record(RecordId::new(1, 1), 1, Direction::Sent, "x");
        timeline.append(record.clone());
        timeline.reset();
        assert!(timeline.is_empty());
        assert!(timeline.append(record));
    }

    #[test]
    fn test_record_ids_increase_within_one_millisecond() {
        let mut ids = RecordIdGenerator::with_rng(ChaCha8Rng::seed_from_u64(3));
        let now = Timestamp::new(1_000);
        let mut previous = ids.next_id(now);
        for _ in 0..1_000 {
            let next = ids.next_id(now);
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_record_ids_survive_clock_stepping_back() {
        let mut ids = RecordIdGenerator::with_rng(ChaCha8Rng::seed_from_u64(4));
        let first = ids.next_id(Timestamp::new(2_000));
        let second = ids.next_id(Timestamp::new(1_000));
        assert!(second > first);
        assert_eq!(second.millis(), 2_000);
    }

    #[test]
    fn test_record_ids_roll_over_exhausted_tiebreak() {
        let mut ids = RecordIdGenerator::with_rng(ChaCha8Rng::seed_from_u64(5));
        ids.last = Some(RecordId::new(10, u32::MAX));
        let next = ids.next_id(Timestamp::new(10));
        assert_eq!(next.millis(), 11);
    }

    #[test]
    fn test_record_factory_summarizes_envelopes() {
        let clock = ManualTimeSource::new(Timestamp::new(500));
        let mut factory = RecordFactory::new(clock.clone());
        let envelope = Envelope::file("a.png", Some("image/png"), vec![0u8; 120]);

        let record = factory.record(Direction::Received, &envelope);
        assert_eq!(record.kind(), EnvelopeKind::File);
        assert_eq!(record.summary.name(), Some("a.png"));
        assert_eq!(record.timestamp, Timestamp::new(500));
        assert_eq!(record.summary.label(), "a.png (120 B)");
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(1023), "1023 B");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    proptest! {
        #[test]
        fn prop_snapshot_is_ordered_for_any_producer_interleaving(
            appends in proptest::collection::vec((0u8..3, 0u64..20), 0..200)
        ) {
            let mut timeline = Timeline::new();
            let mut ids = RecordIdGenerator::with_rng(ChaCha8Rng::seed_from_u64(9));
            let mut appended = Vec::new();

            for (producer, at) in appends {
                let direction = if producer == 0 { Direction::Sent } else { Direction::Received };
                let record = text_record(ids.next_id(Timestamp::new(at)), at, direction, "m");
                appended.push(record.id);
                prop_assert!(timeline.append(record));
            }

            let snapshot = timeline.snapshot();
            prop_assert_eq!(snapshot.len(), appended.len());
            for pair in snapshot.windows(2) {
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
                if pair[0].timestamp == pair[1].timestamp {
                    let first = appended.iter().position(|id| *id == pair[0].id);
                    let second = appended.iter().position(|id| *id == pair[1].id);
                    prop_assert!(first < second);
                }
            }
        }
    }
}
