//! Envelope delivery for the Dropline runtime
//!
//! [`DeliveryManager`] sits between the session and the timeline: outbound
//! envelopes are validated and framed before they reach the transport, and
//! inbound bytes are decoded before anything is recorded. A rejected unit
//! never reaches the timeline.

use dropline_core::protocol::{EnvelopeCodec, RecordFactory};
use dropline_core::{
    Direction, DroplineResult, Envelope, TimeSource, Timeline, TimelineRecord,
};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Timeline shared between the driver task and runtime handles
pub type SharedTimeline = Arc<RwLock<Timeline>>;

/// Create an empty shared timeline
pub fn create_shared_timeline() -> SharedTimeline {
    Arc::new(RwLock::new(Timeline::new()))
}

// ----------------------------------------------------------------------------
// Delivery Manager
// ----------------------------------------------------------------------------

/// Frames outbound envelopes and records every delivered one
pub struct DeliveryManager<T: TimeSource> {
    codec: EnvelopeCodec,
    records: RecordFactory<T>,
    timeline: SharedTimeline,
    stats: DeliveryStats,
}

impl<T: TimeSource> DeliveryManager<T> {
    pub fn new(time_source: T, timeline: SharedTimeline) -> Self {
        Self {
            codec: EnvelopeCodec,
            records: RecordFactory::new(time_source),
            timeline,
            stats: DeliveryStats::default(),
        }
    }

    pub fn timeline(&self) -> &SharedTimeline {
        &self.timeline
    }

    /// Validate and serialize an envelope for the wire
    pub fn frame_outbound(&mut self, envelope: &Envelope) -> DroplineResult<Vec<u8>> {
        self.codec.encode(envelope).inspect_err(|_| {
            self.stats.rejected_outbound += 1;
        })
    }

    /// The transport accepted the framed bytes; record the envelope
    pub async fn record_sent(&mut self, envelope: &Envelope) -> TimelineRecord {
        self.stats.sent += 1;
        self.append(Direction::Sent, envelope).await
    }

    /// The transport refused the framed bytes
    pub fn record_send_failure(&mut self) {
        self.stats.send_failures += 1;
    }

    /// Decode bytes from the open session and record the envelope
    pub async fn accept_inbound(&mut self, bytes: &[u8]) -> DroplineResult<TimelineRecord> {
        let envelope = match self.codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.rejected_inbound += 1;
                return Err(e);
            }
        };
        self.stats.received += 1;
        Ok(self.append(Direction::Received, &envelope).await)
    }

    async fn append(&mut self, direction: Direction, envelope: &Envelope) -> TimelineRecord {
        let record = self.records.record(direction, envelope);
        let mut timeline = self.timeline.write().await;
        if !timeline.append(record.clone()) {
            self.stats.duplicate_records += 1;
        }
        record
    }

    pub fn statistics(&self) -> &DeliveryStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Statistics for envelope delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Envelopes handed to the transport
    pub sent: u64,
    /// Envelopes decoded from the open session
    pub received: u64,
    /// Outbound envelopes that failed validation
    pub rejected_outbound: u64,
    /// Inbound units that failed to decode
    pub rejected_inbound: u64,
    /// Sends the transport refused
    pub send_failures: u64,
    /// Records whose id was already in the timeline
    pub duplicate_records: u64,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
