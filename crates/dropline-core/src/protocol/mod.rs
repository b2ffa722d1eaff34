//! Dropline Protocol Module
//!
//! - `envelope`: payload units carried over a data session
//! - `codec`: validation and JSON framing of envelopes
//! - `connection_state`: single-session lifecycle state machine
//! - `reconnect`: bounded broker-disconnect recovery policy
//! - `timeline`: ordered history of sent and received envelopes

pub mod codec;
pub mod connection_state;
pub mod envelope;
pub mod reconnect;
pub mod timeline;

// Re-export codec types
pub use codec::{decode, encode, EnvelopeCodec};

// Re-export connection state types
pub use connection_state::{
    AuditEntry, ConnectionEvent, ConnectionState, ConnectionStatus, Effect, ErrorReason,
    SessionOrigin, StateTransition, StateTransitionError, TransitionContext,
};

// Re-export envelope types
pub use envelope::{Envelope, EnvelopeKind, FileEnvelope, TextEnvelope, DEFAULT_MIME_TYPE};

// Re-export reconnection types
pub use reconnect::{ReconnectController, ReconnectDecision, ReconnectPolicy};

// Re-export timeline types
pub use timeline::{
    format_file_size, Direction, PayloadSummary, RecordFactory, RecordId, RecordIdGenerator,
    Timeline, TimelineRecord, TimelineStats,
};
