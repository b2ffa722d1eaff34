//! Dropline Core
//!
//! Foundational types for Dropline, a two-party file and text drop over a
//! brokered peer-to-peer transport:
//! - session identities and their generator
//! - the envelope wire codec
//! - the single-session connection state machine
//! - the reconnection policy
//! - the timeline merge engine
//! - the transport collaborator contract
//!
//! Nothing here performs I/O or spawns tasks; `dropline-runtime` drives these
//! pieces against a concrete transport.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod errors;
pub mod identity;
pub mod launch;
pub mod protocol;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{create_event_channel, DroplineEvent, DroplineEventReceiver, DroplineEventSender};
pub use config::{
    ChannelConfig, ConnectionConfig, DroplineConfig, ReconnectConfig, SharedDroplineConfig,
    TransportConfig,
};
pub use errors::{
    DroplineError, DroplineResult, EnvelopeError, Result, SessionError, TransportError,
    TransportErrorKind,
};
pub use identity::{generate_identity, IdentityGenerator};
pub use launch::{share_link, LaunchRequest};
pub use protocol::{
    format_file_size, ConnectionState, ConnectionStatus, Direction, Envelope, EnvelopeKind,
    ErrorReason, FileEnvelope, PayloadSummary, RecordId, TextEnvelope, Timeline, TimelineRecord,
};
pub use transport::{
    create_transport_event_channel, ConnectOptions, Endpoint, Session, Transport, TransportEvent,
    TransportEventReceiver, TransportEventSender,
};
pub use types::{
    ManualTimeSource, SessionId, SessionIdentity, SystemTimeSource, TimeSource, Timestamp,
};
