//! Error types for Dropline
//!
//! Specific error enums per concern (envelope codec, transport, session) are
//! unified by [`DroplineError`].

use serde::{Deserialize, Serialize};
use std::fmt;

// ----------------------------------------------------------------------------
// Transport Error Classification
// ----------------------------------------------------------------------------

/// Classified transport failure, as signalled by the endpoint or a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportErrorKind {
    /// The remote identity is not registered with the broker
    PeerUnavailable,
    /// Connectivity problem between this endpoint and the broker or peer
    NetworkIssue,
    /// The signalling/relay channel dropped
    BrokerDisconnected,
    /// The broker reported an internal failure
    ServerError,
    /// Anything the transport reports without a known type
    Other,
}

impl TransportErrorKind {
    /// Classify the type string a transport attaches to an error signal
    pub fn from_signal(signal: &str) -> Self {
        match signal {
            "peer-unavailable" => Self::PeerUnavailable,
            "network" => Self::NetworkIssue,
            "disconnected" => Self::BrokerDisconnected,
            "server-error" => Self::ServerError,
            _ => Self::Other,
        }
    }

    /// Wire name of this kind, also used as the `Errored` reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerUnavailable => "peer-unavailable",
            Self::NetworkIssue => "network",
            Self::BrokerDisconnected => "disconnected",
            Self::ServerError => "server-error",
            Self::Other => "transport-error",
        }
    }

    /// Whether the reconnection controller retries this kind
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PeerUnavailable | Self::NetworkIssue | Self::BrokerDisconnected
        )
    }

    /// Status line shown to the user for this kind
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::PeerUnavailable => "Remote device unavailable",
            Self::NetworkIssue => "Network connection issue",
            Self::BrokerDisconnected => "Disconnected from server",
            Self::ServerError => "Server error",
            Self::Other => "Connection error",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Envelope codec failures; the offending unit is dropped, the session stays up
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid envelope: {reason}")]
    Invalid { reason: String },
    #[error("Unknown envelope type: {discriminator}")]
    UnknownType { discriminator: String },
}

/// Transport collaborator failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport reported {kind}: {reason}")]
    Signalled {
        kind: TransportErrorKind,
        reason: String,
    },
    #[error("Connection to {peer_id} failed: {reason}")]
    ConnectionFailed { peer_id: String, reason: String },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Operation not supported by transport: {operation}")]
    Unsupported { operation: String },
    #[error("No local endpoint is available")]
    EndpointUnavailable,
}

impl TransportError {
    /// Classified kind of this failure
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            TransportError::Signalled { kind, .. } => *kind,
            TransportError::ConnectionFailed { .. } => TransportErrorKind::PeerUnavailable,
            TransportError::EndpointUnavailable => TransportErrorKind::BrokerDisconnected,
            _ => TransportErrorKind::Other,
        }
    }
}

/// Session lifecycle failures
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection timed out after {duration_ms}ms")]
    ConnectTimeout { duration_ms: u64 },
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("Runtime has shut down")]
    Shutdown,
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for Dropline
#[derive(Debug, thiserror::Error)]
pub enum DroplineError {
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] crate::protocol::StateTransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Channel communication error between handle and driver task
    #[error("Channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl DroplineError {
    pub fn invalid_envelope<T: Into<String>>(reason: T) -> Self {
        DroplineError::Envelope(EnvelopeError::Invalid {
            reason: reason.into(),
        })
    }

    pub fn unknown_envelope_type<T: Into<String>>(discriminator: T) -> Self {
        DroplineError::Envelope(EnvelopeError::UnknownType {
            discriminator: discriminator.into(),
        })
    }

    pub fn invalid_identity<T: Into<String>>(reason: T) -> Self {
        DroplineError::InvalidIdentity {
            reason: reason.into(),
        }
    }

    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        DroplineError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        DroplineError::Channel {
            message: message.into(),
        }
    }

    pub fn not_connected() -> Self {
        DroplineError::Session(SessionError::NotConnected)
    }

    pub fn transport_signalled<R: Into<String>>(kind: TransportErrorKind, reason: R) -> Self {
        DroplineError::Transport(TransportError::Signalled {
            kind,
            reason: reason.into(),
        })
    }

    pub fn unsupported<T: Into<String>>(operation: T) -> Self {
        DroplineError::Transport(TransportError::Unsupported {
            operation: operation.into(),
        })
    }

    /// Whether this is a codec-level rejection that leaves the session open
    pub fn is_envelope_error(&self) -> bool {
        matches!(self, DroplineError::Envelope(_))
    }

    /// Classified kind for errors raised by the transport
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            DroplineError::Transport(e) => Some(e.kind()),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, DroplineError>;
pub type DroplineResult<T> = Result<T>;
