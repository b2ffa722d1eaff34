//! Transport Collaborator Contract
//!
//! The session layer drives a peer-to-peer transport it does not implement.
//! A [`Transport`] creates [`Endpoint`]s registered with a broker under a
//! [`SessionIdentity`]; an endpoint opens [`Session`]s to remote identities.
//!
//! Everything the transport observes asynchronously (endpoint open/error,
//! inbound sessions, session open/data/close/error) is reported as a
//! [`TransportEvent`] on the sender handed over at endpoint creation. The
//! runtime consumes those events on a single task, so implementations never
//! call back into the session layer directly.

use crate::config::TransportConfig;
use crate::errors::TransportErrorKind;
use crate::types::{SessionId, SessionIdentity};
use crate::DroplineResult;
use std::fmt;
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Signals raised by an endpoint or one of its sessions
pub enum TransportEvent {
    /// The endpoint registered with the broker
    EndpointOpen { identity: SessionIdentity },
    /// The endpoint reported an error
    EndpointError {
        kind: TransportErrorKind,
        message: String,
    },
    /// The signalling channel to the broker dropped
    EndpointDisconnected,
    /// A remote endpoint opened a session to this one
    IncomingSession { session: Box<dyn Session> },
    /// The session is ready to carry data
    SessionOpen { id: SessionId },
    /// Bytes arrived on a session, in the order the remote sent them
    SessionData { id: SessionId, bytes: Vec<u8> },
    /// The session closed
    SessionClose { id: SessionId },
    /// The session failed
    SessionError {
        id: SessionId,
        kind: TransportErrorKind,
        message: String,
    },
}

impl TransportEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::EndpointOpen { .. } => "EndpointOpen",
            TransportEvent::EndpointError { .. } => "EndpointError",
            TransportEvent::EndpointDisconnected => "EndpointDisconnected",
            TransportEvent::IncomingSession { .. } => "IncomingSession",
            TransportEvent::SessionOpen { .. } => "SessionOpen",
            TransportEvent::SessionData { .. } => "SessionData",
            TransportEvent::SessionClose { .. } => "SessionClose",
            TransportEvent::SessionError { .. } => "SessionError",
        }
    }
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::EndpointOpen { identity } => f
                .debug_struct("EndpointOpen")
                .field("identity", identity)
                .finish(),
            TransportEvent::EndpointError { kind, message } => f
                .debug_struct("EndpointError")
                .field("kind", kind)
                .field("message", message)
                .finish(),
            TransportEvent::EndpointDisconnected => f.write_str("EndpointDisconnected"),
            TransportEvent::IncomingSession { session } => f
                .debug_struct("IncomingSession")
                .field("id", &session.id())
                .field("remote", session.remote())
                .finish(),
            TransportEvent::SessionOpen { id } => {
                f.debug_struct("SessionOpen").field("id", id).finish()
            }
            TransportEvent::SessionData { id, bytes } => f
                .debug_struct("SessionData")
                .field("id", id)
                .field("len", &bytes.len())
                .finish(),
            TransportEvent::SessionClose { id } => {
                f.debug_struct("SessionClose").field("id", id).finish()
            }
            TransportEvent::SessionError { id, kind, message } => f
                .debug_struct("SessionError")
                .field("id", id)
                .field("kind", kind)
                .field("message", message)
                .finish(),
        }
    }
}

/// Unbounded so transport callbacks never wait on the session layer
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel an endpoint reports through
pub fn create_transport_event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Collaborator Traits
// ----------------------------------------------------------------------------

/// Options for opening an outbound session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Request a reliable, ordered channel
    pub reliable: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { reliable: true }
    }
}

/// Factory for local endpoints
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Register a new endpoint under `identity`
    ///
    /// The endpoint reports `EndpointOpen` on `events` once the broker has
    /// accepted the identity.
    async fn create_endpoint(
        &self,
        identity: SessionIdentity,
        config: &TransportConfig,
        events: TransportEventSender,
    ) -> DroplineResult<Box<dyn Endpoint>>;
}

/// Local binding to the broker under one identity
#[async_trait::async_trait]
pub trait Endpoint: Send + Sync {
    /// Identity the endpoint is registered under
    fn identity(&self) -> &SessionIdentity;

    /// Open a session to `remote`
    ///
    /// Returning `Ok` only means the session exists; it becomes usable after
    /// its `SessionOpen` event.
    async fn connect(
        &self,
        remote: &SessionIdentity,
        options: ConnectOptions,
    ) -> DroplineResult<Box<dyn Session>>;

    /// Re-register with the broker after a disconnect
    ///
    /// Transports without built-in reconnection return
    /// [`crate::TransportError::Unsupported`].
    async fn reconnect(&self) -> DroplineResult<()>;

    /// Release the binding and every session it owns
    async fn destroy(&self);
}

/// One data session to a remote endpoint
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Transport-assigned id carried by every event of this session
    fn id(&self) -> SessionId;

    /// Identity on the other end
    fn remote(&self) -> &SessionIdentity;

    /// Send one framed unit
    async fn send(&self, bytes: Vec<u8>) -> DroplineResult<()>;

    /// Close the session
    async fn close(&self);
}
