//! Single-Session Connection State Machine
//!
//! Lifecycle of the one data session an endpoint may hold at a time. The
//! state is consumed by [`ConnectionState::transition`], which returns the new
//! state together with the side effects the driver must carry out.

use crate::errors::TransportErrorKind;
use crate::protocol::timeline::Direction;
use crate::types::{SessionId, SessionIdentity, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Connection State Types
// ----------------------------------------------------------------------------

/// Connection state that must be consumed to transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No session has been attempted yet
    Idle,
    /// A session exists but has not reported open
    Connecting(ConnectingState),
    /// The session is open and may carry envelopes
    Connected(ConnectedState),
    /// The session ended without error
    Closed(ClosedState),
    /// The session ended with an error
    Errored(ErroredState),
}

/// Which side opened the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOrigin {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectingState {
    pub remote: SessionIdentity,
    pub session: SessionId,
    pub origin: SessionOrigin,
    pub started_at: Timestamp,
    pub deadline: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedState {
    pub remote: SessionIdentity,
    pub session: SessionId,
    pub origin: SessionOrigin,
    pub opened_at: Timestamp,
    pub envelopes_sent: u64,
    pub envelopes_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedState {
    pub remote: Option<SessionIdentity>,
    pub closed_at: Timestamp,
    /// Closed through an explicit `disconnect()`
    pub by_user: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErroredState {
    pub remote: Option<SessionIdentity>,
    pub reason: ErrorReason,
    pub failed_at: Timestamp,
}

/// Why a session ended in `Errored`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorReason {
    /// No open signal within the connect budget
    Timeout,
    /// The transport reported a failure
    Transport(TransportErrorKind),
    /// Broker recovery ran out of attempts; needs a manual restart
    MaxReconnectExceeded,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::Timeout => "timeout",
            ErrorReason::Transport(kind) => kind.as_str(),
            ErrorReason::MaxReconnectExceeded => "max-reconnect-exceeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorReason::MaxReconnectExceeded)
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// State Transition Events
// ----------------------------------------------------------------------------

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// The transport created an outbound session to `remote`
    Connect {
        remote: SessionIdentity,
        session: SessionId,
    },
    /// A remote endpoint opened a session to us
    IncomingSession {
        remote: SessionIdentity,
        session: SessionId,
    },
    /// The transport refused to create an outbound session
    ConnectRejected {
        remote: SessionIdentity,
        kind: TransportErrorKind,
    },
    /// The session reported open
    TransportOpen { session: SessionId },
    /// The session closed
    TransportClose { session: SessionId },
    /// The session failed
    TransportError {
        session: SessionId,
        kind: TransportErrorKind,
    },
    /// The connect budget elapsed
    Timeout { session: SessionId },
    /// An envelope crossed the open session
    Activity {
        session: SessionId,
        direction: Direction,
    },
    /// Explicit teardown requested by the user
    Disconnect,
    /// Broker recovery gave up
    ReconnectExhausted,
}

impl ConnectionEvent {
    /// Session the event refers to, if it is a session signal
    pub fn session(&self) -> Option<SessionId> {
        match self {
            ConnectionEvent::TransportOpen { session }
            | ConnectionEvent::TransportClose { session }
            | ConnectionEvent::TransportError { session, .. }
            | ConnectionEvent::Timeout { session }
            | ConnectionEvent::Activity { session, .. } => Some(*session),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connect { .. } => "Connect",
            ConnectionEvent::IncomingSession { .. } => "IncomingSession",
            ConnectionEvent::ConnectRejected { .. } => "ConnectRejected",
            ConnectionEvent::TransportOpen { .. } => "TransportOpen",
            ConnectionEvent::TransportClose { .. } => "TransportClose",
            ConnectionEvent::TransportError { .. } => "TransportError",
            ConnectionEvent::Timeout { .. } => "Timeout",
            ConnectionEvent::Activity { .. } => "Activity",
            ConnectionEvent::Disconnect => "Disconnect",
            ConnectionEvent::ReconnectExhausted => "ReconnectExhausted",
        }
    }
}

// ----------------------------------------------------------------------------
// Effects and Transition Results
// ----------------------------------------------------------------------------

/// Side effects the driver executes after a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Close a transport session
    CloseSession { session: SessionId },
    /// Arm the connect-timeout for a session
    StartConnectTimer { session: SessionId, after: Duration },
    /// Disarm the connect-timeout
    CancelConnectTimer,
}

/// Inputs a transition needs besides the event
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub now: Timestamp,
    pub connect_timeout: Duration,
}

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub new_state: ConnectionState,
    pub effects: Vec<Effect>,
    pub audit_entry: AuditEntry,
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub effects_count: usize,
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Idle
    }
}

impl ConnectionState {
    /// Get current state name for logging/audit
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting(_) => "Connecting",
            ConnectionState::Connected(_) => "Connected",
            ConnectionState::Closed(_) => "Closed",
            ConnectionState::Errored(_) => "Errored",
        }
    }

    /// Session currently owned by the machine, if any
    pub fn active_session(&self) -> Option<SessionId> {
        match self {
            ConnectionState::Connecting(s) => Some(s.session),
            ConnectionState::Connected(s) => Some(s.session),
            _ => None,
        }
    }

    /// Remote identity the machine is, or was last, attached to
    pub fn remote(&self) -> Option<&SessionIdentity> {
        match self {
            ConnectionState::Idle => None,
            ConnectionState::Connecting(s) => Some(&s.remote),
            ConnectionState::Connected(s) => Some(&s.remote),
            ConnectionState::Closed(s) => s.remote.as_ref(),
            ConnectionState::Errored(s) => s.remote.as_ref(),
        }
    }

    /// Only `Connected` may carry envelopes
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// Deadline of the pending connect, if one is armed
    pub fn connect_deadline(&self) -> Option<Timestamp> {
        match self {
            ConnectionState::Connecting(s) => Some(s.deadline),
            _ => None,
        }
    }

    /// Process an event and transition to a new state (consumes self)
    pub fn transition(
        self,
        event: ConnectionEvent,
        ctx: TransitionContext,
    ) -> Result<StateTransition, StateTransitionError> {
        let from_state = self.state_name();
        let event_name = event.name();

        // Session signals must name the live session
        if let Some(session) = event.session() {
            if self.active_session() != Some(session) {
                trace!("{} for {} ignored in {}", event_name, session, from_state);
                return Err(StateTransitionError::StaleSession {
                    session,
                    state: from_state.to_string(),
                    event: event_name.to_string(),
                });
            }
        }

        let (new_state, effects) = match (self, event) {
            // A new session supersedes whatever is live
            (state, ConnectionEvent::Connect { remote, session }) => {
                let mut effects = state.teardown_effects();
                effects.push(Effect::StartConnectTimer {
                    session,
                    after: ctx.connect_timeout,
                });
                let new_state = connecting(remote, session, SessionOrigin::Outbound, ctx);
                (new_state, effects)
            }

            (state, ConnectionEvent::IncomingSession { remote, session }) => {
                let mut effects = state.teardown_effects();
                effects.push(Effect::StartConnectTimer {
                    session,
                    after: ctx.connect_timeout,
                });
                let new_state = connecting(remote, session, SessionOrigin::Inbound, ctx);
                (new_state, effects)
            }

            (state, ConnectionEvent::ConnectRejected { remote, kind }) => {
                let effects = state.teardown_effects();
                let new_state = ConnectionState::Errored(ErroredState {
                    remote: Some(remote),
                    reason: ErrorReason::Transport(kind),
                    failed_at: ctx.now,
                });
                (new_state, effects)
            }

            // From Connecting
            (ConnectionState::Connecting(state), ConnectionEvent::TransportOpen { .. }) => {
                let new_state = ConnectionState::Connected(ConnectedState {
                    remote: state.remote,
                    session: state.session,
                    origin: state.origin,
                    opened_at: ctx.now,
                    envelopes_sent: 0,
                    envelopes_received: 0,
                });
                (new_state, vec![Effect::CancelConnectTimer])
            }

            (ConnectionState::Connecting(state), ConnectionEvent::Timeout { .. }) => {
                let new_state = ConnectionState::Errored(ErroredState {
                    remote: Some(state.remote),
                    reason: ErrorReason::Timeout,
                    failed_at: ctx.now,
                });
                (
                    new_state,
                    vec![Effect::CloseSession {
                        session: state.session,
                    }],
                )
            }

            (ConnectionState::Connecting(state), ConnectionEvent::TransportClose { .. }) => {
                let new_state = ConnectionState::Closed(ClosedState {
                    remote: Some(state.remote),
                    closed_at: ctx.now,
                    by_user: false,
                });
                (new_state, vec![Effect::CancelConnectTimer])
            }

            (ConnectionState::Connecting(state), ConnectionEvent::TransportError { kind, .. }) => {
                let new_state = ConnectionState::Errored(ErroredState {
                    remote: Some(state.remote),
                    reason: ErrorReason::Transport(kind),
                    failed_at: ctx.now,
                });
                let effects = vec![
                    Effect::CancelConnectTimer,
                    Effect::CloseSession {
                        session: state.session,
                    },
                ];
                (new_state, effects)
            }

            // From Connected
            (ConnectionState::Connected(mut state), ConnectionEvent::Activity { direction, .. }) => {
                match direction {
                    Direction::Sent => state.envelopes_sent += 1,
                    Direction::Received => state.envelopes_received += 1,
                }
                (ConnectionState::Connected(state), Vec::new())
            }

            (ConnectionState::Connected(state), ConnectionEvent::TransportClose { .. }) => {
                let new_state = ConnectionState::Closed(ClosedState {
                    remote: Some(state.remote),
                    closed_at: ctx.now,
                    by_user: false,
                });
                (new_state, Vec::new())
            }

            (ConnectionState::Connected(state), ConnectionEvent::TransportError { kind, .. }) => {
                let new_state = ConnectionState::Errored(ErroredState {
                    remote: Some(state.remote),
                    reason: ErrorReason::Transport(kind),
                    failed_at: ctx.now,
                });
                (
                    new_state,
                    vec![Effect::CloseSession {
                        session: state.session,
                    }],
                )
            }

            // Universal transitions
            (state, ConnectionEvent::Disconnect) => {
                let remote = state.remote().cloned();
                let effects = state.teardown_effects();
                let new_state = ConnectionState::Closed(ClosedState {
                    remote,
                    closed_at: ctx.now,
                    by_user: true,
                });
                (new_state, effects)
            }

            (state, ConnectionEvent::ReconnectExhausted) => {
                let remote = state.remote().cloned();
                let effects = state.teardown_effects();
                let new_state = ConnectionState::Errored(ErroredState {
                    remote,
                    reason: ErrorReason::MaxReconnectExceeded,
                    failed_at: ctx.now,
                });
                (new_state, effects)
            }

            // Invalid transitions
            (state, event) => {
                debug!("{} is not valid in {}", event.name(), state.state_name());
                return Err(StateTransitionError::InvalidTransition {
                    from_state: state.state_name().to_string(),
                    event: event.name().to_string(),
                    reason: format!("{} is not valid in {}", event.name(), state.state_name()),
                });
            }
        };

        debug!(
            "Connection {} -> {} on {}",
            from_state,
            new_state.state_name(),
            event_name
        );
        let audit_entry = AuditEntry {
            timestamp: ctx.now,
            from_state: from_state.to_string(),
            to_state: new_state.state_name().to_string(),
            event: event_name.to_string(),
            effects_count: effects.len(),
        };

        Ok(StateTransition {
            new_state,
            effects,
            audit_entry,
        })
    }

    /// Effects releasing the live session and its timer
    fn teardown_effects(&self) -> Vec<Effect> {
        match self {
            ConnectionState::Connecting(s) => vec![
                Effect::CancelConnectTimer,
                Effect::CloseSession { session: s.session },
            ],
            ConnectionState::Connected(s) => vec![Effect::CloseSession { session: s.session }],
            _ => Vec::new(),
        }
    }
}

fn connecting(
    remote: SessionIdentity,
    session: SessionId,
    origin: SessionOrigin,
    ctx: TransitionContext,
) -> ConnectionState {
    ConnectionState::Connecting(ConnectingState {
        remote,
        session,
        origin,
        started_at: ctx.now,
        deadline: ctx.now + ctx.connect_timeout.as_millis() as u64,
    })
}

// ----------------------------------------------------------------------------
// Connection Status
// ----------------------------------------------------------------------------

/// UI-facing summary of a [`ConnectionState`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting { remote: SessionIdentity },
    Connected { remote: SessionIdentity },
    Closed,
    Errored { reason: ErrorReason },
}

impl ConnectionStatus {
    /// Status line for this state
    pub fn status_text(&self) -> String {
        match self {
            ConnectionStatus::Idle => "Not connected".to_string(),
            ConnectionStatus::Connecting { .. } => "Connecting...".to_string(),
            ConnectionStatus::Connected { remote } => format!("Connected to {}", remote),
            ConnectionStatus::Closed => "Connection closed".to_string(),
            ConnectionStatus::Errored { reason } => match reason {
                ErrorReason::Timeout => "Connection timed out, please try again".to_string(),
                ErrorReason::Transport(kind) => kind.status_text().to_string(),
                ErrorReason::MaxReconnectExceeded => {
                    "Unable to reach the server, please restart".to_string()
                }
            },
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }
}

impl From<&ConnectionState> for ConnectionStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Idle => ConnectionStatus::Idle,
            ConnectionState::Connecting(s) => ConnectionStatus::Connecting {
                remote: s.remote.clone(),
            },
            ConnectionState::Connected(s) => ConnectionStatus::Connected {
                remote: s.remote.clone(),
            },
            ConnectionState::Closed(_) => ConnectionStatus::Closed,
            ConnectionState::Errored(s) => ConnectionStatus::Errored { reason: s.reason },
        }
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during state transitions
#[derive(Debug, Clone)]
pub enum StateTransitionError {
    /// Event not valid for the current state
    InvalidTransition {
        from_state: String,
        event: String,
        reason: String,
    },
    /// Signal for a session the machine no longer owns
    StaleSession {
        session: SessionId,
        state: String,
        event: String,
    },
}

impl StateTransitionError {
    pub fn is_stale(&self) -> bool {
        matches!(self, StateTransitionError::StaleSession { .. })
    }
}

impl fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTransitionError::InvalidTransition {
                from_state,
                event,
                reason,
            } => {
                write!(
                    f,
                    "Invalid transition from {} on event {}: {}",
                    from_state, event, reason
                )
            }
            StateTransitionError::StaleSession {
                session,
                state,
                event,
            } => {
                write!(f, "Ignoring {} for stale {} in {}", event, session, state)
            }
        }
    }
}

impl std::error::Error for StateTransitionError {}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(now: u64) -> TransitionContext {
        TransitionContext {
            now: Timestamp::new(now),
            connect_timeout: Duration::from_secs(20),
        }
    }

    fn peer(name: &str) -> SessionIdentity {
        SessionIdentity::parse(name).unwrap()
    }

    fn connected(remote: &str, session: u64) -> ConnectionState {
        let state = ConnectionState::Idle
            .transition(
                ConnectionEvent::Connect {
                    remote: peer(remote),
                    session: SessionId::new(session),
                },
                ctx(0),
            )
            .unwrap()
            .new_state;
        state
            .transition(
                ConnectionEvent::TransportOpen {
                    session: SessionId::new(session),
                },
                ctx(10),
            )
            .unwrap()
            .new_state
    }

    #[test]
    fn test_initial_state() {
        let state = ConnectionState::default();
        assert_eq!(state.state_name(), "Idle");
        assert!(!state.can_send());
        assert_eq!(state.active_session(), None);
        assert_eq!(ConnectionStatus::from(&state).status_text(), "Not connected");
    }

    #[test]
    fn test_connect_arms_timer_and_open_cancels_it() {
        let transition = ConnectionState::Idle
            .transition(
                ConnectionEvent::Connect {
                    remote: peer("peer-42"),
                    session: SessionId::new(1),
                },
                ctx(1_000),
            )
            .unwrap();
        assert_eq!(transition.new_state.state_name(), "Connecting");
        assert_eq!(
            transition.effects,
            vec![Effect::StartConnectTimer {
                session: SessionId::new(1),
                after: Duration::from_secs(20),
            }]
        );
        assert_eq!(
            transition.new_state.connect_deadline(),
            Some(Timestamp::new(21_000))
        );

        let transition = transition
            .new_state
            .transition(
                ConnectionEvent::TransportOpen {
                    session: SessionId::new(1),
                },
                ctx(1_500),
            )
            .unwrap();
        assert_eq!(transition.effects, vec![Effect::CancelConnectTimer]);
        assert!(transition.new_state.can_send());
        assert_eq!(
            ConnectionStatus::from(&transition.new_state),
            ConnectionStatus::Connected {
                remote: peer("peer-42")
            }
        );
        assert_eq!(transition.audit_entry.from_state, "Connecting");
        assert_eq!(transition.audit_entry.to_state, "Connected");
    }

    #[test]
    fn test_timeout_discards_session() {
        let state = ConnectionState::Idle
            .transition(
                ConnectionEvent::Connect {
                    remote: peer("peer-42"),
                    session: SessionId::new(1),
                },
                ctx(0),
            )
            .unwrap()
            .new_state;
        let transition = state
            .transition(
                ConnectionEvent::Timeout {
                    session: SessionId::new(1),
                },
                ctx(20_000),
            )
            .unwrap();
        assert_eq!(
            transition.effects,
            vec![Effect::CloseSession {
                session: SessionId::new(1)
            }]
        );
        match transition.new_state {
            ConnectionState::Errored(s) => assert_eq!(s.reason.as_str(), "timeout"),
            other => panic!("expected Errored, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_after_open_is_rejected_as_invalid() {
        let state = connected("peer-42", 1);
        let result = state.transition(
            ConnectionEvent::Timeout {
                session: SessionId::new(1),
            },
            ctx(20_000),
        );
        assert!(matches!(
            result,
            Err(StateTransitionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_incoming_session_goes_through_connecting() {
        let state = ConnectionState::Idle
            .transition(
                ConnectionEvent::IncomingSession {
                    remote: peer("caller"),
                    session: SessionId::new(5),
                },
                ctx(0),
            )
            .unwrap()
            .new_state;
        match &state {
            ConnectionState::Connecting(s) => assert_eq!(s.origin, SessionOrigin::Inbound),
            other => panic!("expected Connecting, got {:?}", other),
        }
        let state = state
            .transition(
                ConnectionEvent::TransportOpen {
                    session: SessionId::new(5),
                },
                ctx(1),
            )
            .unwrap()
            .new_state;
        assert_eq!(state.remote(), Some(&peer("caller")));
        assert!(state.can_send());
    }

    #[test]
    fn test_connect_supersedes_live_session() {
        let state = connected("peer-a", 1);
        let transition = state
            .transition(
                ConnectionEvent::Connect {
                    remote: peer("peer-b"),
                    session: SessionId::new(2),
                },
                ctx(100),
            )
            .unwrap();
        assert_eq!(
            transition.effects,
            vec![
                Effect::CloseSession {
                    session: SessionId::new(1)
                },
                Effect::StartConnectTimer {
                    session: SessionId::new(2),
                    after: Duration::from_secs(20),
                },
            ]
        );
        assert_eq!(transition.new_state.active_session(), Some(SessionId::new(2)));
    }

    #[test]
    fn test_signals_for_superseded_session_are_stale() {
        let state = connected("peer-a", 1)
            .transition(
                ConnectionEvent::Connect {
                    remote: peer("peer-b"),
                    session: SessionId::new(2),
                },
                ctx(100),
            )
            .unwrap()
            .new_state;
        let err = state
            .transition(
                ConnectionEvent::TransportClose {
                    session: SessionId::new(1),
                },
                ctx(101),
            )
            .unwrap_err();
        assert!(err.is_stale());
    }

    #[test]
    fn test_peer_close_ends_in_closed() {
        let state = connected("peer-a", 1);
        let transition = state
            .transition(
                ConnectionEvent::TransportClose {
                    session: SessionId::new(1),
                },
                ctx(50),
            )
            .unwrap();
        assert!(transition.effects.is_empty());
        match transition.new_state {
            ConnectionState::Closed(s) => assert!(!s.by_user),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn test_transport_error_while_connected() {
        let state = connected("peer-a", 1);
        let transition = state
            .transition(
                ConnectionEvent::TransportError {
                    session: SessionId::new(1),
                    kind: TransportErrorKind::NetworkIssue,
                },
                ctx(50),
            )
            .unwrap();
        assert_eq!(
            ConnectionStatus::from(&transition.new_state).status_text(),
            "Network connection issue"
        );
    }

    #[test]
    fn test_disconnect_from_any_state() {
        let state = ConnectionState::Idle
            .transition(ConnectionEvent::Disconnect, ctx(0))
            .unwrap()
            .new_state;
        assert_eq!(state.state_name(), "Closed");

        let transition = connected("peer-a", 1)
            .transition(ConnectionEvent::Disconnect, ctx(1))
            .unwrap();
        assert_eq!(
            transition.effects,
            vec![Effect::CloseSession {
                session: SessionId::new(1)
            }]
        );
        match transition.new_state {
            ConnectionState::Closed(s) => {
                assert!(s.by_user);
                assert_eq!(s.remote, Some(peer("peer-a")));
            }
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_and_errored_are_not_terminal() {
        let errored = ConnectionState::Idle
            .transition(
                ConnectionEvent::ConnectRejected {
                    remote: peer("ghost"),
                    kind: TransportErrorKind::PeerUnavailable,
                },
                ctx(0),
            )
            .unwrap()
            .new_state;
        assert_eq!(errored.state_name(), "Errored");

        let reconnecting = errored
            .transition(
                ConnectionEvent::Connect {
                    remote: peer("ghost"),
                    session: SessionId::new(9),
                },
                ctx(1),
            )
            .unwrap()
            .new_state;
        assert_eq!(reconnecting.state_name(), "Connecting");
    }

    #[test]
    fn test_reconnect_exhausted_is_terminal_error() {
        let transition = connected("peer-a", 1)
            .transition(ConnectionEvent::ReconnectExhausted, ctx(5))
            .unwrap();
        match &transition.new_state {
            ConnectionState::Errored(s) => {
                assert_eq!(s.reason.as_str(), "max-reconnect-exceeded");
                assert!(s.reason.is_terminal());
            }
            other => panic!("expected Errored, got {:?}", other),
        }
        assert_eq!(transition.effects.len(), 1);
    }

    #[test]
    fn test_activity_counts_envelopes() {
        let state = connected("peer-a", 1)
            .transition(
                ConnectionEvent::Activity {
                    session: SessionId::new(1),
                    direction: Direction::Sent,
                },
                ctx(2),
            )
            .unwrap()
            .new_state
            .transition(
                ConnectionEvent::Activity {
                    session: SessionId::new(1),
                    direction: Direction::Received,
                },
                ctx(3),
            )
            .unwrap()
            .new_state;
        match state {
            ConnectionState::Connected(s) => {
                assert_eq!(s.envelopes_sent, 1);
                assert_eq!(s.envelopes_received, 1);
            }
            other => panic!("expected Connected, got {:?}", other),
        }
    }

    #[test]
    fn test_open_while_idle_is_stale() {
        let err = ConnectionState::Idle
            .transition(
                ConnectionEvent::TransportOpen {
                    session: SessionId::new(1),
                },
                ctx(0),
            )
            .unwrap_err();
        assert!(err.is_stale());
    }
}
