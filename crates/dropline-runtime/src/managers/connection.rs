//! Connection state management for the Dropline runtime
//!
//! [`ConnectionManager`] owns the state machine, the transport session
//! handles it refers to and the audit trail of its transitions. It is the
//! only holder of session handles, so every `send` and `close` is routed
//! through it.

use dropline_core::protocol::{
    AuditEntry, ConnectionEvent, ConnectionState, ConnectionStatus, StateTransition,
    StateTransitionError, TransitionContext,
};
use dropline_core::{ConnectionConfig, Session, SessionId, TimeSource};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

/// Owns the single-session state machine and its session handles
pub struct ConnectionManager<T: TimeSource> {
    state: ConnectionState,
    /// Live session plus any superseded ones awaiting their close effect
    sessions: HashMap<SessionId, Box<dyn Session>>,
    audit_trail: VecDeque<AuditEntry>,
    audit_capacity: usize,
    connect_timeout: Duration,
    time_source: T,
    stats: ConnectionStats,
}

impl<T: TimeSource> ConnectionManager<T> {
    pub fn new(config: &ConnectionConfig, time_source: T) -> Self {
        Self {
            state: ConnectionState::Idle,
            sessions: HashMap::new(),
            audit_trail: VecDeque::new(),
            audit_capacity: config.audit_trail_capacity.max(1),
            connect_timeout: config.connect_timeout,
            time_source,
            stats: ConnectionStats::default(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from(&self.state)
    }

    pub fn can_send(&self) -> bool {
        self.state.can_send()
    }

    /// Handle of the session the machine currently owns
    pub fn active_session(&self) -> Option<&dyn Session> {
        let id = self.state.active_session()?;
        self.sessions.get(&id).map(|session| session.as_ref())
    }

    /// Hand a freshly created session to the manager before its
    /// `Connect`/`IncomingSession` event is processed
    pub fn attach(&mut self, session: Box<dyn Session>) -> SessionId {
        let id = session.id();
        self.sessions.insert(id, session);
        id
    }

    /// Take a session handle out, typically to close it
    pub fn release(&mut self, id: SessionId) -> Option<Box<dyn Session>> {
        self.sessions.remove(&id)
    }

    /// Process a connection event and update state
    pub fn process(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<StateTransition, StateTransitionError> {
        let ctx = TransitionContext {
            now: self.time_source.now(),
            connect_timeout: self.connect_timeout,
        };

        // Take the current state to consume it
        let current = std::mem::take(&mut self.state);
        let snapshot = current.clone();

        match current.transition(event, ctx) {
            Ok(transition) => {
                self.state = transition.new_state.clone();
                self.record(transition.audit_entry.clone());
                self.stats.state_transitions += 1;
                if matches!(self.state, ConnectionState::Connected(_))
                    && snapshot.state_name() != "Connected"
                {
                    self.stats.sessions_opened += 1;
                }
                self.retain_owned(&transition);
                Ok(transition)
            }
            Err(error) => {
                self.state = snapshot;
                if error.is_stale() {
                    self.stats.stale_signals_ignored += 1;
                } else {
                    self.stats.rejected_events += 1;
                }
                Err(error)
            }
        }
    }

    /// Put the machine back to `Idle`, releasing every session handle
    pub fn reset(&mut self) -> Vec<Box<dyn Session>> {
        let from = self.state.state_name().to_string();
        self.state = ConnectionState::Idle;
        self.record(AuditEntry {
            timestamp: self.time_source.now(),
            from_state: from,
            to_state: "Idle".to_string(),
            event: "Reset".to_string(),
            effects_count: 0,
        });
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    /// Drop handles the new state no longer refers to; handles named by a
    /// close effect stay until the effect releases them
    fn retain_owned(&mut self, transition: &StateTransition) {
        let active = self.state.active_session();
        let closing: Vec<SessionId> = transition
            .effects
            .iter()
            .filter_map(|effect| match effect {
                dropline_core::protocol::Effect::CloseSession { session } => Some(*session),
                _ => None,
            })
            .collect();
        self.sessions
            .retain(|id, _| Some(*id) == active || closing.contains(id));
    }

    fn record(&mut self, entry: AuditEntry) {
        self.audit_trail.push_back(entry);
        while self.audit_trail.len() > self.audit_capacity {
            self.audit_trail.pop_front();
        }
    }

    /// Get recent audit entries, oldest first
    pub fn recent_audit_entries(&self, limit: usize) -> Vec<AuditEntry> {
        let skip = self.audit_trail.len().saturating_sub(limit);
        self.audit_trail.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> &ConnectionStats {
        &self.stats
    }
}

/// Status line combining the machine state with endpoint health
///
/// Broker recovery takes precedence over the machine state, and an idle
/// machine on a registered endpoint reads as waiting for a peer.
pub fn compose_status_text(
    status: &ConnectionStatus,
    endpoint_online: bool,
    recovering: bool,
) -> String {
    if recovering && !status.is_connected() {
        return "Connection lost, attempting to reconnect...".to_string();
    }
    match status {
        ConnectionStatus::Idle if endpoint_online => "Online, waiting for connection".to_string(),
        other => other.status_text(),
    }
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Statistics for connection management
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Number of accepted state transitions
    pub state_transitions: u64,
    /// Number of times the machine entered `Connected`
    pub sessions_opened: u64,
    /// Signals dropped because they named a superseded session
    pub stale_signals_ignored: u64,
    /// Events the current state does not accept
    pub rejected_events: u64,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
