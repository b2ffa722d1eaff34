//! Loopback Transport for Testing
//!
//! An in-memory broker that pairs endpoints inside one process. Sessions
//! between two registered endpoints carry bytes for real; every call the
//! session layer makes is recorded so tests can assert on transport I/O, and
//! broker-level faults (disconnects, failed reconnects, errors) can be
//! injected on demand.

use dropline_core::{
    create_transport_event_channel, ConnectOptions, DroplineError, DroplineResult, Endpoint,
    Session, SessionId, SessionIdentity, Transport, TransportConfig, TransportError,
    TransportErrorKind, TransportEvent, TransportEventReceiver, TransportEventSender,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

// ----------------------------------------------------------------------------
// Loopback Configuration
// ----------------------------------------------------------------------------

/// How `Endpoint::reconnect` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectBehavior {
    /// Re-register with the broker and report open
    Succeed,
    /// Report a failure so the caller rebuilds the endpoint
    Fail,
    /// Report that the transport has no built-in reconnect
    Unsupported,
    /// Accept the request but never report open
    Stall,
}

/// Configuration for loopback broker behavior
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// New endpoints report open immediately
    pub auto_open_endpoints: bool,
    /// New sessions report open on both sides immediately
    pub auto_open_sessions: bool,
    pub reconnect: ReconnectBehavior,
    /// `create_endpoint` fails as if the broker were unreachable
    pub refuse_endpoints: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            auto_open_endpoints: true,
            auto_open_sessions: true,
            reconnect: ReconnectBehavior::Succeed,
            refuse_endpoints: false,
        }
    }
}

impl LoopbackConfig {
    /// Nothing opens by itself; tests signal every step
    pub fn manual() -> Self {
        Self {
            auto_open_endpoints: false,
            auto_open_sessions: false,
            reconnect: ReconnectBehavior::Succeed,
            refuse_endpoints: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Broker State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct EndpointSlot {
    events: TransportEventSender,
    online: bool,
}

#[derive(Debug, Clone)]
struct SessionSlot {
    owner: SessionIdentity,
    remote: SessionIdentity,
    peer: Option<SessionId>,
    open: bool,
    closed: bool,
}

/// One `send` observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub session: SessionId,
    pub bytes: Vec<u8>,
}

/// One `connect` observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub local: SessionIdentity,
    pub remote: SessionIdentity,
    pub session: SessionId,
    pub reliable: bool,
}

/// Endpoint and session calls in the order the broker saw them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    CreateEndpoint(SessionIdentity),
    Connect {
        local: SessionIdentity,
        remote: SessionIdentity,
        session: SessionId,
    },
    Close(SessionId),
    Reconnect(SessionIdentity),
    Destroy(SessionIdentity),
}

#[derive(Debug, Default)]
struct CallLog {
    endpoints_created: Vec<SessionIdentity>,
    connects: Vec<ConnectCall>,
    sends: Vec<SentFrame>,
    closes: Vec<SessionId>,
    reconnects: Vec<SessionIdentity>,
    destroyed: Vec<SessionIdentity>,
    history: Vec<BrokerCall>,
}

#[derive(Debug)]
struct BrokerState {
    config: LoopbackConfig,
    endpoints: HashMap<SessionIdentity, EndpointSlot>,
    sessions: HashMap<SessionId, SessionSlot>,
    next_session: u64,
    calls: CallLog,
}

impl BrokerState {
    fn emit(&self, owner: &SessionIdentity, event: TransportEvent) {
        if let Some(slot) = self.endpoints.get(owner) {
            if slot.events.send(event).is_err() {
                debug!("Loopback: endpoint {} stopped listening", owner);
            }
        }
    }

    fn allocate(&mut self) -> SessionId {
        self.next_session += 1;
        SessionId::new(self.next_session)
    }

    /// Close one side and tell both owners
    fn close_pair(&mut self, id: SessionId) {
        let Some(slot) = self.sessions.get_mut(&id) else {
            return;
        };
        if slot.closed {
            return;
        }
        slot.closed = true;
        slot.open = false;
        let owner = slot.owner.clone();
        let peer = slot.peer;
        self.emit(&owner, TransportEvent::SessionClose { id });

        if let Some(peer_id) = peer {
            if let Some(peer_slot) = self.sessions.get_mut(&peer_id) {
                if !peer_slot.closed {
                    peer_slot.closed = true;
                    peer_slot.open = false;
                    let peer_owner = peer_slot.owner.clone();
                    self.emit(&peer_owner, TransportEvent::SessionClose { id: peer_id });
                }
            }
        }
    }

    fn mark_open(&mut self, id: SessionId) {
        if let Some(slot) = self.sessions.get_mut(&id) {
            if slot.closed || slot.open {
                return;
            }
            slot.open = true;
            let owner = slot.owner.clone();
            self.emit(&owner, TransportEvent::SessionOpen { id });
        }
    }
}

/// Transfer counters
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub frames_sent: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub sessions_opened: AtomicU64,
}

// ----------------------------------------------------------------------------
// Loopback Broker
// ----------------------------------------------------------------------------

/// Shared in-memory broker; clones observe the same network
#[derive(Debug, Clone)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
    stats: Arc<LoopbackStats>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl LoopbackBroker {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                config,
                endpoints: HashMap::new(),
                sessions: HashMap::new(),
                next_session: 0,
                calls: CallLog::default(),
            })),
            stats: Arc::new(LoopbackStats::default()),
        }
    }

    /// Transport handle to give to a runtime
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            broker: self.clone(),
        }
    }

    pub fn stats(&self) -> &LoopbackStats {
        &self.stats
    }

    /// Register a scripted remote peer under `identity`
    pub async fn add_peer(&self, identity: &str) -> DroplineResult<RemotePeer> {
        let identity = SessionIdentity::parse(identity)?;
        let (events, receiver) = create_transport_event_channel();
        let endpoint = self.register(identity, events, true).await;
        Ok(RemotePeer {
            endpoint,
            events: receiver,
        })
    }

    async fn register(
        &self,
        identity: SessionIdentity,
        events: TransportEventSender,
        force_open: bool,
    ) -> LoopbackEndpoint {
        let mut state = self.state.lock().await;
        let open = force_open || state.config.auto_open_endpoints;
        state.endpoints.insert(
            identity.clone(),
            EndpointSlot {
                events,
                online: open,
            },
        );
        state.calls.endpoints_created.push(identity.clone());
        state
            .calls
            .history
            .push(BrokerCall::CreateEndpoint(identity.clone()));
        if open {
            state.emit(
                &identity,
                TransportEvent::EndpointOpen {
                    identity: identity.clone(),
                },
            );
        }
        debug!("Loopback: registered endpoint {}", identity);

        LoopbackEndpoint {
            identity,
            broker: self.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    pub async fn set_auto_open_endpoints(&self, enabled: bool) {
        self.state.lock().await.config.auto_open_endpoints = enabled;
    }

    pub async fn set_auto_open_sessions(&self, enabled: bool) {
        self.state.lock().await.config.auto_open_sessions = enabled;
    }

    pub async fn set_reconnect_behavior(&self, behavior: ReconnectBehavior) {
        self.state.lock().await.config.reconnect = behavior;
    }

    pub async fn set_refuse_endpoints(&self, refuse: bool) {
        self.state.lock().await.config.refuse_endpoints = refuse;
    }

    /// Report the endpoint as registered
    pub async fn open_endpoint(&self, identity: &SessionIdentity) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.endpoints.get_mut(identity) {
            slot.online = true;
            state.emit(
                identity,
                TransportEvent::EndpointOpen {
                    identity: identity.clone(),
                },
            );
        }
    }

    /// Drop the endpoint's signalling channel
    pub async fn disconnect_endpoint(&self, identity: &SessionIdentity) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.endpoints.get_mut(identity) {
            slot.online = false;
            state.emit(identity, TransportEvent::EndpointDisconnected);
            debug!("Loopback: broker dropped {}", identity);
        }
    }

    /// Raise an endpoint-level error signal
    pub async fn fail_endpoint(&self, identity: &SessionIdentity, kind: TransportErrorKind) {
        let state = self.state.lock().await;
        state.emit(
            identity,
            TransportEvent::EndpointError {
                kind,
                message: format!("injected {}", kind),
            },
        );
    }

    /// Report a session as open to its owner
    pub async fn open_session(&self, id: SessionId) {
        let mut state = self.state.lock().await;
        state.mark_open(id);
        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Close a session from the far side
    pub async fn close_session(&self, id: SessionId) {
        self.state.lock().await.close_pair(id);
    }

    /// Raise a session-level error to its owner
    pub async fn fail_session(&self, id: SessionId, kind: TransportErrorKind) {
        let state = self.state.lock().await;
        if let Some(slot) = state.sessions.get(&id) {
            state.emit(
                &slot.owner,
                TransportEvent::SessionError {
                    id,
                    kind,
                    message: format!("injected {}", kind),
                },
            );
        }
    }

    /// Deliver raw bytes to the owner of a session
    pub async fn inject_data(&self, id: SessionId, bytes: Vec<u8>) {
        let state = self.state.lock().await;
        if let Some(slot) = state.sessions.get(&id) {
            state.emit(&slot.owner, TransportEvent::SessionData { id, bytes });
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn sends(&self) -> Vec<SentFrame> {
        self.state.lock().await.calls.sends.clone()
    }

    pub async fn closes(&self) -> Vec<SessionId> {
        self.state.lock().await.calls.closes.clone()
    }

    pub async fn connects(&self) -> Vec<ConnectCall> {
        self.state.lock().await.calls.connects.clone()
    }

    pub async fn reconnect_calls(&self) -> usize {
        self.state.lock().await.calls.reconnects.len()
    }

    pub async fn endpoints_created(&self) -> Vec<SessionIdentity> {
        self.state.lock().await.calls.endpoints_created.clone()
    }

    pub async fn destroyed(&self) -> Vec<SessionIdentity> {
        self.state.lock().await.calls.destroyed.clone()
    }

    /// Every endpoint and session call, in order
    pub async fn history(&self) -> Vec<BrokerCall> {
        self.state.lock().await.calls.history.clone()
    }

    pub async fn is_open(&self, id: SessionId) -> bool {
        self.state
            .lock()
            .await
            .sessions
            .get(&id)
            .is_some_and(|s| s.open && !s.closed)
    }

    /// Sessions owned by `identity` that are not closed
    pub async fn live_sessions(&self, identity: &SessionIdentity) -> Vec<SessionId> {
        let state = self.state.lock().await;
        let mut ids: Vec<_> = state
            .sessions
            .iter()
            .filter(|(_, s)| &s.owner == identity && !s.closed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Whether `identity` is registered and online
    pub async fn is_online(&self, identity: &SessionIdentity) -> bool {
        self.state
            .lock()
            .await
            .endpoints
            .get(identity)
            .is_some_and(|slot| slot.online)
    }
}

// ----------------------------------------------------------------------------
// Transport, Endpoint and Session
// ----------------------------------------------------------------------------

/// [`Transport`] backed by a [`LoopbackBroker`]
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    broker: LoopbackBroker,
}

impl LoopbackTransport {
    pub fn broker(&self) -> &LoopbackBroker {
        &self.broker
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn create_endpoint(
        &self,
        identity: SessionIdentity,
        _config: &TransportConfig,
        events: TransportEventSender,
    ) -> DroplineResult<Box<dyn Endpoint>> {
        if self.broker.state.lock().await.config.refuse_endpoints {
            debug!("Loopback: refusing endpoint {}", identity);
            return Err(DroplineError::transport_signalled(
                TransportErrorKind::NetworkIssue,
                "broker unreachable",
            ));
        }
        let endpoint = self.broker.register(identity, events, false).await;
        Ok(Box::new(endpoint))
    }
}

/// Endpoint registered with a loopback broker
#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    identity: SessionIdentity,
    broker: LoopbackBroker,
}

#[async_trait::async_trait]
impl Endpoint for LoopbackEndpoint {
    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    async fn connect(
        &self,
        remote: &SessionIdentity,
        options: ConnectOptions,
    ) -> DroplineResult<Box<dyn Session>> {
        let mut state = self.broker.state.lock().await;

        let online = state
            .endpoints
            .get(&self.identity)
            .is_some_and(|slot| slot.online);
        if !online {
            return Err(DroplineError::Transport(TransportError::EndpointUnavailable));
        }

        let local_id = state.allocate();
        state.calls.connects.push(ConnectCall {
            local: self.identity.clone(),
            remote: remote.clone(),
            session: local_id,
            reliable: options.reliable,
        });
        state.calls.history.push(BrokerCall::Connect {
            local: self.identity.clone(),
            remote: remote.clone(),
            session: local_id,
        });

        let remote_online = remote != &self.identity
            && state
                .endpoints
                .get(remote)
                .is_some_and(|slot| slot.online);

        if remote_online {
            let remote_id = state.allocate();
            state.sessions.insert(
                local_id,
                SessionSlot {
                    owner: self.identity.clone(),
                    remote: remote.clone(),
                    peer: Some(remote_id),
                    open: false,
                    closed: false,
                },
            );
            state.sessions.insert(
                remote_id,
                SessionSlot {
                    owner: remote.clone(),
                    remote: self.identity.clone(),
                    peer: Some(local_id),
                    open: false,
                    closed: false,
                },
            );

            let inbound = LoopbackSession {
                id: remote_id,
                remote: self.identity.clone(),
                broker: self.broker.clone(),
            };
            state.emit(
                remote,
                TransportEvent::IncomingSession {
                    session: Box::new(inbound),
                },
            );

            if state.config.auto_open_sessions {
                state.mark_open(remote_id);
                state.mark_open(local_id);
                self.broker
                    .stats
                    .sessions_opened
                    .fetch_add(2, Ordering::Relaxed);
            }
        } else {
            state.sessions.insert(
                local_id,
                SessionSlot {
                    owner: self.identity.clone(),
                    remote: remote.clone(),
                    peer: None,
                    open: false,
                    closed: false,
                },
            );
            state.emit(
                &self.identity,
                TransportEvent::EndpointError {
                    kind: TransportErrorKind::PeerUnavailable,
                    message: format!("Could not connect to peer {}", remote),
                },
            );
        }

        debug!("Loopback: {} -> {} as {}", self.identity, remote, local_id);
        Ok(Box::new(LoopbackSession {
            id: local_id,
            remote: remote.clone(),
            broker: self.broker.clone(),
        }))
    }

    async fn reconnect(&self) -> DroplineResult<()> {
        let mut state = self.broker.state.lock().await;
        state.calls.reconnects.push(self.identity.clone());
        state
            .calls
            .history
            .push(BrokerCall::Reconnect(self.identity.clone()));

        match state.config.reconnect {
            ReconnectBehavior::Succeed => {
                let Some(slot) = state.endpoints.get_mut(&self.identity) else {
                    return Err(DroplineError::Transport(TransportError::EndpointUnavailable));
                };
                slot.online = true;
                state.emit(
                    &self.identity,
                    TransportEvent::EndpointOpen {
                        identity: self.identity.clone(),
                    },
                );
                Ok(())
            }
            ReconnectBehavior::Fail => Err(DroplineError::transport_signalled(
                TransportErrorKind::BrokerDisconnected,
                "broker refused the reconnect",
            )),
            ReconnectBehavior::Unsupported => Err(DroplineError::unsupported("reconnect")),
            ReconnectBehavior::Stall => Ok(()),
        }
    }

    async fn destroy(&self) {
        let mut state = self.broker.state.lock().await;
        state.calls.destroyed.push(self.identity.clone());
        state
            .calls
            .history
            .push(BrokerCall::Destroy(self.identity.clone()));

        let owned: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.owner == self.identity && !s.closed)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            state.close_pair(id);
        }
        state.endpoints.remove(&self.identity);
        debug!("Loopback: destroyed endpoint {}", self.identity);
    }
}

/// One side of a loopback session
#[derive(Debug, Clone)]
pub struct LoopbackSession {
    id: SessionId,
    remote: SessionIdentity,
    broker: LoopbackBroker,
}

#[async_trait::async_trait]
impl Session for LoopbackSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn remote(&self) -> &SessionIdentity {
        &self.remote
    }

    async fn send(&self, bytes: Vec<u8>) -> DroplineResult<()> {
        let mut state = self.broker.state.lock().await;
        state.calls.sends.push(SentFrame {
            session: self.id,
            bytes: bytes.clone(),
        });
        self.broker.stats.frames_sent.fetch_add(1, Ordering::Relaxed);

        let Some(slot) = state.sessions.get(&self.id).cloned() else {
            return Err(DroplineError::Transport(TransportError::SendFailed {
                reason: format!("unknown {}", self.id),
            }));
        };
        if slot.closed || !slot.open {
            self.broker
                .stats
                .frames_dropped
                .fetch_add(1, Ordering::Relaxed);
            return Err(DroplineError::Transport(TransportError::SendFailed {
                reason: format!("{} is not open", self.id),
            }));
        }

        if let Some(peer_id) = slot.peer {
            if let Some(peer) = state.sessions.get(&peer_id) {
                if !peer.closed {
                    state.emit(
                        &peer.owner,
                        TransportEvent::SessionData {
                            id: peer_id,
                            bytes,
                        },
                    );
                    self.broker
                        .stats
                        .frames_delivered
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.broker.state.lock().await;
        state.calls.closes.push(self.id);
        state.calls.history.push(BrokerCall::Close(self.id));
        state.close_pair(self.id);
    }
}

// ----------------------------------------------------------------------------
// Remote Peer
// ----------------------------------------------------------------------------

/// Scripted far side of a session, driven directly by a test
pub struct RemotePeer {
    endpoint: LoopbackEndpoint,
    events: TransportEventReceiver,
}

impl RemotePeer {
    pub fn identity(&self) -> &SessionIdentity {
        &self.endpoint.identity
    }

    pub fn endpoint(&self) -> &LoopbackEndpoint {
        &self.endpoint
    }

    /// Next signal the broker raised for this peer
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Signal already queued for this peer, if any
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next inbound session, skipping other signals
    pub async fn accept(&mut self) -> Option<Box<dyn Session>> {
        while let Some(event) = self.events.recv().await {
            if let TransportEvent::IncomingSession { session } = event {
                return Some(session);
            }
        }
        None
    }

    /// Wait for data on any session, skipping other signals
    pub async fn next_data(&mut self) -> Option<(SessionId, Vec<u8>)> {
        while let Some(event) = self.events.recv().await {
            if let TransportEvent::SessionData { id, bytes } = event {
                return Some((id, bytes));
            }
        }
        None
    }

    /// Open a session from this peer to `remote`
    pub async fn connect(&self, remote: &SessionIdentity) -> DroplineResult<Box<dyn Session>> {
        self.endpoint.connect(remote, ConnectOptions::default()).await
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
