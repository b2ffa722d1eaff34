//! Session driver task
//!
//! A single task owns the endpoint, the connection state machine, recovery
//! bookkeeping and envelope delivery. User commands, transport signals and
//! both timers (connect timeout, recovery backoff) are multiplexed on one
//! `tokio::select!` loop, so transitions never run concurrently.

use crate::managers::{
    compose_status_text, ConnectionManager, DeliveryManager, RecoveryManager, RecoveryStep,
    SharedTimeline,
};
use crate::runtime::{RuntimeSnapshot, RuntimeStats};
use dropline_core::protocol::{
    AuditEntry, ConnectionEvent, ConnectionState, Effect, ReconnectDecision,
};
use dropline_core::{
    create_transport_event_channel, ConnectOptions, ConnectionStatus, Direction, DroplineConfig,
    DroplineError, DroplineEvent, DroplineEventSender, DroplineResult, Endpoint, Envelope,
    IdentityGenerator, LaunchRequest, RecordId, SessionId, SessionIdentity, SystemTimeSource,
    Transport, TransportErrorKind, TransportEvent, TransportEventReceiver,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Requests from runtime handles to the driver
#[derive(Debug)]
pub enum RuntimeCommand {
    /// Open a session to `remote`, superseding any current one
    Connect {
        remote: SessionIdentity,
        reply: oneshot::Sender<DroplineResult<()>>,
    },
    /// Send an envelope over the open session
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<DroplineResult<RecordId>>,
    },
    /// Tear the session down and stop recovery
    Disconnect { reply: oneshot::Sender<()> },
    /// Replace the endpoint under a fresh identity and start over
    Restart {
        reply: oneshot::Sender<DroplineResult<SessionIdentity>>,
    },
    /// Report identity, state and counters
    Snapshot {
        reply: oneshot::Sender<RuntimeSnapshot>,
    },
    /// Report the most recent transitions
    AuditTrail {
        limit: usize,
        reply: oneshot::Sender<Vec<AuditEntry>>,
    },
    Shutdown,
}

pub type RuntimeCommandSender = mpsc::Sender<RuntimeCommand>;
pub type RuntimeCommandReceiver = mpsc::Receiver<RuntimeCommand>;

// ----------------------------------------------------------------------------
// Session Driver Task
// ----------------------------------------------------------------------------

/// Owns every piece of session state and serializes all changes to it
pub struct SessionDriverTask {
    config: DroplineConfig,
    transport: Arc<dyn Transport>,
    identities: IdentityGenerator,
    identity: SessionIdentity,
    endpoint: Option<Box<dyn Endpoint>>,
    /// Signals from the current endpoint only; replaced with the endpoint
    transport_events: Option<TransportEventReceiver>,
    /// The current endpoint has reported open at least once
    announced: bool,

    commands: RuntimeCommandReceiver,
    events: DroplineEventSender,

    connection: ConnectionManager<SystemTimeSource>,
    recovery: RecoveryManager,
    delivery: DeliveryManager<SystemTimeSource>,

    connect_deadline: Option<(SessionId, Instant)>,
    /// Connect requested before the endpoint registered
    pending_connect: Option<SessionIdentity>,
    launch: Option<LaunchRequest>,
    published: Option<(ConnectionStatus, String)>,
    published_state: &'static str,
    running: bool,
}

impl SessionDriverTask {
    /// Create the driver and register its first endpoint
    pub async fn start(
        config: DroplineConfig,
        transport: Arc<dyn Transport>,
        identity: SessionIdentity,
        launch: Option<LaunchRequest>,
        commands: RuntimeCommandReceiver,
        events: DroplineEventSender,
        timeline: SharedTimeline,
    ) -> DroplineResult<Self> {
        let mut task = Self {
            connection: ConnectionManager::new(&config.connection, SystemTimeSource),
            recovery: RecoveryManager::new(&config.reconnect),
            delivery: DeliveryManager::new(SystemTimeSource, timeline),
            config,
            transport,
            identities: IdentityGenerator::new(),
            identity: identity.clone(),
            endpoint: None,
            transport_events: None,
            announced: false,
            commands,
            events,
            connect_deadline: None,
            pending_connect: None,
            launch,
            published: None,
            published_state: "Idle",
            running: true,
        };
        task.create_endpoint(identity).await?;
        Ok(task)
    }

    pub async fn run(mut self) -> DroplineResult<()> {
        info!("Session driver starting as {}", self.identity);

        while self.running {
            let connect_deadline = self.connect_deadline.map(|(_, at)| at);
            let backoff_deadline = self.recovery.deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All runtime handles dropped, stopping driver");
                        break;
                    }
                },
                event = next_transport_event(&mut self.transport_events) => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        debug!("Endpoint {} stopped reporting", self.identity);
                        self.transport_events = None;
                    }
                },
                _ = sleep_until_opt(connect_deadline) => self.on_connect_deadline().await,
                _ = sleep_until_opt(backoff_deadline) => self.on_backoff_due().await,
            }

            self.publish_status();
        }

        self.teardown().await;
        info!("Session driver stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: RuntimeCommand) {
        match command {
            RuntimeCommand::Connect { remote, reply } => {
                let result = self.handle_connect(remote).await;
                let _ = reply.send(result);
            }
            RuntimeCommand::Send { envelope, reply } => {
                let result = self.handle_send(envelope).await;
                let _ = reply.send(result);
            }
            RuntimeCommand::Disconnect { reply } => {
                self.handle_disconnect().await;
                let _ = reply.send(());
            }
            RuntimeCommand::Restart { reply } => {
                let result = self.handle_restart().await;
                if let Err(e) = &result {
                    error!("Restart failed: {}", e);
                }
                let _ = reply.send(result);
            }
            RuntimeCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
            RuntimeCommand::AuditTrail { limit, reply } => {
                let _ = reply.send(self.connection.recent_audit_entries(limit));
            }
            RuntimeCommand::Shutdown => {
                info!("Shutdown requested");
                self.running = false;
            }
        }
    }

    async fn handle_connect(&mut self, remote: SessionIdentity) -> DroplineResult<()> {
        info!("Connect to {} requested", remote);
        self.recovery.on_user_connect(remote.clone());

        if self.endpoint.is_some() && self.recovery.endpoint_online() {
            return self.open_session(remote).await;
        }

        debug!("Endpoint not registered; deferring connect to {}", remote);
        self.pending_connect = Some(remote);
        if (self.endpoint.is_none() || self.announced) && !self.recovery.has_pending() {
            let decision = self.recovery.request_recovery(Instant::now());
            self.handle_decision(decision, true).await;
        }
        Ok(())
    }

    async fn open_session(&mut self, remote: SessionIdentity) -> DroplineResult<()> {
        let Some(endpoint) = self.endpoint.as_ref() else {
            return Err(DroplineError::Transport(
                dropline_core::TransportError::EndpointUnavailable,
            ));
        };
        let options = ConnectOptions {
            reliable: self.config.connection.reliable,
        };

        // the prior session goes away before the transport sees the new one
        if let Some(previous) = self.connection.state().active_session() {
            if let Some(handle) = self.connection.release(previous) {
                debug!("Closing {} before connecting to {}", previous, remote);
                handle.close().await;
            }
        }

        match endpoint.connect(&remote, options).await {
            Ok(session) => {
                debug!("Opened {} to {}", session.id(), remote);
                let session = self.connection.attach(session);
                self.apply(ConnectionEvent::Connect { remote, session })
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!("Transport refused session to {}: {}", remote, e);
                let kind = e.transport_kind().unwrap_or(TransportErrorKind::Other);
                self.apply(ConnectionEvent::ConnectRejected { remote, kind })
                    .await;
                Err(e)
            }
        }
    }

    async fn handle_send(&mut self, envelope: Envelope) -> DroplineResult<RecordId> {
        if !self.connection.can_send() {
            debug!(
                "Send refused in state {}",
                self.connection.state().state_name()
            );
            return Err(DroplineError::not_connected());
        }

        let bytes = match self.delivery.frame_outbound(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Rejected outbound {} envelope: {}", envelope.kind().as_str(), e);
                self.emit(DroplineEvent::EnvelopeRejected {
                    direction: Direction::Sent,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let Some(session) = self.connection.active_session() else {
            return Err(DroplineError::not_connected());
        };
        let session_id = session.id();
        if let Err(e) = session.send(bytes).await {
            warn!("Send on {} failed: {}", session_id, e);
            self.delivery.record_send_failure();
            return Err(e);
        }

        let record = self.delivery.record_sent(&envelope).await;
        let record_id = record.id;
        self.apply(ConnectionEvent::Activity {
            session: session_id,
            direction: Direction::Sent,
        })
        .await;
        self.emit(DroplineEvent::RecordAppended { record });
        Ok(record_id)
    }

    async fn handle_disconnect(&mut self) {
        info!("Disconnect requested");
        self.recovery.on_user_disconnect();
        self.pending_connect = None;
        self.apply(ConnectionEvent::Disconnect).await;
    }

    async fn handle_restart(&mut self) -> DroplineResult<SessionIdentity> {
        info!("Restarting endpoint {}", self.identity);
        for session in self.connection.reset() {
            session.close().await;
        }
        self.connect_deadline = None;
        self.pending_connect = None;
        self.recovery.reset();
        self.publish_status();

        match self.replace_identity().await {
            Ok(identity) => Ok(identity),
            Err(e) => {
                warn!("No endpoint after restart: {}", e);
                let decision = self.recovery.on_reopen_failed(Instant::now());
                self.handle_decision(decision, true).await;
                Err(e)
            }
        }
    }

    async fn snapshot(&self) -> RuntimeSnapshot {
        let timeline_len = self.delivery.timeline().read().await.len();
        RuntimeSnapshot {
            identity: self.identity.clone(),
            endpoint_online: self.recovery.endpoint_online(),
            state: self.connection.state().clone(),
            status: self.connection.status(),
            status_text: self.status_text(),
            stats: RuntimeStats {
                connection: self.connection.statistics().clone(),
                delivery: self.delivery.statistics().clone(),
                recovery: self.recovery.statistics().clone(),
                timeline_len,
            },
        }
    }

    // ------------------------------------------------------------------
    // Transport Signals
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        debug!("Transport event: {:?}", event);
        match event {
            TransportEvent::EndpointOpen { identity } => self.on_endpoint_open(identity).await,
            TransportEvent::EndpointDisconnected => self.on_broker_lost().await,
            TransportEvent::EndpointError { kind, message } => {
                self.on_endpoint_error(kind, message).await
            }
            TransportEvent::IncomingSession { session } => {
                let remote = session.remote().clone();
                info!("Incoming session {} from {}", session.id(), remote);
                self.recovery.on_session_established();
                let session = self.connection.attach(session);
                self.apply(ConnectionEvent::IncomingSession { remote, session })
                    .await;
            }
            TransportEvent::SessionOpen { id } => {
                if self.apply(ConnectionEvent::TransportOpen { session: id }).await {
                    info!("Session {} open", id);
                    self.recovery.on_session_established();
                }
            }
            TransportEvent::SessionData { id, bytes } => self.on_session_data(id, bytes).await,
            TransportEvent::SessionClose { id } => {
                self.apply(ConnectionEvent::TransportClose { session: id })
                    .await;
            }
            TransportEvent::SessionError { id, kind, message } => {
                warn!("Session {} error ({}): {}", id, kind, message);
                self.apply(ConnectionEvent::TransportError { session: id, kind })
                    .await;
            }
        }
    }

    async fn on_endpoint_open(&mut self, identity: SessionIdentity) {
        if identity != self.identity {
            debug!("Ignoring open for retired identity {}", identity);
            return;
        }
        let resume = self.recovery.on_endpoint_open();

        if !self.announced {
            self.announced = true;
            info!("Endpoint registered as {}", identity);
            self.emit(DroplineEvent::IdentityAssigned {
                identity: identity.clone(),
            });
        } else {
            info!("Endpoint {} re-registered", identity);
        }

        let mut target = self.pending_connect.take();
        if let Some(launch) = self.launch.take() {
            if let Some(remote) = launch.remote {
                info!("Launch URL requests connect to {}", remote);
                self.emit(DroplineEvent::LaunchUrlConsumed {
                    remote: remote.clone(),
                    cleaned: launch.cleaned,
                });
                if target.is_none() {
                    self.recovery.on_user_connect(remote.clone());
                    target = Some(remote);
                }
            }
        }
        if target.is_none() && self.connection.state().active_session().is_none() {
            target = resume;
        }

        if let Some(remote) = target {
            if let Err(e) = self.open_session(remote).await {
                debug!("Connect after endpoint open failed: {}", e);
            }
        }
    }

    async fn on_broker_lost(&mut self) {
        warn!("Lost broker connection for {}", self.identity);
        let had_session = self.connection.state().active_session().is_some();
        let decision = self.recovery.on_broker_lost(Instant::now(), had_session);
        self.handle_decision(decision, true).await;
    }

    async fn on_endpoint_error(&mut self, kind: TransportErrorKind, message: String) {
        warn!("Endpoint error ({}): {}", kind, message);
        if !self.recovery.endpoint_online() && kind.is_retryable() {
            info!("Endpoint {} still offline after {}", self.identity, kind);
            let decision = self.recovery.on_reopen_failed(Instant::now());
            self.handle_decision(decision, true).await;
            return;
        }
        if kind == TransportErrorKind::BrokerDisconnected {
            self.on_broker_lost().await;
            return;
        }

        if let ConnectionState::Connecting(state) = self.connection.state() {
            let session = state.session;
            self.apply(ConnectionEvent::TransportError { session, kind })
                .await;
        }

        let peer_failure = matches!(
            kind,
            TransportErrorKind::PeerUnavailable | TransportErrorKind::NetworkIssue
        );
        if peer_failure && self.recovery.endpoint_online() && !self.connection.can_send() {
            if let Some(decision) = self.recovery.on_session_failure(Instant::now()) {
                self.handle_decision(decision, false).await;
            }
        }
    }

    async fn on_session_data(&mut self, id: SessionId, bytes: Vec<u8>) {
        if !self.connection.can_send() || self.connection.state().active_session() != Some(id) {
            debug!("Dropping {} bytes for inactive {}", bytes.len(), id);
            return;
        }

        match self.delivery.accept_inbound(&bytes).await {
            Ok(record) => {
                debug!("Received {:?} on {}", record.kind(), id);
                self.apply(ConnectionEvent::Activity {
                    session: id,
                    direction: Direction::Received,
                })
                .await;
                self.emit(DroplineEvent::RecordAppended { record });
            }
            Err(e) => {
                warn!("Rejected inbound envelope on {}: {}", id, e);
                self.emit(DroplineEvent::EnvelopeRejected {
                    direction: Direction::Received,
                    reason: e.to_string(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers and Recovery
    // ------------------------------------------------------------------

    async fn on_connect_deadline(&mut self) {
        if let Some((session, _)) = self.connect_deadline.take() {
            info!("Connect timer for {} expired", session);
            self.apply(ConnectionEvent::Timeout { session }).await;
        }
    }

    async fn on_backoff_due(&mut self) {
        let Some(step) = self.recovery.take_due(Instant::now()) else {
            return;
        };

        match step {
            RecoveryStep::ReconnectEndpoint { attempt } => {
                let Some(endpoint) = self.endpoint.as_ref() else {
                    info!("Attempt {}: no endpoint, building a new one", attempt);
                    self.rebuild_endpoint().await;
                    return;
                };
                info!("Attempt {}: reconnecting {}", attempt, self.identity);
                if let Err(e) = endpoint.reconnect().await {
                    warn!("Reconnect of {} failed: {}", self.identity, e);
                    self.rebuild_endpoint().await;
                }
            }
            RecoveryStep::RetrySession { attempt, remote } => {
                info!("Attempt {}: reconnecting to {}", attempt, remote);
                if let Err(e) = self.open_session(remote).await {
                    debug!("Retry connect failed: {}", e);
                }
            }
        }
    }

    async fn handle_decision(&mut self, decision: ReconnectDecision, broker: bool) {
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                info!("Reconnect attempt {} scheduled in {:?}", attempt, delay);
                self.emit(DroplineEvent::ReconnectScheduled { attempt, delay });
            }
            ReconnectDecision::GiveUp { attempts } => {
                error!("Giving up after {} reconnect attempts", attempts);
                if broker {
                    self.apply(ConnectionEvent::ReconnectExhausted).await;
                }
                self.emit(DroplineEvent::ReconnectExhausted { attempts });
            }
            ReconnectDecision::AlreadyExhausted => {
                debug!("Recovery already exhausted; restart required");
            }
            ReconnectDecision::Suppressed => {
                debug!("Recovery suppressed or already pending");
            }
        }
    }

    /// Destroy the endpoint and register a new one under a fresh identity
    async fn rebuild_endpoint(&mut self) {
        if let Some(session) = self.connection.state().active_session() {
            self.apply(ConnectionEvent::TransportError {
                session,
                kind: TransportErrorKind::BrokerDisconnected,
            })
            .await;
        }

        if let Err(e) = self.replace_identity().await {
            error!("Could not create a replacement endpoint: {}", e);
            let decision = self.recovery.on_reopen_failed(Instant::now());
            self.handle_decision(decision, true).await;
        }
    }

    async fn replace_identity(&mut self) -> DroplineResult<SessionIdentity> {
        if let Some(old) = self.endpoint.take() {
            old.destroy().await;
        }
        self.transport_events = None;
        self.announced = false;

        let old = self.identity.clone();
        let identity = self.identities.generate();
        self.create_endpoint(identity.clone()).await?;
        self.recovery.on_identity_reset();

        info!("Identity {} replaced by {}", old, identity);
        self.emit(DroplineEvent::IdentityReplaced {
            old,
            new: identity.clone(),
        });
        Ok(identity)
    }

    async fn create_endpoint(&mut self, identity: SessionIdentity) -> DroplineResult<()> {
        let (sender, receiver) = create_transport_event_channel();
        let endpoint = self
            .transport
            .create_endpoint(identity.clone(), &self.config.transport, sender)
            .await?;
        debug!("Created endpoint {}", identity);

        self.endpoint = Some(endpoint);
        self.transport_events = Some(receiver);
        self.identity = identity;
        self.announced = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // State Machine Plumbing
    // ------------------------------------------------------------------

    /// Feed one event to the state machine and run its effects
    ///
    /// Returns whether the event was accepted.
    async fn apply(&mut self, event: ConnectionEvent) -> bool {
        match self.connection.process(event) {
            Ok(transition) => {
                for effect in transition.effects {
                    self.run_effect(effect).await;
                }
                self.publish_status();
                true
            }
            Err(e) if e.is_stale() => {
                debug!("Ignored: {}", e);
                false
            }
            Err(e) => {
                warn!("Rejected: {}", e);
                false
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::CloseSession { session } => {
                if let Some(handle) = self.connection.release(session) {
                    debug!("Closing {}", session);
                    handle.close().await;
                }
            }
            Effect::StartConnectTimer { session, after } => {
                self.connect_deadline = Some((session, Instant::now() + after));
            }
            Effect::CancelConnectTimer => {
                self.connect_deadline = None;
            }
        }
    }

    fn status_text(&self) -> String {
        compose_status_text(
            &self.connection.status(),
            self.recovery.endpoint_online(),
            self.recovery.is_recovering(),
        )
    }

    /// Publish `StateChanged` when the status or its text moved
    fn publish_status(&mut self) {
        let status = self.connection.status();
        let text = self.status_text();
        if self
            .published
            .as_ref()
            .is_some_and(|(s, t)| s == &status && t == &text)
        {
            return;
        }

        let from = self.published_state;
        self.published_state = self.connection.state().state_name();
        self.published = Some((status.clone(), text.clone()));
        self.emit(DroplineEvent::StateChanged {
            from: from.to_string(),
            status,
            status_text: text,
        });
    }

    fn emit(&self, event: DroplineEvent) {
        let name = event.name();
        if self.events.send(event).is_err() {
            debug!("No subscribers for {}", name);
        }
    }

    async fn teardown(&mut self) {
        for session in self.connection.reset() {
            session.close().await;
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy().await;
        }
    }
}

// ----------------------------------------------------------------------------
// Select Helpers
// ----------------------------------------------------------------------------

async fn next_transport_event(events: &mut Option<TransportEventReceiver>) -> Option<TransportEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
