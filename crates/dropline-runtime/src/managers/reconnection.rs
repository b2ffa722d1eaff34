//! Broker recovery scheduling for the Dropline runtime
//!
//! [`RecoveryManager`] wraps the pure [`ReconnectController`] with the parts
//! that need a clock: the pending backoff deadline and whether the endpoint
//! is currently registered with the broker.

use dropline_core::protocol::{ReconnectController, ReconnectDecision, ReconnectPolicy};
use dropline_core::{ReconnectConfig, SessionIdentity};
use tokio::time::Instant;

/// Work to run when a backoff deadline expires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Re-register the endpoint with the broker
    ReconnectEndpoint { attempt: u32 },
    /// The endpoint is fine; open a new session to the remote
    RetrySession {
        attempt: u32,
        remote: SessionIdentity,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingAttempt {
    attempt: u32,
    deadline: Instant,
    broker: bool,
}

/// Counters for recovery activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Backoff attempts scheduled
    pub attempts_scheduled: u64,
    /// Broker disconnects observed
    pub broker_disconnects: u64,
    /// Endpoints rebuilt under a new identity
    pub identity_resets: u64,
    /// Times recovery gave up
    pub exhaustions: u64,
}

/// Tracks the endpoint's broker registration and pending recovery attempts
#[derive(Debug)]
pub struct RecoveryManager {
    controller: ReconnectController,
    pending: Option<PendingAttempt>,
    endpoint_online: bool,
    /// A session was live or being opened when the broker dropped
    session_interrupted: bool,
    stats: RecoveryStats,
}

impl RecoveryManager {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            controller: ReconnectController::new(ReconnectPolicy::new(config)),
            pending: None,
            endpoint_online: false,
            session_interrupted: false,
            stats: RecoveryStats::default(),
        }
    }

    pub fn controller(&self) -> &ReconnectController {
        &self.controller
    }

    pub fn endpoint_online(&self) -> bool {
        self.endpoint_online
    }

    /// Broker recovery is under way
    pub fn is_recovering(&self) -> bool {
        !self.endpoint_online && self.controller.is_recovering()
    }

    /// Deadline of the pending attempt, if one is armed
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The endpoint registered (first open or reopen)
    ///
    /// Returns whether a session interrupted by the outage should be resumed.
    pub fn on_endpoint_open(&mut self) -> Option<SessionIdentity> {
        let was_offline = !self.endpoint_online;
        self.endpoint_online = true;
        if self.pending.is_some_and(|p| p.broker) {
            self.pending = None;
        }
        if was_offline {
            self.controller.on_success();
        }

        let interrupted = std::mem::take(&mut self.session_interrupted);
        if interrupted && !self.controller.is_suppressed() {
            self.controller.resume_target().cloned()
        } else {
            None
        }
    }

    /// The broker signalling channel dropped
    pub fn on_broker_lost(&mut self, now: Instant, had_session: bool) -> ReconnectDecision {
        self.endpoint_online = false;
        self.stats.broker_disconnects += 1;
        self.session_interrupted |= had_session;
        self.decide(now, true)
    }

    /// A session could not be established though the endpoint is registered
    ///
    /// Giving up on the remote forgets it, so broker recovery keeps its own
    /// budget and does not resume a session that never opened.
    pub fn on_session_failure(&mut self, now: Instant) -> Option<ReconnectDecision> {
        self.controller.resume_target()?;
        let decision = self.decide(now, false);
        if matches!(decision, ReconnectDecision::GiveUp { .. }) {
            self.controller.reset();
        }
        Some(decision)
    }

    /// The user wants a session while the endpoint is offline and nothing is
    /// scheduled, typically after recovery gave up
    pub fn request_recovery(&mut self, now: Instant) -> ReconnectDecision {
        self.decide(now, true)
    }

    /// Bringing the endpoint back failed; spend another attempt
    ///
    /// Covers a replacement endpoint that could not be created and a reopen
    /// the transport reported as failed after `reconnect` returned.
    pub fn on_reopen_failed(&mut self, now: Instant) -> ReconnectDecision {
        self.endpoint_online = false;
        self.decide(now, true)
    }

    fn decide(&mut self, now: Instant, broker: bool) -> ReconnectDecision {
        if self.pending.is_some() {
            return ReconnectDecision::Suppressed;
        }
        let decision = self.controller.on_broker_disconnected();
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                self.pending = Some(PendingAttempt {
                    attempt,
                    deadline: now + delay,
                    broker,
                });
                self.stats.attempts_scheduled += 1;
            }
            ReconnectDecision::GiveUp { .. } => {
                self.stats.exhaustions += 1;
                self.session_interrupted = false;
            }
            ReconnectDecision::AlreadyExhausted | ReconnectDecision::Suppressed => {}
        }
        decision
    }

    /// Take the pending step once its deadline has passed
    pub fn take_due(&mut self, now: Instant) -> Option<RecoveryStep> {
        let pending = self.pending?;
        if pending.deadline > now {
            return None;
        }
        self.pending = None;

        if pending.broker || !self.endpoint_online {
            return Some(RecoveryStep::ReconnectEndpoint {
                attempt: pending.attempt,
            });
        }
        self.controller
            .resume_target()
            .cloned()
            .map(|remote| RecoveryStep::RetrySession {
                attempt: pending.attempt,
                remote,
            })
    }

    /// A data session reached `Connected` or an inbound session arrived
    pub fn on_session_established(&mut self) {
        self.controller.on_success();
        self.session_interrupted = false;
        if self.pending.is_some_and(|p| !p.broker) {
            self.pending = None;
        }
    }

    pub fn on_user_connect(&mut self, remote: SessionIdentity) {
        self.controller.on_user_connect(remote);
        if self.pending.is_some_and(|p| !p.broker) {
            self.pending = None;
        }
    }

    /// Explicit user teardown: cancel anything pending and stay quiet
    pub fn on_user_disconnect(&mut self) {
        self.controller.suppress();
        self.pending = None;
        self.session_interrupted = false;
    }

    /// A replacement endpoint exists but has not registered yet
    pub fn on_identity_reset(&mut self) {
        self.endpoint_online = false;
        self.stats.identity_resets += 1;
    }

    /// Forget all recovery state, as after a manual restart
    pub fn reset(&mut self) {
        self.controller.reset();
        self.pending = None;
        self.endpoint_online = false;
        self.session_interrupted = false;
    }

    pub fn statistics(&self) -> &RecoveryStats {
        &self.stats
    }
}
