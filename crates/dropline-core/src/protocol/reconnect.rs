//! Broker-disconnect recovery policy
//!
//! [`ReconnectController`] decides whether a broker-disconnect signal earns
//! another attempt and how long to wait before it. It performs no I/O; the
//! runtime owns the timer and the transport calls.

use crate::config::ReconnectConfig;
use crate::types::SessionIdentity;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// ----------------------------------------------------------------------------
// Backoff Policy
// ----------------------------------------------------------------------------

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Delay before the attempt made when `spent` attempts are already used
    pub fn delay_for(&self, spent: u32) -> Duration {
        let multiplier = 1u32.checked_shl(spent).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

/// What to do about a broker-disconnect signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then run attempt number `attempt` (1-based)
    Retry { attempt: u32, delay: Duration },
    /// Attempts are spent; surface the terminal error now
    GiveUp { attempts: u32 },
    /// Already gave up earlier; nothing further to surface
    AlreadyExhausted,
    /// The user disconnected; recovery is off until the next connect
    Suppressed,
}

/// Bounded recovery bookkeeping
#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    attempts: u32,
    exhausted: bool,
    suppressed: bool,
    resume_target: Option<SessionIdentity>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            exhausted: false,
            suppressed: false,
            resume_target: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Attempts spent since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Whether an attempt has been scheduled and not yet cleared by a success
    pub fn is_recovering(&self) -> bool {
        self.attempts > 0 && !self.exhausted && !self.suppressed
    }

    /// Remote to reconnect to once the endpoint is back
    pub fn resume_target(&self) -> Option<&SessionIdentity> {
        self.resume_target.as_ref()
    }

    /// Record a broker-disconnect signal
    pub fn on_broker_disconnected(&mut self) -> ReconnectDecision {
        if self.suppressed {
            return ReconnectDecision::Suppressed;
        }
        if self.exhausted {
            return ReconnectDecision::AlreadyExhausted;
        }
        if self.attempts >= self.policy.max_attempts {
            debug!("Reconnect budget of {} spent", self.policy.max_attempts);
            self.exhausted = true;
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        debug!("Reconnect attempt {} after {:?}", self.attempts, delay);
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// A data session reached `Connected`, an inbound session arrived or the
    /// endpoint reopened
    pub fn on_success(&mut self) {
        self.attempts = 0;
        self.exhausted = false;
    }

    /// The user opened a session; remember it and lift any suppression
    pub fn on_user_connect(&mut self, remote: SessionIdentity) {
        self.resume_target = Some(remote);
        self.suppressed = false;
        self.exhausted = false;
        self.attempts = 0;
    }

    /// The user tore the session down; no recovery until the next connect
    pub fn suppress(&mut self) {
        self.suppressed = true;
        self.resume_target = None;
    }

    /// Clear all bookkeeping
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.exhausted = false;
        self.suppressed = false;
        self.resume_target = None;
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
