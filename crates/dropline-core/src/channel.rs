//! Subscription channel between the runtime and its observers
//!
//! Every observable change is published as one tagged [`DroplineEvent`] on a
//! broadcast channel; a UI subscribes once instead of registering callbacks.

use crate::config::ChannelConfig;
use crate::protocol::{ConnectionStatus, Direction, TimelineRecord};
use crate::types::SessionIdentity;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

// ----------------------------------------------------------------------------
// Dropline Events
// ----------------------------------------------------------------------------

/// Events published to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DroplineEvent {
    /// The connection state machine moved
    StateChanged {
        from: String,
        status: ConnectionStatus,
        status_text: String,
    },
    /// The endpoint registered under this identity; connects may be issued
    IdentityAssigned { identity: SessionIdentity },
    /// Recovery replaced the endpoint; `old` is no longer reachable
    IdentityReplaced {
        old: SessionIdentity,
        new: SessionIdentity,
    },
    /// A broker reconnect attempt will run after `delay`
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Recovery gave up; a manual restart is needed
    ReconnectExhausted { attempts: u32 },
    /// A record entered the timeline
    RecordAppended { record: TimelineRecord },
    /// An envelope was dropped by the codec; the session stays open
    EnvelopeRejected { direction: Direction, reason: String },
    /// The launch URL's connect parameter was used
    LaunchUrlConsumed {
        remote: SessionIdentity,
        cleaned: String,
    },
}

impl DroplineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DroplineEvent::StateChanged { .. } => "StateChanged",
            DroplineEvent::IdentityAssigned { .. } => "IdentityAssigned",
            DroplineEvent::IdentityReplaced { .. } => "IdentityReplaced",
            DroplineEvent::ReconnectScheduled { .. } => "ReconnectScheduled",
            DroplineEvent::ReconnectExhausted { .. } => "ReconnectExhausted",
            DroplineEvent::RecordAppended { .. } => "RecordAppended",
            DroplineEvent::EnvelopeRejected { .. } => "EnvelopeRejected",
            DroplineEvent::LaunchUrlConsumed { .. } => "LaunchUrlConsumed",
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Types
// ----------------------------------------------------------------------------

pub type DroplineEventSender = broadcast::Sender<DroplineEvent>;
pub type DroplineEventReceiver = broadcast::Receiver<DroplineEvent>;

/// Create the subscription channel with the configured capacity
pub fn create_event_channel(config: &ChannelConfig) -> (DroplineEventSender, DroplineEventReceiver) {
    broadcast::channel(config.event_buffer_size)
}
