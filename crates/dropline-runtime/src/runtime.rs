//! Runtime handle
//!
//! [`RuntimeHandle`] is what a UI holds. Every call is forwarded to the
//! session driver as a command; the timeline is the one piece of state read
//! directly, through its shared lock.

use crate::managers::{ConnectionStats, DeliveryStats, RecoveryStats, SharedTimeline};
use crate::tasks::{RuntimeCommand, RuntimeCommandSender};
use dropline_core::protocol::AuditEntry;
use dropline_core::{
    share_link, ConnectionState, ConnectionStatus, DroplineError, DroplineEventReceiver,
    DroplineEventSender, DroplineResult, Envelope, RecordId, SessionError, SessionIdentity,
    TimelineRecord,
};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long `shutdown` waits for the driver to finish
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Runtime Statistics
// ----------------------------------------------------------------------------

/// Counters gathered from every manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub connection: ConnectionStats,
    pub delivery: DeliveryStats,
    pub recovery: RecoveryStats,
    pub timeline_len: usize,
}

/// Point-in-time view of the driver
#[derive(Debug, Clone)]
pub struct RuntimeSnapshot {
    pub identity: SessionIdentity,
    pub endpoint_online: bool,
    pub state: ConnectionState,
    pub status: ConnectionStatus,
    pub status_text: String,
    pub stats: RuntimeStats,
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to a running Dropline runtime
pub struct RuntimeHandle {
    command_sender: RuntimeCommandSender,
    event_sender: DroplineEventSender,
    event_receiver: Option<DroplineEventReceiver>,
    timeline: SharedTimeline,
    driver_handle: Option<JoinHandle<DroplineResult<()>>>,
    running: bool,
}

impl RuntimeHandle {
    pub(crate) fn new(
        command_sender: RuntimeCommandSender,
        event_sender: DroplineEventSender,
        event_receiver: DroplineEventReceiver,
        timeline: SharedTimeline,
        driver_handle: JoinHandle<DroplineResult<()>>,
    ) -> Self {
        Self {
            command_sender,
            event_sender,
            event_receiver: Some(event_receiver),
            timeline,
            driver_handle: Some(driver_handle),
            running: true,
        }
    }

    /// Take the receiver created with the runtime (can only be called once)
    ///
    /// It has seen every event since startup, including the first
    /// `IdentityAssigned`.
    pub fn take_event_receiver(&mut self) -> Option<DroplineEventReceiver> {
        self.event_receiver.take()
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> DroplineEventReceiver {
        self.event_sender.subscribe()
    }

    // ------------------------------------------------------------------
    // Session Control
    // ------------------------------------------------------------------

    /// Open a session to `remote`, closing any current one
    ///
    /// Before the local endpoint has registered, the request is held and
    /// issued as soon as it does.
    pub async fn connect(&self, remote: &str) -> DroplineResult<()> {
        let remote = SessionIdentity::parse(remote)?;
        self.request(|reply| RuntimeCommand::Connect { remote, reply })
            .await?
    }

    /// Send an envelope; `false` when not connected or the envelope was refused
    pub async fn send(&self, envelope: Envelope) -> bool {
        self.try_send(envelope).await.is_ok()
    }

    /// Send an envelope and return the id of its timeline record
    pub async fn try_send(&self, envelope: Envelope) -> DroplineResult<RecordId> {
        self.request(|reply| RuntimeCommand::Send { envelope, reply })
            .await?
    }

    /// Send trimmed text; blank input is refused before reaching the driver
    pub async fn send_text(&self, text: &str) -> DroplineResult<RecordId> {
        self.try_send(Envelope::text(text)?).await
    }

    /// Send a whole file
    pub async fn send_file(
        &self,
        name: &str,
        mime_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> DroplineResult<RecordId> {
        self.try_send(Envelope::file(name, mime_type, bytes)).await
    }

    /// Close the session and stop any recovery until the next `connect`
    pub async fn disconnect(&self) -> DroplineResult<()> {
        self.request(|reply| RuntimeCommand::Disconnect { reply })
            .await
    }

    /// Replace the endpoint under a new identity and start from `Idle`
    pub async fn restart(&self) -> DroplineResult<SessionIdentity> {
        self.request(|reply| RuntimeCommand::Restart { reply })
            .await?
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Records ordered by observation time
    pub async fn timeline(&self) -> Vec<TimelineRecord> {
        self.timeline.read().await.snapshot()
    }

    pub async fn reset_timeline(&self) {
        self.timeline.write().await.reset();
    }

    pub async fn snapshot(&self) -> DroplineResult<RuntimeSnapshot> {
        self.request(|reply| RuntimeCommand::Snapshot { reply })
            .await
    }

    /// Identity the local endpoint is registered under
    pub async fn identity(&self) -> DroplineResult<SessionIdentity> {
        Ok(self.snapshot().await?.identity)
    }

    pub async fn state(&self) -> DroplineResult<ConnectionState> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn status(&self) -> DroplineResult<ConnectionStatus> {
        Ok(self.snapshot().await?.status)
    }

    pub async fn status_text(&self) -> DroplineResult<String> {
        Ok(self.snapshot().await?.status_text)
    }

    pub async fn stats(&self) -> DroplineResult<RuntimeStats> {
        Ok(self.snapshot().await?.stats)
    }

    /// Most recent state transitions, oldest first
    pub async fn audit_trail(&self, limit: usize) -> DroplineResult<Vec<AuditEntry>> {
        self.request(|reply| RuntimeCommand::AuditTrail { limit, reply })
            .await
    }

    /// Link a remote device opens to connect here
    pub async fn share_link(&self, base: &str) -> DroplineResult<String> {
        let identity = self.identity().await?;
        share_link(base, &identity)
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> RuntimeCommand,
    ) -> DroplineResult<R> {
        let (reply, response) = oneshot::channel();
        self.command_sender
            .send(build(reply))
            .await
            .map_err(|_| DroplineError::Session(SessionError::Shutdown))?;
        response
            .await
            .map_err(|_| DroplineError::Session(SessionError::Shutdown))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Check if the runtime is still running
    pub fn is_running(&self) -> bool {
        self.running
            && self
                .driver_handle
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Wait for the driver to complete
    pub async fn wait(&mut self) -> DroplineResult<()> {
        match self.driver_handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                DroplineError::channel_error(format!("Session driver panicked: {}", e))
            })?,
            None => Ok(()),
        }
    }

    /// Shutdown the runtime gracefully
    pub async fn shutdown(&mut self) -> DroplineResult<()> {
        info!("Shutting down Dropline runtime");
        let _ = self.command_sender.send(RuntimeCommand::Shutdown).await;

        if let Some(handle) = self.driver_handle.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("Session driver did not stop within {:?}", SHUTDOWN_TIMEOUT);
            }
        }

        self.running = false;
        info!("Dropline runtime shut down");
        Ok(())
    }
}
