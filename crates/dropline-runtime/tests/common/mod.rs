//! Shared helpers for the runtime integration tests

#![allow(dead_code)]

use dropline_core::{ChannelConfig, ConnectionStatus, DroplineConfig, SessionIdentity};
use dropline_harness::LoopbackBroker;
use dropline_runtime::{DroplineEvent, DroplineEventReceiver, RuntimeBuilder, RuntimeHandle};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::{timeout, Duration};

/// Upper bound on any single wait, in virtual time
const WAIT_LIMIT: Duration = Duration::from_secs(300);

/// Production timings with roomy channels
pub fn config() -> DroplineConfig {
    DroplineConfig::default().with_channels(ChannelConfig::testing())
}

pub fn identity(value: &str) -> SessionIdentity {
    SessionIdentity::parse(value).unwrap()
}

/// Start a runtime on `broker` and wait until its endpoint registered
pub async fn start(broker: &LoopbackBroker, local: &str) -> (RuntimeHandle, DroplineEventReceiver) {
    let runtime = RuntimeBuilder::new(broker.transport())
        .with_config(config())
        .with_identity(identity(local))
        .with_no_logging()
        .build_and_start()
        .await
        .expect("Failed to start runtime");
    ready(runtime).await
}

/// Take the startup receiver and wait for the first `IdentityAssigned`
pub async fn ready(mut runtime: RuntimeHandle) -> (RuntimeHandle, DroplineEventReceiver) {
    let mut events = runtime
        .take_event_receiver()
        .expect("Failed to take event receiver");
    wait_for(&mut events, |e| {
        matches!(e, DroplineEvent::IdentityAssigned { .. })
    })
    .await;
    (runtime, events)
}

/// Wait for the first event matching `predicate`, skipping the rest
pub async fn wait_for<F>(events: &mut DroplineEventReceiver, mut predicate: F) -> DroplineEvent
where
    F: FnMut(&DroplineEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    timeout(WAIT_LIMIT, wait)
        .await
        .expect("timed out waiting for event")
}

/// Every event up to and including the first one matching `predicate`
pub async fn collect_until<F>(events: &mut DroplineEventReceiver, mut predicate: F) -> Vec<DroplineEvent>
where
    F: FnMut(&DroplineEvent) -> bool,
{
    let mut seen = Vec::new();
    wait_for(events, |event| {
        seen.push(event.clone());
        predicate(event)
    })
    .await;
    seen
}

/// Wait for a `StateChanged` whose status matches `predicate`
pub async fn wait_for_status<F>(events: &mut DroplineEventReceiver, mut predicate: F) -> String
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    match wait_for(events, |e| {
        matches!(e, DroplineEvent::StateChanged { status, .. } if predicate(status))
    })
    .await
    {
        DroplineEvent::StateChanged { status_text, .. } => status_text,
        other => unreachable!("unexpected event {:?}", other),
    }
}

/// Wait until the runtime reports a session to `remote` as open
pub async fn wait_connected(events: &mut DroplineEventReceiver, remote: &str) -> String {
    wait_for_status(events, |status| {
        matches!(status, ConnectionStatus::Connected { remote: r } if r.as_str() == remote)
    })
    .await
}

/// Everything already queued on the receiver
pub fn drain(events: &mut DroplineEventReceiver) -> Vec<DroplineEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return seen,
        }
    }
}

/// Advance virtual time until the broker has seen `count` reconnect calls
pub async fn wait_reconnect_calls(broker: &LoopbackBroker, count: usize) {
    let wait = async {
        while broker.reconnect_calls().await < count {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    timeout(WAIT_LIMIT, wait)
        .await
        .expect("timed out waiting for reconnect calls");
}
