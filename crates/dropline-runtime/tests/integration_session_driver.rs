//! Integration tests for the session driver
//!
//! Drives a runtime against the loopback broker and checks the session
//! lifecycle, envelope delivery and the timeline from the outside.

mod common;

use common::{collect_until, identity, ready, start, wait_connected, wait_for, wait_for_status};
use dropline_core::protocol::{decode, encode};
use dropline_core::{FileEnvelope, PayloadSummary, SessionError, TransportErrorKind, TransportEvent};
use dropline_harness::{BrokerCall, LoopbackBroker, LoopbackConfig};
use dropline_runtime::{
    ConnectionStatus, Direction, DroplineError, DroplineEvent, Envelope, ErrorReason,
    RuntimeBuilder,
};
use tokio::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_connect_send_text_records_one_sent_entry() {
    let broker = LoopbackBroker::default();
    let mut peer = broker.add_peer("peer-42").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    runtime.connect("peer-42").await.unwrap();
    let text = wait_connected(&mut events, "peer-42").await;
    assert_eq!(text, "Connected to peer-42");

    assert!(runtime.send(Envelope::text("hi").unwrap()).await);

    let timeline = runtime.timeline().await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].direction, Direction::Sent);
    assert_eq!(
        timeline[0].summary,
        PayloadSummary::Text {
            content: "hi".to_string()
        }
    );

    let (_, bytes) = peer.next_data().await.unwrap();
    match decode(&bytes).unwrap() {
        Envelope::Text(text) => assert_eq!(text.content, "hi"),
        other => panic!("expected text, got {:?}", other),
    }

    let trail = runtime.audit_trail(10).await.unwrap();
    let states: Vec<_> = trail.iter().map(|e| e.to_state.as_str()).collect();
    assert_eq!(&states[..2], &["Connecting", "Connected"]);

    let stats = runtime.stats().await.unwrap();
    assert_eq!(stats.delivery.sent, 1);
    assert_eq!(stats.timeline_len, 1);
    assert_eq!(stats.connection.sessions_opened, 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_send_outside_connected_performs_no_io() {
    let broker = LoopbackBroker::new(LoopbackConfig {
        auto_open_sessions: false,
        ..LoopbackConfig::default()
    });
    let _peer = broker.add_peer("peer-42").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    // Idle
    assert!(!runtime.send(Envelope::text("early").unwrap()).await);

    // Connecting
    runtime.connect("peer-42").await.unwrap();
    assert!(matches!(
        runtime.status().await.unwrap(),
        ConnectionStatus::Connecting { .. }
    ));
    let err = runtime
        .try_send(Envelope::text("still early").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DroplineError::Session(SessionError::NotConnected)
    ));

    // Closed by the far side after opening
    let session = broker.connects().await[0].session;
    broker.open_session(session).await;
    wait_connected(&mut events, "peer-42").await;
    broker.close_session(session).await;
    wait_for_status(&mut events, |s| matches!(s, ConnectionStatus::Closed)).await;
    assert!(!runtime.send(Envelope::text("late").unwrap()).await);

    assert!(broker.sends().await.is_empty());
    assert!(runtime.timeline().await.is_empty());
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_closes_first_session() {
    let broker = LoopbackBroker::default();
    let _a = broker.add_peer("peer-a").await.unwrap();
    let _b = broker.add_peer("peer-b").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    runtime.connect("peer-a").await.unwrap();
    wait_connected(&mut events, "peer-a").await;
    runtime.connect("peer-b").await.unwrap();
    wait_connected(&mut events, "peer-b").await;

    let connects = broker.connects().await;
    assert_eq!(connects.len(), 2);
    let (first, second) = (connects[0].session, connects[1].session);

    let closes = broker.closes().await;
    assert_eq!(closes, vec![first]);
    assert!(!closes.contains(&second));

    // the first session is closed before the second is requested
    let order: Vec<_> = broker
        .history()
        .await
        .into_iter()
        .filter(|call| matches!(call, BrokerCall::Connect { .. } | BrokerCall::Close(_)))
        .collect();
    assert_eq!(
        order,
        vec![
            BrokerCall::Connect {
                local: identity("local-1"),
                remote: identity("peer-a"),
                session: first,
            },
            BrokerCall::Close(first),
            BrokerCall::Connect {
                local: identity("local-1"),
                remote: identity("peer-b"),
                session: second,
            },
        ]
    );
    assert!(!broker.is_open(first).await);
    assert!(broker.is_open(second).await);
    assert_eq!(
        broker.live_sessions(&identity("local-1")).await,
        vec![second]
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_received_file_after_failed_send() {
    let broker = LoopbackBroker::default();
    let mut peer = broker.add_peer("peer-42").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    assert!(!runtime.send(Envelope::text("nobody home").unwrap()).await);

    runtime.connect("peer-42").await.unwrap();
    wait_connected(&mut events, "peer-42").await;

    let mut broken = FileEnvelope::new("broken.bin", None, vec![1, 2, 3]);
    broken.size = 4;
    assert!(!runtime.send(Envelope::File(broken)).await);
    wait_for(&mut events, |e| {
        matches!(e, DroplineEvent::EnvelopeRejected { direction: Direction::Sent, .. })
    })
    .await;

    let inbound = peer.accept().await.unwrap();
    let photo = Envelope::file("a.png", Some("image/png"), vec![0x89; 120]);
    inbound.send(encode(&photo).unwrap()).await.unwrap();
    wait_for(&mut events, |e| matches!(e, DroplineEvent::RecordAppended { .. })).await;

    let timeline = runtime.timeline().await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].direction, Direction::Received);
    assert_eq!(
        timeline[0].summary,
        PayloadSummary::File {
            name: "a.png".to_string(),
            size: 120,
            mime_type: "image/png".to_string(),
        }
    );

    let stats = runtime.stats().await.unwrap();
    assert_eq!(stats.delivery.rejected_outbound, 1);
    assert_eq!(stats.delivery.received, 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_malformed_inbound_keeps_session_open() {
    let broker = LoopbackBroker::default();
    let mut peer = broker.add_peer("peer-42").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    runtime.connect("peer-42").await.unwrap();
    wait_connected(&mut events, "peer-42").await;
    let inbound = peer.accept().await.unwrap();

    inbound.send(b"not an envelope".to_vec()).await.unwrap();
    inbound
        .send(br#"{"type":"ping","content":"?"}"#.to_vec())
        .await
        .unwrap();
    for _ in 0..2 {
        wait_for(&mut events, |e| {
            matches!(
                e,
                DroplineEvent::EnvelopeRejected {
                    direction: Direction::Received,
                    ..
                }
            )
        })
        .await;
    }

    let hello = Envelope::text("hello").unwrap();
    inbound.send(encode(&hello).unwrap()).await.unwrap();
    wait_for(&mut events, |e| matches!(e, DroplineEvent::RecordAppended { .. })).await;

    assert!(runtime.status().await.unwrap().is_connected());
    assert_eq!(runtime.timeline().await.len(), 1);
    assert_eq!(runtime.stats().await.unwrap().delivery.rejected_inbound, 2);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_discards_session() {
    let broker = LoopbackBroker::new(LoopbackConfig {
        auto_open_sessions: false,
        ..LoopbackConfig::default()
    });
    let _peer = broker.add_peer("peer-42").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    let started = tokio::time::Instant::now();
    runtime.connect("peer-42").await.unwrap();
    let text = wait_for_status(&mut events, |s| {
        matches!(
            s,
            ConnectionStatus::Errored {
                reason: ErrorReason::Timeout
            }
        )
    })
    .await;

    assert_eq!(text, "Connection timed out, please try again");
    assert!(started.elapsed() >= Duration::from_secs(20));
    let session = broker.connects().await[0].session;
    assert_eq!(broker.closes().await, vec![session]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_inbound_session_reaches_connected() {
    let broker = LoopbackBroker::default();
    let mut peer = broker.add_peer("peer-42").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    let outbound = peer.connect(&identity("local-1")).await.unwrap();
    wait_connected(&mut events, "peer-42").await;

    let note = Envelope::text("from the far side").unwrap();
    outbound.send(encode(&note).unwrap()).await.unwrap();
    wait_for(&mut events, |e| matches!(e, DroplineEvent::RecordAppended { .. })).await;

    assert!(runtime.send(Envelope::text("welcome").unwrap()).await);
    let (id, _) = peer.next_data().await.unwrap();
    assert_eq!(id, outbound.id());

    let directions: Vec<_> = runtime
        .timeline()
        .await
        .iter()
        .map(|r| r.direction)
        .collect();
    assert_eq!(directions, vec![Direction::Received, Direction::Sent]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_before_registration_is_deferred() {
    let broker = LoopbackBroker::new(LoopbackConfig {
        auto_open_endpoints: false,
        ..LoopbackConfig::default()
    });
    let _peer = broker.add_peer("peer-42").await.unwrap();
    let mut runtime = RuntimeBuilder::new(broker.transport())
        .with_config(common::config())
        .with_identity(identity("local-1"))
        .build_and_start()
        .await
        .unwrap();
    let mut events = runtime.take_event_receiver().unwrap();

    runtime.connect("peer-42").await.unwrap();
    assert!(broker.connects().await.is_empty());
    assert_eq!(runtime.status_text().await.unwrap(), "Not connected");

    broker.open_endpoint(&identity("local-1")).await;
    wait_connected(&mut events, "peer-42").await;
    assert_eq!(broker.connects().await.len(), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_launch_url_connects_exactly_once() {
    let broker = LoopbackBroker::default();
    let _peer = broker.add_peer("peer-42").await.unwrap();
    let runtime = RuntimeBuilder::new(broker.transport())
        .with_config(common::config())
        .with_identity(identity("local-1"))
        .with_launch_url("https://drop.example/app/?connect=peer-42&lang=en")
        .build_and_start()
        .await
        .unwrap();
    let (mut runtime, mut events) = ready(runtime).await;

    match wait_for(&mut events, |e| {
        matches!(e, DroplineEvent::LaunchUrlConsumed { .. })
    })
    .await
    {
        DroplineEvent::LaunchUrlConsumed { remote, cleaned } => {
            assert_eq!(remote.as_str(), "peer-42");
            assert_eq!(cleaned, "https://drop.example/app/?lang=en");
        }
        other => panic!("unexpected {:?}", other),
    }
    wait_connected(&mut events, "peer-42").await;

    let replacement = runtime.restart().await.unwrap();
    let seen_until_ready = collect_until(&mut events, |e| {
        matches!(e, DroplineEvent::IdentityAssigned { identity } if identity == &replacement)
    })
    .await;
    assert!(!seen_until_ready
        .iter()
        .any(|e| matches!(e, DroplineEvent::LaunchUrlConsumed { .. })));
    assert_eq!(broker.connects().await.len(), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_replaces_identity_and_keeps_timeline() {
    let broker = LoopbackBroker::default();
    let _peer = broker.add_peer("peer-42").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    runtime.connect("peer-42").await.unwrap();
    wait_connected(&mut events, "peer-42").await;
    assert!(runtime.send_text("before restart").await.is_ok());
    let session = broker.connects().await[0].session;

    let replacement = runtime.restart().await.unwrap();
    assert_ne!(replacement, identity("local-1"));
    assert_eq!(replacement.as_str().len(), 8);
    assert!(broker.closes().await.contains(&session));
    assert_eq!(broker.destroyed().await, vec![identity("local-1")]);

    match wait_for(&mut events, |e| {
        matches!(e, DroplineEvent::IdentityReplaced { .. })
    })
    .await
    {
        DroplineEvent::IdentityReplaced { old, new } => {
            assert_eq!(old.as_str(), "local-1");
            assert_eq!(new, replacement);
        }
        other => panic!("unexpected {:?}", other),
    }
    wait_for(&mut events, |e| {
        matches!(e, DroplineEvent::IdentityAssigned { identity } if identity == &replacement)
    })
    .await;

    assert_eq!(runtime.state().await.unwrap().state_name(), "Idle");
    assert_eq!(
        runtime.status_text().await.unwrap(),
        "Online, waiting for connection"
    );
    assert_eq!(runtime.timeline().await.len(), 1);

    runtime.reset_timeline().await;
    assert!(runtime.timeline().await.is_empty());
    let link = runtime.share_link("https://drop.example/app/").await.unwrap();
    assert_eq!(
        link,
        format!("https://drop.example/app/scan.html?connect={}", replacement)
    );
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stale_signals_after_supersede_are_ignored() {
    let broker = LoopbackBroker::new(LoopbackConfig {
        auto_open_sessions: false,
        ..LoopbackConfig::default()
    });
    let _a = broker.add_peer("peer-a").await.unwrap();
    let _b = broker.add_peer("peer-b").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    runtime.connect("peer-a").await.unwrap();
    runtime.connect("peer-b").await.unwrap();
    let connects = broker.connects().await;
    let (first, second) = (connects[0].session, connects[1].session);

    // the first session failing late must not touch the second
    broker
        .fail_session(first, TransportErrorKind::NetworkIssue)
        .await;
    broker.open_session(second).await;
    let seen = collect_until(&mut events, |e| {
        matches!(
            e,
            DroplineEvent::StateChanged {
                status: ConnectionStatus::Connected { .. },
                ..
            }
        )
    })
    .await;

    assert!(!seen.iter().any(|e| matches!(
        e,
        DroplineEvent::StateChanged {
            status: ConnectionStatus::Errored { .. },
            ..
        }
    )));
    assert!(runtime.stats().await.unwrap().connection.stale_signals_ignored >= 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remote_peer_sees_close_on_disconnect() {
    let broker = LoopbackBroker::default();
    let mut peer = broker.add_peer("peer-42").await.unwrap();
    let (mut runtime, mut events) = start(&broker, "local-1").await;

    runtime.connect("peer-42").await.unwrap();
    wait_connected(&mut events, "peer-42").await;
    let inbound = peer.accept().await.unwrap();

    runtime.disconnect().await.unwrap();
    let text = wait_for_status(&mut events, |s| matches!(s, ConnectionStatus::Closed)).await;
    assert_eq!(text, "Connection closed");

    loop {
        match peer.next_event().await {
            Some(TransportEvent::SessionClose { id }) if id == inbound.id() => break,
            Some(_) => continue,
            None => panic!("peer channel closed"),
        }
    }
    runtime.shutdown().await.unwrap();
}
