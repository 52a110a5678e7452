use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use transport_datachannel::mock::loopback_pair;
use transport_datachannel::{
    ChannelState, DescriptionOutcome, NotificationKind, PayloadKind, Reliability, Session,
    SessionConfig, SessionEvent, SessionRole, TransportError, TransportStage,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> SessionConfig {
    init_tracing();
    SessionConfig::default().with_poll_interval(Duration::from_millis(1))
}

fn session_pair() -> (Session, Session) {
    let (end_a, end_b) = loopback_pair();
    let a = Session::builder()
        .config(test_config())
        .collaborators(end_a.collaborators)
        .build()
        .expect("build first session");
    let b = Session::builder()
        .config(test_config())
        .collaborators(end_b.collaborators)
        .build()
        .expect("build second session");
    (a, b)
}

/// Offer/answer plus out-of-band candidate exchange, the way an application
/// relays the description text between the peers.
fn exchange_descriptions(a: &Session, b: &Session) {
    let offer = a.local_description().expect("offer");
    assert_eq!(
        b.ingest_remote_description(&offer).expect("ingest offer"),
        DescriptionOutcome::CandidatesPending
    );
    let answer = b.local_description().expect("answer");
    assert_eq!(
        a.ingest_remote_description(&answer).expect("ingest answer"),
        DescriptionOutcome::CandidatesPending
    );
    let a_candidates = a.local_candidate_description().expect("local candidates");
    let b_candidates = b.local_candidate_description().expect("peer candidates");
    assert!(b.ingest_remote_candidates(&a_candidates).expect("ingest") > 0);
    assert!(a.ingest_remote_candidates(&b_candidates).expect("ingest") > 0);
}

async fn wait_for_event(
    events: &mut UnboundedReceiver<SessionEvent>,
    want: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(event) if want(&event) => return event,
                Some(_) => continue,
                None => panic!("session event stream ended unexpectedly"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

#[tokio::test]
async fn loopback_sessions_reach_ready_and_open_a_channel() {
    let (a, b) = session_pair();
    let mut a_events = a.events().expect("events");
    let mut b_events = b.events().expect("events");

    exchange_descriptions(&a, &b);
    wait_for_event(&mut a_events, |e| matches!(e, SessionEvent::Connected)).await;
    wait_for_event(&mut b_events, |e| matches!(e, SessionEvent::Connected)).await;

    assert_eq!(a.transport_stage(), Some(TransportStage::AssociationReady));
    assert_eq!(b.transport_stage(), Some(TransportStage::AssociationReady));
    // The answering side was flipped to responder by the offer's setup
    // attribute.
    assert_eq!(a.role(), SessionRole::Initiator);
    assert_eq!(b.role(), SessionRole::Responder);

    let local = a
        .open_channel("test", "chat-proto", Reliability::reliable(), 0)
        .expect("open channel");
    assert_eq!(local.state(), ChannelState::Connecting);
    assert_eq!(local.sid() % 2, 0, "initiator channels use even stream ids");

    let event = wait_for_event(&mut b_events, |e| {
        matches!(e, SessionEvent::ChannelOpened(_))
    })
    .await;
    let SessionEvent::ChannelOpened(remote) = event else {
        unreachable!();
    };
    assert_eq!(remote.label(), "test");
    assert_eq!(remote.protocol(), "chat-proto");
    assert_eq!(remote.state(), ChannelState::Open);
    assert_eq!(remote.sid(), local.sid());

    // The acknowledgment flips the opening side.
    wait_until(|| local.state() == ChannelState::Open).await;

    let mut remote_inbound = remote.take_receiver().expect("receiver");
    local.send_text("hello from the initiator").expect("send");
    let message = timeout(TEST_TIMEOUT, remote_inbound.recv())
        .await
        .expect("receive in time")
        .expect("message");
    assert_eq!(message.kind, PayloadKind::Text);
    assert_eq!(message.payload.as_ref(), b"hello from the initiator");

    let mut local_inbound = local.take_receiver().expect("receiver");
    remote.send_binary(&[1, 2, 3]).expect("reply");
    let reply = timeout(TEST_TIMEOUT, local_inbound.recv())
        .await
        .expect("receive in time")
        .expect("reply message");
    assert_eq!(reply.kind, PayloadKind::Binary);
    assert_eq!(reply.payload.as_ref(), &[1, 2, 3]);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn sends_before_readiness_arrive_once_ready_in_order() {
    let (a, b) = session_pair();
    let mut b_events = b.events().expect("events");

    // Open and send before any description has been exchanged: everything
    // lands in the deferred buffer and must come out complete and ordered.
    let channel = a
        .open_channel("early", "", Reliability::reliable(), 0)
        .expect("open channel");
    for i in 0..8 {
        channel
            .send_text(&format!("queued-{i}"))
            .expect("pre-readiness send succeeds");
    }

    exchange_descriptions(&a, &b);
    let event = wait_for_event(&mut b_events, |e| {
        matches!(e, SessionEvent::ChannelOpened(_))
    })
    .await;
    let SessionEvent::ChannelOpened(remote) = event else {
        unreachable!();
    };
    let mut inbound = remote.take_receiver().expect("receiver");
    for i in 0..8 {
        let message = timeout(TEST_TIMEOUT, inbound.recv())
            .await
            .expect("receive in time")
            .expect("deferred message");
        assert_eq!(message.payload.as_ref(), format!("queued-{i}").as_bytes());
    }

    // An empty payload rides the empty-message tag and arrives empty.
    channel.send_binary(&[]).expect("empty send");
    let empty = timeout(TEST_TIMEOUT, inbound.recv())
        .await
        .expect("receive in time")
        .expect("empty message");
    assert_eq!(empty.kind, PayloadKind::Binary);
    assert!(empty.payload.is_empty());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn stream_reset_closes_channel_until_new_data_arrives() {
    let (end_a, end_b) = loopback_pair();
    let reset_hook = end_b.association.clone();
    let a = Session::builder()
        .config(test_config())
        .collaborators(end_a.collaborators)
        .build()
        .expect("build");
    let b = Session::builder()
        .config(test_config())
        .collaborators(end_b.collaborators)
        .build()
        .expect("build");
    let mut b_events = b.events().expect("events");

    exchange_descriptions(&a, &b);
    let local = a
        .open_channel("resettable", "", Reliability::reliable(), 0)
        .expect("open channel");
    let event = wait_for_event(&mut b_events, |e| {
        matches!(e, SessionEvent::ChannelOpened(_))
    })
    .await;
    let SessionEvent::ChannelOpened(remote) = event else {
        unreachable!();
    };
    let mut inbound = remote.take_receiver().expect("receiver");

    reset_hook.push_notification(NotificationKind::StreamReset { sid: local.sid() });
    wait_until(|| remote.state() == ChannelState::Closed).await;

    // Data after the reset reopens the channel rather than requiring a new
    // open exchange.
    wait_until(|| local.state() == ChannelState::Open).await;
    local.send_text("wake up").expect("send");
    let message = timeout(TEST_TIMEOUT, inbound.recv())
        .await
        .expect("receive in time")
        .expect("message");
    assert_eq!(message.payload.as_ref(), b"wake up");
    assert_eq!(remote.state(), ChannelState::Open);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn description_ingest_reports_all_three_outcomes() {
    let (a, b) = session_pair();

    let err = b.ingest_remote_description("not a description").unwrap_err();
    assert!(matches!(err, TransportError::MalformedDescription(_)));

    let offer = a.local_description().expect("offer");
    assert_eq!(
        b.ingest_remote_description(&offer).expect("bare offer"),
        DescriptionOutcome::CandidatesPending
    );

    let full = format!(
        "{offer}{}",
        a.local_candidate_description().expect("candidates")
    );
    assert_eq!(
        b.ingest_remote_description(&full).expect("full offer"),
        DescriptionOutcome::Ready
    );

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn two_local_channels_get_increasing_ids_of_the_same_parity() {
    let (a, b) = session_pair();
    exchange_descriptions(&a, &b);

    let first = a
        .open_channel("one", "", Reliability::reliable(), 0)
        .expect("open");
    let second = a
        .open_channel("two", "", Reliability::reliable(), 0)
        .expect("open");
    assert_eq!(first.sid() % 2, second.sid() % 2);
    assert!(second.sid() > first.sid());

    a.close().await;
    b.close().await;
}
