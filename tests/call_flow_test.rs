use std::sync::Arc;
use std::time::Duration;

use guardian_call::calls::media::LocalAudioTrack;
use guardian_call::calls::{ChannelRelay, TransportState};
use guardian_call::calls::mock::{
    MockFailure, MockPeerSessionFactory, RecordingAudioRouter, SessionCall,
};
use guardian_call::{BusyPolicy, CallConfig, CallError, CallEvent, CallManager, CallState, SdpType};
use tokio::sync::broadcast;

const ROOM: &str = "family-room";

struct Peer {
    manager: Arc<CallManager>,
    sessions: MockPeerSessionFactory,
    events: broadcast::Receiver<CallEvent>,
}

async fn join(
    relay: &Arc<ChannelRelay>,
    user: &str,
    config: CallConfig,
    sessions: MockPeerSessionFactory,
) -> Peer {
    let manager = CallManager::new(user, config, relay.clone(), Arc::new(sessions.clone()));
    manager.attach_inbound(relay.join(ROOM, user).await);
    let events = manager.subscribe();
    Peer {
        manager,
        sessions,
        events,
    }
}

async fn pair(caller: &str, callee: &str) -> (Arc<ChannelRelay>, Peer, Peer) {
    let relay = ChannelRelay::new();
    let a = join(&relay, caller, CallConfig::default(), MockPeerSessionFactory::new()).await;
    let b = join(&relay, callee, CallConfig::default(), MockPeerSessionFactory::new()).await;
    (relay, a, b)
}

/// States published until `last`, in order.
async fn states_until(events: &mut broadcast::Receiver<CallEvent>, last: CallState) -> Vec<CallState> {
    let mut seen = Vec::new();
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(state) = event.state() {
                        seen.push(state);
                        if state == last {
                            return;
                        }
                    }
                }
                Err(e) => panic!("event stream broke: {e}"),
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "never reached {last:?}, saw {seen:?}");
    seen
}

/// Give relay and session tasks a chance to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_call_connects_on_both_sides() {
    let (_relay, mut a, mut b) = pair("parent", "child").await;

    let call_id = a.manager.start_call(ROOM, "child").await.unwrap();
    assert!(!call_id.as_str().is_empty());

    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.accept_call().await.unwrap();

    assert_eq!(states_until(&mut a.events, CallState::Connected).await, vec![
        CallState::Calling,
        CallState::Connecting,
        CallState::Connected,
    ]);
    assert_eq!(states_until(&mut b.events, CallState::Connected).await, vec![
        CallState::Connecting,
        CallState::Connected,
    ]);

    // Caller offers, callee answers.
    let a_calls = a.sessions.calls();
    assert_eq!(&a_calls[..3], &[
        SessionCall::AddTrack,
        SessionCall::CreateOffer,
        SessionCall::SetLocal(SdpType::Offer),
    ]);
    assert!(a_calls.contains(&SessionCall::SetRemote(SdpType::Answer)));
    let b_calls = b.sessions.calls();
    assert!(!b_calls.contains(&SessionCall::CreateOffer));
    assert!(b_calls.contains(&SessionCall::CreateAnswer));

    let a_snap = a.manager.snapshot().await.unwrap();
    let b_snap = b.manager.snapshot().await.unwrap();
    assert!(a_snap.session.as_ref().unwrap().is_initiator);
    assert!(!b_snap.session.as_ref().unwrap().is_initiator);
    assert_eq!(b_snap.session.unwrap().peer_id, "parent");
}

#[tokio::test]
async fn test_trickled_candidates_reach_the_peer_after_its_description() {
    let relay = ChannelRelay::new();
    let mut a = join(
        &relay,
        "parent",
        CallConfig::default(),
        MockPeerSessionFactory::new().with_local_candidates(3),
    )
    .await;
    let mut b = join(
        &relay,
        "child",
        CallConfig::default(),
        MockPeerSessionFactory::new().with_local_candidates(2),
    )
    .await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.accept_call().await.unwrap();
    states_until(&mut a.events, CallState::Connected).await;
    states_until(&mut b.events, CallState::Connected).await;
    settle().await;

    // Candidates trickle out right after the offer, before the callee has
    // applied it, yet none reaches the callee's session early.
    let b_calls = b.sessions.calls();
    assert!(
        !b_calls
            .iter()
            .any(|c| matches!(c, SessionCall::EarlyCandidate(_)))
    );
    let remote_at = b_calls
        .iter()
        .position(|c| *c == SessionCall::SetRemote(SdpType::Offer))
        .unwrap();
    let added: Vec<_> = b_calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, SessionCall::AddCandidate(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(added.len(), 3);
    assert!(added.iter().all(|i| *i > remote_at));

    let a_calls = a.sessions.calls();
    assert!(
        !a_calls
            .iter()
            .any(|c| matches!(c, SessionCall::EarlyCandidate(_)))
    );
    assert_eq!(
        a_calls
            .iter()
            .filter(|c| matches!(c, SessionCall::AddCandidate(_)))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_reject_returns_both_sides_to_idle() {
    let (_relay, mut a, mut b) = pair("parent", "child").await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.reject_call().await.unwrap();

    assert_eq!(states_until(&mut b.events, CallState::Idle).await, vec![
        CallState::Rejected,
        CallState::Idle,
    ]);
    assert_eq!(states_until(&mut a.events, CallState::Idle).await, vec![
        CallState::Calling,
        CallState::Rejected,
        CallState::Idle,
    ]);
    assert_eq!(a.sessions.sessions_created(), 0);
    assert_eq!(b.sessions.sessions_created(), 0);
}

#[tokio::test]
async fn test_hangup_from_connected_call() {
    let (_relay, mut a, mut b) = pair("parent", "child").await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.accept_call().await.unwrap();
    states_until(&mut a.events, CallState::Connected).await;
    states_until(&mut b.events, CallState::Connected).await;

    b.manager.end_call().await.unwrap();
    assert_eq!(states_until(&mut a.events, CallState::Idle).await, vec![
        CallState::Ended,
        CallState::Idle,
    ]);
    assert_eq!(states_until(&mut b.events, CallState::Idle).await, vec![
        CallState::Ended,
        CallState::Idle,
    ]);
    settle().await;

    for peer in [&a, &b] {
        assert!(peer.sessions.calls().contains(&SessionCall::Close));
        assert!(peer.sessions.tracks().iter().all(|t| t.is_stopped()));
        let snapshot = peer.manager.snapshot().await.unwrap();
        assert_eq!(snapshot.state, CallState::Idle);
        assert!(snapshot.session.is_none());
    }

    // A new call can be placed afterwards.
    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
}

#[tokio::test]
async fn test_caller_cancels_while_ringing() {
    let (_relay, mut a, mut b) = pair("parent", "child").await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    a.manager.end_call().await.unwrap();

    assert_eq!(states_until(&mut b.events, CallState::Idle).await, vec![
        CallState::Ended,
        CallState::Idle,
    ]);
    assert!(matches!(
        b.manager.accept_call().await,
        Err(CallError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn test_call_for_another_member_is_not_surfaced() {
    let relay = ChannelRelay::new();
    let mut a = join(&relay, "parent", CallConfig::default(), MockPeerSessionFactory::new()).await;
    let mut b = join(&relay, "child", CallConfig::default(), MockPeerSessionFactory::new()).await;
    let c = join(&relay, "sibling", CallConfig::default(), MockPeerSessionFactory::new()).await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut a.events, CallState::Calling).await;
    states_until(&mut b.events, CallState::Incoming).await;
    settle().await;

    // The relay delivered the request to everyone in the room.
    let snapshot = c.manager.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Idle);
    assert!(snapshot.session.is_none());
}

#[tokio::test]
async fn test_busy_callee_rejects_second_caller() {
    let relay = ChannelRelay::new();
    let a = join(&relay, "parent", CallConfig::default(), MockPeerSessionFactory::new()).await;
    let mut b = join(&relay, "child", CallConfig::default(), MockPeerSessionFactory::new()).await;
    let mut c = join(&relay, "grandparent", CallConfig::default(), MockPeerSessionFactory::new()).await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;

    c.manager.start_call(ROOM, "child").await.unwrap();
    assert_eq!(states_until(&mut c.events, CallState::Idle).await, vec![
        CallState::Calling,
        CallState::Rejected,
        CallState::Idle,
    ]);

    // The first call is untouched.
    let snapshot = b.manager.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Incoming);
    assert_eq!(snapshot.session.unwrap().peer_id, "parent");
    let snapshot = a.manager.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Calling);
}

#[tokio::test]
async fn test_busy_callee_can_ignore_second_caller() {
    let relay = ChannelRelay::new();
    let a = join(&relay, "parent", CallConfig::default(), MockPeerSessionFactory::new()).await;
    let mut b = join(
        &relay,
        "child",
        CallConfig::default().with_busy_policy(BusyPolicy::Ignore),
        MockPeerSessionFactory::new(),
    )
    .await;
    let c = join(&relay, "grandparent", CallConfig::default(), MockPeerSessionFactory::new()).await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;

    c.manager.start_call(ROOM, "child").await.unwrap();
    settle().await;

    assert_eq!(c.manager.snapshot().await.unwrap().state, CallState::Calling);
    assert_eq!(b.manager.snapshot().await.unwrap().state, CallState::Incoming);
}

#[tokio::test]
async fn test_second_start_call_is_busy() {
    let (_relay, a, _b) = pair("parent", "child").await;
    a.manager.start_call(ROOM, "child").await.unwrap();
    let err = a.manager.start_call(ROOM, "child").await.unwrap_err();
    assert!(matches!(err, CallError::Busy(CallState::Calling)));
}

#[tokio::test]
async fn test_negotiation_failure_surfaces_error_and_ends_peer() {
    let relay = ChannelRelay::new();
    let mut a = join(
        &relay,
        "parent",
        CallConfig::default(),
        MockPeerSessionFactory::new().fail_on(MockFailure::CreateOffer),
    )
    .await;
    let mut b = join(&relay, "child", CallConfig::default(), MockPeerSessionFactory::new()).await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.accept_call().await.unwrap();

    let mut error = None;
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(CallEvent::StateChanged(change)) = a.events.recv().await {
                seen.push(change.state);
                if change.state == CallState::Error {
                    error = change.error;
                }
                if change.state == CallState::Idle {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, vec![
        CallState::Calling,
        CallState::Connecting,
        CallState::Error,
        CallState::Idle,
    ]);
    assert!(error.unwrap().contains("CreateOffer"));

    // The callee is told the call is over.
    assert_eq!(states_until(&mut b.events, CallState::Idle).await, vec![
        CallState::Connecting,
        CallState::Ended,
        CallState::Idle,
    ]);
}

#[tokio::test]
async fn test_transport_failure_ends_connected_call() {
    let (_relay, mut a, mut b) = pair("parent", "child").await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.accept_call().await.unwrap();
    states_until(&mut a.events, CallState::Connected).await;

    let sink = a.sessions.last_sink().unwrap();
    sink.transport_state(TransportState::Failed);

    assert_eq!(states_until(&mut a.events, CallState::Idle).await, vec![
        CallState::Ended,
        CallState::Idle,
    ]);
}

#[tokio::test]
async fn test_late_peer_event_from_previous_call_is_ignored() {
    let (_relay, mut a, mut b) = pair("parent", "child").await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.accept_call().await.unwrap();
    states_until(&mut a.events, CallState::Connected).await;
    let old_sink = a.sessions.last_sink().unwrap();

    a.manager.end_call().await.unwrap();
    states_until(&mut a.events, CallState::Idle).await;
    states_until(&mut b.events, CallState::Idle).await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut a.events, CallState::Calling).await;

    old_sink.transport_state(TransportState::Failed);
    old_sink.transport_state(TransportState::Connected);
    settle().await;
    assert_eq!(a.manager.snapshot().await.unwrap().state, CallState::Calling);
}

#[tokio::test]
async fn test_mute_and_speaker_are_local() {
    let relay = ChannelRelay::new();
    let router = Arc::new(RecordingAudioRouter::default());
    let mut a = join(
        &relay,
        "parent",
        CallConfig::default().with_audio_router(router.clone()),
        MockPeerSessionFactory::new(),
    )
    .await;
    let mut b = join(&relay, "child", CallConfig::default(), MockPeerSessionFactory::new()).await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.accept_call().await.unwrap();
    states_until(&mut a.events, CallState::Connected).await;

    assert!(a.manager.toggle_mute().await.unwrap());
    assert!(a.manager.toggle_speaker().await.unwrap());
    assert!(!a.sessions.tracks()[0].is_enabled());
    settle().await;

    // Nothing about it reaches the peer.
    let b_snap = b.manager.snapshot().await.unwrap();
    assert!(!b_snap.muted);
    assert!(!b_snap.speaker);

    a.manager.end_call().await.unwrap();
    let a_snap = a.manager.snapshot().await.unwrap();
    assert!(!a_snap.muted);
    assert!(!a_snap.speaker);
    assert_eq!(router.routes(), vec![true, false]);
}

/// Callee fails at `failure`; it must surface `Error` and end the caller's call.
async fn assert_answerer_failure(failure: MockFailure) {
    let relay = ChannelRelay::new();
    let mut a = join(&relay, "parent", CallConfig::default(), MockPeerSessionFactory::new()).await;
    let mut b = join(
        &relay,
        "child",
        CallConfig::default(),
        MockPeerSessionFactory::new().fail_on(failure),
    )
    .await;

    a.manager.start_call(ROOM, "child").await.unwrap();
    states_until(&mut b.events, CallState::Incoming).await;
    b.manager.accept_call().await.unwrap();

    let mut error = None;
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(CallEvent::StateChanged(change)) = b.events.recv().await {
                seen.push(change.state);
                if change.state == CallState::Error {
                    error = change.error;
                }
                if change.state == CallState::Idle {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, vec![
        CallState::Connecting,
        CallState::Error,
        CallState::Idle,
    ]);
    assert!(error.unwrap().contains(&format!("{failure:?}")));

    assert_eq!(states_until(&mut a.events, CallState::Idle).await, vec![
        CallState::Calling,
        CallState::Connecting,
        CallState::Ended,
        CallState::Idle,
    ]);
}

#[tokio::test]
async fn test_answerer_fails_to_apply_offer() {
    assert_answerer_failure(MockFailure::SetRemote).await;
}

#[tokio::test]
async fn test_answerer_fails_to_create_answer() {
    assert_answerer_failure(MockFailure::CreateAnswer).await;
}
