//! Test doubles for the call subsystem's collaborators.
//!
//! A scripted peer session that records every operation, a signal transport
//! that records every envelope, and an audio router that records routes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use callcore::{IceCandidate, SdpType, SessionDescription, SignalCodec, SignalingMessage};

use super::media::{AudioRouter, LocalAudioTrack};
use super::negotiation::{
    NegotiationError, PeerEventSink, PeerSession, PeerSessionFactory, TransportState,
};
use super::transport::SignalTransport;

/// One recorded peer session operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    AddTrack,
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    /// A candidate reached the session before any remote description.
    EarlyCandidate(String),
    Close,
}

#[derive(Debug, Default)]
pub struct MockAudioTrack {
    disabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockAudioTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalAudioTrack for MockAudioTrack {
    fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct RecordingAudioRouter {
    routes: Mutex<Vec<bool>>,
}

impl RecordingAudioRouter {
    pub fn routes(&self) -> Vec<bool> {
        self.routes.lock().unwrap().clone()
    }
}

impl AudioRouter for RecordingAudioRouter {
    fn set_speaker(&self, enabled: bool) {
        self.routes.lock().unwrap().push(enabled);
    }
}

/// Which scripted operation should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Create,
    CreateOffer,
    CreateAnswer,
    SetRemote,
}

/// Shared script and log for every session a [`MockPeerSessionFactory`]
/// creates.
#[derive(Default)]
struct Script {
    calls: Mutex<Vec<SessionCall>>,
    sinks: Mutex<Vec<PeerEventSink>>,
    tracks: Mutex<Vec<Arc<MockAudioTrack>>>,
    failure: Mutex<Option<MockFailure>>,
    remote_gate: Mutex<Option<Arc<Notify>>>,
    local_candidates: AtomicUsize,
    auto_connect: AtomicBool,
}

impl Script {
    fn record(&self, call: SessionCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn fails(&self, failure: MockFailure) -> Result<(), NegotiationError> {
        if *self.failure.lock().unwrap() == Some(failure) {
            return Err(NegotiationError::Session(format!("scripted {:?} failure", failure)));
        }
        Ok(())
    }
}

/// Factory of scripted peer sessions.
///
/// By default sessions succeed at everything and report a connected
/// transport once both descriptions are in place.
#[derive(Clone)]
pub struct MockPeerSessionFactory {
    script: Arc<Script>,
}

impl Default for MockPeerSessionFactory {
    fn default() -> Self {
        let script = Script::default();
        script.auto_connect.store(true, Ordering::SeqCst);
        Self {
            script: Arc::new(script),
        }
    }
}

impl MockPeerSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(self, failure: MockFailure) -> Self {
        *self.script.failure.lock().unwrap() = Some(failure);
        self
    }

    /// Emit `count` local candidates after each local description is set.
    pub fn with_local_candidates(self, count: usize) -> Self {
        self.script.local_candidates.store(count, Ordering::SeqCst);
        self
    }

    pub fn without_auto_connect(self) -> Self {
        self.script.auto_connect.store(false, Ordering::SeqCst);
        self
    }

    /// Hold every `set_remote_description` until the returned gate is
    /// notified once per call.
    pub fn gate_remote_description(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.script.remote_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.script.calls.lock().unwrap().clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.script.sinks.lock().unwrap().len()
    }

    pub fn tracks(&self) -> Vec<Arc<MockAudioTrack>> {
        self.script.tracks.lock().unwrap().clone()
    }

    /// Event sink of the most recently created session.
    pub fn last_sink(&self) -> Option<PeerEventSink> {
        self.script.sinks.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PeerSessionFactory for MockPeerSessionFactory {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerSession>, NegotiationError> {
        self.script.fails(MockFailure::Create)?;
        self.script.sinks.lock().unwrap().push(sink.clone());
        Ok(Arc::new(MockPeerSession {
            script: self.script.clone(),
            sink,
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
        }))
    }
}

struct MockPeerSession {
    script: Arc<Script>,
    sink: PeerEventSink,
    local_set: AtomicBool,
    remote_set: AtomicBool,
}

impl MockPeerSession {
    fn maybe_connect(&self) {
        if self.script.auto_connect.load(Ordering::SeqCst)
            && self.local_set.load(Ordering::SeqCst)
            && self.remote_set.load(Ordering::SeqCst)
        {
            self.sink.transport_state(TransportState::Connected);
        }
    }
}

#[async_trait]
impl PeerSession for MockPeerSession {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.script.fails(MockFailure::CreateOffer)?;
        self.script.record(SessionCall::CreateOffer);
        Ok(SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.script.fails(MockFailure::CreateAnswer)?;
        self.script.record(SessionCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.script.record(SessionCall::SetLocal(description.sdp_type));
        self.local_set.store(true, Ordering::SeqCst);

        let count = self.script.local_candidates.load(Ordering::SeqCst);
        for n in 0..count {
            self.sink.local_candidate(IceCandidate::new(
                format!("candidate:{n} 1 udp 2122260223 192.0.2.{n} 4000{n} typ host"),
                Some("0".into()),
                Some(0),
            ));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let gate = self.script.remote_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.script.fails(MockFailure::SetRemote)?;
        self.script.record(SessionCall::SetRemote(description.sdp_type));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            self.script
                .record(SessionCall::EarlyCandidate(candidate.candidate));
            return Err(NegotiationError::Session(
                "candidate before remote description".into(),
            ));
        }
        self.script.record(SessionCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_local_audio_track(&self) -> Result<Arc<dyn LocalAudioTrack>, NegotiationError> {
        self.script.record(SessionCall::AddTrack);
        let track = Arc::new(MockAudioTrack::default());
        self.script.tracks.lock().unwrap().push(track.clone());
        Ok(track)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.script.record(SessionCall::Close);
        Ok(())
    }
}

/// Transport that keeps every envelope it is asked to send.
pub struct RecordingTransport {
    sent: Mutex<Vec<String>>,
    codec: SignalCodec,
}

impl RecordingTransport {
    /// `observer_id` is the identity used to decode recorded envelopes.
    pub fn new(observer_id: &str) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            codec: SignalCodec::new(observer_id),
        })
    }

    pub fn raw(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent envelopes, decoded as the observer would see them.
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.raw()
            .iter()
            .filter_map(|raw| self.codec.decode(raw).ok())
            .collect()
    }
}

#[async_trait]
impl SignalTransport for RecordingTransport {
    async fn send_envelope(
        &self,
        _room_id: &str,
        _sender_id: &str,
        _target_id: Option<&str>,
        raw: String,
    ) -> Result<(), anyhow::Error> {
        self.sent.lock().unwrap().push(raw);
        Ok(())
    }
}
