//! Call manager: the single owner of call state.
//!
//! [`CallManager`] is a cheap handle. All work happens on one spawned task
//! that drains a command queue: user actions, inbound envelopes, peer
//! session events, negotiation results and timer expiry are processed one
//! at a time, in arrival order. Nothing on that task waits for the network
//! or the media engine; such work is handed off and its result comes back
//! as another command.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use callcore::{
    CallId, CallSession, CallState, CallTransition, CodecError, SessionDescription, SignalBody,
    SignalCodec, SignalKind, SignalingMessage,
};

use super::error::CallError;
use super::events::{CallEvent, CallSnapshot, CallStateChanged};
use super::media::{LoggingAudioRouter, MediaTrackController};
use super::negotiation::{
    NegotiationEngine, NegotiationError, PeerEvent, PeerSessionFactory, SessionOutcome,
    TransportState,
};
use super::transport::SignalTransport;
use crate::config::{BusyPolicy, CallConfig};

/// Everything the call event loop reacts to.
pub(crate) enum Command {
    StartCall {
        room_id: String,
        peer_id: String,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    AcceptCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    RejectCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleSpeaker {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    Envelope(String),
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    Negotiated {
        generation: u64,
        outcome: Result<SessionOutcome, NegotiationError>,
    },
    RingTimeout {
        generation: u64,
    },
    Shutdown,
}

/// Handle to the call event loop.
///
/// Constructed once per signed-in user and shared with whatever needs to
/// place, answer or observe calls. Dropping the last handle hangs up any
/// live call and stops the loop.
pub struct CallManager {
    local_id: String,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Spawn the call event loop for `local_id`. Requires a tokio runtime.
    pub fn new(
        local_id: impl Into<String>,
        config: CallConfig,
        transport: Arc<dyn SignalTransport>,
        sessions: Arc<dyn PeerSessionFactory>,
    ) -> Arc<Self> {
        let local_id = local_id.into();
        let (commands, queue) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let router = config
            .audio_router
            .clone()
            .unwrap_or_else(|| Arc::new(LoggingAudioRouter));
        let outbound = spawn_outbound(transport);

        let actor = CallActor {
            codec: SignalCodec::new(local_id.clone()),
            negotiation: NegotiationEngine::new(sessions, commands.clone()),
            media: MediaTrackController::new(router),
            commands: commands.clone(),
            events: events.clone(),
            outbound,
            config,
            state: CallState::Idle,
            session: None,
            generation: 0,
            ring_timer: None,
        };
        tokio::spawn(actor.run(queue));

        info!("Call manager started for {}", local_id);
        Arc::new(Self {
            local_id,
            commands,
            events,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Place a call to `peer_id` in `room_id`. Only valid while idle.
    pub async fn start_call(
        &self,
        room_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Result<CallId, CallError> {
        let room_id = room_id.into();
        let peer_id = peer_id.into();
        self.request(|reply| Command::StartCall {
            room_id,
            peer_id,
            reply,
        })
        .await?
    }

    /// Answer the ringing incoming call.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::AcceptCall { reply }).await?
    }

    /// Decline the ringing incoming call.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::RejectCall { reply }).await?
    }

    /// Hang up whatever is in progress. Always leaves the manager idle.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Returns whether the microphone is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Returns whether audio now plays through the speaker.
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleSpeaker { reply }).await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Feed one raw envelope received from the chat relay.
    pub fn handle_envelope(&self, raw: impl Into<String>) {
        if self.commands.send(Command::Envelope(raw.into())).is_err() {
            debug!("Call manager stopped, dropping inbound envelope");
        }
    }

    /// Forward a stream of inbound envelopes until it ends or the manager is
    /// dropped.
    pub fn attach_inbound(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(raw) = inbound.recv().await {
                match manager.upgrade() {
                    Some(manager) => manager.handle_envelope(raw),
                    None => break,
                }
            }
        });
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// One signal waiting to go out through the transport.
struct Outbound {
    room_id: String,
    sender_id: String,
    target_id: Option<String>,
    raw: String,
}

/// Sends envelopes in the order they were queued without holding up the
/// event loop.
fn spawn_outbound(transport: Arc<dyn SignalTransport>) -> mpsc::UnboundedSender<Outbound> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            if let Err(e) = transport
                .send_envelope(
                    &out.room_id,
                    &out.sender_id,
                    out.target_id.as_deref(),
                    out.raw,
                )
                .await
            {
                warn!("Failed to send call signal to {}: {}", out.room_id, e);
            }
        }
    });
    tx
}

struct CallActor {
    codec: SignalCodec,
    config: CallConfig,
    negotiation: NegotiationEngine,
    media: MediaTrackController,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CallEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: CallState,
    session: Option<CallSession>,
    /// Bumped whenever a session starts or is torn down.
    generation: u64,
    ring_timer: Option<JoinHandle<()>>,
}

impl CallActor {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = queue.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        if self.session.is_some() {
            self.end_call();
        }
        info!("Call manager for {} stopped", self.codec.local_id());
    }

    /// Returns false once the loop should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::StartCall {
                room_id,
                peer_id,
                reply,
            } => {
                let _ = reply.send(self.start_call(room_id, peer_id));
            }
            Command::AcceptCall { reply } => {
                let _ = reply.send(self.accept_call());
            }
            Command::RejectCall { reply } => {
                let _ = reply.send(self.reject_call());
            }
            Command::EndCall { reply } => {
                self.end_call();
                let _ = reply.send(());
            }
            // Flags belong to a call; without one they stay false.
            Command::ToggleMute { reply } => {
                if self.session.is_none() {
                    debug!("No active call, ignoring mute toggle");
                    let _ = reply.send(self.media.is_muted());
                    return true;
                }
                let muted = self.media.toggle_mute();
                self.publish(CallEvent::MuteChanged(muted));
                let _ = reply.send(muted);
            }
            Command::ToggleSpeaker { reply } => {
                if self.session.is_none() {
                    debug!("No active call, ignoring speaker toggle");
                    let _ = reply.send(self.media.is_speaker());
                    return true;
                }
                let speaker = self.media.toggle_speaker();
                self.publish(CallEvent::SpeakerChanged(speaker));
                let _ = reply.send(speaker);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(CallSnapshot {
                    state: self.state,
                    session: self.session.clone(),
                    muted: self.media.is_muted(),
                    speaker: self.media.is_speaker(),
                });
            }
            Command::Envelope(raw) => self.handle_envelope(&raw),
            Command::Peer { generation, event } => self.handle_peer_event(generation, event),
            Command::Negotiated {
                generation,
                outcome,
            } => self.handle_negotiated(generation, outcome),
            Command::RingTimeout { generation } => self.handle_ring_timeout(generation),
            Command::Shutdown => return false,
        }
        true
    }

    // -- local actions --

    fn start_call(&mut self, room_id: String, peer_id: String) -> Result<CallId, CallError> {
        if !self.state.is_idle() {
            return Err(CallError::Busy(self.state));
        }
        let next = self.state.next(CallTransition::LocalStart)?;

        self.generation += 1;
        let session = CallSession::outgoing(room_id, peer_id, self.generation);
        let call_id = session.call_id.clone();
        info!(
            "Calling {} in room {} (call_id: {})",
            session.peer_id, session.room_id, call_id
        );
        self.session = Some(session);
        self.set_state(next, None);
        self.send_lifecycle(SignalKind::CallRequest);
        self.arm_ring_timer();
        Ok(call_id)
    }

    fn accept_call(&mut self) -> Result<(), CallError> {
        let next = self.state.next(CallTransition::LocalAccept)?;
        let Some(generation) = self.session.as_ref().map(|s| s.generation) else {
            return Err(CallError::Busy(self.state));
        };
        self.cancel_ring_timer();
        self.set_state(next, None);
        self.send_lifecycle(SignalKind::CallAccepted);
        // Be ready before the offer arrives.
        self.negotiation.ensure_session(generation);
        Ok(())
    }

    fn reject_call(&mut self) -> Result<(), CallError> {
        let next = self.state.next(CallTransition::LocalReject)?;
        self.send_lifecycle(SignalKind::CallRejected);
        self.set_state(next, None);
        self.cleanup();
        Ok(())
    }

    fn end_call(&mut self) {
        if self.session.is_some() {
            self.send_lifecycle(SignalKind::CallEnded);
        }
        if let Ok(next) = self.state.next(CallTransition::Hangup) {
            self.set_state(next, None);
        }
        self.cleanup();
    }

    // -- inbound signals --

    fn handle_envelope(&mut self, raw: &str) {
        let msg = match self.codec.decode(raw) {
            Ok(msg) => msg,
            Err(e @ (CodecError::Misdirected(_) | CodecError::Echo | CodecError::NotSignal(_))) => {
                debug!("Ignoring envelope: {}", e);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed call signal: {}", e);
                return;
            }
        };

        if msg.kind == SignalKind::CallRequest {
            self.handle_call_request(msg);
            return;
        }

        let Some(session) = self.session.as_ref() else {
            debug!("Ignoring {} from {}: no active call", msg.kind, msg.sender_id);
            return;
        };
        if !session.involves(&msg.room_id, &msg.sender_id) {
            debug!(
                "Ignoring {} from {} in room {}: not part of the current call",
                msg.kind, msg.sender_id, msg.room_id
            );
            return;
        }
        let generation = session.generation;
        let is_initiator = session.is_initiator;

        let body = match msg.body() {
            Ok(body) => body,
            Err(e) => {
                warn!("Dropping malformed call signal: {}", e);
                return;
            }
        };

        match (msg.kind, body) {
            (SignalKind::CallAccepted, _) => {
                let Ok(next) = self.state.next(CallTransition::RemoteAccept) else {
                    debug!("Ignoring call-accepted in state {}", self.state);
                    return;
                };
                self.cancel_ring_timer();
                self.set_state(next, None);
                if is_initiator {
                    self.negotiation.create_offer(generation);
                }
            }
            (SignalKind::CallRejected, _) => {
                let next = self
                    .state
                    .next(CallTransition::RemoteReject)
                    .or_else(|_| self.state.next(CallTransition::Hangup));
                if let Ok(next) = next {
                    self.set_state(next, None);
                }
                self.cleanup();
            }
            (SignalKind::CallEnded, _) => {
                if let Ok(next) = self.state.next(CallTransition::Hangup) {
                    self.set_state(next, None);
                }
                self.cleanup();
            }
            (SignalKind::Offer, SignalBody::Description(description)) => {
                self.negotiation
                    .handle_remote_offer(generation, description.sdp);
            }
            (SignalKind::Answer, SignalBody::Description(description)) => {
                self.negotiation
                    .handle_remote_answer(generation, description.sdp);
            }
            (SignalKind::IceCandidate, SignalBody::Candidate(candidate)) => {
                self.negotiation.add_remote_ice_candidate(candidate);
            }
            (kind, body) => {
                warn!("Dropping {} with unexpected body {:?}", kind, body);
            }
        }
    }

    fn handle_call_request(&mut self, msg: SignalingMessage) {
        if self.state.is_idle() {
            let Ok(next) = self.state.next(CallTransition::RemoteRequest) else {
                return;
            };
            self.generation += 1;
            let session = CallSession::incoming(&msg.room_id, &msg.sender_id, self.generation);
            info!(
                "Incoming call from {} in room {} (call_id: {})",
                session.peer_id, session.room_id, session.call_id
            );
            self.session = Some(session);
            self.set_state(next, None);
            self.arm_ring_timer();
            return;
        }

        if self
            .session
            .as_ref()
            .is_some_and(|s| s.involves(&msg.room_id, &msg.sender_id))
        {
            debug!("Duplicate call request from {}", msg.sender_id);
            return;
        }

        match self.config.busy_policy {
            BusyPolicy::Reject => {
                info!(
                    "Busy ({}), rejecting call request from {}",
                    self.state, msg.sender_id
                );
                let reply = SignalingMessage::lifecycle(
                    SignalKind::CallRejected,
                    msg.room_id,
                    self.codec.local_id(),
                    Some(msg.sender_id),
                );
                self.send(reply);
            }
            BusyPolicy::Ignore => {
                info!(
                    "Busy ({}), ignoring call request from {}",
                    self.state, msg.sender_id
                );
            }
        }
    }

    // -- peer session feedback --

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    fn handle_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if !self.is_current(generation) {
            debug!("Dropping stale peer event {:?}", event);
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(session) = self.session.as_ref() else {
                    return;
                };
                match SignalingMessage::candidate(
                    &session.room_id,
                    self.codec.local_id(),
                    Some(session.peer_id.clone()),
                    &candidate,
                ) {
                    Ok(msg) => self.send(msg),
                    Err(e) => warn!("Failed to encode local ICE candidate: {}", e),
                }
            }
            PeerEvent::Transport(TransportState::Connected) => {
                match self.state.next(CallTransition::TransportConnected) {
                    Ok(next) => self.set_state(next, None),
                    Err(e) => debug!("Ignoring transport connect: {}", e),
                }
            }
            PeerEvent::Transport(state) if state.is_terminal() => {
                info!("Media transport {:?}, ending call", state);
                if self.state == CallState::Connected
                    && let Ok(next) = self.state.next(CallTransition::Hangup)
                {
                    self.set_state(next, None);
                }
                self.cleanup();
            }
            PeerEvent::Transport(state) => debug!("Media transport {:?}", state),
        }
    }

    fn handle_negotiated(
        &mut self,
        generation: u64,
        outcome: Result<SessionOutcome, NegotiationError>,
    ) {
        if !self.is_current(generation) {
            debug!("Dropping stale negotiation result (generation {})", generation);
            // The track was created for a call that is already gone.
            if let Ok(SessionOutcome::TrackReady(track)) = outcome {
                track.stop();
            }
            return;
        }

        match outcome {
            Ok(SessionOutcome::TrackReady(track)) => self.media.attach(track),
            Ok(SessionOutcome::LocalDescription(description)) => {
                self.send_description(&description)
            }
            Ok(SessionOutcome::RemoteApplied(sdp_type)) => {
                debug!("Remote {:?} applied", sdp_type);
                self.negotiation.on_remote_applied(sdp_type);
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn handle_ring_timeout(&mut self, generation: u64) {
        if !self.is_current(generation) || !self.state.is_ringing() {
            return;
        }
        info!("Call rang out in state {}", self.state);
        self.end_call();
    }

    /// Negotiation failed: surface the error and tell the peer to stop.
    fn fail(&mut self, error: String) {
        warn!("Call negotiation failed: {}", error);
        self.send_lifecycle(SignalKind::CallEnded);
        if let Ok(next) = self.state.next(CallTransition::NegotiationFailed) {
            self.set_state(next, Some(error));
        }
        self.cleanup();
    }

    // -- plumbing --

    /// Release everything the call holds and return to idle. Idempotent.
    fn cleanup(&mut self) {
        self.generation += 1;
        self.cancel_ring_timer();
        self.negotiation.close();
        self.media.release();
        self.session = None;
        if !self.state.is_idle() {
            self.set_state(CallState::Idle, None);
        }
    }

    fn set_state(&mut self, state: CallState, error: Option<String>) {
        let previous = self.state;
        self.state = state;
        debug!("Call state {} -> {}", previous, state);
        self.publish(CallEvent::StateChanged(CallStateChanged {
            previous,
            state,
            session: self.session.clone(),
            error,
            at: Utc::now(),
        }));
    }

    fn publish(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn arm_ring_timer(&mut self) {
        self.cancel_ring_timer();
        let (Some(timeout), Some(session)) = (self.config.ring_timeout, self.session.as_ref())
        else {
            return;
        };
        let generation = session.generation;
        let commands = self.commands.clone();
        self.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::RingTimeout { generation });
        }));
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    fn send_lifecycle(&self, kind: SignalKind) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        self.send(SignalingMessage::lifecycle(
            kind,
            &session.room_id,
            self.codec.local_id(),
            Some(session.peer_id.clone()),
        ));
    }

    fn send_description(&self, description: &SessionDescription) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        match SignalingMessage::description(
            &session.room_id,
            self.codec.local_id(),
            Some(session.peer_id.clone()),
            description,
        ) {
            Ok(msg) => self.send(msg),
            Err(e) => self.warn_encode(e),
        }
    }

    fn send(&self, msg: SignalingMessage) {
        let raw = match self.codec.encode(&msg) {
            Ok(raw) => raw,
            Err(e) => return self.warn_encode(e),
        };
        debug!("Sending {} to {:?} in {}", msg.kind, msg.target_id, msg.room_id);
        let out = Outbound {
            room_id: msg.room_id,
            sender_id: msg.sender_id,
            target_id: msg.target_id,
            raw,
        };
        if self.outbound.send(out).is_err() {
            warn!("Signal sender stopped, dropping {}", msg.kind);
        }
    }

    fn warn_encode(&self, e: CodecError) {
        warn!("Failed to encode call signal: {}", e);
    }
}
