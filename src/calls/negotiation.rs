//! Session negotiation engine.
//!
//! Wraps the underlying peer session (the WebRTC peer connection) and owns
//! the two ordering rules of the negotiation:
//!
//! - a remote ICE candidate is never handed to the session before a remote
//!   description has been applied; earlier candidates are buffered and
//!   released in receipt order;
//! - session operations run one at a time, in the order they were issued,
//!   on a per-call worker task. Their results come back to the call manager
//!   as commands tagged with the call generation, so results that outlive
//!   the call are recognised and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use callcore::{IceCandidate, RemoteCandidateQueue, SdpType, SessionDescription};

use super::manager::Command;
use super::media::LocalAudioTrack;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("session error: {0}")]
    Session(String),

    #[error("session worker stopped")]
    WorkerStopped,
}

/// Transport-level connectivity reported by the peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Unsolicited events from a peer session.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be trickled to the peer.
    LocalCandidate(IceCandidate),
    Transport(TransportState),
}

/// Delivers [`PeerEvent`]s into the call manager's queue.
///
/// Each sink is bound to the call it was created for.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl PeerEventSink {
    pub(crate) fn new(generation: u64, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            generation,
            commands,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEvent::LocalCandidate(candidate));
    }

    pub fn transport_state(&self, state: TransportState) {
        self.emit(PeerEvent::Transport(state));
    }

    fn emit(&self, event: PeerEvent) {
        let command = Command::Peer {
            generation: self.generation,
            event,
        };
        if self.commands.send(command).is_err() {
            debug!("Dropping peer event, call manager is gone");
        }
    }
}

/// The media session object that offers and answers are negotiated on.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Create the local audio source and track and attach them to the
    /// session. Must run before the first offer or answer is created.
    async fn add_local_audio_track(&self) -> Result<Arc<dyn LocalAudioTrack>, NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait PeerSessionFactory: Send + Sync {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerSession>, NegotiationError>;
}

/// Results of session work, reported back to the manager.
pub(crate) enum SessionOutcome {
    TrackReady(Arc<dyn LocalAudioTrack>),
    /// A local description was created and applied; it must be sent.
    LocalDescription(SessionDescription),
    RemoteApplied(SdpType),
}

enum SessionOp {
    CreateOffer,
    CreateAnswer,
    ApplyRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

/// Manager-side half of the negotiation engine for the current call.
pub(crate) struct NegotiationEngine {
    factory: Arc<dyn PeerSessionFactory>,
    commands: mpsc::UnboundedSender<Command>,
    ops: Option<mpsc::UnboundedSender<SessionOp>>,
    candidates: RemoteCandidateQueue,
}

impl NegotiationEngine {
    pub(crate) fn new(
        factory: Arc<dyn PeerSessionFactory>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            factory,
            commands,
            ops: None,
            candidates: RemoteCandidateQueue::new(),
        }
    }

    pub(crate) fn has_session(&self) -> bool {
        self.ops.is_some()
    }

    pub(crate) fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Start the session worker for `generation` unless one is running.
    pub(crate) fn ensure_session(&mut self, generation: u64) {
        if self.ops.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.ops = Some(tx);
        tokio::spawn(run_session_worker(
            self.factory.clone(),
            generation,
            rx,
            self.commands.clone(),
        ));
        debug!("Session worker started for generation {}", generation);
    }

    pub(crate) fn create_offer(&mut self, generation: u64) {
        self.ensure_session(generation);
        self.push(SessionOp::CreateOffer);
    }

    pub(crate) fn handle_remote_offer(&mut self, generation: u64, sdp: String) {
        self.ensure_session(generation);
        self.push(SessionOp::ApplyRemote(SessionDescription::offer(sdp)));
    }

    pub(crate) fn handle_remote_answer(&mut self, generation: u64, sdp: String) {
        self.ensure_session(generation);
        self.push(SessionOp::ApplyRemote(SessionDescription::answer(sdp)));
    }

    /// Apply now if a remote description is in place, otherwise buffer.
    pub(crate) fn add_remote_ice_candidate(&mut self, candidate: IceCandidate) {
        match self.candidates.offer(candidate) {
            Some(candidate) => self.push(SessionOp::AddCandidate(candidate)),
            None => debug!(
                "Buffered remote ICE candidate ({} pending)",
                self.candidates.len()
            ),
        }
    }

    /// The remote description is applied: release buffered candidates in
    /// order, and answer if it was an offer.
    pub(crate) fn on_remote_applied(&mut self, sdp_type: SdpType) {
        let drained = self.candidates.mark_applied();
        if !drained.is_empty() {
            debug!("Applying {} buffered ICE candidate(s)", drained.len());
        }
        for candidate in drained {
            self.push(SessionOp::AddCandidate(candidate));
        }
        if sdp_type == SdpType::Offer {
            self.push(SessionOp::CreateAnswer);
        }
    }

    /// Tear the session down and forget buffered candidates.
    pub(crate) fn close(&mut self) {
        if let Some(ops) = self.ops.take() {
            let _ = ops.send(SessionOp::Close);
        }
        self.candidates.reset();
    }

    fn push(&self, op: SessionOp) {
        match &self.ops {
            Some(ops) if ops.send(op).is_ok() => {}
            _ => warn!("Session operation issued without a running session worker"),
        }
    }
}

/// Runs session operations for one call, strictly in issue order.
async fn run_session_worker(
    factory: Arc<dyn PeerSessionFactory>,
    generation: u64,
    mut ops: mpsc::UnboundedReceiver<SessionOp>,
    commands: mpsc::UnboundedSender<Command>,
) {
    let report = |outcome: Result<SessionOutcome, NegotiationError>| {
        let _ = commands.send(Command::Negotiated {
            generation,
            outcome,
        });
    };

    let session = match open_session(&factory, generation, &commands).await {
        Ok((session, track)) => {
            report(Ok(SessionOutcome::TrackReady(track)));
            session
        }
        Err(e) => {
            report(Err(e));
            return;
        }
    };

    while let Some(op) = ops.recv().await {
        let result = match op {
            SessionOp::CreateOffer => local_description(&*session, SdpType::Offer)
                .await
                .map(|d| Some(SessionOutcome::LocalDescription(d))),
            SessionOp::CreateAnswer => local_description(&*session, SdpType::Answer)
                .await
                .map(|d| Some(SessionOutcome::LocalDescription(d))),
            SessionOp::ApplyRemote(description) => {
                let sdp_type = description.sdp_type;
                session
                    .set_remote_description(description)
                    .await
                    .map(|_| Some(SessionOutcome::RemoteApplied(sdp_type)))
            }
            SessionOp::AddCandidate(candidate) => {
                // A bad candidate only loses one path, the call goes on.
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    warn!("Failed to add remote ICE candidate: {}", e);
                }
                Ok(None)
            }
            SessionOp::Close => break,
        };

        match result {
            Ok(Some(outcome)) => report(Ok(outcome)),
            Ok(None) => {}
            Err(e) => {
                report(Err(e));
                break;
            }
        }
    }

    if let Err(e) = session.close().await {
        debug!("Error closing peer session: {}", e);
    }
    info!("Peer session for generation {} closed", generation);
}

async fn open_session(
    factory: &Arc<dyn PeerSessionFactory>,
    generation: u64,
    commands: &mpsc::UnboundedSender<Command>,
) -> Result<(Arc<dyn PeerSession>, Arc<dyn LocalAudioTrack>), NegotiationError> {
    let session = factory
        .create(PeerEventSink::new(generation, commands.clone()))
        .await?;
    match session.add_local_audio_track().await {
        Ok(track) => Ok((session, track)),
        Err(e) => {
            let _ = session.close().await;
            Err(e)
        }
    }
}

async fn local_description(
    session: &dyn PeerSession,
    sdp_type: SdpType,
) -> Result<SessionDescription, NegotiationError> {
    let description = match sdp_type {
        SdpType::Offer => session.create_offer().await?,
        SdpType::Answer => session.create_answer().await?,
    };
    session.set_local_description(description.clone()).await?;
    Ok(description)
}
