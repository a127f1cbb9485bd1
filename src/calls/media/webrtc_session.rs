//! webrtc-rs implementation of the peer session.
//!
//! One `RTCPeerConnection` per call, audio only: a single Opus
//! `TrackLocalStaticSample` is added before any description is created so
//! that offers and answers carry an audio m-line. Only STUN servers are
//! configured.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use callcore::{IceCandidate, SdpType, SessionDescription};

use super::track::LocalAudioTrack;
use crate::calls::negotiation::{
    NegotiationError, PeerEventSink, PeerSession, PeerSessionFactory, TransportState,
};
use crate::config::CallConfig;

const AUDIO_TRACK_ID: &str = "audio";
const AUDIO_STREAM_ID: &str = "guardian-call";

/// Creates one webrtc-rs peer connection per call.
#[derive(Debug, Clone)]
pub struct WebRtcSessionFactory {
    stun_servers: Vec<String>,
    ice_debug: bool,
}

impl WebRtcSessionFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            stun_servers: config.stun_servers.clone(),
            ice_debug: config.ice_debug,
        }
    }

    fn create_api(&self) -> Result<webrtc::api::API, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if !self.ice_debug {
            setting_engine
                .set_ice_multicast_dns_mode(webrtc::ice::mdns::MulticastDnsMode::Disabled);
        }

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }
}

#[async_trait]
impl PeerSessionFactory for WebRtcSessionFactory {
    async fn create(&self, sink: PeerEventSink) -> Result<Arc<dyn PeerSession>, NegotiationError> {
        let api = self.create_api()?;

        let ice_servers = if self.stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        // Local candidates are trickled as soon as they are gathered.
        let ice_sink = sink.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = ice_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.local_candidate(IceCandidate::new(
                        init.candidate,
                        init.sdp_mid,
                        init.sdp_mline_index,
                    )),
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let state_sink = sink;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                info!("Peer connection state: {}", state);
                let mapped = match state {
                    RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                    RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                    RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    state_sink.transport_state(mapped);
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcPeerSession { peer_connection }))
    }
}

pub struct WebRtcPeerSession {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcPeerSession {
    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        let rtc = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        Ok(rtc)
    }
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = Self::to_rtc(description)?;
        self.peer_connection
            .set_local_description(description)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = Self::to_rtc(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn add_local_audio_track(&self) -> Result<Arc<dyn LocalAudioTrack>, NegotiationError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            AUDIO_TRACK_ID.to_owned(),
            AUDIO_STREAM_ID.to_owned(),
        ));

        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be drained for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let track = Arc::new(WebRtcAudioTrack::new(track));
        spawn_silence_source(track.clone());
        Ok(track)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

/// Opus comfort-noise frame (TOC for 20 ms CELT, no payload).
const OPUS_SILENCE_FRAME: &[u8] = &[0xf8, 0xff, 0xfe];
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Local audio source: paces Opus silence frames into the track until the
/// track is stopped. Muting gates the frames in `write_frame`.
fn spawn_silence_source(track: Arc<WebRtcAudioTrack>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        while !track.stopped.load(Ordering::Acquire) {
            ticker.tick().await;
            if let Err(e) = track
                .write_frame(Bytes::from_static(OPUS_SILENCE_FRAME), FRAME_DURATION)
                .await
            {
                debug!("Local audio source stopped: {}", e);
                break;
            }
        }
    });
}

/// Opus track carrying the call's outbound audio.
pub struct WebRtcAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcAudioTrack {
    fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Send one encoded Opus frame. Frames written while muted or after the
    /// track was stopped are discarded.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<(), NegotiationError> {
        if !self.enabled.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl LocalAudioTrack for WebRtcAudioTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Local audio track {} released", self.track.id());
        }
    }
}
