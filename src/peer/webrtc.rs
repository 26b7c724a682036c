use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::broker::{BrokerConnection, BrokerMessage, MediaPayload};
use super::{IncomingCall, PeerHandle, PeerNetwork, RemoteStream};
use crate::config::PeerConfig;
use crate::error::{AppError, Result};
use crate::media::{AudioPlayback, LocalStream, FRAME_DURATION, PCMU_RATE};
use crate::store::random_id;

/// Peer network backed by the `webrtc` crate, signaling through a
/// PeerJS-compatible broker.
pub struct WebRtcNetwork {
    config: PeerConfig,
}

impl WebRtcNetwork {
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }

    fn build_api() -> Result<API> {
        // PCMU only, so both ends agree on what the capture path produces.
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: pcmu_capability(),
                payload_type: 0,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        Ok(APIBuilder::new().with_media_engine(media_engine).build())
    }
}

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_RATE,
        channels: 1,
        ..Default::default()
    }
}

#[async_trait]
impl PeerNetwork for WebRtcNetwork {
    async fn open(&self) -> Result<Arc<dyn PeerHandle>> {
        let api = Arc::new(Self::build_api()?);
        let (broker, messages) = BrokerConnection::connect(&self.config).await?;
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let shared = Arc::new(Shared {
            broker,
            api,
            rtc_config,
            calls: Mutex::new(HashMap::new()),
            early_candidates: Mutex::new(HashMap::new()),
        });
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(shared.clone(), messages, incoming_tx));

        Ok(Arc::new(WebRtcPeer {
            id: shared.broker.id().to_string(),
            shared,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            dispatcher,
            call_timeout: self.config.call_timeout(),
        }))
    }
}

struct CallSlot {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    remote_set: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
    answer: Option<oneshot::Sender<String>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    broker: BrokerConnection,
    api: Arc<API>,
    rtc_config: RTCConfiguration,
    calls: Mutex<HashMap<String, CallSlot>>,
    /// Candidates for inbound calls that have not been answered yet.
    early_candidates: Mutex<HashMap<String, Vec<RTCIceCandidateInit>>>,
}

impl Shared {
    async fn new_connection(&self, peer_id: &str, connection_id: &str) -> Result<Arc<RTCPeerConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);

        let outgoing = self.broker.outgoing_handle();
        let dst = peer_id.to_string();
        let connection = connection_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outgoing = outgoing.clone();
            let dst = dst.clone();
            let connection = connection.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = outgoing.send(BrokerMessage::Candidate {
                            src: None,
                            dst: Some(dst),
                            payload: MediaPayload::candidate(&connection, init),
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "cannot serialize ICE candidate"),
                }
            })
        }));

        let connection = connection_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(call = %connection, %state, "peer connection state changed");
            Box::pin(async {})
        }));
        Ok(pc)
    }

    fn insert(&self, connection_id: &str, slot: CallSlot) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.insert(connection_id.to_string(), slot);
        }
    }

    fn add_task(&self, connection_id: &str, task: JoinHandle<()>) {
        match self.calls.lock() {
            Ok(mut calls) => match calls.get_mut(connection_id) {
                Some(slot) => slot.tasks.push(task),
                None => task.abort(),
            },
            Err(_) => task.abort(),
        }
    }

    /// Marks the remote description as applied and returns buffered candidates.
    fn take_candidates(&self, connection_id: &str) -> Vec<RTCIceCandidateInit> {
        let mut candidates = self
            .early_candidates
            .lock()
            .ok()
            .and_then(|mut early| early.remove(connection_id))
            .unwrap_or_default();
        if let Ok(mut calls) = self.calls.lock() {
            if let Some(slot) = calls.get_mut(connection_id) {
                slot.remote_set = true;
                candidates.append(&mut slot.pending_candidates);
            }
        }
        candidates
    }

    async fn remove_where(&self, filter: impl Fn(&str, &CallSlot) -> bool) {
        let removed: Vec<(String, CallSlot)> = match self.calls.lock() {
            Ok(mut calls) => {
                let ids: Vec<String> = calls
                    .iter()
                    .filter(|(id, slot)| filter(id, slot))
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| calls.remove(&id).map(|slot| (id, slot)))
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for (id, slot) in removed {
            for task in &slot.tasks {
                task.abort();
            }
            if let Err(e) = slot.pc.close().await {
                tracing::debug!(call = %id, error = %e, "error closing peer connection");
            }
            tracing::info!(call = %id, peer = %slot.peer_id, "call closed");
        }
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut messages: mpsc::UnboundedReceiver<BrokerMessage>,
    incoming: mpsc::UnboundedSender<WebRtcIncoming>,
) {
    while let Some(message) = messages.recv().await {
        match message {
            BrokerMessage::Offer {
                src: Some(src),
                payload,
                ..
            } => {
                let Some(offer) = payload.sdp else {
                    continue;
                };
                let call = WebRtcIncoming {
                    peer_id: src,
                    connection_id: payload.connection_id,
                    offer_sdp: offer.sdp,
                    shared: shared.clone(),
                };
                if incoming.send(call).is_err() {
                    break;
                }
            }
            BrokerMessage::Answer { payload, .. } => {
                let (Some(answer), Ok(mut calls)) = (payload.sdp, shared.calls.lock()) else {
                    continue;
                };
                if let Some(tx) = calls
                    .get_mut(&payload.connection_id)
                    .and_then(|slot| slot.answer.take())
                {
                    let _ = tx.send(answer.sdp);
                }
            }
            BrokerMessage::Candidate { payload, .. } => {
                let Some(candidate) = payload.candidate else {
                    continue;
                };
                let ready = match shared.calls.lock() {
                    Ok(mut calls) => match calls.get_mut(&payload.connection_id) {
                        Some(slot) if slot.remote_set => Some(slot.pc.clone()),
                        Some(slot) => {
                            slot.pending_candidates.push(candidate.clone());
                            None
                        }
                        None => {
                            if let Ok(mut early) = shared.early_candidates.lock() {
                                early
                                    .entry(payload.connection_id.clone())
                                    .or_default()
                                    .push(candidate.clone());
                            }
                            None
                        }
                    },
                    Err(_) => None,
                };
                if let Some(pc) = ready {
                    if let Err(e) = pc.add_ice_candidate(candidate).await {
                        tracing::debug!(error = %e, "rejected remote ICE candidate");
                    }
                }
            }
            BrokerMessage::Leave { src: Some(src), .. } | BrokerMessage::Expire { src: Some(src), .. } => {
                tracing::info!(peer = %src, "peer left the broker");
                shared.remove_where(|_, slot| slot.peer_id == src).await;
            }
            BrokerMessage::Error { payload } => {
                let msg = payload.map(|p| p.msg).unwrap_or_default();
                tracing::warn!(%msg, "broker error");
            }
            _ => {}
        }
    }
    tracing::debug!("broker dispatcher stopped");
}

/// Adds the PCMU track and keeps it fed from the local capture.
async fn attach_local_audio(
    shared: &Shared,
    connection_id: &str,
    pc: &RTCPeerConnection,
    local: &LocalStream,
) -> Result<()> {
    if !local.has_audio() {
        return Ok(());
    }
    let track = Arc::new(TrackLocalStaticSample::new(
        pcmu_capability(),
        "audio".to_owned(),
        local.id().to_owned(),
    ));
    let sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    // RTCP has to be read for the interceptors to run.
    shared.add_task(
        connection_id,
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        }),
    );

    if let Some(mut frames) = local.audio_frames() {
        shared.add_task(
            connection_id,
            tokio::spawn(async move {
                loop {
                    match frames.recv().await {
                        Ok(data) => {
                            let sample = Sample {
                                data,
                                duration: FRAME_DURATION,
                                ..Default::default()
                            };
                            if let Err(e) = track.write_sample(&sample).await {
                                tracing::debug!(error = %e, "dropping audio frame");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "audio sender lagging");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }),
        );
    }
    Ok(())
}

struct WebRtcPeer {
    id: String,
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<WebRtcIncoming>>,
    dispatcher: JoinHandle<()>,
    call_timeout: Duration,
}

impl WebRtcPeer {
    async fn place_call(
        &self,
        peer_id: &str,
        connection_id: &str,
        local: &LocalStream,
    ) -> Result<RemoteStream> {
        let shared = &self.shared;
        let pc = shared.new_connection(peer_id, connection_id).await?;
        let (answer_tx, answer_rx) = oneshot::channel();
        shared.insert(
            connection_id,
            CallSlot {
                peer_id: peer_id.to_string(),
                pc: pc.clone(),
                remote_set: false,
                pending_candidates: Vec::new(),
                answer: Some(answer_tx),
                tasks: Vec::new(),
            },
        );
        attach_local_audio(shared, connection_id, &pc, local).await?;

        let (stream_tx, stream_rx) = oneshot::channel::<RemoteStream>();
        let stream_tx = Arc::new(Mutex::new(Some(stream_tx)));
        let call_id = connection_id.to_string();
        let remote_peer = peer_id.to_string();
        let track_shared = Arc::downgrade(shared);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = track.kind();
                if let Some(tx) = stream_tx.lock().ok().and_then(|mut tx| tx.take()) {
                    let _ = tx.send(RemoteStream {
                        call_id: call_id.clone(),
                        peer_id: remote_peer.clone(),
                        audio: kind == RTPCodecType::Audio,
                        video: kind == RTPCodecType::Video,
                    });
                }
                let reader = tokio::spawn(render_remote_track(track));
                if let Some(shared) = track_shared.upgrade() {
                    shared.add_task(&call_id, reader);
                }
                Box::pin(async {})
            },
        ));

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        shared.broker.send(BrokerMessage::Offer {
            src: None,
            dst: Some(peer_id.to_string()),
            payload: MediaPayload::session(connection_id, "offer", offer.sdp),
        })?;

        let answer_sdp = answer_rx
            .await
            .map_err(|_| AppError::Peer(format!("call to {} was dropped", peer_id)))?;
        pc.set_remote_description(RTCSessionDescription::answer(answer_sdp)?)
            .await?;
        for candidate in shared.take_candidates(connection_id) {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::debug!(error = %e, "rejected buffered ICE candidate");
            }
        }

        stream_rx
            .await
            .map_err(|_| AppError::Peer(format!("no media from {}", peer_id)))
    }
}

/// Plays remote PCMU until the track ends.
async fn render_remote_track(track: Arc<TrackRemote>) {
    let playback = if track.kind() == RTPCodecType::Audio {
        match tokio::task::spawn_blocking(AudioPlayback::start).await {
            Ok(Ok(playback)) => Some(playback),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "remote audio will not be played");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "playback setup panicked");
                None
            }
        }
    } else {
        None
    };
    while let Ok((packet, _)) = track.read_rtp().await {
        if let Some(playback) = &playback {
            playback.push_ulaw(&packet.payload);
        }
    }
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(&self, peer_id: &str, local: &LocalStream) -> Result<RemoteStream> {
        let connection_id = format!("mc_{}", random_id());
        tracing::info!(peer = %peer_id, call = %connection_id, "calling peer");
        let outcome = tokio::time::timeout(
            self.call_timeout,
            self.place_call(peer_id, &connection_id, local),
        )
        .await
        .unwrap_or(Err(AppError::Timeout("remote media")));
        if outcome.is_err() {
            self.shared.remove_where(|id, _| id == connection_id).await;
        }
        outcome
    }

    async fn accept(&self) -> Option<Box<dyn IncomingCall>> {
        let call = self.incoming.lock().await.recv().await?;
        Some(Box::new(call))
    }

    async fn hang_up(&self, call_id: &str) {
        self.shared.remove_where(|id, _| id == call_id).await;
    }

    async fn close_peer(&self, peer_id: &str) {
        self.shared.remove_where(|_, slot| slot.peer_id == peer_id).await;
    }

    async fn close(&self) {
        self.dispatcher.abort();
        self.incoming.lock().await.close();
        self.shared.remove_where(|_, _| true).await;
        tracing::info!(peer = %self.id, "peer handle closed");
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

struct WebRtcIncoming {
    peer_id: String,
    connection_id: String,
    offer_sdp: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl IncomingCall for WebRtcIncoming {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn answer(self: Box<Self>, local: &LocalStream) -> Result<()> {
        let Self {
            peer_id,
            connection_id,
            offer_sdp,
            shared,
        } = *self;
        let pc = shared.new_connection(&peer_id, &connection_id).await?;
        shared.insert(
            &connection_id,
            CallSlot {
                peer_id: peer_id.clone(),
                pc: pc.clone(),
                remote_set: false,
                pending_candidates: Vec::new(),
                answer: None,
                tasks: Vec::new(),
            },
        );
        attach_local_audio(&shared, &connection_id, &pc, local).await?;

        // The caller renders its own outbound call; media arriving here is drained.
        pc.on_track(Box::new(
            |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                Box::pin(async {})
            },
        ));

        pc.set_remote_description(RTCSessionDescription::offer(offer_sdp)?)
            .await?;
        for candidate in shared.take_candidates(&connection_id) {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::debug!(error = %e, "rejected buffered ICE candidate");
            }
        }
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        shared.broker.send(BrokerMessage::Answer {
            src: None,
            dst: Some(peer_id.clone()),
            payload: MediaPayload::session(&connection_id, "answer", answer.sdp),
        })?;
        tracing::info!(peer = %peer_id, call = %connection_id, "answered call");
        Ok(())
    }
}
