//! One room visit.
//!
//! [`RoomSession::enter`] acquires media, opens a peer handle, publishes
//! presence and spawns the event loop. All room state lives in that task;
//! the session handle only sends commands and reads the [`RoomView`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::documents::RoomDocuments;
use super::listeners::Listeners;
use super::lookup::share_link;
use super::state::{Effect, PeerPhase, PresenceTracker, Signal};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::media::{LocalStream, MediaDevices, MediaKind, MediaRequest};
use crate::peer::{IncomingCall, PeerHandle, PeerNetwork, RemoteStream};
use crate::store::DocumentStore;

/// Collaborators shared by every room visit.
#[derive(Clone)]
pub struct RoomContext {
    pub store: Arc<dyn DocumentStore>,
    pub network: Arc<dyn PeerNetwork>,
    pub devices: Arc<dyn MediaDevices>,
    pub config: AppConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Live,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub peer_id: String,
    pub username: String,
    pub phase: PeerPhase,
    pub stream: Option<RemoteStream>,
}

/// Snapshot the UI renders from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomView {
    pub room_id: String,
    pub status: RoomStatus,
    pub local_peer_id: String,
    pub username: String,
    pub camera_on: bool,
    /// Whether this client currently has a presence record in the room.
    pub published: bool,
    pub media: MediaKind,
    pub share_link: String,
    /// Remote peers that have not left, ordered by peer id.
    pub peers: Vec<PeerView>,
}

enum Command {
    ToggleCamera(oneshot::Sender<Result<bool>>),
    HangUp(oneshot::Sender<Result<()>>),
}

/// Handle to a running room visit. Dropping it ends the visit without
/// publishing a disconnect.
pub struct RoomSession {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<RoomView>,
    task: JoinHandle<()>,
}

fn validate_room_id(room_id: &str) -> Result<()> {
    if room_id.trim().is_empty() || room_id.contains('/') {
        return Err(AppError::InvalidRoomId(room_id.to_string()));
    }
    Ok(())
}

/// Requests audio and video, falling back to audio only.
pub async fn acquire_media(devices: &dyn MediaDevices) -> Result<LocalStream> {
    match devices.request(MediaRequest::AUDIO_VIDEO).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            tracing::warn!(error = %e, "camera unavailable, falling back to audio only");
            let stream = devices.request(MediaRequest::AUDIO_ONLY).await?;
            Ok(stream)
        }
    }
}

impl RoomSession {
    /// Joins `room_id` as `username`.
    ///
    /// `local` is reused when it is still live; otherwise audio and video
    /// are requested, falling back to audio only.
    pub async fn enter(
        ctx: &RoomContext,
        room_id: &str,
        username: &str,
        local: Option<LocalStream>,
    ) -> Result<Self> {
        validate_room_id(room_id)?;

        let local = match local.filter(|s| !s.is_stopped()) {
            Some(stream) => stream,
            None => acquire_media(ctx.devices.as_ref()).await?,
        };

        let handle = match ctx.network.open().await {
            Ok(handle) => handle,
            Err(e) => {
                local.stop();
                return Err(e);
            }
        };
        tracing::info!(room = %room_id, peer = %handle.id(), media = ?local.kind(), "entering room");

        let docs = RoomDocuments::new(ctx.store.clone(), &ctx.config.store, room_id);
        let attach = Listeners::attach(ctx.store.as_ref(), docs.paths());
        let attached = tokio::time::timeout(ctx.config.store.request_timeout(), attach)
            .await
            .unwrap_or(Err(AppError::Timeout("room subscriptions")));
        let listeners = match attached {
            Ok(listeners) => listeners,
            Err(e) => {
                handle.close().await;
                local.stop();
                return Err(e);
            }
        };
        let record_id = docs.publish_presence(handle.id(), username).await;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let initial = RoomView {
            room_id: room_id.to_string(),
            status: RoomStatus::Live,
            local_peer_id: handle.id().to_string(),
            username: username.to_string(),
            camera_on: true,
            published: record_id.is_some(),
            media: local.kind(),
            share_link: share_link(&ctx.config.app.origin, room_id),
            peers: Vec::new(),
        };
        let (view_tx, view) = watch::channel(initial);

        let mut room = RoomLoop {
            tracker: PresenceTracker::new(handle.id()),
            handle,
            docs,
            local,
            username: username.to_string(),
            record_id,
            camera_on: true,
            listeners: Some(listeners),
            commands: commands_rx,
            outcomes_tx,
            outcomes: outcomes_rx,
            calls: Vec::new(),
            view: view_tx,
            closed: false,
        };
        let task = tokio::spawn(async move { room.run().await });

        Ok(Self {
            commands,
            view,
            task,
        })
    }

    pub fn view(&self) -> watch::Receiver<RoomView> {
        self.view.clone()
    }

    /// Pauses or resumes the camera. Resolves to the new camera state.
    pub async fn toggle_camera(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ToggleCamera(tx))
            .map_err(|_| AppError::SessionClosed)?;
        rx.await.map_err(|_| AppError::SessionClosed)?
    }

    /// Leaves the room. On [`AppError::Disconnect`] the visit continues.
    pub async fn hang_up(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::HangUp(tx))
            .map_err(|_| AppError::SessionClosed)?;
        rx.await.map_err(|_| AppError::SessionClosed)?
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Event {
    Command(Option<Command>),
    Feed(Option<Signal>),
    Outcome(Signal),
    Incoming(Box<dyn IncomingCall>),
}

struct RoomLoop {
    handle: Arc<dyn PeerHandle>,
    docs: RoomDocuments,
    local: LocalStream,
    username: String,
    record_id: Option<String>,
    camera_on: bool,
    tracker: PresenceTracker,
    listeners: Option<Listeners>,
    commands: mpsc::UnboundedReceiver<Command>,
    outcomes_tx: mpsc::UnboundedSender<Signal>,
    outcomes: mpsc::UnboundedReceiver<Signal>,
    calls: Vec<JoinHandle<()>>,
    view: watch::Sender<RoomView>,
    closed: bool,
}

async fn next_signal(listeners: &mut Option<Listeners>) -> Option<Signal> {
    match listeners {
        Some(listeners) => listeners.next().await,
        None => std::future::pending().await,
    }
}

impl RoomLoop {
    async fn run(&mut self) {
        self.publish_view();
        loop {
            let handle = self.handle.clone();
            let event = tokio::select! {
                biased;
                command = self.commands.recv() => Event::Command(command),
                signal = next_signal(&mut self.listeners) => Event::Feed(signal),
                Some(signal) = self.outcomes.recv() => Event::Outcome(signal),
                Some(call) = handle.accept() => Event::Incoming(call),
            };

            match event {
                Event::Command(Some(Command::ToggleCamera(reply))) => {
                    let result = self.toggle_camera().await;
                    self.publish_view();
                    let _ = reply.send(result);
                }
                Event::Command(Some(Command::HangUp(reply))) => {
                    let result = self.hang_up().await;
                    let left = result.is_ok();
                    self.publish_view();
                    let _ = reply.send(result);
                    if left {
                        break;
                    }
                }
                Event::Command(None) => {
                    self.shutdown().await;
                    break;
                }
                Event::Feed(Some(signal)) | Event::Outcome(signal) => {
                    let effects = self.tracker.apply(signal);
                    for effect in effects {
                        self.execute(effect).await;
                    }
                }
                Event::Feed(None) => {
                    tracing::warn!(room = %self.docs.room_id(), "room feeds closed");
                    self.listeners = None;
                }
                Event::Incoming(call) => self.answer(call),
            }
            self.publish_view();
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::PlaceCall {
                peer_id,
                generation,
            } => self.place_call(peer_id, generation),
            Effect::Render { peer_id } => {
                tracing::info!(room = %self.docs.room_id(), peer = %peer_id, "remote stream live");
            }
            Effect::Hide { peer_id } => {
                tracing::debug!(peer = %peer_id, "remote camera paused");
            }
            Effect::Show { peer_id } => {
                tracing::debug!(peer = %peer_id, "remote camera resumed");
            }
            Effect::Teardown { peer_id } => {
                tracing::info!(room = %self.docs.room_id(), peer = %peer_id, "peer left");
                self.handle.close_peer(&peer_id).await;
            }
            Effect::Release { stream } => {
                self.handle.hang_up(&stream.call_id).await;
            }
        }
    }

    fn place_call(&mut self, peer_id: String, generation: u64) {
        self.calls.retain(|task| !task.is_finished());
        let handle = self.handle.clone();
        let local = self.local.clone();
        let outcomes = self.outcomes_tx.clone();
        tracing::debug!(peer = %peer_id, generation, "placing call");
        self.calls.push(tokio::spawn(async move {
            let signal = match handle.call(&peer_id, &local).await {
                Ok(stream) => Signal::StreamReceived {
                    peer_id,
                    generation,
                    stream,
                },
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, "call failed");
                    Signal::CallFailed {
                        peer_id,
                        generation,
                    }
                }
            };
            let _ = outcomes.send(signal);
        }));
    }

    fn answer(&mut self, call: Box<dyn IncomingCall>) {
        self.calls.retain(|task| !task.is_finished());
        let local = self.local.clone();
        self.calls.push(tokio::spawn(async move {
            let from = call.peer_id().to_string();
            if let Err(e) = call.answer(&local).await {
                tracing::warn!(peer = %from, error = %e, "failed to answer call");
            }
        }));
    }

    /// Without a presence record on file (camera paused, or the first
    /// publish failed) this publishes one. Otherwise it pauses the camera,
    /// keeping the record and the camera when the record cannot be retracted.
    async fn toggle_camera(&mut self) -> Result<bool> {
        let Some(record) = self.record_id.clone() else {
            let record = self
                .docs
                .publish_presence(self.handle.id(), &self.username)
                .await
                .ok_or_else(|| AppError::Store("could not publish presence".to_string()))?;
            self.record_id = Some(record);
            self.local.set_video_enabled(true);
            self.camera_on = true;
            return Ok(true);
        };
        if !self
            .docs
            .publish_stop_stream(self.handle.id(), &self.username)
            .await
        {
            tracing::warn!(room = %self.docs.room_id(), "peers will see a departure instead of a pause");
        }
        if !self.docs.retract_presence(&record).await {
            return Err(AppError::Store("could not retract presence".to_string()));
        }
        self.record_id = None;
        self.local.set_video_enabled(false);
        self.camera_on = false;
        Ok(false)
    }

    async fn hang_up(&mut self) -> Result<()> {
        if !self
            .docs
            .publish_disconnect(self.handle.id(), &self.username)
            .await
        {
            return Err(AppError::Disconnect);
        }
        if let Some(record) = self.record_id.take() {
            if !self.docs.retract_presence(&record).await {
                tracing::warn!(room = %self.docs.room_id(), record = %record, "presence record left behind");
            }
        }
        self.shutdown().await;
        tracing::info!(room = %self.docs.room_id(), peer = %self.handle.id(), "left room");
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listeners = None;
        for task in self.calls.drain(..) {
            task.abort();
        }
        self.local.stop();
        self.handle.close().await;
        self.publish_view();
    }

    fn publish_view(&self) {
        let peers = self
            .tracker
            .peers()
            .into_iter()
            .filter(|peer| peer.phase != PeerPhase::Disconnected)
            .map(|peer| PeerView {
                peer_id: peer.peer_id.clone(),
                username: peer.username.clone(),
                phase: peer.phase,
                stream: peer.stream.clone(),
            })
            .collect();
        self.view.send_modify(|view| {
            view.status = if self.closed {
                RoomStatus::Left
            } else {
                RoomStatus::Live
            };
            view.camera_on = self.camera_on;
            view.published = self.record_id.is_some();
            view.media = self.local.kind();
            view.peers = peers;
        });
    }
}

impl Drop for RoomLoop {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        for task in self.calls.drain(..) {
            task.abort();
        }
        self.local.stop();
        let handle = self.handle.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { handle.close().await });
        }
    }
}
