//! Local media: what the user granted, and the frames it produces.

mod audio;

pub use audio::{decode_ulaw, encode_ulaw, AudioPlayback, CpalDevices, FRAME_DURATION, FRAME_SAMPLES, PCMU_RATE};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    Denied(&'static str),
    #[error("no {0} device found")]
    NotFound(&'static str),
    #[error("device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl MediaRequest {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MediaKind {
    #[default]
    None,
    AudioOnly,
    AudioVideo,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn request(&self, request: MediaRequest) -> Result<LocalStream, MediaError>;
}

/// Stops whatever produces frames for a stream when told to or dropped.
pub(crate) trait CaptureGuard: Send {
    fn stop(&mut self);
}

struct StreamInner {
    id: String,
    audio: bool,
    video: bool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
    frames: Option<broadcast::Sender<Bytes>>,
    capture: Mutex<Option<Box<dyn CaptureGuard>>>,
}

/// Camera/microphone stream held by the room controller. Clones share state.
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<StreamInner>,
}

impl LocalStream {
    /// A stream with no frame source, e.g. for the in-process peer network.
    pub fn detached(audio: bool, video: bool) -> Self {
        Self::build(audio, video, None, None)
    }

    pub(crate) fn build(
        audio: bool,
        video: bool,
        frames: Option<broadcast::Sender<Bytes>>,
        capture: Option<Box<dyn CaptureGuard>>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: crate::store::random_id(),
                audio,
                video,
                video_enabled: AtomicBool::new(video),
                stopped: AtomicBool::new(false),
                frames,
                capture: Mutex::new(capture),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn has_audio(&self) -> bool {
        self.inner.audio
    }

    pub fn kind(&self) -> MediaKind {
        match (self.inner.audio, self.inner.video) {
            (_, true) => MediaKind::AudioVideo,
            (true, false) => MediaKind::AudioOnly,
            (false, false) => MediaKind::None,
        }
    }

    pub fn video_enabled(&self) -> bool {
        self.inner.video_enabled.load(Ordering::SeqCst)
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.inner
            .video_enabled
            .store(enabled && self.inner.video, Ordering::SeqCst);
    }

    /// Encoded PCMU frames, if this stream captures audio from a device.
    pub fn audio_frames(&self) -> Option<broadcast::Receiver<Bytes>> {
        self.inner.frames.as_ref().map(|tx| tx.subscribe())
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Releases the devices. Safe to call more than once.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.video_enabled.store(false, Ordering::SeqCst);
        if let Ok(mut capture) = self.inner.capture.lock() {
            if let Some(mut guard) = capture.take() {
                guard.stop();
            }
        }
        tracing::debug!(stream = %self.inner.id, "local stream stopped");
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Grants a fixed set of devices with no frame source.
#[derive(Debug, Clone, Copy)]
pub struct StaticDevices {
    pub microphone: bool,
    pub camera: bool,
}

impl StaticDevices {
    pub fn all() -> Self {
        Self {
            microphone: true,
            camera: true,
        }
    }
}

#[async_trait]
impl MediaDevices for StaticDevices {
    async fn request(&self, request: MediaRequest) -> Result<LocalStream, MediaError> {
        if request.video && !self.camera {
            return Err(MediaError::Denied("camera"));
        }
        if request.audio && !self.microphone {
            return Err(MediaError::Denied("microphone"));
        }
        Ok(LocalStream::detached(request.audio, request.video))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_toggle_needs_a_video_track() {
        let stream = LocalStream::detached(true, false);
        stream.set_video_enabled(true);
        assert!(!stream.video_enabled());

        let stream = LocalStream::detached(true, true);
        stream.set_video_enabled(false);
        assert!(!stream.video_enabled());
        stream.set_video_enabled(true);
        assert!(stream.video_enabled());
    }

    #[test]
    fn stop_is_idempotent_and_shared_by_clones() {
        let stream = LocalStream::detached(true, true);
        let clone = stream.clone();
        stream.stop();
        stream.stop();
        assert!(clone.is_stopped());
        assert!(!clone.video_enabled());
    }

    #[tokio::test]
    async fn static_devices_deny_missing_camera() {
        let devices = StaticDevices {
            microphone: true,
            camera: false,
        };
        assert_eq!(
            devices.request(MediaRequest::AUDIO_VIDEO).await.unwrap_err(),
            MediaError::Denied("camera")
        );
        let stream = devices.request(MediaRequest::AUDIO_ONLY).await.unwrap();
        assert_eq!(stream.kind(), MediaKind::AudioOnly);
    }
}
