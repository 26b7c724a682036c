//! Peer-connection library seam.
//!
//! A [`PeerHandle`] is this client's identity on the peer network. Outbound
//! calls resolve once the remote side's media arrives; inbound calls are
//! surfaced through [`PeerHandle::accept`] and answered with the local stream.

mod broker;
mod local;
mod webrtc;

pub use self::broker::{BrokerConnection, BrokerMessage, MediaPayload, SessionPayload};
pub use self::local::LocalNetwork;
pub use self::webrtc::WebRtcNetwork;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::media::LocalStream;

/// Media received from a remote peer over one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub call_id: String,
    pub peer_id: String,
    pub audio: bool,
    pub video: bool,
}

#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Registers a new identity; resolves once the network assigned its id.
    async fn open(&self) -> Result<Arc<dyn PeerHandle>>;
}

#[async_trait]
pub trait PeerHandle: Send + Sync {
    fn id(&self) -> &str;

    async fn call(&self, peer_id: &str, local: &LocalStream) -> Result<RemoteStream>;

    /// Next inbound call, or `None` once the handle is closed.
    async fn accept(&self) -> Option<Box<dyn IncomingCall>>;

    async fn hang_up(&self, call_id: &str);

    /// Closes every call with `peer_id`, in either direction.
    async fn close_peer(&self, peer_id: &str);

    async fn close(&self);
}

#[async_trait]
pub trait IncomingCall: Send {
    fn peer_id(&self) -> &str;

    async fn answer(self: Box<Self>, local: &LocalStream) -> Result<()>;
}
