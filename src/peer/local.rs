use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{IncomingCall, PeerHandle, PeerNetwork, RemoteStream};
use crate::error::{AppError, Result};
use crate::media::LocalStream;
use crate::store::random_id;

const ANSWER_TIMEOUT: Duration = Duration::from_secs(5);

struct Offer {
    call_id: String,
    from: String,
    answer: oneshot::Sender<(bool, bool)>,
}

#[derive(Debug, Clone)]
struct CallRecord {
    caller: String,
    callee: String,
    open: bool,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<String, mpsc::UnboundedSender<Offer>>,
    calls: HashMap<String, CallRecord>,
}

/// In-process peer network. Calls are bookkeeping only; media never flows.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls placed from `caller` to `callee`, open or not.
    pub fn calls_placed(&self, caller: &str, callee: &str) -> usize {
        self.count(|c| c.caller == caller && c.callee == callee)
    }

    pub fn open_calls(&self, caller: &str, callee: &str) -> usize {
        self.count(|c| c.open && c.caller == caller && c.callee == callee)
    }

    fn count(&self, filter: impl Fn(&CallRecord) -> bool) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.calls.values().filter(|c| filter(c)).count())
            .unwrap_or(0)
    }

    fn close_where(&self, filter: impl Fn(&CallRecord) -> bool) {
        if let Ok(mut inner) = self.inner.lock() {
            for call in inner.calls.values_mut().filter(|c| filter(c)) {
                call.open = false;
            }
        }
    }
}

#[async_trait]
impl PeerNetwork for LocalNetwork {
    async fn open(&self) -> Result<Arc<dyn PeerHandle>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = random_id();
        self.inner
            .lock()
            .map_err(|_| AppError::Peer("network state poisoned".to_string()))?
            .peers
            .insert(id.clone(), tx);
        Ok(Arc::new(LocalPeer {
            id,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        }))
    }
}

struct LocalPeer {
    id: String,
    network: LocalNetwork,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Offer>>,
}

#[async_trait]
impl PeerHandle for LocalPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(&self, peer_id: &str, _local: &LocalStream) -> Result<RemoteStream> {
        let call_id = random_id();
        let (answer_tx, answer_rx) = oneshot::channel();
        {
            let mut inner = self
                .network
                .inner
                .lock()
                .map_err(|_| AppError::Peer("network state poisoned".to_string()))?;
            inner.calls.insert(
                call_id.clone(),
                CallRecord {
                    caller: self.id.clone(),
                    callee: peer_id.to_string(),
                    open: false,
                },
            );
            let target = inner
                .peers
                .get(peer_id)
                .ok_or_else(|| AppError::Peer(format!("peer {} is unavailable", peer_id)))?;
            target
                .send(Offer {
                    call_id: call_id.clone(),
                    from: self.id.clone(),
                    answer: answer_tx,
                })
                .map_err(|_| AppError::Peer(format!("peer {} is unavailable", peer_id)))?;
        }

        let (audio, video) = tokio::time::timeout(ANSWER_TIMEOUT, answer_rx)
            .await
            .map_err(|_| AppError::Timeout("call answer"))?
            .map_err(|_| AppError::Peer(format!("peer {} dropped the call", peer_id)))?;

        let mut inner = self
            .network
            .inner
            .lock()
            .map_err(|_| AppError::Peer("network state poisoned".to_string()))?;
        let callee_alive = inner.peers.contains_key(peer_id);
        if let Some(call) = inner.calls.get_mut(&call_id) {
            call.open = callee_alive;
        }
        if !callee_alive {
            return Err(AppError::Peer(format!("peer {} left", peer_id)));
        }
        Ok(RemoteStream {
            call_id,
            peer_id: peer_id.to_string(),
            audio,
            video,
        })
    }

    async fn accept(&self) -> Option<Box<dyn IncomingCall>> {
        let offer = self.incoming.lock().await.recv().await?;
        Some(Box::new(LocalIncoming { offer }))
    }

    async fn hang_up(&self, call_id: &str) {
        if let Ok(mut inner) = self.network.inner.lock() {
            if let Some(call) = inner.calls.get_mut(call_id) {
                call.open = false;
            }
        }
    }

    async fn close_peer(&self, peer_id: &str) {
        let me = self.id.as_str();
        self.network.close_where(|c| {
            (c.caller == me && c.callee == peer_id) || (c.caller == peer_id && c.callee == me)
        });
    }

    async fn close(&self) {
        let me = self.id.as_str();
        if let Ok(mut inner) = self.network.inner.lock() {
            inner.peers.remove(me);
        }
        self.network.close_where(|c| c.caller == me || c.callee == me);
        self.incoming.lock().await.close();
    }
}

struct LocalIncoming {
    offer: Offer,
}

#[async_trait]
impl IncomingCall for LocalIncoming {
    fn peer_id(&self) -> &str {
        &self.offer.from
    }

    async fn answer(self: Box<Self>, local: &LocalStream) -> Result<()> {
        tracing::debug!(call = %self.offer.call_id, from = %self.offer.from, "answering local call");
        self.offer
            .answer
            .send((local.has_audio(), local.video_enabled()))
            .map_err(|_| AppError::Peer("caller gave up".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_is_answered_and_closed() {
        let network = LocalNetwork::new();
        let a = network.open().await.unwrap();
        let b = network.open().await.unwrap();

        let b_side = b.clone();
        let caller = a.id().to_string();
        let answerer = tokio::spawn(async move {
            let call = b_side.accept().await.unwrap();
            assert_eq!(call.peer_id(), caller);
            call.answer(&LocalStream::detached(true, true)).await.unwrap();
        });
        let stream = a.call(b.id(), &LocalStream::detached(true, false)).await.unwrap();
        answerer.await.unwrap();

        assert_eq!(stream.peer_id, b.id());
        assert!(stream.audio && stream.video);
        assert_eq!(network.open_calls(a.id(), b.id()), 1);

        b.close_peer(a.id()).await;
        assert_eq!(network.open_calls(a.id(), b.id()), 0);
        assert_eq!(network.calls_placed(a.id(), b.id()), 1);
    }

    #[tokio::test]
    async fn calling_a_closed_peer_fails() {
        let network = LocalNetwork::new();
        let a = network.open().await.unwrap();
        let b = network.open().await.unwrap();
        b.close().await;
        assert!(a.call(b.id(), &LocalStream::detached(true, false)).await.is_err());
    }
}
