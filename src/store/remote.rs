use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{Change, Document, DocumentStore, Subscription};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    Add {
        request: u64,
        collection: String,
        fields: Value,
    },
    Get {
        request: u64,
        collection: String,
        id: String,
    },
    Delete {
        request: u64,
        collection: String,
        id: String,
    },
    Subscribe {
        request: u64,
        collection: String,
    },
    Unsubscribe {
        subscription: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Reply {
    Ack {
        request: u64,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        document: Option<Document>,
    },
    Error {
        request: u64,
        message: String,
    },
    Change {
        subscription: u64,
        change: Change,
    },
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;
type Listeners = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Change>>>>;

/// Client for a document relay reached over one WebSocket. Requests are
/// matched to replies by id; change notifications are routed by
/// subscription id.
///
/// Once either half of the socket fails, every waiter is woken with an
/// error and later requests fail immediately.
pub struct RemoteStore {
    outgoing: mpsc::UnboundedSender<Request>,
    pending: Pending,
    listeners: Listeners,
    closed: Arc<AtomicBool>,
    next_request: AtomicU64,
}

/// Removes an in-flight request from the relay maps when its caller gives
/// up, whether by timeout, cancellation or error.
struct Waiter<'a> {
    store: &'a RemoteStore,
    request: u64,
    listening: bool,
}

impl Waiter<'_> {
    fn keep_listener(mut self) {
        self.listening = false;
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.store.pending.lock() {
            pending.remove(&self.request);
        }
        if self.listening {
            if let Ok(mut listeners) = self.store.listeners.lock() {
                listeners.remove(&self.request);
            }
        }
    }
}

fn connection_closed() -> AppError {
    AppError::Store("relay connection closed".to_string())
}

fn poisoned() -> AppError {
    AppError::Store("relay state poisoned".to_string())
}

/// Marks the relay closed, then drops every waiter and listener. The flag is
/// raised first so a request registered after the drain sees it.
fn shut_relay(closed: &AtomicBool, pending: &Pending, listeners: &Listeners) {
    closed.store(true, Ordering::SeqCst);
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
    if let Ok(mut listeners) = listeners.lock() {
        listeners.clear();
    }
}

impl RemoteStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        tracing::info!(url, "connected to document relay");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Request>();
        let pending: Pending = Arc::default();
        let listeners: Listeners = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_pending = pending.clone();
        let writer_listeners = listeners.clone();
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(request) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&request) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unserializable relay request");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    tracing::warn!(error = %e, "document relay write failed");
                    break;
                }
            }
            shut_relay(&writer_closed, &writer_pending, &writer_listeners);
        });

        let reader_pending = pending.clone();
        let reader_listeners = listeners.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<Reply>(&text) {
                    Ok(reply) => route_reply(reply, &reader_pending, &reader_listeners),
                    Err(e) => tracing::warn!(error = %e, "unparseable relay message"),
                }
            }
            tracing::warn!("document relay connection closed");
            shut_relay(&reader_closed, &reader_pending, &reader_listeners);
        });

        Ok(Self {
            outgoing,
            pending,
            listeners,
            closed,
            next_request: AtomicU64::new(1),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers a reply slot for a fresh request id. Fails when the relay
    /// is already gone, including when it closed while registering.
    fn register(
        &self,
        listener: Option<mpsc::UnboundedSender<Change>>,
    ) -> Result<(Waiter<'_>, oneshot::Receiver<Reply>)> {
        if self.is_closed() {
            return Err(connection_closed());
        }
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let waiter = Waiter {
            store: self,
            request,
            listening: listener.is_some(),
        };
        if let Some(tx) = listener {
            self.listeners.lock().map_err(|_| poisoned())?.insert(request, tx);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().map_err(|_| poisoned())?.insert(request, tx);
        if self.is_closed() {
            return Err(connection_closed());
        }
        Ok((waiter, rx))
    }

    async fn call(&self, build: impl FnOnce(u64) -> Request) -> Result<Reply> {
        let (waiter, rx) = self.register(None)?;
        self.outgoing
            .send(build(waiter.request))
            .map_err(|_| connection_closed())?;
        match rx.await {
            Ok(Reply::Error { message, .. }) => Err(AppError::Store(message)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(connection_closed()),
        }
    }
}

fn route_reply(reply: Reply, pending: &Pending, listeners: &Listeners) {
    match reply {
        Reply::Change {
            subscription,
            change,
        } => {
            let Ok(mut listeners) = listeners.lock() else {
                return;
            };
            if let Some(tx) = listeners.get(&subscription) {
                if tx.send(change).is_err() {
                    listeners.remove(&subscription);
                }
            }
        }
        Reply::Ack { request, .. } | Reply::Error { request, .. } => {
            let waiter = pending.lock().ok().and_then(|mut p| p.remove(&request));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => tracing::debug!(request, "reply for unknown request"),
            }
        }
    }
}

#[async_trait]
impl DocumentStore for RemoteStore {
    async fn add(&self, collection: &str, fields: Value) -> Result<String> {
        let collection = collection.to_string();
        match self
            .call(|request| Request::Add {
                request,
                collection,
                fields,
            })
            .await?
        {
            Reply::Ack { id: Some(id), .. } => Ok(id),
            _ => Err(AppError::Store("relay did not return a document id".to_string())),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let (collection, id) = (collection.to_string(), id.to_string());
        match self
            .call(|request| Request::Get {
                request,
                collection,
                id,
            })
            .await?
        {
            Reply::Ack { document, .. } => Ok(document),
            _ => Err(AppError::Store("unexpected relay reply".to_string())),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.call(|request| Request::Delete {
            request,
            collection,
            id,
        })
        .await?;
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        // The listener is registered before the request goes out so the
        // initial replay is not lost.
        let (waiter, ack) = self.register(Some(tx))?;
        let request = waiter.request;
        self.outgoing
            .send(Request::Subscribe {
                request,
                collection: collection.to_string(),
            })
            .map_err(|_| connection_closed())?;
        match ack.await {
            Ok(Reply::Ack { .. }) => waiter.keep_listener(),
            Ok(Reply::Error { message, .. }) => return Err(AppError::Store(message)),
            _ => return Err(connection_closed()),
        }

        let outgoing = self.outgoing.clone();
        let listeners = self.listeners.clone();
        Ok(Subscription::with_release(rx, move || {
            if let Ok(mut listeners) = listeners.lock() {
                listeners.remove(&request);
            }
            let _ = outgoing.send(Request::Unsubscribe {
                subscription: request,
            });
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::room::resolve_room;
    use crate::store::ChangeKind;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Relay that accepts one client and runs `serve` on the socket.
    async fn relay<F, Fut>(serve: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            serve(ws).await;
        });
        format!("ws://{}", addr)
    }

    #[test]
    fn requests_are_tagged_by_op() {
        let json = serde_json::to_value(Request::Delete {
            request: 7,
            collection: "calls/r/presence".to_string(),
            id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(json["op"], "delete");
        assert_eq!(json["request"], 7);
    }

    #[test]
    fn change_reply_routes_to_subscription() {
        let pending: Pending = Arc::default();
        let listeners: Listeners = Arc::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        listeners.lock().unwrap().insert(3, tx);

        let reply: Reply = serde_json::from_str(
            r#"{"kind":"change","subscription":3,
                "change":{"type":"removed","document":{"id":"d1","created":9,"fields":{}}}}"#,
        )
        .unwrap();
        route_reply(reply, &pending, &listeners);

        let change = rx.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Removed);
        assert_eq!(change.document.id, "d1");
    }

    #[test]
    fn ack_wakes_waiter() {
        let pending: Pending = Arc::default();
        let listeners: Listeners = Arc::default();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(11, tx);

        route_reply(
            serde_json::from_str(r#"{"kind":"ack","request":11,"id":"new"}"#).unwrap(),
            &pending,
            &listeners,
        );
        match rx.try_recv().unwrap() {
            Reply::Ack { id, .. } => assert_eq!(id.as_deref(), Some("new")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_relay_fails_requests_instead_of_hanging() {
        let url = relay(|mut ws| async move {
            let _ = ws.close(None).await;
        })
        .await;
        let store = RemoteStore::connect(&url).await.unwrap();

        let config = StoreConfig {
            request_timeout_ms: 10_000,
            ..StoreConfig::default()
        };
        let lookup = tokio::time::timeout(
            Duration::from_secs(3),
            resolve_room(&store, &config, "abc"),
        )
        .await
        .expect("lookup should settle once the relay is gone");
        assert!(matches!(lookup, Err(AppError::RoomNotFound)));

        assert!(store.is_closed());
        assert!(store.get("calls", "abc").await.is_err());
        assert!(store.subscribe("calls").await.is_err());
        assert!(store.pending.lock().unwrap().is_empty());
        assert!(store.listeners.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_request_leaves_no_waiter() {
        let url = relay(|mut ws| async move {
            // Reads everything, answers nothing.
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
        let store = RemoteStore::connect(&url).await.unwrap();

        let get = tokio::time::timeout(Duration::from_millis(50), store.get("calls", "abc")).await;
        assert!(get.is_err());
        let sub = tokio::time::timeout(Duration::from_millis(50), store.subscribe("calls")).await;
        assert!(sub.is_err());

        assert!(!store.is_closed());
        assert!(store.pending.lock().unwrap().is_empty());
        assert!(store.listeners.lock().unwrap().is_empty());
    }
}
