use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::config::PeerConfig;
use crate::error::{AppError, Result};

/// Messages exchanged with a PeerJS-compatible broker. The broker fills in
/// `src` when relaying; clients only set `dst`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum BrokerMessage {
    Open,
    IdTaken {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },
    Error {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },
    Heartbeat,
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: MediaPayload,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: MediaPayload,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: MediaPayload,
    },
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
    },
    Expire {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "type", default = "media_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<RTCIceCandidateInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn media_kind() -> String {
    "media".to_string()
}

impl MediaPayload {
    pub fn session(connection_id: &str, kind: &str, sdp: String) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            kind: media_kind(),
            sdp: Some(SessionPayload {
                kind: kind.to_string(),
                sdp,
            }),
            candidate: None,
            metadata: None,
        }
    }

    pub fn candidate(connection_id: &str, candidate: RTCIceCandidateInit) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            kind: media_kind(),
            sdp: None,
            candidate: Some(candidate),
            metadata: None,
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub(crate) fn broker_url(config: &PeerConfig, id: &str, token: &str) -> String {
    let base = config.broker_url.trim_end_matches('/');
    format!(
        "{}/peerjs?key={}&id={}&token={}",
        base, config.broker_key, id, token
    )
}

/// Open socket to the broker. Dropping it stops the heartbeat, which closes
/// the socket once the last sender is gone.
pub struct BrokerConnection {
    id: String,
    outgoing: mpsc::UnboundedSender<BrokerMessage>,
    heartbeat: JoinHandle<()>,
}

impl BrokerConnection {
    /// Connects with a freshly generated id and waits for `OPEN`.
    pub async fn connect(
        config: &PeerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BrokerMessage>)> {
        let id = random_token(16);
        let url = broker_url(config, &id, &random_token(12));
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<BrokerMessage>();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        let (incoming_tx, mut incoming) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<BrokerMessage>(&text) {
                    Ok(message) => {
                        if incoming_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "ignoring broker message"),
                }
            }
            tracing::info!("broker connection closed");
        });

        let opened = tokio::time::timeout(config.open_timeout(), async {
            while let Some(message) = incoming.recv().await {
                match message {
                    BrokerMessage::Open => return Ok(()),
                    BrokerMessage::IdTaken { payload } | BrokerMessage::Error { payload } => {
                        let msg = payload.map(|p| p.msg).unwrap_or_default();
                        return Err(AppError::Peer(format!("broker refused id: {}", msg)));
                    }
                    other => tracing::debug!(?other, "message before OPEN"),
                }
            }
            Err(AppError::Peer("broker closed before OPEN".to_string()))
        })
        .await
        .map_err(|_| AppError::Timeout("broker OPEN"))?;
        opened?;
        tracing::info!(peer = %id, "peer id registered with broker");

        let heartbeat_tx = outgoing.clone();
        let interval = config.heartbeat_interval().max(Duration::from_millis(100));
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(BrokerMessage::Heartbeat).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                id,
                outgoing,
                heartbeat,
            },
            incoming,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn outgoing_handle(&self) -> mpsc::UnboundedSender<BrokerMessage> {
        self.outgoing.clone()
    }

    pub fn send(&self, message: BrokerMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| AppError::Peer("broker connection closed".to_string()))
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relayed_offer() {
        let message: BrokerMessage = serde_json::from_str(
            r#"{"type":"OFFER","src":"abc","dst":"me",
                "payload":{"sdp":{"type":"offer","sdp":"v=0"},"type":"media",
                           "connectionId":"mc_1","browser":"firefox"}}"#,
        )
        .unwrap();
        match message {
            BrokerMessage::Offer { src, payload, .. } => {
                assert_eq!(src.as_deref(), Some("abc"));
                assert_eq!(payload.connection_id, "mc_1");
                assert_eq!(payload.sdp.unwrap().sdp, "v=0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn control_messages_use_peerjs_names() {
        assert_eq!(
            serde_json::to_value(BrokerMessage::Heartbeat).unwrap(),
            serde_json::json!({"type": "HEARTBEAT"})
        );
        let taken: BrokerMessage =
            serde_json::from_str(r#"{"type":"ID-TAKEN","payload":{"msg":"taken"}}"#).unwrap();
        assert!(matches!(taken, BrokerMessage::IdTaken { .. }));
    }

    #[test]
    fn outgoing_candidate_omits_src() {
        let json = serde_json::to_value(BrokerMessage::Candidate {
            src: None,
            dst: Some("peer".to_string()),
            payload: MediaPayload::candidate(
                "mc_9",
                RTCIceCandidateInit {
                    candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
                    ..Default::default()
                },
            ),
        })
        .unwrap();
        assert!(json.get("src").is_none());
        assert_eq!(json["payload"]["connectionId"], "mc_9");
        assert_eq!(json["payload"]["type"], "media");
    }

    #[test]
    fn url_has_single_separator() {
        let config = PeerConfig {
            broker_url: "ws://broker:9000/".to_string(),
            ..PeerConfig::default()
        };
        assert_eq!(
            broker_url(&config, "id1", "tok"),
            "ws://broker:9000/peerjs?key=peerjs&id=id1&token=tok"
        );
    }
}
