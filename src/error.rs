use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::media::MediaError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Username is required and must be btw 5 to 20 characters")]
    InvalidUsername,

    #[error("Either room id is incorrect or room doesn't exist")]
    RoomNotFound,

    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Cannot disconnect, the disconnect event was not published")]
    Disconnect,

    #[error("Room session has ended")]
    SessionClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
