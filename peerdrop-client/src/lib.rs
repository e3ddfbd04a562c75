pub mod channel;
pub mod config;
pub mod files;
pub mod runtime;
pub mod signal_client;

use peerdrop_core::CoreError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("config error: {0}")]
    Config(String),
    #[error("{remote} declined the call")]
    Rejected { remote: String },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        ClientError::WebSocket(Box::new(err))
    }
}
