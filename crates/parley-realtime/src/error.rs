use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid socket url: {0}")]
    Url(String),

    #[error("malformed packet: {0}")]
    Protocol(String),

    /// The server refused the namespace connect, usually a bad token.
    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("no credential to connect with")]
    NoCredential,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed")]
    Closed,
}
