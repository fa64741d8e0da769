/// Everything that can go wrong talking to the server. None of these are
/// fatal to the sync core; the connection manager logs and retries.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("gateway rejected request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed")]
    Closed,

    #[error("sync loop has shut down")]
    Shutdown,
}
