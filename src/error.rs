use thiserror::Error;

#[derive(Debug, Error)]
pub enum NdtError {
    #[error("no usable transport: {0}")]
    UnsupportedTransport(String),
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("server terminated test with SRV_QUEUE 9977")]
    ServerAbort,
    #[error("message body of {0} bytes does not fit the 16-bit length field")]
    MessageTooLarge(usize),
    #[error("locate failed: {0}")]
    LocateFailed(#[from] reqwest::Error),
    #[error("no servers available")]
    NoTargets,
    #[error("serialize/deserialize error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("timeout occured")]
    Timeout,
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("bad server URL: {0}")]
    ServiceUnsupported(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl NdtError {
    /// True for failures of the underlying channel rather than of the protocol.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            NdtError::ConnectionFailure(_) | NdtError::WebSocket(_) | NdtError::IoError(_)
        )
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        NdtError::ProtocolViolation(msg.into())
    }
}

// reducing size of NdtError by putting large element in the Box
impl From<tokio_tungstenite::tungstenite::Error> for NdtError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        NdtError::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, NdtError>;
