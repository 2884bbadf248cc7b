use thiserror::Error;

/// Failures that reject a `connect()` call.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("No bearer token available; refusing to open the realtime connection")]
    MissingCredential,

    #[error("A connection attempt is already in flight")]
    AlreadyConnecting,

    #[error("Server rejected the credential (HTTP {status})")]
    AuthRejected { status: u16 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection attempt was abandoned by disconnect()")]
    Aborted,
}

impl ConnectError {
    /// Whether the reconnect policy may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Transport(_))
    }
}

/// Errors raised by the socket layer beneath the connection manager.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint URL: {0}")]
    Url(String),

    #[error("Handshake failed with HTTP {status}")]
    Handshake { status: u16 },

    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors raised while talking to the QR login handshake service.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// 404 from the artifact endpoint: the code has not been generated yet.
    #[error("Resource not ready (404)")]
    NotFound,

    #[error("Handshake service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Could not decode handshake response: {0}")]
    Decode(String),

    #[error("Handshake service refused to start the login flow (status: {status})")]
    StartRejected { status: String },
}

impl HandshakeError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, HandshakeError::NotFound)
    }

    /// 5xx, connection and protocol level failures are worth another try;
    /// other 4xx responses and decode errors will not improve by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            HandshakeError::Status { status, .. } => *status >= 500,
            HandshakeError::Http(e) => e.status().map_or(true, |s| s.is_server_error()),
            HandshakeError::NotFound
            | HandshakeError::Decode(_)
            | HandshakeError::StartRejected { .. } => false,
        }
    }
}
