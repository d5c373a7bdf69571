use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("no usable SASL mechanism offered by {0}")]
    NoUsableMechanism(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("connection timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("not connected")]
    NotConnected,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::AuthenticationFailed(_) | ConnectionError::NoUsableMechanism(_)
        )
    }

    /// Authentication problems are reported apart from transport failures.
    pub fn is_auth_failure(&self) -> bool {
        !self.is_retryable()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StanzaError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("stanza serialization failed: {0}")]
    SerializeFailed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("handler {slot} failed: {message}")]
    HandlerFailed { slot: usize, message: String },

    #[error("handler {slot} panicked: {message}")]
    HandlerPanicked { slot: usize, message: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboundError {
    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl From<ConnectionError> for tern_core::TernError {
    fn from(error: ConnectionError) -> Self {
        tern_core::TernError::Xmpp(error.to_string())
    }
}
