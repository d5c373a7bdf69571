use tern_core::RegistryError;
use tern_core::config::ConfigError;
use tern_xmpp::{ConnectionError, OutboundError, StanzaError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("account {0} is not connected")]
    NotConnected(String),

    #[error("no password configured for account {0}")]
    MissingPassword(String),

    #[error("connection loop for account {0} has stopped")]
    LoopStopped(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Stanza(#[from] StanzaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<ClientError> for tern_core::TernError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Config(error) => tern_core::TernError::Config(error),
            ClientError::Registry(error) => tern_core::TernError::Registry(error),
            other => tern_core::TernError::Xmpp(other.to_string()),
        }
    }
}
