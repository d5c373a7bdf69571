use thiserror::Error;

/// The universal error type for Tern.
#[derive(Error, Debug)]
pub enum TernError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("XMPP error: {0}")]
    Xmpp(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Tern operations.
pub type Result<T> = std::result::Result<T, TernError>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("account {0} is not registered")]
    UnknownAccount(String),

    #[error("account {0} is already registered")]
    DuplicateAccount(String),
}
