use std::time::Duration;

use tracing::{debug, info, instrument, warn};

pub use crate::transport::ConnectionConfig;
use crate::{
    error::ConnectionError,
    sasl::{build_mechanism, credentials, select_mechanism},
    stanza::Stanza,
    transport::XmppTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// Lifecycle of one account's stream over a transport.
///
/// Every `connect` is a single attempt. Retrying is left to the caller.
pub struct ConnectionManager<T>
where
    T: XmppTransport,
{
    state: ConnectionState,
    config: ConnectionConfig,
    transport: T,
}

impl<T> ConnectionManager<T>
where
    T: XmppTransport,
{
    pub fn new(config: ConnectionConfig, transport: T) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            transport,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[instrument(skip(self, password), fields(jid = %self.config.full_jid()))]
    pub async fn connect(&mut self, password: &str) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let timeout = Duration::from_secs(u64::from(self.config.timeout_seconds.max(1)));
        let opened = match tokio::time::timeout(timeout, self.transport.connect(&self.config)).await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        };
        if let Err(error) = opened {
            warn!(error = %error, "transport connect failed");
            self.state = ConnectionState::Disconnected;
            return Err(error);
        }

        self.state = ConnectionState::Authenticating;
        if let Err(error) = self.authenticate(password).await {
            warn!(error = %error, "authentication failed");
            if let Err(close_error) = self.transport.close().await {
                debug!(error = %close_error, "closing after failed authentication");
            }
            self.state = ConnectionState::Disconnected;
            return Err(error);
        }

        self.state = ConnectionState::Connected;
        info!("connected");
        Ok(())
    }

    async fn authenticate(&mut self, password: &str) -> Result<(), ConnectionError> {
        let offered = self.transport.mechanisms();
        let allow_plain = self.config.allow_plain || self.transport.is_secure();
        let selected = select_mechanism(&offered, allow_plain)
            .ok_or_else(|| ConnectionError::NoUsableMechanism(self.config.hostname.clone()))?;
        debug!(mechanism = %selected, "selected SASL mechanism");

        let mechanism = build_mechanism(selected, &credentials(&self.config.login, password))?;
        self.transport.authenticate(mechanism).await
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        self.transport.send(data).await
    }

    pub async fn send_stanza(&mut self, stanza: &Stanza) -> Result<(), ConnectionError> {
        let bytes = stanza
            .to_bytes()
            .map_err(|error| ConnectionError::StreamError(error.to_string()))?;
        self.send(&bytes).await
    }

    /// Next inbound frame. Pending forever while not connected, so it can sit
    /// in a `select!` next to other sources.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        if self.state != ConnectionState::Connected {
            return std::future::pending().await;
        }
        self.transport.recv().await
    }

    #[instrument(skip(self), fields(jid = %self.config.full_jid()))]
    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }
        self.state = ConnectionState::Disconnected;
        let result = self.transport.close().await;
        info!("disconnected");
        result
    }

    /// Record that the transport went away underneath us.
    pub fn mark_lost(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}
