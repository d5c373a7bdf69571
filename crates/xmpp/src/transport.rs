use std::collections::HashSet;
use std::future::Future;

use sasl::client::Mechanism;
use tern_core::config::{AccountConfig, ProxyConfig};

use crate::error::ConnectionError;

/// Where and how to reach the server for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub login: String,
    pub hostname: String,
    pub resource: String,
    pub port: u16,
    pub proxy: Option<ProxyConfig>,
    pub use_tls: bool,
    /// Permit PLAIN over a stream that is not encrypted.
    pub allow_plain: bool,
    pub timeout_seconds: u32,
}

impl ConnectionConfig {
    pub fn from_account(account: &AccountConfig) -> Self {
        Self {
            login: account.login.clone(),
            hostname: account.hostname.clone(),
            resource: account.resource.clone(),
            port: account.port,
            proxy: account.proxy.clone(),
            use_tls: account.use_tls,
            allow_plain: account.allow_plain,
            timeout_seconds: account.connect_timeout_seconds,
        }
    }

    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.login, self.hostname)
    }

    pub fn full_jid(&self) -> String {
        format!("{}@{}/{}", self.login, self.hostname, self.resource)
    }

    /// The host and port the socket is opened to, which is the proxy when
    /// one is configured.
    pub fn socket_target(&self) -> (&str, u16) {
        match &self.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (self.hostname.as_str(), self.port),
        }
    }
}

/// The socket, TLS and XML framing layer under a connection.
///
/// Implementations hand over whole top-level stanzas as bytes. `recv` must be
/// cancel-safe: the connection loop polls it inside `select!`.
pub trait XmppTransport: Send + 'static {
    /// Open the stream and read the server's features.
    fn connect(
        &mut self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// SASL mechanisms advertised in the stream features.
    fn mechanisms(&self) -> HashSet<String>;

    /// Whether the stream is protected by TLS.
    fn is_secure(&self) -> bool;

    /// Run the SASL exchange with `mechanism`, then restart the stream and
    /// bind the resource.
    fn authenticate(
        &mut self,
        mechanism: Box<dyn Mechanism + Send>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}
