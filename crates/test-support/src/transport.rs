//! An in-memory [`XmppTransport`] driven by the test.
//!
//! The transport half goes into the code under test; the [`ScriptHandle`]
//! stays with the test to feed inbound stanzas and inspect what was sent.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sasl::client::Mechanism;
use tern_xmpp::{ConnectionConfig, ConnectionError, Stanza, XmppTransport};
use tokio::sync::mpsc;
use tracing::debug;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ScriptState {
    connects: usize,
    authenticated_with: Option<String>,
    closed: bool,
}

pub struct ScriptedTransport {
    mechanisms: HashSet<String>,
    secure: bool,
    refuse_connect: Option<String>,
    reject_auth: Option<String>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<Mutex<ScriptState>>,
}

pub struct ScriptHandle {
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    /// A secure transport offering SCRAM-SHA-1 and PLAIN that accepts any
    /// credentials.
    pub fn new() -> (Self, ScriptHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ScriptState::default()));

        let transport = Self {
            mechanisms: ["SCRAM-SHA-1", "PLAIN"].into_iter().map(String::from).collect(),
            secure: true,
            refuse_connect: None,
            reject_auth: None,
            inbound: inbound_rx,
            outbound: outbound_tx,
            state: Arc::clone(&state),
        };
        let handle = ScriptHandle {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            state,
        };
        (transport, handle)
    }

    pub fn with_mechanisms(mut self, mechanisms: &[&str]) -> Self {
        self.mechanisms = mechanisms.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    /// Every `connect` fails with a transport error.
    pub fn refuse_connect(mut self, reason: impl Into<String>) -> Self {
        self.refuse_connect = Some(reason.into());
        self
    }

    /// Every SASL exchange fails with `condition`.
    pub fn reject_auth(mut self, condition: impl Into<String>) -> Self {
        self.reject_auth = Some(condition.into());
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl XmppTransport for ScriptedTransport {
    async fn connect(&mut self, config: &ConnectionConfig) -> Result<(), ConnectionError> {
        self.state().connects += 1;
        if let Some(reason) = &self.refuse_connect {
            return Err(ConnectionError::TransportError(reason.clone()));
        }
        debug!(jid = %config.full_jid(), "scripted transport connected");
        self.state().closed = false;
        Ok(())
    }

    fn mechanisms(&self) -> HashSet<String> {
        self.mechanisms.clone()
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    async fn authenticate(
        &mut self,
        mechanism: Box<dyn Mechanism + Send>,
    ) -> Result<(), ConnectionError> {
        self.state().authenticated_with = Some(mechanism.name().to_string());
        match &self.reject_auth {
            Some(condition) => Err(ConnectionError::AuthenticationFailed(condition.clone())),
            None => Ok(()),
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.outbound
            .send(data.to_vec())
            .map_err(|_| ConnectionError::TransportError("script handle dropped".to_string()))
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| ConnectionError::TransportError("stream closed by peer".to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.state().closed = true;
        Ok(())
    }
}

impl ScriptHandle {
    /// Queue raw XML as the next inbound frame.
    pub fn push(&self, xml: impl AsRef<str>) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(xml.as_ref().as_bytes().to_vec());
        }
    }

    /// Make the transport report the stream as gone.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Next stanza the code under test sent, or `None` after five seconds
    /// of silence.
    pub async fn next_sent(&mut self) -> Option<Stanza> {
        let bytes = tokio::time::timeout(SEND_TIMEOUT, self.outbound.recv())
            .await
            .ok()??;
        Some(parse_sent(&bytes))
    }

    /// Skip sent stanzas until one satisfies `predicate`.
    pub async fn sent_matching(&mut self, predicate: impl Fn(&Stanza) -> bool) -> Option<Stanza> {
        while let Some(stanza) = self.next_sent().await {
            if predicate(&stanza) {
                return Some(stanza);
            }
        }
        None
    }

    /// Everything sent so far, without waiting.
    pub fn drain_sent(&mut self) -> Vec<Stanza> {
        let mut sent = Vec::new();
        while let Ok(bytes) = self.outbound.try_recv() {
            sent.push(parse_sent(&bytes));
        }
        sent
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn authenticated_with(&self) -> Option<String> {
        self.state().authenticated_with.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_sent(bytes: &[u8]) -> Stanza {
    Stanza::parse(bytes).unwrap_or_else(|error| {
        panic!(
            "code under test sent an invalid stanza ({error}): {}",
            String::from_utf8_lossy(bytes)
        )
    })
}
