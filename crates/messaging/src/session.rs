use std::sync::{Arc, Weak};
use std::time::Instant;

use tern_core::contact::resource_part;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Chat,
    /// Private message with a room occupant, keyed by the occupant's full JID.
    Pm,
}

/// Whatever displays a session. The store only keeps a weak reference and
/// tells the control when its session goes away.
pub trait SessionControl: Send + Sync {
    fn session_terminated(&self, session: SessionId);
}

/// One conversation with a peer.
pub struct Session {
    id: SessionId,
    peer: String,
    thread_id: Option<String>,
    kind: SessionKind,
    received_thread_id: bool,
    last_send: Option<Instant>,
    control: Option<Weak<dyn SessionControl>>,
    pub enable_encryption: bool,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        peer: impl Into<String>,
        thread_id: Option<String>,
        kind: SessionKind,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            thread_id,
            kind,
            received_thread_id: false,
            last_send: None,
            control: None,
            enable_encryption: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// JID the session talks to, with the resource when one is known.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn resource(&self) -> Option<&str> {
        resource_part(&self.peer)
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.thread_id.is_none()
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Whether the peer has sent us this session's thread id.
    pub fn received_thread_id(&self) -> bool {
        self.received_thread_id
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn record_send(&mut self, at: Instant) {
        self.last_send = Some(at);
    }

    pub fn set_control(&mut self, control: &Arc<dyn SessionControl>) {
        self.control = Some(Arc::downgrade(control));
    }

    pub fn clear_control(&mut self) {
        self.control = None;
    }

    /// The attached control, if it is still alive.
    pub fn control(&self) -> Option<Arc<dyn SessionControl>> {
        self.control.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_control(&self) -> bool {
        self.control().is_some()
    }

    pub(crate) fn set_peer(&mut self, peer: &str) {
        if self.peer != peer {
            self.peer = peer.to_string();
        }
    }

    pub(crate) fn bind_thread(&mut self, thread: String) {
        self.thread_id = Some(thread);
    }

    pub(crate) fn mark_thread_received(&mut self) {
        self.received_thread_id = true;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("thread_id", &self.thread_id)
            .field("kind", &self.kind)
            .field("received_thread_id", &self.received_thread_id)
            .field("enable_encryption", &self.enable_encryption)
            .field("has_control", &self.has_control())
            .finish()
    }
}
