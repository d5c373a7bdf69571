use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
#[cfg(feature = "native")]
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
#[cfg(feature = "native")]
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::contact::{Show, Subscription};
use crate::error::EventBusError;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(name.split('.').next(), Some("system" | "xmpp" | "ui"))
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The envelope every outward event travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "xmpp.presence.notify")
    pub channel: Channel,

    pub timestamp: DateTime<Utc>,

    pub id: Uuid,

    /// Links a response event to the event or request that caused it.
    pub correlation_id: Option<Uuid>,

    pub source: EventSource,

    /// Account the event belongs to, `None` for process-wide events.
    pub account: Option<String>,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            account: None,
            payload,
        }
    }

    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }

    /// Build an XMPP-sourced event for `account` on the payload's own channel.
    pub fn for_account(
        account: impl Into<String>,
        payload: EventPayload,
    ) -> std::result::Result<Self, EventBusError> {
        let channel = Channel::new(payload.channel_name())?;
        Ok(Self {
            account: Some(account.into()),
            ..Self::new(channel, EventSource::Xmpp, payload)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    System(String),
    Xmpp,
    Ui,
}

/// The closed set of events the core publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    Status {
        show: Show,
        message: Option<String>,
    },
    Error {
        message: String,
    },
    AuthFailed {
        server: String,
        message: String,
    },
    Roster {
        connected: bool,
        items: Vec<RosterEntry>,
    },
    RosterInfo {
        entry: RosterEntry,
    },
    Notify {
        notice: PresenceNotice,
    },
    ContactStatus {
        jid: String,
        show: Show,
        status: Option<String>,
    },
    SignatureVerified {
        jid: String,
        resource: String,
        key_id: Option<String>,
    },
    Subscribe {
        jid: String,
        status: String,
    },
    Subscribed {
        jid: String,
        resource: Option<String>,
    },
    Unsubscribed {
        jid: String,
    },
    Msg {
        message: IncomingMessage,
    },
    MsgError {
        jid: String,
        code: Option<String>,
        text: String,
        body: Option<String>,
        timestamp: DateTime<Utc>,
    },
    MsgSent {
        jid: String,
        body: String,
        encrypted: bool,
    },
    Receipt {
        jid: String,
        message_id: String,
    },
    DecryptionFailed {
        jid: String,
        message_id: Option<String>,
    },
    GcMsg {
        jid: String,
        body: String,
        timestamp: DateTime<Utc>,
    },
    GcSubject {
        room: String,
        subject: String,
    },
    GcNotify {
        presence: GroupchatPresence,
    },
    NickConflict {
        room: String,
        message: String,
    },
    Vcard {
        jid: String,
        fields: serde_json::Value,
    },
    BadPassphrase,
    GpgSecretKeys {
        keys: BTreeMap<String, String>,
    },
    DbError {
        title: String,
        message: String,
    },
    LogNbLine {
        jid: String,
        count: u64,
    },
    LogLine {
        jid: String,
        line_number: u64,
        kind: String,
        timestamp: DateTime<Utc>,
        text: String,
    },
    RequestTimeout {
        request_id: String,
        message: String,
    },
    IqError {
        jid: String,
        request: String,
        condition: String,
        text: Option<String>,
    },
    AgentRemoved {
        agent: String,
    },
    RegAgentInfo {
        agent: String,
        instructions: Option<String>,
        fields: BTreeMap<String, String>,
    },
    DiscoItems {
        jid: String,
        node: Option<String>,
        items: Vec<DiscoItem>,
    },
    DiscoInfo {
        jid: String,
        identities: Vec<DiscoIdentity>,
        features: Vec<String>,
    },
    OsInfo {
        jid: String,
        name: Option<String>,
        version: Option<String>,
        os: Option<String>,
    },
    LastStatusTime {
        jid: String,
        seconds: u64,
        status: Option<String>,
    },
    EntityTime {
        jid: String,
        utc: String,
        tzo: String,
    },
    Pong {
        jid: String,
    },
    HttpAuth {
        jid: String,
        id: String,
        method: String,
        url: String,
    },
}

impl EventPayload {
    /// The stable upper-case name consumers key on.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "STATUS",
            Self::Error { .. } => "ERROR",
            Self::AuthFailed { .. } => "AUTH_FAILED",
            Self::Roster { .. } => "ROSTER",
            Self::RosterInfo { .. } => "ROSTER_INFO",
            Self::Notify { .. } => "NOTIFY",
            Self::ContactStatus { .. } => "CONTACT_STATUS",
            Self::SignatureVerified { .. } => "SIGNATURE_VERIFIED",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::Subscribed { .. } => "SUBSCRIBED",
            Self::Unsubscribed { .. } => "UNSUBSCRIBED",
            Self::Msg { .. } => "MSG",
            Self::MsgError { .. } => "MSGERROR",
            Self::MsgSent { .. } => "MSGSENT",
            Self::Receipt { .. } => "RECEIPT",
            Self::DecryptionFailed { .. } => "DECRYPTION_FAILED",
            Self::GcMsg { .. } => "GC_MSG",
            Self::GcSubject { .. } => "GC_SUBJECT",
            Self::GcNotify { .. } => "GC_NOTIFY",
            Self::NickConflict { .. } => "NICK_CONFLICT",
            Self::Vcard { .. } => "VCARD",
            Self::BadPassphrase => "BAD_PASSPHRASE",
            Self::GpgSecretKeys { .. } => "GPG_SECRET_KEYS",
            Self::DbError { .. } => "DB_ERROR",
            Self::LogNbLine { .. } => "LOG_NB_LINE",
            Self::LogLine { .. } => "LOG_LINE",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::IqError { .. } => "IQ_ERROR",
            Self::AgentRemoved { .. } => "AGENT_REMOVED",
            Self::RegAgentInfo { .. } => "REG_AGENT_INFO",
            Self::DiscoItems { .. } => "DISCO_ITEMS",
            Self::DiscoInfo { .. } => "DISCO_INFO",
            Self::OsInfo { .. } => "OS_INFO",
            Self::LastStatusTime { .. } => "LAST_STATUS_TIME",
            Self::EntityTime { .. } => "ENTITY_TIME",
            Self::Pong { .. } => "PONG",
            Self::HttpAuth { .. } => "HTTP_AUTH",
        }
    }

    pub fn channel_name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "system.connection.status",
            Self::Error { .. } => "system.connection.error",
            Self::AuthFailed { .. } => "system.connection.authfailed",
            Self::Roster { .. } => "xmpp.roster.snapshot",
            Self::RosterInfo { .. } => "xmpp.roster.info",
            Self::Notify { .. } => "xmpp.presence.notify",
            Self::ContactStatus { .. } => "xmpp.presence.changed",
            Self::SignatureVerified { .. } => "xmpp.presence.verified",
            Self::Subscribe { .. } => "xmpp.subscription.request",
            Self::Subscribed { .. } => "xmpp.subscription.subscribed",
            Self::Unsubscribed { .. } => "xmpp.subscription.unsubscribed",
            Self::Msg { .. } => "xmpp.message.received",
            Self::MsgError { .. } => "xmpp.message.error",
            Self::MsgSent { .. } => "xmpp.message.sent",
            Self::Receipt { .. } => "xmpp.message.receipt",
            Self::DecryptionFailed { .. } => "xmpp.message.decryptionfailed",
            Self::GcMsg { .. } => "xmpp.muc.message",
            Self::GcSubject { .. } => "xmpp.muc.subject",
            Self::GcNotify { .. } => "xmpp.muc.presence",
            Self::NickConflict { .. } => "xmpp.muc.nickconflict",
            Self::Vcard { .. } => "xmpp.vcard.received",
            Self::BadPassphrase => "system.security.badpassphrase",
            Self::GpgSecretKeys { .. } => "system.security.secretkeys",
            Self::DbError { .. } => "system.storage.error",
            Self::LogNbLine { .. } => "system.log.count",
            Self::LogLine { .. } => "system.log.line",
            Self::RequestTimeout { .. } => "xmpp.iq.timeout",
            Self::IqError { .. } => "xmpp.iq.error",
            Self::AgentRemoved { .. } => "xmpp.agent.removed",
            Self::RegAgentInfo { .. } => "xmpp.agent.info",
            Self::DiscoItems { .. } => "xmpp.disco.items",
            Self::DiscoInfo { .. } => "xmpp.disco.info",
            Self::OsInfo { .. } => "xmpp.entity.version",
            Self::LastStatusTime { .. } => "xmpp.entity.last",
            Self::EntityTime { .. } => "xmpp.entity.time",
            Self::Pong { .. } => "xmpp.entity.pong",
            Self::HttpAuth { .. } => "xmpp.httpauth.request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub jid: String,
    pub name: Option<String>,
    /// `None` when the item was removed from the roster.
    pub subscription: Option<Subscription>,
    pub ask: Option<String>,
    pub groups: Vec<String>,
}

/// Per-resource presence change of a contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub jid: String,
    pub resource: Option<String>,
    pub show: Show,
    pub status: Option<String>,
    pub priority: i8,
    pub key_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupchatPresence {
    pub room: String,
    pub nick: String,
    pub show: Show,
    pub status: Option<String>,
    pub role: Option<String>,
    pub affiliation: Option<String>,
    pub jid: Option<String>,
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub status_codes: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Full JID of the sender.
    pub jid: String,
    pub message_id: Option<String>,
    pub message_type: String,
    pub body: String,
    pub subject: Option<String>,
    pub thread: Option<String>,
    pub session_id: u64,
    pub encrypted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoItem {
    pub jid: String,
    pub node: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoIdentity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

#[cfg(feature = "native")]
pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError>;
}

#[cfg(feature = "native")]
#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    xmpp_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
}

#[cfg(feature = "native")]
impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (xmpp_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            xmpp_sender,
            ui_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "xmpp" => Some(&self.xmpp_sender),
            "ui" => Some(&self.ui_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        let all = has_glob_meta(first_segment);
        let wants = |domain: &str| all || first_segment == domain;

        if !all && self.sender_for_domain(first_segment).is_none() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        Ok(DomainReceivers {
            system: wants("system").then(|| self.system_sender.subscribe()),
            xmpp: wants("xmpp").then(|| self.xmpp_sender.subscribe()),
            ui: wants("ui").then(|| self.ui_sender.subscribe()),
        })
    }
}

#[cfg(feature = "native")]
impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(feature = "native")]
impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[cfg(feature = "native")]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    xmpp: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
}

#[cfg(feature = "native")]
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

#[cfg(feature = "native")]
impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, EventBusError> {
        loop {
            let received = tokio::select! {
                result = recv_from_domain(self.receivers.system.as_mut()) => result,
                result = recv_from_domain(self.receivers.xmpp.as_mut()) => result,
                result = recv_from_domain(self.receivers.ui.as_mut()) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }

    /// Non-blocking variant used by drain loops and tests.
    pub fn try_recv(&mut self) -> Option<Event> {
        for receiver in [
            self.receivers.system.as_mut(),
            self.receivers.xmpp.as_mut(),
            self.receivers.ui.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            while let Ok(event) = receiver.try_recv() {
                if self.matcher.is_match(event.channel.as_str()) {
                    return Some(event);
                }
            }
        }
        None
    }
}

#[cfg(feature = "native")]
async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(feature = "native")]
fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}


#[cfg(all(test, feature = "native"))]
mod event_bus_tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_event(payload: EventPayload) -> Event {
        Event::for_account("work", payload).unwrap()
    }

    #[tokio::test]
    async fn publish_to_xmpp_routes_to_xmpp_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("xmpp.**").unwrap();

        bus.publish(make_event(EventPayload::Unsubscribed {
            jid: "bob@example.com".into(),
        }))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "xmpp.subscription.unsubscribed");
    }

    #[tokio::test]
    async fn xmpp_event_not_received_by_system_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();

        bus.publish(make_event(EventPayload::Pong {
            jid: "example.com".into(),
        }))
        .unwrap();

        let result = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "system subscriber should not see xmpp events");
    }

    #[tokio::test]
    async fn publish_succeeds_with_no_subscribers() {
        let bus = BroadcastEventBus::default();
        assert!(bus.publish(make_event(EventPayload::BadPassphrase)).is_ok());
    }

    #[tokio::test]
    async fn wildcard_domain_receives_every_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("*.**").unwrap();

        bus.publish(make_event(EventPayload::BadPassphrase)).unwrap();
        bus.publish(make_event(EventPayload::Pong {
            jid: "example.com".into(),
        }))
        .unwrap();

        let mut channels = Vec::new();
        for _ in 0..2 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            channels.push(event.channel.to_string());
        }
        channels.sort();
        assert_eq!(
            channels,
            vec!["system.security.badpassphrase", "xmpp.entity.pong"]
        );
    }

    #[tokio::test]
    async fn glob_filters_non_matching_channels_within_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("xmpp.roster.*").unwrap();

        bus.publish(make_event(EventPayload::Pong {
            jid: "example.com".into(),
        }))
        .unwrap();
        bus.publish(make_event(EventPayload::Roster {
            connected: true,
            items: vec![],
        }))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "xmpp.roster.snapshot");
    }

    #[tokio::test]
    async fn try_recv_drains_without_blocking() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("xmpp.**").unwrap();
        assert!(sub.try_recv().is_none());

        bus.publish(make_event(EventPayload::Pong {
            jid: "example.com".into(),
        }))
        .unwrap();
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn subscribe_rejects_unknown_domain() {
        let bus = BroadcastEventBus::default();
        assert!(matches!(
            bus.subscribe("plugin.**"),
            Err(EventBusError::InvalidPattern(_))
        ));
    }
}
