//! Everything a front end can ask of a connection.

use tern_core::contact::Show;

/// Commands accepted by a connection loop, handled in the order they were
/// sent. Unless noted, a command is dropped while the account is offline.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Go online, change availability or go offline. Works in any state.
    SetStatus {
        show: Show,
        message: Option<String>,
    },
    SendMessage {
        to: String,
        body: String,
        /// Encrypt to this key when set.
        key_id: Option<String>,
        thread: Option<String>,
    },

    /// `text` defaults to [`tern_presence::DEFAULT_SUBSCRIBE_TEXT`].
    RequestSubscription {
        jid: String,
        text: Option<String>,
    },
    Authorize(String),
    Deny(String),
    /// Drop a contact, revoking and removing as `[core]` says.
    Unsubscribe(String),

    UpdateRosterItem {
        jid: String,
        name: Option<String>,
        groups: Vec<String>,
    },
    RemoveAgent(String),
    RequestAgentInfo(String),
    /// Raw presence of `presence_type` to a transport.
    AgentLogging {
        agent: String,
        presence_type: String,
    },

    RequestVCard(String),
    PublishVCard(serde_json::Value),

    RequestDiscoItems {
        jid: String,
        node: Option<String>,
    },
    RequestDiscoInfo {
        jid: String,
        node: Option<String>,
    },
    RequestVersion(String),
    RequestLastActivity(String),
    RequestTime(String),
    Ping(String),

    JoinRoom {
        nick: String,
        room: String,
        server: String,
        password: Option<String>,
    },
    LeaveRoom {
        room: String,
        nick: String,
        status: Option<String>,
    },
    SendGroupchat {
        room: String,
        body: String,
    },
    SetSubject {
        room: String,
        subject: String,
    },
    SetRoomStatus {
        room: String,
        nick: String,
        show: Show,
        status: Option<String>,
    },
    SetRole {
        room: String,
        nick: String,
        role: String,
    },
    SetAffiliation {
        room: String,
        jid: String,
        affiliation: String,
    },

    ChangePassword(String),

    /// Works in any state.
    SetPassphrase(Option<String>),
    /// Works in any state.
    ListSecretKeys,

    /// Publish the roster as currently known. Works in any state.
    AskRoster,
    /// Works in any state.
    LogLineCount(String),
    /// Lines `start..end` of a peer's history. Works in any state.
    LogRange {
        jid: String,
        start: u64,
        end: u64,
    },

    /// Answer an HTTP auth request previously announced by `HTTP_AUTH`.
    AnswerHttpAuth {
        id: String,
        accept: bool,
    },
}

impl Command {
    /// Whether the command makes sense without a live stream.
    pub fn is_state_independent(&self) -> bool {
        matches!(
            self,
            Command::SetStatus { .. }
                | Command::SetPassphrase(_)
                | Command::ListSecretKeys
                | Command::AskRoster
                | Command::LogLineCount(_)
                | Command::LogRange { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SetStatus { .. } => "set-status",
            Command::SendMessage { .. } => "send-message",
            Command::RequestSubscription { .. } => "request-subscription",
            Command::Authorize(_) => "authorize",
            Command::Deny(_) => "deny",
            Command::Unsubscribe(_) => "unsubscribe",
            Command::UpdateRosterItem { .. } => "update-roster-item",
            Command::RemoveAgent(_) => "remove-agent",
            Command::RequestAgentInfo(_) => "request-agent-info",
            Command::AgentLogging { .. } => "agent-logging",
            Command::RequestVCard(_) => "request-vcard",
            Command::PublishVCard(_) => "publish-vcard",
            Command::RequestDiscoItems { .. } => "request-disco-items",
            Command::RequestDiscoInfo { .. } => "request-disco-info",
            Command::RequestVersion(_) => "request-version",
            Command::RequestLastActivity(_) => "request-last-activity",
            Command::RequestTime(_) => "request-time",
            Command::Ping(_) => "ping",
            Command::JoinRoom { .. } => "join-room",
            Command::LeaveRoom { .. } => "leave-room",
            Command::SendGroupchat { .. } => "send-groupchat",
            Command::SetSubject { .. } => "set-subject",
            Command::SetRoomStatus { .. } => "set-room-status",
            Command::SetRole { .. } => "set-role",
            Command::SetAffiliation { .. } => "set-affiliation",
            Command::ChangePassword(_) => "change-password",
            Command::SetPassphrase(_) => "set-passphrase",
            Command::ListSecretKeys => "list-secret-keys",
            Command::AskRoster => "ask-roster",
            Command::LogLineCount(_) => "log-line-count",
            Command::LogRange { .. } => "log-range",
            Command::AnswerHttpAuth { .. } => "answer-http-auth",
        }
    }
}
