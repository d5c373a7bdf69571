//! State of one connection, mutated only from its own loop.
//!
//! Handlers never touch the network, the event bus or the history. They
//! queue [`Effects`] which the loop flushes once the handler has returned,
//! and they push roster mutations and subscription acks onto a deferred
//! queue that runs on the next loop iteration.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use tern_core::config::{AccountConfig, ConfigStore, CoreConfig};
use tern_core::contact::{Show, bare_jid};
use tern_core::event::{EventPayload, IncomingMessage};
use tern_core::registry::ContactRegistry;
use tern_messaging::SessionStore;
use tern_presence::{PresenceAction, PresenceEngine, PresenceOutcome, PresenceSettings};
use tern_security::PgpRequest;
use tern_storage::LogKind;
use tern_xmpp::outbound::{self, SubscriptionAction};
use tern_xmpp::{OutboundError, PendingRequestTable, RequestId, RequestKind, Stanza};

/// Where a PGP result goes once the worker is done with it.
#[derive(Debug)]
pub(crate) enum PgpContext {
    Status { show: Show, message: String },
    Outgoing(OutgoingDraft),
    Incoming(IncomingDraft),
    Signature { jid: String, resource: String },
    SecretKeys,
}

/// A chat message waiting for its ciphertext.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingDraft {
    pub to: String,
    pub body: String,
    pub thread: Option<String>,
}

/// An inbound chat message waiting for its plaintext.
#[derive(Debug, Clone)]
pub(crate) struct IncomingDraft {
    pub from: String,
    pub message_id: Option<String>,
    pub message_type: String,
    pub subject: Option<String>,
    pub thread: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HistoryEntry {
    pub kind: LogKind,
    pub peer: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub outbox: Vec<Stanza>,
    pub events: Vec<EventPayload>,
    pub history: Vec<HistoryEntry>,
    pub security: Vec<(PgpContext, PgpRequest)>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty()
            && self.events.is_empty()
            && self.history.is_empty()
            && self.security.is_empty()
    }
}

/// Clock shared by request deadlines and subscription windows. Follows
/// tokio's clock so paused-time tests can drive it.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) struct ConnectionContext {
    pub account: String,
    pub settings: AccountConfig,
    pub core: CoreConfig,
    pub config: Arc<ConfigStore>,
    pub presence: PresenceEngine,
    pub sessions: SessionStore,
    /// Pending requests, each with the JID it was sent to.
    pub pending: PendingRequestTable<String>,
    /// Unanswered HTTP auth requests by confirmation id.
    pub http_auth: HashMap<String, Stanza>,
    pub rooms: HashSet<String>,
    pub connected: bool,
    pub show: Show,
    pub last_inbound: Option<Instant>,
    pub last_activity: Instant,
    /// A PGP backend exists; signing and decryption also need a key id.
    pub pgp_available: bool,
    deferred: VecDeque<PresenceAction>,
    effects: Effects,
    next_message_id: u64,
}

impl ConnectionContext {
    pub fn new(
        account: &str,
        settings: AccountConfig,
        core: CoreConfig,
        config: Arc<ConfigStore>,
        registry: Arc<ContactRegistry>,
        pgp_available: bool,
    ) -> Self {
        let presence = PresenceEngine::new(
            account,
            &settings.full_jid(),
            PresenceSettings::from_account(&settings),
            registry,
        );
        Self {
            account: account.to_string(),
            settings,
            core,
            config,
            presence,
            sessions: SessionStore::new(),
            pending: PendingRequestTable::new(account),
            http_auth: HashMap::new(),
            rooms: HashSet::new(),
            connected: false,
            show: Show::Offline,
            last_inbound: None,
            last_activity: now(),
            pgp_available,
            deferred: VecDeque::new(),
            effects: Effects::default(),
            next_message_id: 0,
        }
    }

    pub fn registry(&self) -> &Arc<ContactRegistry> {
        self.presence.registry()
    }

    pub fn own_bare_jid(&self) -> String {
        self.settings.bare_jid()
    }

    /// Key id to sign and decrypt with, when PGP can be used at all.
    pub fn signing_key(&self) -> Option<&str> {
        self.settings
            .keyid
            .as_deref()
            .filter(|key_id| self.pgp_available && !key_id.is_empty())
    }

    pub fn send(&mut self, stanza: Stanza) {
        self.effects.outbox.push(stanza);
    }

    pub fn emit(&mut self, payload: EventPayload) {
        self.effects.events.push(payload);
    }

    pub fn log(&mut self, kind: LogKind, peer: &str, text: impl Into<String>, timestamp: DateTime<Utc>) {
        self.effects.history.push(HistoryEntry {
            kind,
            peer: peer.to_string(),
            text: text.into(),
            timestamp,
        });
    }

    pub fn submit(&mut self, context: PgpContext, request: PgpRequest) {
        self.effects.security.push((context, request));
    }

    pub fn take_effects(&mut self) -> Effects {
        std::mem::take(&mut self.effects)
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn next_message_id(&mut self) -> String {
        self.next_message_id += 1;
        format!("{}-msg-{}", self.account, self.next_message_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.request_timeout_seconds.max(1))
    }

    /// Issue a correlated request to `target` and queue the stanza `build`
    /// makes for the new id.
    pub fn request(
        &mut self,
        kind: RequestKind,
        target: &str,
        build: impl FnOnce(&str) -> Result<Stanza, OutboundError>,
    ) -> Result<RequestId, OutboundError> {
        let timeout = self.request_timeout();
        let id = self
            .pending
            .issue_at(kind, target.to_string(), Some(timeout), now());
        match build(&id) {
            Ok(stanza) => {
                self.send(stanza);
                Ok(id)
            }
            Err(error) => {
                let _ = self.pending.resolve(&id);
                Err(error)
            }
        }
    }

    pub fn request_roster(&mut self) {
        let target = self.own_bare_jid();
        let _ = self.request(RequestKind::Roster, &target, |id| Ok(outbound::roster_get(id)));
    }

    pub fn request_own_vcard(&mut self) {
        let target = self.own_bare_jid();
        if let Err(error) = self.request(RequestKind::VCard, &target, |id| outbound::vcard_get(id, None)) {
            warn!(account = %self.account, error = %error, "cannot request own vCard");
        }
    }

    /// Put a contact on the roster and ask for its presence.
    pub fn request_subscription(
        &mut self,
        jid: &str,
        text: Option<&str>,
        name: Option<&str>,
        groups: &[String],
    ) -> Result<(), OutboundError> {
        self.request(RequestKind::RosterUpdate, jid, |id| {
            outbound::roster_set(id, jid, name, groups)
        })?;
        self.send(outbound::subscription(jid, SubscriptionAction::Subscribe, text)?);
        Ok(())
    }

    /// History is kept per bare JID, except for room occupants.
    pub fn history_peer(&self, jid: &str) -> String {
        if self.sessions.is_pm_peer(jid) {
            jid.to_string()
        } else {
            bare_jid(jid).to_string()
        }
    }

    pub fn apply_presence(&mut self, outcome: PresenceOutcome) {
        self.effects.events.extend(outcome.events);
        for action in outcome.actions {
            if action.is_deferred() {
                debug!(account = %self.account, ?action, "presence follow-up deferred");
                self.deferred.push_back(action);
            } else {
                self.run_action(action);
            }
        }
    }

    /// Run the follow-ups queued by earlier handlers.
    pub fn run_deferred(&mut self) {
        while let Some(action) = self.deferred.pop_front() {
            self.run_action(action);
        }
    }

    fn run_action(&mut self, action: PresenceAction) {
        let result = match action {
            PresenceAction::SendSubscribed { jid } => {
                outbound::subscription(&jid, SubscriptionAction::Subscribed, None)
                    .map(|stanza| self.send(stanza))
            }
            PresenceAction::RequestSubscription { jid } => {
                self.request_subscription(&jid, None, None, &[])
            }
            PresenceAction::AckSubscribed { jid } => {
                outbound::subscription(&jid, SubscriptionAction::Subscribe, None)
                    .map(|stanza| self.send(stanza))
            }
            PresenceAction::AckUnsubscribed { jid } => {
                outbound::subscription(&jid, SubscriptionAction::Unsubscribe, None)
                    .map(|stanza| self.send(stanza))
            }
            PresenceAction::EndSessions {
                full_jid,
                supports_negotiation,
                ..
            } => {
                for ended in self.sessions.end_for_unavailable(&full_jid, supports_negotiation) {
                    if let Some(notice) = ended.notice {
                        self.send(notice);
                    }
                }
                Ok(())
            }
            PresenceAction::PersistDontAck => {
                self.persist_dont_ack();
                Ok(())
            }
            PresenceAction::LogStatus { jid, show, status } => {
                let text = match status.filter(|status| !status.is_empty()) {
                    Some(status) => format!("{show}:{status}"),
                    None => show.to_string(),
                };
                self.log(LogKind::Status, &jid, text, Utc::now());
                Ok(())
            }
            PresenceAction::VerifySignature {
                jid,
                resource,
                status,
                signature,
            } => {
                if self.pgp_available {
                    self.submit(
                        PgpContext::Signature { jid, resource },
                        PgpRequest::Verify {
                            text: status,
                            signature,
                        },
                    );
                }
                Ok(())
            }
        };

        if let Err(error) = result {
            warn!(account = %self.account, error = %error, "presence follow-up failed");
        }
    }

    fn persist_dont_ack(&mut self) {
        self.settings.dont_ack_subscription = true;
        let section = format!("accounts.{}", self.account);
        let saved = self
            .config
            .set(&section, "dont_ack_subscription", true)
            .and_then(|()| self.config.save());
        match saved {
            Ok(()) => warn!(account = %self.account, "subscription loop detected, acks disabled"),
            Err(error) => {
                warn!(account = %self.account, error = %error, "cannot persist dont_ack_subscription")
            }
        }
    }

    /// Hand a message to its session and report it.
    pub fn deliver(&mut self, draft: IncomingDraft, body: String, encrypted: bool) {
        let session = self.sessions.receive(&draft.from, draft.thread.as_deref());
        if encrypted {
            if let Some(session) = self.sessions.get_mut(session) {
                session.enable_encryption = true;
            }
        }

        let peer = self.history_peer(&draft.from);
        self.log(LogKind::Recv, &peer, body.clone(), draft.timestamp);
        self.emit(EventPayload::Msg {
            message: IncomingMessage {
                jid: draft.from,
                message_id: draft.message_id,
                message_type: draft.message_type,
                body,
                subject: draft.subject,
                thread: draft.thread,
                session_id: session.0,
                encrypted,
                timestamp: draft.timestamp,
            },
        });
    }

    /// Forget everything tied to the stream. Pending requests are dropped
    /// without answers and sessions end without notices.
    pub fn teardown(&mut self) {
        let dropped = self.pending.clear();
        let ended = self.sessions.terminate_all(false).len();
        for room in std::mem::take(&mut self.rooms) {
            self.sessions.mark_room_left(&room);
        }
        let offline = self.presence.go_offline();
        self.effects.events.extend(offline);
        self.effects.outbox.clear();
        self.deferred.clear();
        self.http_auth.clear();
        self.connected = false;
        self.show = Show::Offline;
        self.emit(EventPayload::Status {
            show: Show::Offline,
            message: None,
        });
        debug!(account = %self.account, dropped, ended, "connection state torn down");
    }
}
