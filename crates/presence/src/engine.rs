use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use tern_core::config::AccountConfig;
use tern_core::contact::{
    Contact, ResourcePresence, Show, Subscription, bare_jid, is_transport_jid, resource_part,
};
use tern_core::event::{EventPayload, GroupchatPresence, PresenceNotice, RosterEntry};
use tern_core::registry::ContactRegistry;
use tern_xmpp::{Stanza, ns, payload};

use crate::PresenceError;
use crate::subscription::{SubscriptionEventLog, SubscriptionKind};

pub const DEFAULT_SUBSCRIBE_TEXT: &str = "I would like to add you to my roster.";

const NICK_CONFLICT_TEXT: &str = "Nickname already in use";

/// Per-account switches that decide how subscription requests are answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSettings {
    pub autoauth: bool,
    pub dont_ack_subscription: bool,
    pub jids_for_auto_auth: Vec<String>,
}

impl PresenceSettings {
    pub fn from_account(account: &AccountConfig) -> Self {
        Self {
            autoauth: account.autoauth,
            dont_ack_subscription: account.dont_ack_subscription,
            jids_for_auto_auth: account.jids_for_auto_auth.clone(),
        }
    }
}

/// Work the connection has to carry out on the engine's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAction {
    /// Reply `subscribed` to `jid` right away.
    SendSubscribed { jid: String },
    /// Ask `jid` for a subscription and add it to the roster.
    RequestSubscription { jid: String },
    /// Acknowledge a `subscribed` from `jid`.
    AckSubscribed { jid: String },
    /// Acknowledge an `unsubscribed` from `jid`.
    AckUnsubscribed { jid: String },
    /// `full_jid` went away. Encrypted sessions with it end, and so do
    /// threadless sessions when the peer negotiates sessions.
    EndSessions {
        full_jid: String,
        bare: String,
        supports_negotiation: bool,
    },
    /// Store `dont_ack_subscription = true` for the account.
    PersistDontAck,
    LogStatus {
        jid: String,
        show: Show,
        status: Option<String>,
    },
    /// Check the signature of a signed status in the background.
    VerifySignature {
        jid: String,
        resource: String,
        status: String,
        signature: String,
    },
}

impl PresenceAction {
    /// Roster mutations and acks run on the next loop iteration, never from
    /// inside the presence handler.
    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            Self::RequestSubscription { .. } | Self::AckSubscribed { .. } | Self::AckUnsubscribed { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceOutcome {
    pub events: Vec<EventPayload>,
    pub actions: Vec<PresenceAction>,
}

impl PresenceOutcome {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.actions.is_empty()
    }
}

/// Presence and subscription state machine for one account.
///
/// The engine is the only writer of presence-derived contact fields in the
/// shared [`ContactRegistry`]. It never touches the network: everything it
/// wants done comes back as [`PresenceAction`]s and everything it wants
/// reported as [`EventPayload`]s.
pub struct PresenceEngine {
    account: String,
    own_bare: String,
    own_resource: String,
    registry: Arc<ContactRegistry>,
    settings: PresenceSettings,
    automatically_added: HashSet<String>,
    subscription_log: SubscriptionEventLog,
    rooms: HashSet<String>,
}

impl PresenceEngine {
    pub fn new(
        account: impl Into<String>,
        own_jid: &str,
        settings: PresenceSettings,
        registry: Arc<ContactRegistry>,
    ) -> Self {
        Self {
            account: account.into(),
            own_bare: bare_jid(own_jid).to_string(),
            own_resource: resource_part(own_jid).unwrap_or_default().to_string(),
            registry,
            settings,
            automatically_added: HashSet::new(),
            subscription_log: SubscriptionEventLog::new(),
            rooms: HashSet::new(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ContactRegistry> {
        &self.registry
    }

    pub fn mark_room_joined(&mut self, room: &str) {
        self.rooms.insert(bare_jid(room).to_string());
    }

    pub fn mark_room_left(&mut self, room: &str) {
        self.rooms.remove(bare_jid(room));
    }

    pub fn is_room(&self, jid: &str) -> bool {
        self.rooms.contains(bare_jid(jid))
    }

    pub fn handle_presence(
        &mut self,
        stanza: &Stanza,
        now: Instant,
    ) -> Result<PresenceOutcome, PresenceError> {
        let from = stanza.from().ok_or(PresenceError::MissingSender)?;
        let bare = bare_jid(from).to_string();
        let presence_type = stanza.stanza_type();

        if presence_type != "error"
            && (self.rooms.contains(&bare) || stanza.child("x", ns::MUC_USER).is_some())
        {
            return Ok(groupchat_presence(stanza, &bare, from));
        }

        match presence_type {
            "available" | "unavailable" => self.availability(stanza, from, &bare),
            "error" => self.error_presence(stanza, from, &bare),
            "subscribe" => Ok(self.subscribe(stanza, bare)),
            "subscribed" => Ok(self.subscribed(bare, resource_part(from), now)),
            "unsubscribed" => Ok(self.unsubscribed(bare, now)),
            other => {
                debug!(account = %self.account, jid = %from, presence_type = other, "presence ignored");
                Ok(PresenceOutcome::default())
            }
        }
    }

    fn availability(
        &mut self,
        stanza: &Stanza,
        from: &str,
        bare: &str,
    ) -> Result<PresenceOutcome, PresenceError> {
        let resource = resource_part(from).unwrap_or_default();
        let show = show_of(stanza);

        if bare == self.own_bare {
            if resource == self.own_resource {
                return Ok(PresenceOutcome::default());
            }
            let known = self
                .registry
                .contact(&self.account, bare)
                .is_some_and(|contact| contact.resource(resource).is_some());
            if show.is_unavailable() && !known {
                return Ok(PresenceOutcome::default());
            }
        }

        let notice = PresenceNotice {
            jid: bare.to_string(),
            resource: (!resource.is_empty()).then(|| resource.to_string()),
            show,
            status: stanza.status().filter(|status| !status.is_empty()),
            priority: stanza.priority(),
            key_id: None,
            timestamp: payload::delay_timestamp(stanza).unwrap_or_else(Utc::now),
        };
        let mut outcome = self.apply_resource(from, notice, payload::caps_hash(stanza), false)?;

        if !show.is_unavailable() {
            if let Some(signed) = stanza.child("x", ns::SIGNED) {
                outcome.actions.push(PresenceAction::VerifySignature {
                    jid: bare.to_string(),
                    resource: resource.to_string(),
                    status: stanza.status().unwrap_or_default(),
                    signature: signed.text(),
                });
            }
        }
        Ok(outcome)
    }

    fn error_presence(
        &mut self,
        stanza: &Stanza,
        from: &str,
        bare: &str,
    ) -> Result<PresenceOutcome, PresenceError> {
        let details = stanza.error().unwrap_or_default();
        let code = details
            .code
            .as_deref()
            .and_then(|code| code.trim().parse::<u16>().ok())
            .or_else(|| details.condition.as_deref().and_then(condition_code));

        match code {
            Some(400 | 401 | 403 | 404 | 405 | 407) => {
                debug!(account = %self.account, jid = %from, ?code, "error presence ignored");
                Ok(PresenceOutcome::default())
            }
            Some(409) => Ok(PresenceOutcome {
                events: vec![EventPayload::NickConflict {
                    room: bare.to_string(),
                    message: details.text.unwrap_or_else(|| NICK_CONFLICT_TEXT.to_string()),
                }],
                actions: Vec::new(),
            }),
            _ => {
                let notice = PresenceNotice {
                    jid: bare.to_string(),
                    resource: resource_part(from).map(str::to_string),
                    show: Show::Error,
                    status: details.text.or(details.condition),
                    priority: 0,
                    key_id: None,
                    timestamp: Utc::now(),
                };
                self.apply_resource(from, notice, None, true)
            }
        }
    }

    /// Write one resource change into the registry and report it.
    fn apply_resource(
        &self,
        from: &str,
        notice: PresenceNotice,
        caps_hash: Option<String>,
        always_notify: bool,
    ) -> Result<PresenceOutcome, PresenceError> {
        let mut outcome = PresenceOutcome::default();
        let bare = notice.jid.clone();
        let resource = notice.resource.clone().unwrap_or_default();
        let is_self = bare == self.own_bare;

        if notice.show.is_unavailable() {
            // Caps live on the resource entry that is about to go.
            let supports_negotiation =
                self.registry
                    .contact_supports(&self.account, &bare, ns::SESSION_NEGOTIATION);
            outcome.actions.push(PresenceAction::EndSessions {
                full_jid: from.to_string(),
                bare: bare.clone(),
                supports_negotiation,
            });
        }

        let entry = ResourcePresence {
            resource: resource.clone(),
            show: notice.show,
            status: notice.status.clone(),
            priority: notice.priority,
            caps_hash,
            key_id: None,
            last_status_time: notice.timestamp,
        };
        let (changed, before, after) =
            self.registry
                .with_contact(&self.account, &bare, |contact: &mut Contact| {
                    if is_self {
                        contact.is_self = true;
                    }
                    let before = aggregate(contact);
                    let changed = if entry.show.is_unavailable() {
                        contact.remove_resource(&entry.resource).is_some()
                    } else {
                        contact.upsert_resource(entry)
                    };
                    (changed, before, aggregate(contact))
                })?;

        if !changed && !always_notify {
            return Ok(outcome);
        }

        debug!(
            account = %self.account,
            jid = %bare,
            resource = %resource,
            show = %notice.show,
            "contact presence updated"
        );
        if !is_self && !is_transport_jid(&bare) {
            outcome.actions.push(PresenceAction::LogStatus {
                jid: bare.clone(),
                show: notice.show,
                status: notice.status.clone(),
            });
        }
        outcome.events.push(EventPayload::Notify { notice });
        if before != after {
            outcome.events.push(EventPayload::ContactStatus {
                jid: bare,
                show: after.0,
                status: after.1,
            });
        }
        Ok(outcome)
    }

    fn subscribe(&mut self, stanza: &Stanza, jid: String) -> PresenceOutcome {
        let mut outcome = PresenceOutcome::default();
        let transport = is_transport_jid(&jid);
        let authorize = self.settings.autoauth
            || transport
            || self.settings.jids_for_auto_auth.contains(&jid)
            || self.automatically_added.contains(&jid);

        if authorize {
            info!(account = %self.account, jid = %jid, "subscription authorized automatically");
            outcome
                .actions
                .push(PresenceAction::SendSubscribed { jid: jid.clone() });
            if transport && self.automatically_added.insert(jid.clone()) {
                outcome
                    .actions
                    .push(PresenceAction::RequestSubscription { jid });
            }
            return outcome;
        }

        let status = stanza
            .status()
            .filter(|status| !status.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUBSCRIBE_TEXT.to_string());
        outcome.events.push(EventPayload::Subscribe { jid, status });
        outcome
    }

    fn subscribed(&mut self, jid: String, resource: Option<&str>, now: Instant) -> PresenceOutcome {
        if self.automatically_added.remove(&jid) {
            debug!(account = %self.account, jid = %jid, "reciprocal subscription granted");
            return PresenceOutcome::default();
        }

        let mut outcome = PresenceOutcome::default();
        if self
            .subscription_log
            .record(&jid, SubscriptionKind::Subscribed, now)
        {
            self.stop_acknowledging(&mut outcome);
        }
        outcome.events.push(EventPayload::Subscribed {
            jid: jid.clone(),
            resource: resource.map(str::to_string),
        });
        if !self.settings.dont_ack_subscription {
            outcome.actions.push(PresenceAction::AckSubscribed { jid });
        }
        outcome
    }

    fn unsubscribed(&mut self, jid: String, now: Instant) -> PresenceOutcome {
        let mut outcome = PresenceOutcome::default();
        if self
            .subscription_log
            .record(&jid, SubscriptionKind::Unsubscribed, now)
        {
            self.stop_acknowledging(&mut outcome);
        }
        outcome
            .events
            .push(EventPayload::Unsubscribed { jid: jid.clone() });
        if !self.settings.dont_ack_subscription {
            outcome.actions.push(PresenceAction::AckUnsubscribed { jid });
        }
        outcome
    }

    fn stop_acknowledging(&mut self, outcome: &mut PresenceOutcome) {
        if !self.settings.dont_ack_subscription {
            self.settings.dont_ack_subscription = true;
            outcome.actions.push(PresenceAction::PersistDontAck);
        }
    }

    /// Store a full roster as received on connect.
    pub fn apply_roster(&self, items: &[RosterEntry]) -> Result<(), PresenceError> {
        for item in items.iter().filter(|item| item.subscription.is_some()) {
            self.store_roster_item(item)?;
        }
        debug!(account = %self.account, count = items.len(), "roster stored");
        Ok(())
    }

    /// Apply one roster push and return the event announcing it.
    pub fn apply_roster_push(&self, entry: RosterEntry) -> Result<EventPayload, PresenceError> {
        if entry.subscription.is_some() {
            self.store_roster_item(&entry)?;
        } else {
            let offline = self
                .registry
                .update_existing(&self.account, &entry.jid, |contact| {
                    contact.in_roster = false;
                    contact.subscription = Subscription::None;
                    contact.resources.is_empty()
                });
            if offline == Some(true) {
                self.registry.remove_contact(&self.account, &entry.jid);
            }
        }
        Ok(EventPayload::RosterInfo { entry })
    }

    fn store_roster_item(&self, item: &RosterEntry) -> Result<(), PresenceError> {
        self.registry
            .with_contact(&self.account, &item.jid, |contact| {
                contact.name = item.name.clone();
                contact.subscription = item.subscription.unwrap_or_default();
                contact.ask = item.ask.clone();
                contact.groups = item.groups.clone();
                contact.in_roster = true;
            })?;
        Ok(())
    }

    pub fn roster_snapshot(&self) -> Vec<RosterEntry> {
        self.registry
            .contacts(&self.account)
            .into_iter()
            .filter(|contact| contact.in_roster && !contact.is_self)
            .map(|contact| RosterEntry {
                jid: contact.jid,
                name: contact.name,
                subscription: Some(contact.subscription),
                ask: contact.ask,
                groups: contact.groups,
            })
            .collect()
    }

    /// Attach the outcome of a signature check to the resource it came from.
    /// `None` when the resource went away meanwhile.
    pub fn apply_signature(
        &self,
        jid: &str,
        resource: &str,
        key_id: Option<String>,
    ) -> Option<EventPayload> {
        let key_id = key_id.filter(|key_id| !key_id.is_empty());
        let stored = self
            .registry
            .update_existing(&self.account, jid, |contact| {
                contact
                    .resources
                    .iter_mut()
                    .find(|entry| entry.resource == resource)
                    .map(|entry| entry.key_id = key_id.clone())
                    .is_some()
            })
            .unwrap_or(false);

        stored.then(|| EventPayload::SignatureVerified {
            jid: jid.to_string(),
            resource: resource.to_string(),
            key_id,
        })
    }

    /// Drop every resource of every contact; used when the connection goes
    /// down. Returns a status event for each contact that was online.
    pub fn go_offline(&mut self) -> Vec<EventPayload> {
        self.rooms.clear();
        self.registry
            .contacts(&self.account)
            .into_iter()
            .filter(|contact| !contact.resources.is_empty())
            .filter_map(|contact| {
                let was_online = self
                    .registry
                    .update_existing(&self.account, &contact.jid, |contact| {
                        let was_online = contact.is_online();
                        contact.resources.clear();
                        was_online
                    })?;
                was_online.then(|| EventPayload::ContactStatus {
                    jid: contact.jid,
                    show: Show::Offline,
                    status: None,
                })
            })
            .collect()
    }
}

fn aggregate(contact: &Contact) -> (Show, Option<String>) {
    (contact.show(), contact.status().map(str::to_string))
}

fn show_of(stanza: &Stanza) -> Show {
    match stanza.stanza_type() {
        "unavailable" => Show::Offline,
        "error" => Show::Error,
        _ => stanza
            .show()
            .and_then(|show| show.trim().parse::<Show>().ok())
            .filter(|show| matches!(show, Show::Chat | Show::Away | Show::Xa | Show::Dnd))
            .unwrap_or(Show::Online),
    }
}

/// Legacy numeric code for an error condition, for servers that omit `code`.
fn condition_code(condition: &str) -> Option<u16> {
    match condition {
        "bad-request" => Some(400),
        "not-authorized" => Some(401),
        "forbidden" => Some(403),
        "item-not-found" => Some(404),
        "not-allowed" => Some(405),
        "registration-required" => Some(407),
        "conflict" => Some(409),
        _ => None,
    }
}

fn groupchat_presence(stanza: &Stanza, room: &str, from: &str) -> PresenceOutcome {
    let user = payload::muc_user(stanza).unwrap_or_default();
    PresenceOutcome {
        events: vec![EventPayload::GcNotify {
            presence: GroupchatPresence {
                room: room.to_string(),
                nick: resource_part(from).unwrap_or_default().to_string(),
                show: show_of(stanza),
                status: stanza.status(),
                role: user.role,
                affiliation: user.affiliation,
                jid: user.jid,
                reason: user.reason,
                actor: user.actor,
                status_codes: user.status_codes,
            },
        }],
        actions: Vec::new(),
    }
}
