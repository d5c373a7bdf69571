//! Commands that need a live stream.

use chrono::Utc;
use tracing::{debug, warn};

use tern_core::contact::{Show, bare_jid};
use tern_core::event::EventPayload;
use tern_presence::DEFAULT_SUBSCRIBE_TEXT;
use tern_security::PgpRequest;
use tern_storage::LogKind;
use tern_xmpp::outbound::{self, AdminItem, OutgoingMessage, SubscriptionAction};
use tern_xmpp::{RequestKind, ns};

use crate::command::Command;
use crate::context::{ConnectionContext, OutgoingDraft, PgpContext, now};
use crate::error::ClientError;

impl ConnectionContext {
    /// Run a command that puts stanzas on the wire. Local commands are the
    /// loop's business and are rejected here.
    pub(crate) fn execute(&mut self, command: Command) -> Result<(), ClientError> {
        match command {
            Command::SendMessage {
                to,
                body,
                key_id,
                thread,
            } => self.send_chat(OutgoingDraft { to, body, thread }, key_id)?,

            Command::RequestSubscription { jid, text } => {
                let text = text.as_deref().unwrap_or(DEFAULT_SUBSCRIBE_TEXT);
                self.request_subscription(&jid, Some(text), None, &[])?;
            }
            Command::Authorize(jid) => {
                self.send(outbound::subscription(&jid, SubscriptionAction::Subscribed, None)?);
            }
            Command::Deny(jid) => {
                self.send(outbound::subscription(&jid, SubscriptionAction::Unsubscribed, None)?);
            }
            Command::Unsubscribe(jid) => self.unsubscribe(&jid)?,
            Command::UpdateRosterItem { jid, name, groups } => {
                self.request(RequestKind::RosterUpdate, &jid, |id| {
                    outbound::roster_set(id, &jid, name.as_deref(), &groups)
                })?;
            }

            Command::RemoveAgent(agent) => {
                self.request(RequestKind::RosterUpdate, &agent, |id| {
                    outbound::roster_remove(id, &agent)
                })?;
                self.request(RequestKind::AgentRemove, &agent, |id| {
                    outbound::register_remove(id, &agent)
                })?;
            }
            Command::RequestAgentInfo(agent) => {
                self.request(RequestKind::RegistrationInfo, &agent, |id| {
                    outbound::register_get(id, &agent)
                })?;
            }
            Command::AgentLogging {
                agent,
                presence_type,
            } => self.send(outbound::agent_presence(&agent, &presence_type)?),

            Command::RequestVCard(jid) => {
                let to = (bare_jid(&jid) != self.own_bare_jid()).then_some(jid.as_str());
                self.request(RequestKind::VCard, &jid, |id| outbound::vcard_get(id, to))?;
            }
            Command::PublishVCard(fields) => {
                let own = self.own_bare_jid();
                self.request(RequestKind::VCardPublish, &own, |id| {
                    outbound::vcard_set(id, &fields)
                })?;
            }

            Command::RequestDiscoItems { jid, node } => {
                self.request(RequestKind::DiscoItems, &jid, |id| {
                    outbound::disco_items_get(id, &jid, node.as_deref())
                })?;
            }
            Command::RequestDiscoInfo { jid, node } => {
                self.request(RequestKind::DiscoInfo, &jid, |id| {
                    outbound::disco_info_get(id, &jid, node.as_deref())
                })?;
            }
            Command::RequestVersion(jid) => {
                self.request(RequestKind::Version, &jid, |id| outbound::version_get(id, &jid))?;
            }
            Command::RequestLastActivity(jid) => {
                self.request(RequestKind::LastActivity, &jid, |id| {
                    outbound::last_activity_get(id, &jid)
                })?;
            }
            Command::RequestTime(jid) => {
                self.request(RequestKind::Time, &jid, |id| outbound::time_get(id, &jid))?;
            }
            Command::Ping(jid) => {
                self.request(RequestKind::Ping, &jid, |id| outbound::ping(id, &jid))?;
            }

            Command::JoinRoom {
                nick,
                room,
                server,
                password,
            } => self.join_room(&format!("{room}@{server}"), &nick, password.as_deref())?,
            Command::LeaveRoom { room, nick, status } => {
                self.send(outbound::muc_leave(&room, &nick, status.as_deref())?);
                self.leave_room(&room);
            }
            Command::SendGroupchat { room, body } => {
                self.send(outbound::groupchat(&room, &body)?);
                self.last_activity = now();
            }
            Command::SetSubject { room, subject } => {
                self.send(outbound::room_subject(&room, &subject)?);
            }
            Command::SetRoomStatus {
                room,
                nick,
                show,
                status,
            } => {
                let occupant = format!("{room}/{nick}");
                self.send(outbound::presence(Some(&occupant), show, status.as_deref(), None, None)?);
            }
            Command::SetRole { room, nick, role } => {
                self.request(RequestKind::RoomAdmin, &room, |id| {
                    outbound::muc_admin(id, &room, AdminItem::Role { nick: &nick, role: &role })
                })?;
            }
            Command::SetAffiliation {
                room,
                jid,
                affiliation,
            } => {
                self.request(RequestKind::RoomAdmin, &room, |id| {
                    outbound::muc_admin(
                        id,
                        &room,
                        AdminItem::Affiliation {
                            jid: &jid,
                            affiliation: &affiliation,
                        },
                    )
                })?;
            }

            Command::ChangePassword(password) => {
                let host = self.settings.hostname.clone();
                let username = self.settings.login.clone();
                self.request(RequestKind::PasswordChange, &host, |id| {
                    outbound::change_password(id, &host, &username, &password)
                })?;
            }

            Command::AnswerHttpAuth { id, accept } => {
                let answer = self
                    .http_auth
                    .remove(&id)
                    .and_then(|request| outbound::http_auth_answer(&request, accept));
                match answer {
                    Some(answer) => self.send(answer),
                    None => debug!(account = %self.account, id = %id, "no such HTTP auth request"),
                }
            }

            local => {
                warn!(account = %self.account, command = local.name(), "local command reached the stream");
            }
        }
        Ok(())
    }

    /// Encrypt when a key is given and PGP is usable, otherwise send as is.
    fn send_chat(&mut self, draft: OutgoingDraft, key_id: Option<String>) -> Result<(), ClientError> {
        match key_id.filter(|key_id| self.pgp_available && !key_id.is_empty()) {
            Some(recipient) => {
                self.submit(
                    PgpContext::Outgoing(draft.clone()),
                    PgpRequest::Encrypt {
                        text: draft.body,
                        recipient,
                    },
                );
                Ok(())
            }
            None => self.finish_send(draft, None),
        }
    }

    /// Send a chat message, with `ciphertext` in place of the body when
    /// encryption succeeded.
    pub(crate) fn finish_send(
        &mut self,
        draft: OutgoingDraft,
        ciphertext: Option<String>,
    ) -> Result<(), ClientError> {
        let session_id = self.sessions.get_or_create(&draft.to, draft.thread.as_deref());
        let thread = self
            .sessions
            .get(session_id)
            .and_then(|session| session.thread_id())
            .map(str::to_string)
            .or(draft.thread.clone());
        let request_receipt =
            self.registry()
                .contact_supports(&self.account, bare_jid(&draft.to), ns::RECEIPTS);
        let id = self.next_message_id();

        let stanza = outbound::message(&OutgoingMessage {
            to: &draft.to,
            body: &draft.body,
            message_type: "chat",
            id: Some(&id),
            thread: thread.as_deref(),
            ciphertext: ciphertext.as_deref(),
            request_receipt,
        })?;
        self.send(stanza);

        let encrypted = ciphertext.is_some();
        if let Some(session) = self.sessions.get_mut(session_id) {
            if encrypted {
                session.enable_encryption = true;
            }
        }
        if let Err(error) = self.sessions.record_send(session_id, now()) {
            warn!(account = %self.account, error = %error, "cannot record send");
        }
        self.last_activity = now();

        let peer = self.history_peer(&draft.to);
        self.log(LogKind::Sent, &peer, draft.body.clone(), Utc::now());
        self.emit(EventPayload::MsgSent {
            jid: draft.to,
            body: draft.body,
            encrypted,
        });
        Ok(())
    }

    fn unsubscribe(&mut self, jid: &str) -> Result<(), ClientError> {
        if self.core.delauth {
            self.send(outbound::subscription(jid, SubscriptionAction::Unsubscribe, None)?);
        }
        if self.core.delroster {
            self.request(RequestKind::RosterUpdate, jid, |id| outbound::roster_remove(id, jid))?;
        }
        Ok(())
    }

    fn join_room(&mut self, room: &str, nick: &str, password: Option<&str>) -> Result<(), ClientError> {
        let show = match self.show {
            Show::Offline | Show::Error => Show::Online,
            show => show,
        };
        self.send(outbound::muc_join(room, nick, password, show, None)?);
        self.presence.mark_room_joined(room);
        self.sessions.mark_room_joined(room);
        self.rooms.insert(room.to_string());
        Ok(())
    }

    fn leave_room(&mut self, room: &str) {
        self.presence.mark_room_left(room);
        for ended in self.sessions.mark_room_left(room) {
            if let Some(notice) = ended.notice {
                self.send(notice);
            }
        }
        self.rooms.remove(room);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::context::tests::{context, context_with};

    #[test]
    fn plain_message_is_sent_and_reported() {
        let mut ctx = context();
        ctx.execute(Command::SendMessage {
            to: "alice@example.com".into(),
            body: "Hello".into(),
            key_id: None,
            thread: None,
        })
        .unwrap();

        let effects = ctx.take_effects();
        assert_eq!(effects.outbox.len(), 1);
        assert_eq!(effects.outbox[0].body().as_deref(), Some("Hello"));
        assert_eq!(effects.outbox[0].id(), Some("work-msg-1"));
        assert_eq!(effects.history[0].kind, LogKind::Sent);
        assert_eq!(
            effects.events,
            vec![EventPayload::MsgSent {
                jid: "alice@example.com".into(),
                body: "Hello".into(),
                encrypted: false,
            }]
        );
        assert_eq!(ctx.sessions.len(), 1);
    }

    #[test]
    fn message_with_key_waits_for_ciphertext() {
        let mut ctx = context();
        ctx.execute(Command::SendMessage {
            to: "alice@example.com".into(),
            body: "Hello".into(),
            key_id: Some("ABCDEF01".into()),
            thread: None,
        })
        .unwrap();

        let effects = ctx.take_effects();
        assert!(effects.outbox.is_empty());
        assert_matches!(
            &effects.security[..],
            [(PgpContext::Outgoing(draft), PgpRequest::Encrypt { recipient, .. })]
                if draft.to == "alice@example.com" && recipient == "ABCDEF01"
        );
    }

    #[test]
    fn encrypted_send_uses_the_placeholder() {
        let mut ctx = context();
        ctx.finish_send(
            OutgoingDraft {
                to: "alice@example.com".into(),
                body: "Hello".into(),
                thread: Some("th-1".into()),
            },
            Some("XYZ".into()),
        )
        .unwrap();

        let effects = ctx.take_effects();
        let stanza = &effects.outbox[0];
        assert_eq!(stanza.body().as_deref(), Some(outbound::ENCRYPTED_PLACEHOLDER));
        assert_eq!(
            stanza.child("x", ns::ENCRYPTED).map(|x| x.text()).as_deref(),
            Some("XYZ")
        );
        assert_matches!(&effects.events[..], [EventPayload::MsgSent { encrypted: true, .. }]);

        let session = ctx.sessions.find("alice@example.com", Some("th-1")).unwrap();
        assert!(ctx.sessions.get(session).unwrap().enable_encryption);
    }

    #[test]
    fn unsubscribe_follows_core_settings() {
        let mut ctx = context_with(
            r#"
            [core]
            delauth = true
            delroster = false

            [accounts.work]
            hostname = "example.com"
            login = "bob"
            "#,
        );
        ctx.execute(Command::Unsubscribe("alice@example.com".into())).unwrap();

        let outbox = ctx.take_effects().outbox;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].stanza_type(), "unsubscribe");
        assert!(ctx.pending.is_empty());
    }

    #[test]
    fn removing_an_agent_sends_two_requests() {
        let mut ctx = context();
        ctx.execute(Command::RemoveAgent("icq.example.com".into())).unwrap();

        let outbox = ctx.take_effects().outbox;
        assert_eq!(outbox.len(), 2);
        assert!(outbox[0].has_namespace(ns::ROSTER));
        assert!(outbox[1].has_namespace(ns::REGISTER));
        assert_eq!(ctx.pending.len(), 2);
    }

    #[test]
    fn joining_and_leaving_a_room() {
        let mut ctx = context();
        ctx.show = Show::Away;
        ctx.execute(Command::JoinRoom {
            nick: "bob".into(),
            room: "lounge".into(),
            server: "conference.example.com".into(),
            password: None,
        })
        .unwrap();

        let join = ctx.take_effects().outbox.remove(0);
        assert_eq!(join.to(), Some("lounge@conference.example.com/bob"));
        assert_eq!(join.show().as_deref(), Some("away"));
        assert!(join.has_namespace(ns::MUC));
        assert!(ctx.presence.is_room("lounge@conference.example.com"));
        assert!(ctx.sessions.is_pm_peer("lounge@conference.example.com/carol"));

        ctx.execute(Command::LeaveRoom {
            room: "lounge@conference.example.com".into(),
            nick: "bob".into(),
            status: None,
        })
        .unwrap();
        let leave = ctx.take_effects().outbox.remove(0);
        assert_eq!(leave.stanza_type(), "unavailable");
        assert!(!ctx.presence.is_room("lounge@conference.example.com"));
        assert!(ctx.rooms.is_empty());
    }

    #[test]
    fn invalid_jids_are_rejected() {
        let mut ctx = context();
        let result = ctx.execute(Command::Authorize("alice@".into()));
        assert_matches!(result, Err(ClientError::Outbound(_)));
        assert!(ctx.take_effects().is_empty());
    }

    #[test]
    fn unknown_http_auth_answers_are_ignored() {
        let mut ctx = context();
        ctx.execute(Command::AnswerHttpAuth {
            id: "nope".into(),
            accept: true,
        })
        .unwrap();
        assert!(ctx.take_effects().is_empty());
    }
}
