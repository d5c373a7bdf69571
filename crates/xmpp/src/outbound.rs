//! Builders for every stanza the core sends.

use std::str::FromStr;

use jid::{BareJid, Jid};
use minidom::Element;
use tern_core::contact::Show;
use xmpp_parsers::roster::{Ask, Group, Item, Roster, Subscription};

use crate::error::OutboundError;
use crate::ns;
use crate::stanza::{Stanza, StanzaKind};

/// Body sent in place of the plaintext of an encrypted message.
pub const ENCRYPTED_PLACEHOLDER: &str = "[this message is encrypted]";

/// Outgoing subscription presence types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
}

impl SubscriptionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionAction::Subscribe => "subscribe",
            SubscriptionAction::Subscribed => "subscribed",
            SubscriptionAction::Unsubscribe => "unsubscribe",
            SubscriptionAction::Unsubscribed => "unsubscribed",
        }
    }
}

/// An outgoing one-to-one message.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage<'a> {
    pub to: &'a str,
    pub body: &'a str,
    pub message_type: &'a str,
    pub id: Option<&'a str>,
    pub thread: Option<&'a str>,
    /// Armored ciphertext; when set the body is replaced by a placeholder.
    pub ciphertext: Option<&'a str>,
    pub request_receipt: bool,
}

pub fn validate_jid(jid: &str) -> Result<Jid, OutboundError> {
    Jid::from_str(jid).map_err(|_| OutboundError::InvalidJid(jid.to_string()))
}

fn validate_bare_jid(jid: &str) -> Result<BareJid, OutboundError> {
    BareJid::from_str(jid).map_err(|_| OutboundError::InvalidJid(jid.to_string()))
}

fn text_element(name: &str, text: &str) -> Element {
    Element::builder(name, ns::CLIENT).append(text).build()
}

pub fn message(message: &OutgoingMessage<'_>) -> Result<Stanza, OutboundError> {
    validate_jid(message.to)?;
    let message_type = if message.message_type.is_empty() {
        "chat"
    } else {
        message.message_type
    };

    let body = match message.ciphertext {
        Some(_) => ENCRYPTED_PLACEHOLDER,
        None => message.body,
    };

    let mut builder = Element::builder("message", ns::CLIENT)
        .attr("to", message.to)
        .attr("type", message_type)
        .attr("id", message.id)
        .append(text_element("body", body));
    if let Some(thread) = message.thread {
        builder = builder.append(text_element("thread", thread));
    }
    if let Some(ciphertext) = message.ciphertext {
        builder = builder.append(Element::builder("x", ns::ENCRYPTED).append(ciphertext).build());
    }
    if message.request_receipt {
        builder = builder.append(Element::builder("request", ns::RECEIPTS).build());
    }

    Ok(Stanza::built(StanzaKind::Message, builder.build()))
}

/// Delivery receipt for `message_id`, on the same thread as the message.
pub fn receipt(to: &str, message_id: &str, thread: Option<&str>) -> Result<Stanza, OutboundError> {
    validate_jid(to)?;
    let mut builder = Element::builder("message", ns::CLIENT)
        .attr("to", to)
        .attr("type", "chat")
        .attr("id", message_id)
        .append(
            Element::builder("received", ns::RECEIPTS)
                .attr("id", message_id)
                .build(),
        );
    if let Some(thread) = thread {
        builder = builder.append(text_element("thread", thread));
    }
    Ok(Stanza::built(StanzaKind::Message, builder.build()))
}

/// Tells the peer that the conversation on `thread` is over.
pub fn session_terminate(to: &str, thread: &str) -> Result<Stanza, OutboundError> {
    validate_jid(to)?;
    let field = |var: &str, value: &str| {
        Element::builder("field", "jabber:x:data")
            .attr("var", var)
            .append(Element::builder("value", "jabber:x:data").append(value).build())
            .build()
    };
    let form = Element::builder("x", "jabber:x:data")
        .attr("type", "submit")
        .append(field("FORM_TYPE", ns::SESSION_NEGOTIATION))
        .append(field("terminate", "1"))
        .build();
    let element = Element::builder("message", ns::CLIENT)
        .attr("to", to)
        .attr("type", "normal")
        .append(text_element("thread", thread))
        .append(Element::builder("feature", ns::FEATURE_NEG).append(form).build())
        .build();
    Ok(Stanza::built(StanzaKind::Message, element))
}

pub fn groupchat(room: &str, body: &str) -> Result<Stanza, OutboundError> {
    validate_bare_jid(room)?;
    let element = Element::builder("message", ns::CLIENT)
        .attr("to", room)
        .attr("type", "groupchat")
        .append(text_element("body", body))
        .build();
    Ok(Stanza::built(StanzaKind::Message, element))
}

pub fn room_subject(room: &str, subject: &str) -> Result<Stanza, OutboundError> {
    validate_bare_jid(room)?;
    let element = Element::builder("message", ns::CLIENT)
        .attr("to", room)
        .attr("type", "groupchat")
        .append(text_element("subject", subject))
        .build();
    Ok(Stanza::built(StanzaKind::Message, element))
}

/// Presence for our own availability, broadcast unless `to` is given.
///
/// `offline` becomes `unavailable`, `invisible` is sent as its own type.
pub fn presence(
    to: Option<&str>,
    show: Show,
    status: Option<&str>,
    priority: Option<i8>,
    signature: Option<&str>,
) -> Result<Stanza, OutboundError> {
    if let Some(to) = to {
        validate_jid(to)?;
    }

    let presence_type = match show {
        Show::Offline | Show::Error => Some("unavailable"),
        Show::Invisible => Some("invisible"),
        _ => None,
    };
    let show_value = match show {
        Show::Chat | Show::Away | Show::Xa | Show::Dnd => Some(show.as_str()),
        _ => None,
    };

    let mut builder = Element::builder("presence", ns::CLIENT)
        .attr("to", to)
        .attr("type", presence_type);
    if let Some(show_value) = show_value {
        builder = builder.append(text_element("show", show_value));
    }
    if let Some(status) = status.filter(|status| !status.is_empty()) {
        builder = builder.append(text_element("status", status));
    }
    if let Some(priority) = priority.filter(|_| presence_type != Some("unavailable")) {
        builder = builder.append(text_element("priority", &priority.to_string()));
    }
    if let Some(signature) = signature {
        builder = builder.append(Element::builder("x", ns::SIGNED).append(signature).build());
    }

    Ok(Stanza::built(StanzaKind::Presence, builder.build()))
}

pub fn subscription(
    to: &str,
    action: SubscriptionAction,
    status: Option<&str>,
) -> Result<Stanza, OutboundError> {
    validate_bare_jid(to)?;
    let mut builder = Element::builder("presence", ns::CLIENT)
        .attr("to", to)
        .attr("type", action.as_str());
    if let Some(status) = status.filter(|status| !status.is_empty()) {
        builder = builder.append(text_element("status", status));
    }
    Ok(Stanza::built(StanzaKind::Presence, builder.build()))
}

/// Presence of a given raw type (`available`, `unavailable`, `probe`) to a
/// transport.
pub fn agent_presence(agent: &str, presence_type: &str) -> Result<Stanza, OutboundError> {
    validate_jid(agent)?;
    let presence_type = match presence_type {
        "available" | "" => None,
        other => Some(other),
    };
    let element = Element::builder("presence", ns::CLIENT)
        .attr("to", agent)
        .attr("type", presence_type)
        .build();
    Ok(Stanza::built(StanzaKind::Presence, element))
}

pub fn muc_join(
    room: &str,
    nick: &str,
    password: Option<&str>,
    show: Show,
    status: Option<&str>,
) -> Result<Stanza, OutboundError> {
    let occupant = format!("{room}/{nick}");
    let presence = presence(Some(&occupant), show, status, None, None)?;

    let mut muc = Element::builder("x", ns::MUC);
    if let Some(password) = password.filter(|password| !password.is_empty()) {
        muc = muc.append(Element::builder("password", ns::MUC).append(password).build());
    }

    let mut element = presence.into_element();
    element.append_child(muc.build());
    Ok(Stanza::built(StanzaKind::Presence, element))
}

pub fn muc_leave(room: &str, nick: &str, status: Option<&str>) -> Result<Stanza, OutboundError> {
    presence(Some(&format!("{room}/{nick}")), Show::Offline, status, None, None)
}

/// An item of a muc#admin change: either a nick with a role or a bare JID
/// with an affiliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminItem<'a> {
    Role { nick: &'a str, role: &'a str },
    Affiliation { jid: &'a str, affiliation: &'a str },
}

pub fn muc_admin(id: &str, room: &str, item: AdminItem<'_>) -> Result<Stanza, OutboundError> {
    validate_bare_jid(room)?;
    let item = match item {
        AdminItem::Role { nick, role } => Element::builder("item", ns::MUC_ADMIN)
            .attr("nick", nick)
            .attr("role", role)
            .build(),
        AdminItem::Affiliation { jid, affiliation } => {
            validate_bare_jid(jid)?;
            Element::builder("item", ns::MUC_ADMIN)
                .attr("jid", jid)
                .attr("affiliation", affiliation)
                .build()
        }
    };
    let query = Element::builder("query", ns::MUC_ADMIN).append(item).build();
    Ok(iq("set", id, Some(room), Some(query)))
}

fn iq(iq_type: &str, id: &str, to: Option<&str>, payload: Option<Element>) -> Stanza {
    let mut builder = Element::builder("iq", ns::CLIENT)
        .attr("type", iq_type)
        .attr("id", id)
        .attr("to", to);
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    Stanza::built(StanzaKind::Iq, builder.build())
}

fn query(namespace: &str) -> Element {
    Element::builder("query", namespace).build()
}

pub fn iq_get(id: &str, to: Option<&str>, payload: Element) -> Result<Stanza, OutboundError> {
    if let Some(to) = to {
        validate_jid(to)?;
    }
    Ok(iq("get", id, to, Some(payload)))
}

pub fn iq_set(id: &str, to: Option<&str>, payload: Element) -> Result<Stanza, OutboundError> {
    if let Some(to) = to {
        validate_jid(to)?;
    }
    Ok(iq("set", id, to, Some(payload)))
}

/// Reply to an inbound `get`/`set`.
pub fn iq_result(to: Option<&str>, id: &str, payload: Option<Element>) -> Stanza {
    iq("result", id, to, payload)
}

pub fn iq_error(
    to: Option<&str>,
    id: &str,
    error_type: &str,
    condition: &str,
) -> Stanza {
    let error = Element::builder("error", ns::CLIENT)
        .attr("type", error_type)
        .append(Element::builder(condition, ns::STANZAS).build())
        .build();
    iq("error", id, to, Some(error))
}

pub fn service_unavailable(to: Option<&str>, id: &str) -> Stanza {
    iq_error(to, id, "cancel", "service-unavailable")
}

pub fn roster_get(id: &str) -> Stanza {
    iq("get", id, None, Some(query(ns::ROSTER)))
}

pub fn roster_set(
    id: &str,
    jid: &str,
    name: Option<&str>,
    groups: &[String],
) -> Result<Stanza, OutboundError> {
    let item = Item {
        jid: validate_bare_jid(jid)?,
        name: name.filter(|name| !name.is_empty()).map(str::to_string),
        subscription: Subscription::None,
        ask: Ask::None,
        groups: groups.iter().cloned().map(Group).collect(),
    };
    Ok(roster_push(id, item))
}

pub fn roster_remove(id: &str, jid: &str) -> Result<Stanza, OutboundError> {
    let item = Item {
        jid: validate_bare_jid(jid)?,
        name: None,
        subscription: Subscription::Remove,
        ask: Ask::None,
        groups: Vec::new(),
    };
    Ok(roster_push(id, item))
}

fn roster_push(id: &str, item: Item) -> Stanza {
    let roster = Roster {
        ver: None,
        items: vec![item],
    };
    iq("set", id, None, Some(Element::from(roster)))
}

pub fn vcard_get(id: &str, to: Option<&str>) -> Result<Stanza, OutboundError> {
    iq_get(id, to, Element::builder("vCard", ns::VCARD).build())
}

/// Publish our own vCard. Nested objects become nested elements.
pub fn vcard_set(id: &str, fields: &serde_json::Value) -> Result<Stanza, OutboundError> {
    let serde_json::Value::Object(fields) = fields else {
        return Err(OutboundError::InvalidValue {
            field: "vcard",
            message: "expected an object of fields".to_string(),
        });
    };
    let mut vcard = Element::builder("vCard", ns::VCARD);
    for (name, value) in fields {
        vcard = vcard.append(vcard_field(name, value));
    }
    Ok(iq("set", id, None, Some(vcard.build())))
}

fn vcard_field(name: &str, value: &serde_json::Value) -> Element {
    let builder = Element::builder(name, ns::VCARD);
    match value {
        serde_json::Value::Object(children) => builder
            .append_all(
                children
                    .iter()
                    .map(|(child, value)| vcard_field(child, value)),
            )
            .build(),
        serde_json::Value::String(text) => builder.append(text.as_str()).build(),
        serde_json::Value::Null => builder.build(),
        other => builder.append(other.to_string()).build(),
    }
}

pub fn disco_items_get(id: &str, to: &str, node: Option<&str>) -> Result<Stanza, OutboundError> {
    let payload = Element::builder("query", ns::DISCO_ITEMS)
        .attr("node", node)
        .build();
    iq_get(id, Some(to), payload)
}

pub fn disco_info_get(id: &str, to: &str, node: Option<&str>) -> Result<Stanza, OutboundError> {
    let payload = Element::builder("query", ns::DISCO_INFO)
        .attr("node", node)
        .build();
    iq_get(id, Some(to), payload)
}

pub fn version_get(id: &str, to: &str) -> Result<Stanza, OutboundError> {
    iq_get(id, Some(to), query(ns::VERSION))
}

pub fn last_activity_get(id: &str, to: &str) -> Result<Stanza, OutboundError> {
    iq_get(id, Some(to), query(ns::LAST))
}

pub fn time_get(id: &str, to: &str) -> Result<Stanza, OutboundError> {
    iq_get(id, Some(to), Element::builder("time", ns::TIME).build())
}

pub fn ping(id: &str, to: &str) -> Result<Stanza, OutboundError> {
    iq_get(id, Some(to), Element::builder("ping", ns::PING).build())
}

pub fn register_get(id: &str, agent: &str) -> Result<Stanza, OutboundError> {
    iq_get(id, Some(agent), query(ns::REGISTER))
}

/// Cancel our registration with a transport.
pub fn register_remove(id: &str, agent: &str) -> Result<Stanza, OutboundError> {
    let payload = Element::builder("query", ns::REGISTER)
        .append(Element::builder("remove", ns::REGISTER).build())
        .build();
    iq_set(id, Some(agent), payload)
}

pub fn change_password(
    id: &str,
    host: &str,
    username: &str,
    password: &str,
) -> Result<Stanza, OutboundError> {
    let payload = Element::builder("query", ns::REGISTER)
        .append(Element::builder("username", ns::REGISTER).append(username).build())
        .append(Element::builder("password", ns::REGISTER).append(password).build())
        .build();
    iq_set(id, Some(host), payload)
}

pub fn version_result(
    to: Option<&str>,
    id: &str,
    name: &str,
    version: &str,
    os: Option<&str>,
) -> Stanza {
    let mut payload = Element::builder("query", ns::VERSION)
        .append(Element::builder("name", ns::VERSION).append(name).build())
        .append(Element::builder("version", ns::VERSION).append(version).build());
    if let Some(os) = os {
        payload = payload.append(Element::builder("os", ns::VERSION).append(os).build());
    }
    iq_result(to, id, Some(payload.build()))
}

pub fn time_result(to: Option<&str>, id: &str, utc: &str, tzo: &str) -> Stanza {
    let payload = Element::builder("time", ns::TIME)
        .append(Element::builder("tzo", ns::TIME).append(tzo).build())
        .append(Element::builder("utc", ns::TIME).append(utc).build())
        .build();
    iq_result(to, id, Some(payload))
}

pub fn last_activity_result(to: Option<&str>, id: &str, seconds: u64) -> Stanza {
    let payload = Element::builder("query", ns::LAST)
        .attr("seconds", seconds.to_string())
        .build();
    iq_result(to, id, Some(payload))
}

pub fn disco_info_result(
    to: Option<&str>,
    id: &str,
    node: Option<&str>,
    identity: (&str, &str, &str),
    features: &[&str],
) -> Stanza {
    let (category, kind, name) = identity;
    let payload = Element::builder("query", ns::DISCO_INFO)
        .attr("node", node)
        .append(
            Element::builder("identity", ns::DISCO_INFO)
                .attr("category", category)
                .attr("type", kind)
                .attr("name", name)
                .build(),
        )
        .append_all(features.iter().map(|feature| {
            Element::builder("feature", ns::DISCO_INFO)
                .attr("var", *feature)
                .build()
        }))
        .build();
    iq_result(to, id, Some(payload))
}

/// Answer an HTTP auth confirmation request, echoing the `confirm` element.
pub fn http_auth_answer(request: &Stanza, accept: bool) -> Option<Stanza> {
    let confirm = request.child("confirm", ns::HTTP_AUTH)?.clone();
    let to = request.from();
    let id = request.id().unwrap_or_default();

    Some(match (request.kind(), accept) {
        (StanzaKind::Iq, true) => iq_result(to, id, None),
        (StanzaKind::Iq, false) => {
            let mut reply = iq_error(to, id, "auth", "not-authorized").into_element();
            reply.append_child(confirm);
            Stanza::built(StanzaKind::Iq, reply)
        }
        (_, true) => Stanza::built(
            StanzaKind::Message,
            Element::builder("message", ns::CLIENT)
                .attr("to", to)
                .append(confirm)
                .build(),
        ),
        (_, false) => Stanza::built(
            StanzaKind::Message,
            Element::builder("message", ns::CLIENT)
                .attr("to", to)
                .attr("type", "error")
                .append(confirm)
                .append(
                    Element::builder("error", ns::CLIENT)
                        .attr("type", "auth")
                        .append(Element::builder("not-authorized", ns::STANZAS).build())
                        .build(),
                )
                .build(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn reparse(stanza: &Stanza) -> Stanza {
        Stanza::parse(&stanza.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn encrypted_message_carries_placeholder_and_payload() {
        let stanza = message(&OutgoingMessage {
            to: "alice@example.com",
            body: "secret plans",
            ciphertext: Some("XYZ"),
            ..OutgoingMessage::default()
        })
        .unwrap();

        let parsed = reparse(&stanza);
        assert_eq!(parsed.stanza_type(), "chat");
        assert_eq!(parsed.body().as_deref(), Some(ENCRYPTED_PLACEHOLDER));
        assert_eq!(
            parsed.child("x", ns::ENCRYPTED).map(Element::text).as_deref(),
            Some("XYZ")
        );
    }

    #[test]
    fn plain_message_keeps_body_and_thread() {
        let stanza = message(&OutgoingMessage {
            to: "alice@example.com/phone",
            body: "hello",
            id: Some("tern-4"),
            thread: Some("t-9"),
            request_receipt: true,
            ..OutgoingMessage::default()
        })
        .unwrap();

        let parsed = reparse(&stanza);
        assert_eq!(parsed.body().as_deref(), Some("hello"));
        assert_eq!(parsed.thread().as_deref(), Some("t-9"));
        assert_eq!(parsed.id(), Some("tern-4"));
        assert!(parsed.child("x", ns::ENCRYPTED).is_none());
        assert!(parsed.child("request", ns::RECEIPTS).is_some());
    }

    #[test]
    fn rejects_invalid_jid() {
        let result = message(&OutgoingMessage {
            to: "not a jid@@/",
            body: "hi",
            ..OutgoingMessage::default()
        });
        assert_matches!(result, Err(OutboundError::InvalidJid(_)));
    }

    #[test]
    fn presence_maps_show_states() {
        let away = reparse(&presence(None, Show::Away, Some("lunch"), Some(5), None).unwrap());
        assert_eq!(away.stanza_type(), "available");
        assert_eq!(away.show().as_deref(), Some("away"));
        assert_eq!(away.status().as_deref(), Some("lunch"));
        assert_eq!(away.priority(), 5);

        let online = reparse(&presence(None, Show::Online, None, Some(0), None).unwrap());
        assert!(online.show().is_none());

        let offline = reparse(&presence(None, Show::Offline, Some("bye"), Some(5), None).unwrap());
        assert_eq!(offline.stanza_type(), "unavailable");
        assert!(offline.child("priority", ns::CLIENT).is_none());

        let invisible = reparse(&presence(None, Show::Invisible, None, Some(1), None).unwrap());
        assert_eq!(invisible.stanza_type(), "invisible");
    }

    #[test]
    fn signed_presence_carries_signature() {
        let stanza = presence(None, Show::Online, Some("hi"), None, Some("SIG")).unwrap();
        assert_eq!(
            stanza.child("x", ns::SIGNED).map(Element::text).as_deref(),
            Some("SIG")
        );
    }

    #[test]
    fn subscription_presences() {
        let stanza = subscription(
            "alice@example.com",
            SubscriptionAction::Subscribe,
            Some("I would like to add you to my roster."),
        )
        .unwrap();
        assert_eq!(stanza.stanza_type(), "subscribe");
        assert_eq!(stanza.to(), Some("alice@example.com"));
        assert_eq!(
            stanza.status().as_deref(),
            Some("I would like to add you to my roster.")
        );

        let denied = subscription("alice@example.com", SubscriptionAction::Unsubscribed, None)
            .unwrap();
        assert_eq!(denied.stanza_type(), "unsubscribed");
        assert!(denied.status().is_none());
    }

    #[test]
    fn roster_set_and_remove() {
        let set = reparse(
            &roster_set(
                "tern-1",
                "alice@example.com",
                Some("Alice"),
                &["Friends".to_string()],
            )
            .unwrap(),
        );
        assert_eq!(set.stanza_type(), "set");
        let item = set
            .child("query", ns::ROSTER)
            .and_then(|query| query.get_child("item", ns::ROSTER))
            .unwrap();
        assert_eq!(item.attr("jid"), Some("alice@example.com"));
        assert_eq!(item.attr("name"), Some("Alice"));
        assert_eq!(
            item.get_child("group", ns::ROSTER).map(Element::text).as_deref(),
            Some("Friends")
        );

        let removed = roster_remove("tern-2", "alice@example.com").unwrap();
        let item = removed
            .child("query", ns::ROSTER)
            .and_then(|query| query.get_child("item", ns::ROSTER))
            .unwrap();
        assert_eq!(item.attr("subscription"), Some("remove"));
    }

    #[test]
    fn muc_join_adds_muc_payload_and_password() {
        let stanza = muc_join(
            "room@conference.example.com",
            "bob",
            Some("hunter2"),
            Show::Online,
            None,
        )
        .unwrap();
        assert_eq!(stanza.to(), Some("room@conference.example.com/bob"));
        let muc = stanza.child("x", ns::MUC).unwrap();
        assert_eq!(
            muc.get_child("password", ns::MUC).map(Element::text).as_deref(),
            Some("hunter2")
        );
    }

    #[test]
    fn muc_admin_role_and_affiliation() {
        let role = muc_admin(
            "tern-3",
            "room@conference.example.com",
            AdminItem::Role {
                nick: "troll",
                role: "none",
            },
        )
        .unwrap();
        let item = role
            .child("query", ns::MUC_ADMIN)
            .and_then(|query| query.get_child("item", ns::MUC_ADMIN))
            .unwrap();
        assert_eq!(item.attr("nick"), Some("troll"));
        assert_eq!(item.attr("role"), Some("none"));

        let affiliation = muc_admin(
            "tern-4",
            "room@conference.example.com",
            AdminItem::Affiliation {
                jid: "carol@example.com",
                affiliation: "member",
            },
        )
        .unwrap();
        let item = affiliation
            .child("query", ns::MUC_ADMIN)
            .and_then(|query| query.get_child("item", ns::MUC_ADMIN))
            .unwrap();
        assert_eq!(item.attr("affiliation"), Some("member"));
    }

    #[test]
    fn service_unavailable_reply() {
        let reply = service_unavailable(Some("alice@example.com/phone"), "q1");
        let parsed = reparse(&reply);
        assert_eq!(parsed.stanza_type(), "error");
        assert_eq!(
            parsed.error().and_then(|details| details.condition).as_deref(),
            Some("service-unavailable")
        );
    }

    #[test]
    fn session_terminate_names_thread() {
        let stanza = session_terminate("alice@example.com/phone", "t-1").unwrap();
        assert_eq!(stanza.thread().as_deref(), Some("t-1"));
        assert!(stanza.child("feature", ns::FEATURE_NEG).is_some());
    }

    #[test]
    fn vcard_set_nests_objects() {
        let fields = serde_json::json!({
            "FN": "Bob",
            "N": { "GIVEN": "Bob", "FAMILY": "Builder" }
        });
        let stanza = vcard_set("tern-5", &fields).unwrap();
        let vcard = stanza.child("vCard", ns::VCARD).unwrap();
        assert_eq!(vcard.get_child("FN", ns::VCARD).map(Element::text).as_deref(), Some("Bob"));
        assert_eq!(
            vcard
                .get_child("N", ns::VCARD)
                .and_then(|n| n.get_child("FAMILY", ns::VCARD))
                .map(Element::text)
                .as_deref(),
            Some("Builder")
        );

        assert_matches!(
            vcard_set("tern-6", &serde_json::json!("Bob")),
            Err(OutboundError::InvalidValue { .. })
        );
    }

    #[test]
    fn password_change_goes_to_host() {
        let stanza = change_password("tern-7", "example.com", "bob", "n3w").unwrap();
        assert_eq!(stanza.to(), Some("example.com"));
        let query = stanza.child("query", ns::REGISTER).unwrap();
        assert_eq!(
            query.get_child("password", ns::REGISTER).map(Element::text).as_deref(),
            Some("n3w")
        );
    }
}
