//! Readers for the extension payloads the core understands.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use minidom::Element;
use tern_core::contact::Subscription;
use tern_core::event::{DiscoIdentity, DiscoItem, RosterEntry};
use xmpp_parsers::roster::{self, Roster};

use crate::error::StanzaError;
use crate::ns;
use crate::stanza::Stanza;

pub fn roster_items(query: &Element) -> Result<Vec<RosterEntry>, StanzaError> {
    let roster = Roster::try_from(query.clone())
        .map_err(|error| StanzaError::ParseFailed(format!("invalid roster payload: {error}")))?;

    Ok(roster
        .items
        .into_iter()
        .map(|item| RosterEntry {
            jid: item.jid.to_string(),
            name: item.name.filter(|name| !name.is_empty()),
            subscription: match item.subscription {
                roster::Subscription::None => Some(Subscription::None),
                roster::Subscription::To => Some(Subscription::To),
                roster::Subscription::From => Some(Subscription::From),
                roster::Subscription::Both => Some(Subscription::Both),
                roster::Subscription::Remove => None,
            },
            ask: match item.ask {
                roster::Ask::Subscribe => Some("subscribe".to_string()),
                roster::Ask::None => None,
            },
            groups: item.groups.into_iter().map(|group| group.0).collect(),
        })
        .collect())
}

/// Flatten a vCard into a JSON object; elements with children become nested
/// objects, leaves become strings.
pub fn vcard_fields(vcard: &Element) -> serde_json::Value {
    let mut fields = serde_json::Map::new();
    for child in vcard.children() {
        let value = if child.children().next().is_some() {
            vcard_fields(child)
        } else {
            serde_json::Value::String(child.text())
        };
        fields.insert(child.name().to_string(), value);
    }
    serde_json::Value::Object(fields)
}

pub fn disco_items(query: &Element) -> Vec<DiscoItem> {
    query
        .children()
        .filter(|child| child.is("item", ns::DISCO_ITEMS))
        .filter_map(|item| {
            Some(DiscoItem {
                jid: item.attr("jid")?.to_string(),
                node: item.attr("node").map(str::to_string),
                name: item.attr("name").map(str::to_string),
            })
        })
        .collect()
}

pub fn disco_info(query: &Element) -> (Vec<DiscoIdentity>, Vec<String>) {
    let identities = query
        .children()
        .filter(|child| child.is("identity", ns::DISCO_INFO))
        .map(|identity| DiscoIdentity {
            category: identity.attr("category").unwrap_or_default().to_string(),
            kind: identity.attr("type").unwrap_or_default().to_string(),
            name: identity.attr("name").map(str::to_string),
        })
        .collect();
    let features = query
        .children()
        .filter(|child| child.is("feature", ns::DISCO_INFO))
        .filter_map(|feature| feature.attr("var").map(str::to_string))
        .collect();
    (identities, features)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftwareVersion {
    pub name: Option<String>,
    pub version: Option<String>,
    pub os: Option<String>,
}

pub fn software_version(query: &Element) -> SoftwareVersion {
    let field = |name: &str| {
        query
            .get_child(name, ns::VERSION)
            .map(Element::text)
            .filter(|text| !text.is_empty())
    };
    SoftwareVersion {
        name: field("name"),
        version: field("version"),
        os: field("os"),
    }
}

/// `(utc, tzo)` of an XEP-0202 reply.
pub fn entity_time(time: &Element) -> (String, String) {
    let field = |name: &str| {
        time.get_child(name, ns::TIME)
            .map(Element::text)
            .unwrap_or_default()
    };
    (field("utc"), field("tzo"))
}

/// Seconds and optional status text of a jabber:iq:last reply.
pub fn last_activity(query: &Element) -> Option<(u64, Option<String>)> {
    let seconds = query.attr("seconds")?.parse().ok()?;
    let status = Some(query.text()).filter(|text| !text.trim().is_empty());
    Some((seconds, status))
}

/// Instructions and field values of a jabber:iq:register form.
pub fn registration_form(query: &Element) -> (Option<String>, BTreeMap<String, String>) {
    let mut instructions = None;
    let mut fields = BTreeMap::new();
    for child in query.children().filter(|child| child.ns() == ns::REGISTER) {
        match child.name() {
            "instructions" => instructions = Some(child.text()),
            "registered" | "remove" => {}
            name => {
                fields.insert(name.to_string(), child.text());
            }
        }
    }
    (instructions, fields)
}

/// The muc#user extension of an occupant presence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MucUser {
    pub role: Option<String>,
    pub affiliation: Option<String>,
    pub jid: Option<String>,
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub status_codes: Vec<u16>,
}

pub fn muc_user(stanza: &Stanza) -> Option<MucUser> {
    let x = stanza.child("x", ns::MUC_USER)?;
    let item = x.get_child("item", ns::MUC_USER);
    Some(MucUser {
        role: item.and_then(|item| item.attr("role")).map(str::to_string),
        affiliation: item
            .and_then(|item| item.attr("affiliation"))
            .map(str::to_string),
        jid: item.and_then(|item| item.attr("jid")).map(str::to_string),
        reason: item
            .and_then(|item| item.get_child("reason", ns::MUC_USER))
            .map(Element::text),
        actor: item
            .and_then(|item| item.get_child("actor", ns::MUC_USER))
            .and_then(|actor| actor.attr("jid").or_else(|| actor.attr("nick")))
            .map(str::to_string),
        status_codes: x
            .children()
            .filter(|child| child.is("status", ns::MUC_USER))
            .filter_map(|status| status.attr("code")?.parse().ok())
            .collect(),
    })
}

/// Original send time of a delayed stanza, modern or legacy format.
pub fn delay_timestamp(stanza: &Stanza) -> Option<DateTime<Utc>> {
    if let Some(stamp) = stanza
        .child("delay", ns::DELAY)
        .and_then(|delay| delay.attr("stamp"))
    {
        return DateTime::parse_from_rfc3339(stamp)
            .ok()
            .map(|stamp| stamp.with_timezone(&Utc));
    }

    let stamp = stanza.child("x", ns::LEGACY_DELAY)?.attr("stamp")?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn caps_hash(stanza: &Stanza) -> Option<String> {
    stanza
        .child("c", ns::CAPS)
        .and_then(|caps| caps.attr("ver"))
        .map(str::to_string)
}

/// `(id, method, url)` of an HTTP auth confirmation request.
pub fn http_auth_request(stanza: &Stanza) -> Option<(String, String, String)> {
    let confirm = stanza.child("confirm", ns::HTTP_AUTH)?;
    Some((
        confirm.attr("id")?.to_string(),
        confirm.attr("method").unwrap_or("GET").to_string(),
        confirm.attr("url").unwrap_or_default().to_string(),
    ))
}
