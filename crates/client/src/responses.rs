//! Turning answers to our own requests into events.

use serde_json::json;
use tracing::debug;

use tern_core::event::EventPayload;
use tern_xmpp::{HandlerError, RequestKind, Stanza, ns, payload};

use crate::context::ConnectionContext;

/// Report an error response to a pending request of `kind` sent to `target`.
pub(crate) fn failed(ctx: &mut ConnectionContext, kind: RequestKind, target: &str, stanza: &Stanza) {
    let details = stanza.error().unwrap_or_default();
    debug!(
        account = %ctx.account,
        request = kind.as_str(),
        target,
        condition = ?details.condition,
        "request failed"
    );

    // A contact without a vCard still gets a (blank) card.
    if kind == RequestKind::VCard {
        ctx.emit(EventPayload::Vcard {
            jid: target.to_string(),
            fields: json!({}),
        });
        return;
    }

    ctx.emit(EventPayload::IqError {
        jid: target.to_string(),
        request: kind.as_str().to_string(),
        condition: details
            .condition
            .unwrap_or_else(|| "undefined-condition".to_string()),
        text: details.text,
    });
}

/// Report a result response to a pending request of `kind` sent to `target`.
pub(crate) fn answered(
    ctx: &mut ConnectionContext,
    kind: RequestKind,
    target: &str,
    stanza: &Stanza,
) -> Result<(), HandlerError> {
    let jid = target.to_string();
    let payload = stanza.payload();

    let event = match kind {
        RequestKind::Roster => {
            let items = match stanza.child("query", ns::ROSTER) {
                Some(query) => payload::roster_items(query)
                    .map_err(|error| HandlerError::new(error.to_string()))?,
                None => Vec::new(),
            };
            ctx.presence
                .apply_roster(&items)
                .map_err(|error| HandlerError::new(error.to_string()))?;
            EventPayload::Roster {
                connected: true,
                items: ctx.presence.roster_snapshot(),
            }
        }
        RequestKind::VCard => EventPayload::Vcard {
            jid,
            fields: stanza
                .child("vCard", ns::VCARD)
                .map(payload::vcard_fields)
                .unwrap_or_else(|| json!({})),
        },
        RequestKind::DiscoItems => {
            let query = stanza.child("query", ns::DISCO_ITEMS);
            EventPayload::DiscoItems {
                jid,
                node: query.and_then(|query| query.attr("node")).map(str::to_string),
                items: query.map(payload::disco_items).unwrap_or_default(),
            }
        }
        RequestKind::DiscoInfo => {
            let (identities, features) = stanza
                .child("query", ns::DISCO_INFO)
                .map(payload::disco_info)
                .unwrap_or_default();
            EventPayload::DiscoInfo {
                jid,
                identities,
                features,
            }
        }
        RequestKind::Version => {
            let version = stanza
                .child("query", ns::VERSION)
                .map(payload::software_version)
                .unwrap_or_default();
            EventPayload::OsInfo {
                jid,
                name: version.name,
                version: version.version,
                os: version.os,
            }
        }
        RequestKind::LastActivity => {
            let (seconds, status) = stanza
                .child("query", ns::LAST)
                .and_then(payload::last_activity)
                .unwrap_or((0, None));
            EventPayload::LastStatusTime {
                jid,
                seconds,
                status,
            }
        }
        RequestKind::Time => {
            let (utc, tzo) = stanza
                .child("time", ns::TIME)
                .map(payload::entity_time)
                .unwrap_or_default();
            EventPayload::EntityTime { jid, utc, tzo }
        }
        RequestKind::Ping => EventPayload::Pong { jid },
        RequestKind::RegistrationInfo => {
            let (instructions, fields) = stanza
                .child("query", ns::REGISTER)
                .map(payload::registration_form)
                .unwrap_or_default();
            EventPayload::RegAgentInfo {
                agent: jid,
                instructions,
                fields,
            }
        }
        RequestKind::AgentRemove => EventPayload::AgentRemoved { agent: jid },
        RequestKind::VCardPublish
        | RequestKind::RosterUpdate
        | RequestKind::RoomAdmin
        | RequestKind::PasswordChange => {
            debug!(
                account = %ctx.account,
                request = kind.as_str(),
                target,
                has_payload = payload.is_some(),
                "request acknowledged"
            );
            return Ok(());
        }
    };

    ctx.emit(event);
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tern_core::contact::Subscription;

    use super::*;
    use crate::context::tests::context;

    fn parse(xml: &str) -> Stanza {
        Stanza::parse(xml.as_bytes()).expect("test stanza")
    }

    #[test]
    fn roster_result_is_stored_and_published() {
        let mut ctx = context();
        answered(
            &mut ctx,
            RequestKind::Roster,
            "bob@example.com",
            &parse(
                "<iq xmlns='jabber:client' type='result' id='work-1'>\
                 <query xmlns='jabber:iq:roster'>\
                 <item jid='alice@example.com' subscription='both' name='Alice'/>\
                 </query></iq>",
            ),
        )
        .unwrap();

        assert_matches!(
            &ctx.take_effects().events[..],
            [EventPayload::Roster { connected: true, items }]
                if items.len() == 1 && items[0].subscription == Some(Subscription::Both)
        );
    }

    #[test]
    fn missing_vcard_reads_as_empty() {
        let mut ctx = context();
        failed(
            &mut ctx,
            RequestKind::VCard,
            "alice@example.com",
            &parse(
                "<iq xmlns='jabber:client' type='error' id='work-2' from='alice@example.com'>\
                 <error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
            ),
        );

        assert_eq!(
            ctx.take_effects().events,
            vec![EventPayload::Vcard {
                jid: "alice@example.com".into(),
                fields: json!({}),
            }]
        );
    }

    #[test]
    fn other_errors_name_the_request() {
        let mut ctx = context();
        failed(
            &mut ctx,
            RequestKind::Version,
            "alice@example.com/home",
            &parse(
                "<iq xmlns='jabber:client' type='error' id='work-3'>\
                 <error type='cancel'><feature-not-implemented xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
            ),
        );

        assert_matches!(
            &ctx.take_effects().events[..],
            [EventPayload::IqError { request, condition, .. }]
                if request == "version" && condition == "feature-not-implemented"
        );
    }

    #[test]
    fn last_activity_and_registration_forms() {
        let mut ctx = context();
        answered(
            &mut ctx,
            RequestKind::LastActivity,
            "alice@example.com",
            &parse(
                "<iq xmlns='jabber:client' type='result' id='work-4'>\
                 <query xmlns='jabber:iq:last' seconds='903'>Heading home</query></iq>",
            ),
        )
        .unwrap();
        answered(
            &mut ctx,
            RequestKind::RegistrationInfo,
            "icq.example.com",
            &parse(
                "<iq xmlns='jabber:client' type='result' id='work-5'>\
                 <query xmlns='jabber:iq:register'>\
                 <instructions>Enter your UIN</instructions><username/><password/>\
                 </query></iq>",
            ),
        )
        .unwrap();

        let events = ctx.take_effects().events;
        assert_matches!(
            &events[0],
            EventPayload::LastStatusTime { seconds: 903, status: Some(status), .. } if status == "Heading home"
        );
        assert_matches!(
            &events[1],
            EventPayload::RegAgentInfo { agent, instructions: Some(_), fields }
                if agent == "icq.example.com" && fields.contains_key("username")
        );
    }

    #[test]
    fn acknowledgements_stay_quiet() {
        let mut ctx = context();
        answered(
            &mut ctx,
            RequestKind::RosterUpdate,
            "alice@example.com",
            &parse("<iq xmlns='jabber:client' type='result' id='work-6'/>"),
        )
        .unwrap();
        assert!(ctx.take_effects().is_empty());
    }
}
