//! Inbound stanza handlers, registered on every successful connect.

use chrono::{DateTime, Local, SecondsFormat, Utc};
use tracing::{debug, warn};

use tern_core::contact::{bare_jid, resource_part};
use tern_core::event::EventPayload;
use tern_security::PgpRequest;
use tern_storage::LogKind;
use tern_xmpp::{
    Disposition, HandlerError, RequestKind, StanzaKind, StanzaRouter, StanzaType, ns, outbound,
    payload, Stanza,
};

use crate::context::{ConnectionContext, IncomingDraft, PgpContext, now};
use crate::responses;

pub(crate) const CLIENT_NAME: &str = "Tern";

/// Features announced in our disco#info replies.
const FEATURES: &[&str] = &[
    ns::DISCO_INFO,
    ns::VERSION,
    ns::TIME,
    ns::LAST,
    ns::PING,
    ns::RECEIPTS,
    ns::HTTP_AUTH,
    ns::MUC,
    ns::ENCRYPTED,
    ns::SIGNED,
];

type HandlerResult = Result<Disposition, HandlerError>;

fn handler_error(error: impl std::fmt::Display) -> HandlerError {
    HandlerError::new(error.to_string())
}

/// Install every handler, the catch-all and the liveness observer.
/// Registration order is dispatch order.
pub(crate) fn register(router: &mut StanzaRouter<ConnectionContext>) {
    router.clear();

    router.register(
        StanzaKind::Iq,
        StanzaType::of(&["result", "error"]),
        None,
        Box::new(on_iq_response),
    );
    router.register(
        StanzaKind::Iq,
        StanzaType::of(&["set"]),
        Some(ns::ROSTER),
        Box::new(on_roster_push),
    );
    router.register(StanzaKind::Iq, StanzaType::of(&["get"]), Some(ns::PING), Box::new(on_ping));
    router.register(
        StanzaKind::Iq,
        StanzaType::of(&["get"]),
        Some(ns::VERSION),
        Box::new(on_version),
    );
    router.register(StanzaKind::Iq, StanzaType::of(&["get"]), Some(ns::TIME), Box::new(on_time));
    router.register(
        StanzaKind::Iq,
        StanzaType::of(&["get"]),
        Some(ns::LAST),
        Box::new(on_last_activity),
    );
    router.register(
        StanzaKind::Iq,
        StanzaType::of(&["get"]),
        Some(ns::DISCO_INFO),
        Box::new(on_disco_info),
    );
    router.register(
        StanzaKind::Message,
        StanzaType::Any,
        Some(ns::HTTP_AUTH),
        Box::new(on_http_auth),
    );
    router.register(
        StanzaKind::Iq,
        StanzaType::of(&["get", "set"]),
        Some(ns::HTTP_AUTH),
        Box::new(on_http_auth),
    );
    router.register(StanzaKind::Presence, StanzaType::Any, None, Box::new(on_presence));
    router.register(StanzaKind::Message, StanzaType::Any, None, Box::new(on_message));

    router.set_catch_all(Box::new(on_unclaimed));
    router.set_raw_observer(Box::new(|ctx: &mut ConnectionContext, _: &Stanza| {
        ctx.last_inbound = Some(now());
    }));
}

fn on_iq_response(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let Some(id) = stanza.id() else {
        return Ok(Disposition::NotConsumed);
    };
    let Some((kind, target)) = ctx.pending.peek(id) else {
        debug!(account = %ctx.account, id, "response ignored");
        return Ok(Disposition::NotConsumed);
    };
    if !answered_by_addressee(ctx, kind, target, stanza.from()) {
        warn!(
            account = %ctx.account,
            id,
            from = stanza.from().unwrap_or_default(),
            expected = %target,
            "response from an unexpected sender ignored"
        );
        return Ok(Disposition::NotConsumed);
    }
    let (kind, target) = ctx.pending.resolve(id).map_err(handler_error)?;

    if stanza.stanza_type() == "error" {
        responses::failed(ctx, kind, &target, stanza);
    } else {
        responses::answered(ctx, kind, &target, stanza)?;
    }
    Ok(Disposition::Consumed)
}

/// Whether `from` may answer a request of `kind` sent to `target`. Our own
/// server answers for the account with no `from`, the bare JID or the domain.
fn answered_by_addressee(
    ctx: &ConnectionContext,
    kind: RequestKind,
    target: &str,
    from: Option<&str>,
) -> bool {
    let own = ctx.own_bare_jid();
    let host = ctx.settings.hostname.as_str();
    let for_account = matches!(
        kind,
        RequestKind::Roster | RequestKind::RosterUpdate | RequestKind::VCardPublish
    ) || target == own
        || target == host;
    let from_account = from.is_none_or(|from| from == own || from == host);
    if for_account && from_account {
        return true;
    }

    from.is_some_and(|from| {
        from == target || (resource_part(target).is_none() && bare_jid(from) == target)
    })
}

fn on_roster_push(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    if let Some(from) = stanza.from() {
        if bare_jid(from) != ctx.own_bare_jid() {
            warn!(account = %ctx.account, from, "roster push from a foreign entity ignored");
            return Ok(Disposition::Consumed);
        }
    }
    let Some(query) = stanza.child("query", ns::ROSTER) else {
        return Ok(Disposition::NotConsumed);
    };

    for entry in payload::roster_items(query).map_err(handler_error)? {
        let event = ctx.presence.apply_roster_push(entry).map_err(handler_error)?;
        ctx.emit(event);
    }
    if let Some(id) = stanza.id() {
        ctx.send(outbound::iq_result(stanza.from(), id, None));
    }
    Ok(Disposition::Consumed)
}

fn on_ping(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let Some(id) = stanza.id() else {
        return Ok(Disposition::NotConsumed);
    };
    ctx.send(outbound::iq_result(stanza.from(), id, None));
    Ok(Disposition::Consumed)
}

fn on_version(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let Some(id) = stanza.id() else {
        return Ok(Disposition::NotConsumed);
    };
    ctx.send(outbound::version_result(
        stanza.from(),
        id,
        CLIENT_NAME,
        env!("CARGO_PKG_VERSION"),
        Some(std::env::consts::OS),
    ));
    Ok(Disposition::Consumed)
}

fn on_time(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let Some(id) = stanza.id() else {
        return Ok(Disposition::NotConsumed);
    };
    let utc = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let tzo = Local::now().format("%:z").to_string();
    ctx.send(outbound::time_result(stanza.from(), id, &utc, &tzo));
    Ok(Disposition::Consumed)
}

fn on_last_activity(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let Some(id) = stanza.id() else {
        return Ok(Disposition::NotConsumed);
    };
    let idle = now().saturating_duration_since(ctx.last_activity).as_secs();
    ctx.send(outbound::last_activity_result(stanza.from(), id, idle));
    Ok(Disposition::Consumed)
}

fn on_disco_info(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let Some(id) = stanza.id() else {
        return Ok(Disposition::NotConsumed);
    };
    let node = stanza
        .child("query", ns::DISCO_INFO)
        .and_then(|query| query.attr("node"));
    ctx.send(outbound::disco_info_result(
        stanza.from(),
        id,
        node,
        ("client", "pc", CLIENT_NAME),
        FEATURES,
    ));
    Ok(Disposition::Consumed)
}

fn on_http_auth(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let Some((id, method, url)) = payload::http_auth_request(stanza) else {
        return Ok(Disposition::NotConsumed);
    };
    let jid = stanza.from().unwrap_or_default().to_string();
    debug!(account = %ctx.account, jid = %jid, id = %id, "HTTP auth requested");
    ctx.http_auth.insert(id.clone(), stanza.clone());
    ctx.emit(EventPayload::HttpAuth {
        jid,
        id,
        method,
        url,
    });
    Ok(Disposition::Consumed)
}

fn on_presence(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let outcome = ctx
        .presence
        .handle_presence(stanza, now())
        .map_err(handler_error)?;
    ctx.apply_presence(outcome);
    Ok(Disposition::Consumed)
}

fn on_message(ctx: &mut ConnectionContext, stanza: &Stanza) -> HandlerResult {
    let Some(from) = stanza.from().map(str::to_string) else {
        debug!(account = %ctx.account, "message without a sender dropped");
        return Ok(Disposition::Consumed);
    };
    let delay = payload::delay_timestamp(stanza);
    let timestamp = delay.unwrap_or_else(Utc::now);

    match stanza.stanza_type() {
        "error" => {
            message_error(ctx, stanza, from, timestamp);
            return Ok(Disposition::Consumed);
        }
        "groupchat" => {
            groupchat_message(ctx, stanza, from, timestamp, delay.is_some());
            return Ok(Disposition::Consumed);
        }
        _ => {}
    }

    if let Some(received) = stanza.child("received", ns::RECEIPTS) {
        let message_id = received.attr("id").or(stanza.id()).unwrap_or_default();
        ctx.emit(EventPayload::Receipt {
            jid: from.clone(),
            message_id: message_id.to_string(),
        });
    }
    if stanza.child("request", ns::RECEIPTS).is_some() {
        answer_receipt(ctx, stanza, &from);
    }

    let thread = stanza.thread();
    if is_session_terminate(stanza) {
        if let Some(session) = ctx.sessions.find(&from, thread.as_deref()) {
            ctx.sessions.terminate(session, false);
        }
        return Ok(Disposition::Consumed);
    }

    let draft = IncomingDraft {
        from,
        message_id: stanza.id().map(str::to_string),
        message_type: stanza.stanza_type().to_string(),
        subject: stanza.subject(),
        thread,
        timestamp,
    };

    if let Some(encrypted) = stanza.child("x", ns::ENCRYPTED) {
        if let Some(key_id) = ctx.signing_key().map(str::to_string) {
            ctx.submit(
                PgpContext::Incoming(draft),
                PgpRequest::Decrypt {
                    ciphertext: encrypted.text(),
                    key_id,
                },
            );
            return Ok(Disposition::Consumed);
        }
        debug!(account = %ctx.account, jid = %draft.from, "encrypted message without a usable key");
    }

    match stanza.body() {
        Some(body) if !body.is_empty() => ctx.deliver(draft, body, false),
        _ if draft.subject.is_some() => ctx.deliver(draft, String::new(), false),
        _ => debug!(account = %ctx.account, jid = %draft.from, "message without a body"),
    }
    Ok(Disposition::Consumed)
}

fn message_error(ctx: &mut ConnectionContext, stanza: &Stanza, from: String, timestamp: DateTime<Utc>) {
    let details = stanza.error().unwrap_or_default();
    let text = details.text.or(details.condition).unwrap_or_default();
    let peer = ctx.history_peer(&from);
    ctx.log(LogKind::Error, &peer, text.clone(), timestamp);
    ctx.emit(EventPayload::MsgError {
        jid: from,
        code: details.code,
        text,
        body: stanza.body(),
        timestamp,
    });
}

fn groupchat_message(
    ctx: &mut ConnectionContext,
    stanza: &Stanza,
    from: String,
    timestamp: DateTime<Utc>,
    delayed: bool,
) {
    let room = bare_jid(&from).to_string();
    if let Some(subject) = stanza.subject() {
        ctx.emit(EventPayload::GcSubject {
            room: room.clone(),
            subject,
        });
    }
    let Some(body) = stanza.body() else {
        return;
    };

    // Delayed lines are the room's own history replay.
    if !delayed {
        let line = match resource_part(&from) {
            Some(nick) => format!("{nick}: {body}"),
            None => body.clone(),
        };
        ctx.log(LogKind::Gc, &room, line, timestamp);
    }
    ctx.emit(EventPayload::GcMsg {
        jid: from,
        body,
        timestamp,
    });
}

/// Receipts go only to peers allowed to see our presence, or to occupants
/// of a room we are in.
fn answer_receipt(ctx: &mut ConnectionContext, stanza: &Stanza, from: &str) {
    if !ctx.settings.answer_receipts {
        return;
    }
    let Some(id) = stanza.id() else {
        return;
    };
    let allowed = ctx.sessions.is_pm_peer(from)
        || ctx
            .registry()
            .contact(&ctx.account, bare_jid(from))
            .is_some_and(|contact| contact.subscription.shares_our_presence());
    if !allowed {
        debug!(account = %ctx.account, jid = from, "receipt request from a stranger ignored");
        return;
    }

    match outbound::receipt(from, id, stanza.thread().as_deref()) {
        Ok(receipt) => ctx.send(receipt),
        Err(error) => warn!(account = %ctx.account, error = %error, "cannot answer receipt request"),
    }
}

fn is_session_terminate(stanza: &Stanza) -> bool {
    let Some(form) = stanza
        .child("feature", ns::FEATURE_NEG)
        .and_then(|feature| feature.get_child("x", "jabber:x:data"))
    else {
        return false;
    };
    form.children()
        .filter(|field| field.name() == "field" && field.attr("var") == Some("terminate"))
        .filter_map(|field| field.get_child("value", "jabber:x:data"))
        .any(|value| matches!(value.text().trim(), "1" | "true"))
}

fn on_unclaimed(ctx: &mut ConnectionContext, stanza: &Stanza) {
    if stanza.kind() != StanzaKind::Iq || !matches!(stanza.stanza_type(), "get" | "set") {
        return;
    }
    if let Some(id) = stanza.id() {
        ctx.send(outbound::service_unavailable(stanza.from(), id));
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tern_core::contact::Subscription;
    use tern_core::event::RosterEntry;
    use tracing_test::traced_test;

    use super::*;
    use crate::context::tests::context;

    fn router() -> StanzaRouter<ConnectionContext> {
        let mut router = StanzaRouter::new();
        register(&mut router);
        router
    }

    fn parse(xml: &str) -> Stanza {
        Stanza::parse(xml.as_bytes()).expect("test stanza")
    }

    fn with_contact(ctx: &mut ConnectionContext, jid: &str, subscription: Subscription) {
        ctx.presence
            .apply_roster(&[RosterEntry {
                jid: jid.to_string(),
                name: None,
                subscription: Some(subscription),
                ask: None,
                groups: Vec::new(),
            }])
            .expect("roster stored");
    }

    #[test]
    #[traced_test]
    fn unknown_response_emits_nothing() {
        let router = router();
        let mut ctx = context();
        let outcome = router.dispatch(
            &mut ctx,
            &parse("<iq xmlns='jabber:client' type='result' id='never-issued' from='example.com'/>"),
        );

        assert!(!outcome.consumed());
        assert!(outcome.error.is_none());
        assert!(ctx.take_effects().is_empty());
        assert!(logs_contain("response ignored"));
    }

    #[test]
    fn pong_resolves_the_request() {
        let router = router();
        let mut ctx = context();
        let id = ctx
            .request(RequestKind::Ping, "example.com", |id| outbound::ping(id, "example.com"))
            .unwrap();
        let _ = ctx.take_effects();

        let reply = format!("<iq xmlns='jabber:client' type='result' id='{id}' from='example.com'/>");
        assert!(router.dispatch(&mut ctx, &parse(&reply)).consumed());
        assert_eq!(
            ctx.take_effects().events,
            vec![EventPayload::Pong {
                jid: "example.com".into()
            }]
        );

        assert!(!router.dispatch(&mut ctx, &parse(&reply)).consumed());
        assert!(ctx.take_effects().events.is_empty());
    }

    #[test]
    fn result_from_someone_else_leaves_the_request_pending() {
        let router = router();
        let mut ctx = context();
        let id = ctx
            .request(RequestKind::Version, "alice@example.com/home", |id| {
                outbound::version_get(id, "alice@example.com/home")
            })
            .unwrap();
        let _ = ctx.take_effects();

        let forged = format!(
            "<iq xmlns='jabber:client' type='result' id='{id}' from='mallory@example.net/x'>\
             <query xmlns='jabber:iq:version'><name>Forged</name></query></iq>"
        );
        assert!(!router.dispatch(&mut ctx, &parse(&forged)).consumed());
        assert!(ctx.take_effects().events.is_empty());
        assert_eq!(ctx.pending.kind_of(&id), Some(RequestKind::Version));

        let genuine = format!(
            "<iq xmlns='jabber:client' type='result' id='{id}' from='alice@example.com/home'>\
             <query xmlns='jabber:iq:version'><name>Gajim</name></query></iq>"
        );
        assert!(router.dispatch(&mut ctx, &parse(&genuine)).consumed());
        assert_matches!(
            ctx.take_effects().events.as_slice(),
            [EventPayload::OsInfo { jid, name: Some(name), .. }]
                if jid == "alice@example.com/home" && name == "Gajim"
        );
    }

    #[test]
    fn roster_result_is_only_taken_from_our_server() {
        let router = router();
        let mut ctx = context();
        ctx.request_roster();
        let id = ctx.take_effects().outbox[0].id().unwrap().to_string();

        let forged = format!(
            "<iq xmlns='jabber:client' type='result' id='{id}' from='alice@example.com/home'>\
             <query xmlns='jabber:iq:roster'>\
             <item jid='mallory@example.net' subscription='both'/></query></iq>"
        );
        assert!(!router.dispatch(&mut ctx, &parse(&forged)).consumed());
        assert!(ctx.registry().contact("work", "mallory@example.net").is_none());

        let genuine = format!(
            "<iq xmlns='jabber:client' type='result' id='{id}'>\
             <query xmlns='jabber:iq:roster'>\
             <item jid='alice@example.com' subscription='both'/></query></iq>"
        );
        assert!(router.dispatch(&mut ctx, &parse(&genuine)).consumed());
        assert!(ctx.registry().contact("work", "alice@example.com").is_some());
        assert!(ctx.pending.is_empty());
    }

    #[test]
    fn unsupported_queries_get_service_unavailable() {
        let router = router();
        let mut ctx = context();
        router.dispatch(
            &mut ctx,
            &parse(
                "<iq xmlns='jabber:client' type='get' id='u1' from='alice@example.com/home'>\
                 <query xmlns='urn:example:unsupported'/></iq>",
            ),
        );

        let outbox = ctx.take_effects().outbox;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].stanza_type(), "error");
        assert_eq!(outbox[0].id(), Some("u1"));
        assert_eq!(
            outbox[0].error().and_then(|error| error.condition).as_deref(),
            Some("service-unavailable")
        );
    }

    #[test]
    fn version_query_is_answered() {
        let router = router();
        let mut ctx = context();
        router.dispatch(
            &mut ctx,
            &parse(
                "<iq xmlns='jabber:client' type='get' id='v1' from='alice@example.com/home'>\
                 <query xmlns='jabber:iq:version'/></iq>",
            ),
        );

        let outbox = ctx.take_effects().outbox;
        let version = payload::software_version(outbox[0].payload().expect("query"));
        assert_eq!(version.name.as_deref(), Some(CLIENT_NAME));
        assert_eq!(version.version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn roster_push_from_the_server_is_applied() {
        let router = router();
        let mut ctx = context();
        router.dispatch(
            &mut ctx,
            &parse(
                "<iq xmlns='jabber:client' type='set' id='push1'>\
                 <query xmlns='jabber:iq:roster'>\
                 <item jid='carol@example.com' subscription='to' name='Carol'/>\
                 </query></iq>",
            ),
        );

        let effects = ctx.take_effects();
        assert_matches!(
            &effects.events[..],
            [EventPayload::RosterInfo { entry }] if entry.jid == "carol@example.com"
        );
        assert_eq!(effects.outbox[0].stanza_type(), "result");
        assert!(ctx.registry().contact("work", "carol@example.com").is_some());
    }

    #[test]
    fn roster_push_from_a_stranger_is_ignored() {
        let router = router();
        let mut ctx = context();
        router.dispatch(
            &mut ctx,
            &parse(
                "<iq xmlns='jabber:client' type='set' id='push2' from='mallory@evil.example'>\
                 <query xmlns='jabber:iq:roster'><item jid='mallory@evil.example'/></query></iq>",
            ),
        );

        assert!(ctx.take_effects().is_empty());
        assert!(ctx.registry().contact("work", "mallory@evil.example").is_none());
    }

    #[test]
    fn receipts_are_answered_for_contacts_sharing_presence() {
        let router = router();
        let mut ctx = context();
        with_contact(&mut ctx, "alice@example.com", Subscription::Both);

        router.dispatch(
            &mut ctx,
            &parse(
                "<message xmlns='jabber:client' type='chat' id='m3' from='alice@example.com/home'>\
                 <body>ping?</body><thread>th-3</thread>\
                 <request xmlns='urn:xmpp:receipts'/></message>",
            ),
        );

        let effects = ctx.take_effects();
        let receipt = &effects.outbox[0];
        assert_eq!(receipt.to(), Some("alice@example.com/home"));
        assert_eq!(receipt.id(), Some("m3"));
        assert_eq!(receipt.thread().as_deref(), Some("th-3"));
        assert_eq!(
            receipt.child("received", ns::RECEIPTS).and_then(|r| r.attr("id")),
            Some("m3")
        );
        assert_matches!(&effects.events[..], [EventPayload::Msg { .. }]);
    }

    #[test]
    fn receipts_are_not_answered_for_strangers() {
        let router = router();
        let mut ctx = context();
        with_contact(&mut ctx, "alice@example.com", Subscription::To);

        router.dispatch(
            &mut ctx,
            &parse(
                "<message xmlns='jabber:client' type='chat' id='m4' from='alice@example.com/home'>\
                 <body>ping?</body><request xmlns='urn:xmpp:receipts'/></message>",
            ),
        );

        assert!(ctx.take_effects().outbox.is_empty());
    }

    #[test]
    fn encrypted_message_goes_to_the_worker() {
        let router = router();
        let mut ctx = crate::context::tests::context_with(
            r#"
            [accounts.work]
            hostname = "example.com"
            login = "bob"
            keyid = "0123456789ABCDEF"
            "#,
        );

        router.dispatch(
            &mut ctx,
            &parse(
                "<message xmlns='jabber:client' type='chat' id='m2' from='alice@example.com/home'>\
                 <body>[this message is encrypted]</body>\
                 <x xmlns='jabber:x:encrypted'>hQEMA5vMIl</x></message>",
            ),
        );

        let effects = ctx.take_effects();
        assert!(effects.events.is_empty());
        assert_matches!(
            &effects.security[..],
            [(PgpContext::Incoming(draft), PgpRequest::Decrypt { ciphertext, key_id })]
                if draft.from == "alice@example.com/home"
                    && ciphertext == "hQEMA5vMIl"
                    && key_id == "0123456789ABCDEF"
        );
    }

    #[test]
    fn session_terminate_ends_the_thread() {
        let router = router();
        let mut ctx = context();
        let session = ctx.sessions.receive("alice@example.com/home", Some("th-9"));

        router.dispatch(
            &mut ctx,
            &parse(
                "<message xmlns='jabber:client' type='normal' from='alice@example.com/home'>\
                 <thread>th-9</thread>\
                 <feature xmlns='http://jabber.org/protocol/feature-neg'>\
                 <x xmlns='jabber:x:data' type='submit'>\
                 <field var='FORM_TYPE'><value>urn:xmpp:ssn</value></field>\
                 <field var='terminate'><value>1</value></field>\
                 </x></feature></message>",
            ),
        );

        assert!(ctx.sessions.get(session).is_none());
        assert!(ctx.take_effects().events.is_empty());
    }

    #[test]
    fn groupchat_subject_and_body() {
        let router = router();
        let mut ctx = context();
        router.dispatch(
            &mut ctx,
            &parse(
                "<message xmlns='jabber:client' type='groupchat' from='lounge@conference.example.com/carol'>\
                 <subject>Release day</subject><body>hello all</body></message>",
            ),
        );

        let effects = ctx.take_effects();
        assert_matches!(
            &effects.events[..],
            [EventPayload::GcSubject { room, .. }, EventPayload::GcMsg { jid, body, .. }]
                if room == "lounge@conference.example.com"
                    && jid == "lounge@conference.example.com/carol"
                    && body == "hello all"
        );
        assert_eq!(effects.history[0].text, "carol: hello all");
    }

    #[test]
    fn message_errors_are_reported() {
        let router = router();
        let mut ctx = context();
        router.dispatch(
            &mut ctx,
            &parse(
                "<message xmlns='jabber:client' type='error' from='nobody@example.com'>\
                 <body>hi</body><error code='404' type='cancel'>\
                 <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></message>",
            ),
        );

        assert_matches!(
            &ctx.take_effects().events[..],
            [EventPayload::MsgError { jid, code: Some(code), text, body: Some(body), .. }]
                if jid == "nobody@example.com" && code == "404" && text == "item-not-found" && body == "hi"
        );
    }

    #[test]
    fn http_auth_requests_are_kept_for_the_answer() {
        let router = router();
        let mut ctx = context();
        router.dispatch(
            &mut ctx,
            &parse(
                "<iq xmlns='jabber:client' type='get' id='ha1' from='files.example.com'>\
                 <confirm xmlns='http://jabber.org/protocol/http-auth' id='a7374jnjlalasdf82' \
                 method='GET' url='https://files.example.com/secret'/></iq>",
            ),
        );

        assert_matches!(
            &ctx.take_effects().events[..],
            [EventPayload::HttpAuth { id, method, .. }] if id == "a7374jnjlalasdf82" && method == "GET"
        );
        assert!(ctx.http_auth.contains_key("a7374jnjlalasdf82"));
    }

    #[test]
    fn inbound_stanzas_refresh_liveness() {
        let router = router();
        let mut ctx = context();
        assert!(ctx.last_inbound.is_none());
        router.dispatch(&mut ctx, &parse("<presence xmlns='jabber:client' from='alice@example.com/home'/>"));
        assert!(ctx.last_inbound.is_some());
    }
}
