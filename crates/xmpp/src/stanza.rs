use std::str::FromStr;

use minidom::Element;

use crate::error::StanzaError;
use crate::ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn name(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }

    /// The `type` a stanza of this kind has when the attribute is absent.
    pub fn default_type(&self) -> &'static str {
        match self {
            StanzaKind::Message => "normal",
            StanzaKind::Presence => "available",
            StanzaKind::Iq => "",
        }
    }
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One top-level `message`, `presence` or `iq` element.
///
/// The element is kept as parsed so handlers can read any extension payload;
/// the accessors below cover the attributes and children the core keys on.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    element: Element,
}

/// Error details carried by a stanza of type `error`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetails {
    pub code: Option<String>,
    pub condition: Option<String>,
    pub text: Option<String>,
}

impl Stanza {
    /// Wrap an element built locally; callers guarantee it is well-formed.
    pub(crate) fn built(kind: StanzaKind, element: Element) -> Self {
        Self { kind, element }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, StanzaError> {
        parse_stanza(raw)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StanzaError> {
        serialize_stanza(self)
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    /// The `type` attribute, falling back to the kind's default.
    pub fn stanza_type(&self) -> &str {
        self.element
            .attr("type")
            .unwrap_or_else(|| self.kind.default_type())
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn from(&self) -> Option<&str> {
        self.element.attr("from")
    }

    pub fn to(&self) -> Option<&str> {
        self.element.attr("to")
    }

    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.element.get_child(name, namespace)
    }

    /// Whether any direct child lives in `namespace`.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.element
            .children()
            .any(|child| child.ns() == namespace)
    }

    /// First child element that is not an `error`; the query of an `iq`.
    pub fn payload(&self) -> Option<&Element> {
        self.element.children().find(|child| child.name() != "error")
    }

    pub fn body(&self) -> Option<String> {
        self.text_child("body")
    }

    pub fn subject(&self) -> Option<String> {
        self.text_child("subject")
    }

    pub fn thread(&self) -> Option<String> {
        self.text_child("thread").filter(|thread| !thread.is_empty())
    }

    pub fn status(&self) -> Option<String> {
        self.text_child("status")
    }

    pub fn show(&self) -> Option<String> {
        self.text_child("show")
    }

    /// Presence priority; missing or malformed values read as 0.
    pub fn priority(&self) -> i8 {
        self.text_child("priority")
            .and_then(|text| text.trim().parse::<i8>().ok())
            .unwrap_or(0)
    }

    pub fn error(&self) -> Option<ErrorDetails> {
        let error = self
            .element
            .children()
            .find(|child| child.name() == "error")?;

        let condition = error
            .children()
            .find(|child| child.ns() == ns::STANZAS && child.name() != "text")
            .map(|child| child.name().to_string());
        let text = error
            .get_child("text", ns::STANZAS)
            .map(Element::text)
            .or_else(|| {
                let legacy = error.text();
                (!legacy.trim().is_empty()).then(|| legacy.trim().to_string())
            });

        Some(ErrorDetails {
            code: error.attr("code").map(str::to_string),
            condition,
            text,
        })
    }

    fn text_child(&self, name: &str) -> Option<String> {
        let namespace = self.element.ns();
        self.element.get_child(name, namespace.as_str()).map(Element::text)
    }
}

impl TryFrom<Element> for Stanza {
    type Error = StanzaError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        parse_stanza_element(element)
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        value.element
    }
}

pub fn parse_stanza(raw: &[u8]) -> Result<Stanza, StanzaError> {
    let xml = std::str::from_utf8(raw).map_err(|error| {
        StanzaError::ParseFailed(format!("invalid UTF-8 stanza bytes: {error}"))
    })?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(StanzaError::ParseFailed("stanza payload is empty".to_string()));
    }

    let element = Element::from_str(trimmed).map_err(|error| {
        StanzaError::ParseFailed(format!("failed to parse stanza XML: {error}"))
    })?;
    parse_stanza_element(element)
}

pub fn serialize_stanza(stanza: &Stanza) -> Result<Vec<u8>, StanzaError> {
    let mut payload = Vec::new();
    stanza.element.write_to(&mut payload).map_err(|error| {
        StanzaError::SerializeFailed(format!(
            "failed to serialize <{}/> stanza: {error}",
            stanza.name()
        ))
    })?;
    Ok(payload)
}

fn parse_stanza_element(element: Element) -> Result<Stanza, StanzaError> {
    let kind = match element.name() {
        "message" => StanzaKind::Message,
        "presence" => StanzaKind::Presence,
        "iq" => StanzaKind::Iq,
        other => {
            return Err(StanzaError::ParseFailed(format!(
                "unsupported stanza element <{other}/>"
            )));
        }
    };

    if kind == StanzaKind::Iq {
        match element.attr("type") {
            Some("get" | "set" | "result" | "error") => {}
            Some(other) => {
                return Err(StanzaError::ParseFailed(format!(
                    "invalid iq type {other:?}"
                )));
            }
            None => {
                return Err(StanzaError::ParseFailed("iq without type".to_string()));
            }
        }
        if element.attr("id").is_none() {
            return Err(StanzaError::ParseFailed("iq without id".to_string()));
        }
    }

    Ok(Stanza { kind, element })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const MESSAGE_XML: &str = "<message xmlns='jabber:client' type='chat' from='alice@example.com/phone' to='bob@example.com'><body>hello</body><thread>t-1</thread></message>";
    const PRESENCE_XML: &str = "<presence xmlns='jabber:client'><show>away</show><status>out</status><priority>5</priority></presence>";
    const IQ_XML: &str =
        "<iq xmlns='jabber:client' type='get' id='ping-1'><ping xmlns='urn:xmpp:ping'/></iq>";

    #[test]
    fn parses_message_stanza() {
        let stanza = parse_stanza(MESSAGE_XML.as_bytes()).expect("message stanza should parse");

        assert_eq!(stanza.kind(), StanzaKind::Message);
        assert_eq!(stanza.stanza_type(), "chat");
        assert_eq!(stanza.body().as_deref(), Some("hello"));
        assert_eq!(stanza.thread().as_deref(), Some("t-1"));
        assert_eq!(stanza.from(), Some("alice@example.com/phone"));
    }

    #[test]
    fn presence_defaults_to_available() {
        let stanza = parse_stanza(PRESENCE_XML.as_bytes()).expect("presence stanza should parse");

        assert_eq!(stanza.stanza_type(), "available");
        assert_eq!(stanza.show().as_deref(), Some("away"));
        assert_eq!(stanza.status().as_deref(), Some("out"));
        assert_eq!(stanza.priority(), 5);
    }

    #[test]
    fn malformed_priority_reads_as_zero() {
        let stanza = parse_stanza(
            b"<presence xmlns='jabber:client'><priority>lots</priority></presence>",
        )
        .unwrap();
        assert_eq!(stanza.priority(), 0);
    }

    #[test]
    fn parses_iq_stanza() {
        let stanza = parse_stanza(IQ_XML.as_bytes()).expect("iq stanza should parse");

        assert_eq!(stanza.kind(), StanzaKind::Iq);
        assert_eq!(stanza.id(), Some("ping-1"));
        assert!(stanza.has_namespace(ns::PING));
        assert_eq!(stanza.payload().map(Element::name), Some("ping"));
    }

    #[test]
    fn iq_requires_type_and_id() {
        assert_matches!(
            parse_stanza(b"<iq xmlns='jabber:client' id='a'/>"),
            Err(StanzaError::ParseFailed(_))
        );
        assert_matches!(
            parse_stanza(b"<iq xmlns='jabber:client' type='get'/>"),
            Err(StanzaError::ParseFailed(_))
        );
        assert_matches!(
            parse_stanza(b"<iq xmlns='jabber:client' type='poke' id='a'/>"),
            Err(StanzaError::ParseFailed(_))
        );
    }

    #[test]
    fn reads_modern_and_legacy_errors() {
        let modern = parse_stanza(
            b"<presence xmlns='jabber:client' type='error' from='room@muc.example.com/me'>\
              <error code='409' type='cancel'>\
              <conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
              <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>Nickname in use</text>\
              </error></presence>",
        )
        .unwrap();
        let details = modern.error().unwrap();
        assert_eq!(details.code.as_deref(), Some("409"));
        assert_eq!(details.condition.as_deref(), Some("conflict"));
        assert_eq!(details.text.as_deref(), Some("Nickname in use"));

        let legacy = parse_stanza(
            b"<message xmlns='jabber:client' type='error'><error code='404'>Not Found</error></message>",
        )
        .unwrap();
        let details = legacy.error().unwrap();
        assert_eq!(details.code.as_deref(), Some("404"));
        assert_eq!(details.condition, None);
        assert_eq!(details.text.as_deref(), Some("Not Found"));
    }

    #[test]
    fn parse_rejects_unknown_root_element() {
        let error = parse_stanza(b"<foo xmlns='jabber:client'/>").expect_err("must fail");
        assert!(
            error
                .to_string()
                .contains("unsupported stanza element <foo/>")
        );
    }

    #[test]
    fn parse_rejects_invalid_utf8() {
        let error = parse_stanza(&[0xFF, 0xFE]).expect_err("must fail");
        assert!(error.to_string().contains("invalid UTF-8 stanza bytes"));
    }

    #[test]
    fn serialized_stanzas_parse_back() {
        for raw in [MESSAGE_XML, PRESENCE_XML, IQ_XML] {
            let stanza = parse_stanza(raw.as_bytes()).expect("stanza should parse");
            let encoded = serialize_stanza(&stanza).expect("stanza should serialize");
            let decoded = parse_stanza(&encoded).expect("serialized stanza should parse");
            assert_eq!(decoded, stanza);
        }
    }
}
