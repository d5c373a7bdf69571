//! Namespaces the core reads or writes.

pub const CLIENT: &str = "jabber:client";
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

pub const ROSTER: &str = "jabber:iq:roster";
pub const REGISTER: &str = "jabber:iq:register";
pub const VERSION: &str = "jabber:iq:version";
pub const LAST: &str = "jabber:iq:last";
pub const TIME: &str = "urn:xmpp:time";
pub const PING: &str = "urn:xmpp:ping";
pub const VCARD: &str = "vcard-temp";
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
pub const HTTP_AUTH: &str = "http://jabber.org/protocol/http-auth";
pub const CAPS: &str = "http://jabber.org/protocol/caps";
pub const DELAY: &str = "urn:xmpp:delay";
pub const LEGACY_DELAY: &str = "jabber:x:delay";
pub const RECEIPTS: &str = "urn:xmpp:receipts";
pub const FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";
pub const SESSION_NEGOTIATION: &str = "urn:xmpp:ssn";

pub const MUC: &str = "http://jabber.org/protocol/muc";
pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub const MUC_ADMIN: &str = "http://jabber.org/protocol/muc#admin";

pub const ENCRYPTED: &str = "jabber:x:encrypted";
pub const SIGNED: &str = "jabber:x:signed";
