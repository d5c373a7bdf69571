use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Availability of a contact resource, ordered from least to most available
/// the same way the legacy status list was (offline, error, online, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Show {
    Offline,
    Error,
    Online,
    Chat,
    Away,
    Xa,
    Dnd,
    Invisible,
}

impl Show {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Error => "error",
            Self::Online => "online",
            Self::Chat => "chat",
            Self::Away => "away",
            Self::Xa => "xa",
            Self::Dnd => "dnd",
            Self::Invisible => "invisible",
        }
    }

    /// `true` for the states that mean the resource is gone.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Offline | Self::Error)
    }
}

impl std::fmt::Display for Show {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Show {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(Self::Offline),
            "error" => Ok(Self::Error),
            "online" => Ok(Self::Online),
            "chat" => Ok(Self::Chat),
            "away" => Ok(Self::Away),
            "xa" => Ok(Self::Xa),
            "dnd" => Ok(Self::Dnd),
            "invisible" => Ok(Self::Invisible),
            other => Err(format!("unknown show value: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::To => "to",
            Self::From => "from",
            Self::Both => "both",
            Self::Remove => "remove",
        }
    }

    /// Whether the contact is allowed to see our presence.
    pub fn shares_our_presence(&self) -> bool {
        matches!(self, Self::From | Self::Both)
    }
}

impl std::str::FromStr for Subscription {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "to" => Ok(Self::To),
            "from" => Ok(Self::From),
            "both" => Ok(Self::Both),
            "remove" => Ok(Self::Remove),
            other => Err(format!("unknown subscription value: {other}")),
        }
    }
}

/// Presence of one connected resource of a contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePresence {
    pub resource: String,
    pub show: Show,
    pub status: Option<String>,
    pub priority: i8,
    pub caps_hash: Option<String>,
    pub key_id: Option<String>,
    pub last_status_time: DateTime<Utc>,
}

impl ResourcePresence {
    /// Equality on the fields a peer controls; timestamps are ignored.
    pub fn same_state(&self, other: &ResourcePresence) -> bool {
        self.show == other.show
            && self.status == other.status
            && self.priority == other.priority
            && self.caps_hash == other.caps_hash
    }
}

/// A contact of one account: roster data plus zero or more resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub jid: String,
    pub name: Option<String>,
    pub subscription: Subscription,
    pub ask: Option<String>,
    pub groups: Vec<String>,
    pub resources: Vec<ResourcePresence>,
    pub in_roster: bool,
    pub is_self: bool,
}

impl Contact {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            name: None,
            subscription: Subscription::None,
            ask: None,
            groups: Vec::new(),
            resources: Vec::new(),
            in_roster: false,
            is_self: false,
        }
    }

    /// The resource that decides the contact's effective show and status:
    /// highest priority first, most recent presence on ties.
    pub fn highest(&self) -> Option<&ResourcePresence> {
        self.resources
            .iter()
            .filter(|entry| !entry.show.is_unavailable())
            .max_by(|left, right| {
                left.priority
                    .cmp(&right.priority)
                    .then_with(|| left.last_status_time.cmp(&right.last_status_time))
            })
    }

    pub fn show(&self) -> Show {
        self.highest().map_or(Show::Offline, |entry| entry.show)
    }

    pub fn status(&self) -> Option<&str> {
        self.highest().and_then(|entry| entry.status.as_deref())
    }

    pub fn resource(&self, resource: &str) -> Option<&ResourcePresence> {
        self.resources.iter().find(|entry| entry.resource == resource)
    }

    /// Insert or replace the entry for `entry.resource`. Returns `false` when
    /// the stored entry already had the same state.
    pub fn upsert_resource(&mut self, entry: ResourcePresence) -> bool {
        match self
            .resources
            .iter_mut()
            .find(|existing| existing.resource == entry.resource)
        {
            Some(existing) => {
                let changed = !existing.same_state(&entry);
                *existing = entry;
                changed
            }
            None => {
                self.resources.push(entry);
                true
            }
        }
    }

    pub fn remove_resource(&mut self, resource: &str) -> Option<ResourcePresence> {
        let index = self
            .resources
            .iter()
            .position(|entry| entry.resource == resource)?;
        Some(self.resources.remove(index))
    }

    pub fn is_online(&self) -> bool {
        self.highest().is_some()
    }

    /// Transports and gateways are addressed by a bare domain.
    pub fn is_transport(&self) -> bool {
        is_transport_jid(&self.jid)
    }
}

pub fn is_transport_jid(jid: &str) -> bool {
    !bare_jid(jid).contains('@')
}

/// Strip the resource from a JID string.
pub fn bare_jid(jid: &str) -> &str {
    jid.split_once('/').map_or(jid, |(bare, _)| bare)
}

/// The resource part of a JID string, if any.
pub fn resource_part(jid: &str) -> Option<&str> {
    jid.split_once('/')
        .map(|(_, resource)| resource)
        .filter(|resource| !resource.is_empty())
}
