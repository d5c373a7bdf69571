//! Correlation of outgoing requests with their responses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

pub type RequestId = String;

/// What an outstanding request was for; decides how its response and its
/// timeout are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Roster,
    VCard,
    VCardPublish,
    DiscoItems,
    DiscoInfo,
    Version,
    LastActivity,
    Time,
    Ping,
    RegistrationInfo,
    AgentRemove,
    PasswordChange,
    RosterUpdate,
    RoomAdmin,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Roster => "roster",
            RequestKind::VCard => "vcard",
            RequestKind::VCardPublish => "vcard-publish",
            RequestKind::DiscoItems => "disco-items",
            RequestKind::DiscoInfo => "disco-info",
            RequestKind::Version => "version",
            RequestKind::LastActivity => "last-activity",
            RequestKind::Time => "time",
            RequestKind::Ping => "ping",
            RequestKind::RegistrationInfo => "registration-info",
            RequestKind::AgentRemove => "agent-remove",
            RequestKind::PasswordChange => "password-change",
            RequestKind::RosterUpdate => "roster-update",
            RequestKind::RoomAdmin => "room-admin",
        }
    }

    /// Text of the event raised when no response arrives in time.
    pub fn timeout_message(&self) -> &'static str {
        match self {
            RequestKind::RegistrationInfo => "registration information did not arrive in time",
            RequestKind::Roster => "roster did not arrive in time",
            RequestKind::VCard => "contact information did not arrive in time",
            RequestKind::Ping => "ping reply did not arrive in time",
            _ => "request did not receive a response in time",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no pending request with id {0}")]
pub struct NotFound(pub RequestId);

#[derive(Debug)]
struct PendingEntry<C> {
    kind: RequestKind,
    context: C,
    issued_at: Instant,
    deadline: Option<Instant>,
}

/// Requests awaiting a response on one connection.
///
/// Ids come from a counter that is never reset, so an id is not reused for
/// the lifetime of the table even after its entry is gone.
#[derive(Debug)]
pub struct PendingRequestTable<C> {
    prefix: String,
    next_id: u64,
    entries: HashMap<RequestId, PendingEntry<C>>,
}

impl<C> PendingRequestTable<C> {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Register a request and return the id to put on the wire.
    pub fn issue(&mut self, kind: RequestKind, context: C, timeout: Option<Duration>) -> RequestId {
        self.issue_at(kind, context, timeout, Instant::now())
    }

    pub fn issue_at(
        &mut self,
        kind: RequestKind,
        context: C,
        timeout: Option<Duration>,
        now: Instant,
    ) -> RequestId {
        let id = loop {
            let candidate = format!("{}-{}", self.prefix, self.next_id);
            self.next_id += 1;
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        self.entries.insert(
            id.clone(),
            PendingEntry {
                kind,
                context,
                issued_at: now,
                deadline: timeout.map(|timeout| now + timeout),
            },
        );
        debug!(id = %id, kind = %kind, "request issued");
        id
    }

    /// Remove and return the request `id`. A second call for the same id
    /// reports `NotFound`.
    pub fn resolve(&mut self, id: &str) -> Result<(RequestKind, C), NotFound> {
        self.entries
            .remove(id)
            .map(|entry| (entry.kind, entry.context))
            .ok_or_else(|| NotFound(id.to_string()))
    }

    /// Look at request `id` without resolving it.
    pub fn peek(&self, id: &str) -> Option<(RequestKind, &C)> {
        self.entries.get(id).map(|entry| (entry.kind, &entry.context))
    }

    pub fn kind_of(&self, id: &str) -> Option<RequestKind> {
        self.entries.get(id).map(|entry| entry.kind)
    }

    pub fn issued_at(&self, id: &str) -> Option<Instant> {
        self.entries.get(id).map(|entry| entry.issued_at)
    }

    /// Remove and return every request whose deadline is at or before `now`,
    /// oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<(RequestId, RequestKind, C)> {
        let mut expired_ids: Vec<(Instant, RequestId)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, entry)| (entry.issued_at, id.clone()))
            .collect();
        expired_ids.sort();

        expired_ids
            .into_iter()
            .filter_map(|(_, id)| {
                self.entries
                    .remove(&id)
                    .map(|entry| (id, entry.kind, entry.context))
            })
            .collect()
    }

    /// Discard every pending request without reporting anything. Used when the
    /// connection is torn down.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        if dropped > 0 {
            debug!(dropped, "pending requests discarded");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn issued_ids_are_unique() {
        let mut table = PendingRequestTable::new("tern");
        let ids: HashSet<_> = (0..100)
            .map(|n| table.issue(RequestKind::Ping, n, None))
            .collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn ids_are_not_reused_after_resolution() {
        let mut table = PendingRequestTable::new("tern");
        let first = table.issue(RequestKind::Ping, (), None);
        table.resolve(&first).unwrap();
        let second = table.issue(RequestKind::Ping, (), None);
        assert_ne!(first, second);
    }

    #[test]
    fn second_resolution_is_not_found() {
        let mut table = PendingRequestTable::new("tern");
        let id = table.issue(RequestKind::VCard, "alice@example.com", None);

        assert_eq!(
            table.resolve(&id),
            Ok((RequestKind::VCard, "alice@example.com"))
        );
        assert_eq!(table.resolve(&id), Err(NotFound(id.clone())));
        assert!(table.is_empty());
    }

    #[test]
    fn peek_leaves_the_request_pending() {
        let mut table = PendingRequestTable::new("tern");
        let id = table.issue(RequestKind::Version, "alice@example.com", None);

        assert_eq!(table.peek(&id), Some((RequestKind::Version, &"alice@example.com")));
        assert_eq!(table.len(), 1);
        assert!(table.resolve(&id).is_ok());
        assert_eq!(table.peek(&id), None);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let mut table: PendingRequestTable<()> = PendingRequestTable::new("tern");
        assert_matches!(table.resolve("never-issued"), Err(NotFound(id)) if id == "never-issued");
    }

    #[test]
    fn expire_on_empty_table_is_noop() {
        let mut table: PendingRequestTable<()> = PendingRequestTable::new("tern");
        assert!(table.expire(Instant::now()).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn expire_returns_only_overdue_requests() {
        let start = Instant::now();
        let mut table = PendingRequestTable::new("tern");
        let short = table.issue_at(
            RequestKind::RegistrationInfo,
            "icq.example.com",
            Some(Duration::from_secs(5)),
            start,
        );
        let long = table.issue_at(
            RequestKind::Version,
            "bob@example.com",
            Some(Duration::from_secs(60)),
            start,
        );
        table.issue_at(RequestKind::Ping, "example.com", None, start);

        assert!(table.expire(start + Duration::from_secs(4)).is_empty());

        let expired = table.expire(start + Duration::from_secs(5));
        assert_eq!(
            expired,
            vec![(short.clone(), RequestKind::RegistrationInfo, "icq.example.com")]
        );
        assert_matches!(table.resolve(&short), Err(NotFound(_)));
        assert_eq!(table.kind_of(&long), Some(RequestKind::Version));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn expired_requests_come_back_oldest_first() {
        let start = Instant::now();
        let mut table = PendingRequestTable::new("tern");
        let second = table.issue_at(
            RequestKind::Time,
            2,
            Some(Duration::from_secs(1)),
            start + Duration::from_secs(1),
        );
        let first = table.issue_at(RequestKind::Time, 1, Some(Duration::from_secs(5)), start);

        let expired: Vec<_> = table
            .expire(start + Duration::from_secs(10))
            .into_iter()
            .map(|(id, _, _)| id)
            .collect();
        assert_eq!(expired, vec![first, second]);
    }

    #[test]
    fn clear_discards_everything() {
        let mut table = PendingRequestTable::new("tern");
        table.issue(RequestKind::Roster, (), Some(Duration::from_secs(1)));
        table.issue(RequestKind::DiscoInfo, (), None);

        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
        assert!(table.expire(Instant::now() + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn registration_timeout_text() {
        assert_eq!(
            RequestKind::RegistrationInfo.timeout_message(),
            "registration information did not arrive in time"
        );
    }
}
