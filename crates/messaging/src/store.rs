//! Per-connection table of chat sessions.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, warn};

use tern_core::contact::{bare_jid, resource_part};
use tern_xmpp::{Stanza, outbound};

use crate::SessionError;
use crate::session::{Session, SessionId, SessionKind};

/// A session removed from the store, with the notice to send the peer if
/// one was asked for.
#[derive(Debug)]
pub struct TerminatedSession {
    pub session: Session,
    pub notice: Option<Stanza>,
}

/// Sessions of one connection.
///
/// Chat sessions are keyed by the peer's bare JID, so every resource of a
/// contact shares them. Sessions with occupants of a joined room are keyed
/// by the occupant's full JID instead. Session ids come from a counter and
/// are never reused, so a session created after a termination is always a
/// different one.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<SessionId, Session>,
    next_id: u64,
    rooms: HashSet<String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_room_joined(&mut self, room: &str) {
        self.rooms.insert(bare_jid(room).to_string());
    }

    /// Forget the room and end every private session with its occupants.
    pub fn mark_room_left(&mut self, room: &str) -> Vec<TerminatedSession> {
        let room = bare_jid(room);
        self.rooms.remove(room);
        self.pm_sessions(room)
            .into_iter()
            .filter_map(|id| self.terminate(id, false))
            .collect()
    }

    /// A full JID inside a joined room addresses one occupant.
    pub fn is_pm_peer(&self, jid: &str) -> bool {
        resource_part(jid).is_some() && self.rooms.contains(bare_jid(jid))
    }

    fn key_of(&self, jid: &str) -> String {
        if self.is_pm_peer(jid) {
            jid.to_string()
        } else {
            bare_jid(jid).to_string()
        }
    }

    fn matches_key(session: &Session, key: &str) -> bool {
        match session.kind() {
            SessionKind::Pm => session.peer() == key,
            SessionKind::Chat => bare_jid(session.peer()) == key,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Every session with `peer`, oldest first.
    pub fn sessions_with(&self, peer: &str) -> Vec<&Session> {
        let key = self.key_of(peer);
        let mut sessions: Vec<&Session> = self
            .sessions
            .values()
            .filter(|session| Self::matches_key(session, &key))
            .collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    /// Private sessions with occupants of `room`.
    pub fn pm_sessions(&self, room: &str) -> Vec<SessionId> {
        let room = bare_jid(room);
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.kind() == SessionKind::Pm && bare_jid(session.peer()) == room)
            .map(Session::id)
            .collect();
        ids.sort();
        ids
    }

    pub fn find(&self, peer: &str, thread: Option<&str>) -> Option<SessionId> {
        match thread.filter(|thread| !thread.is_empty()) {
            None => self.find_null_session(peer),
            Some(thread) => {
                let key = self.key_of(peer);
                self.sessions
                    .values()
                    .find(|session| {
                        Self::matches_key(session, &key) && session.thread_id() == Some(thread)
                    })
                    .map(Session::id)
            }
        }
    }

    /// The session a threadless message from `peer` belongs to: among the
    /// sessions the peer never sent a thread id in, the one we last sent to.
    pub fn find_null_session(&self, peer: &str) -> Option<SessionId> {
        let key = self.key_of(peer);
        self.sessions
            .values()
            .filter(|session| Self::matches_key(session, &key) && !session.received_thread_id())
            .max_by_key(|session| (session.last_send(), session.id()))
            .map(Session::id)
    }

    fn find_unbound_session(&self, peer: &str) -> Option<SessionId> {
        let key = self.key_of(peer);
        self.sessions
            .values()
            .filter(|session| Self::matches_key(session, &key) && session.is_null())
            .max_by_key(|session| (session.last_send(), session.id()))
            .map(Session::id)
    }

    /// A session with `peer` that nothing displays yet.
    pub fn find_controlless_session(&self, peer: &str, resource: Option<&str>) -> Option<SessionId> {
        let key = self.key_of(peer);
        self.sessions
            .values()
            .filter(|session| Self::matches_key(session, &key) && !session.has_control())
            .filter(|session| resource.is_none_or(|resource| session.resource() == Some(resource)))
            .min_by_key(|session| session.id())
            .map(Session::id)
    }

    /// Session for an outgoing message to `peer`, created when none matches.
    pub fn get_or_create(&mut self, peer: &str, thread: Option<&str>) -> SessionId {
        let thread = thread.filter(|thread| !thread.is_empty());
        match self.find(peer, thread) {
            Some(id) => id,
            None => self.create(peer, thread),
        }
    }

    /// Session for an incoming message from `peer`.
    ///
    /// A thread id seen for the first time binds the most recent null
    /// session in place, so whoever holds its id keeps a valid handle.
    pub fn receive(&mut self, peer: &str, thread: Option<&str>) -> SessionId {
        let Some(thread) = thread.filter(|thread| !thread.is_empty()) else {
            return self.get_or_create(peer, None);
        };

        if let Some(id) = self.find(peer, Some(thread)) {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.mark_thread_received();
                if session.kind() == SessionKind::Chat && resource_part(peer).is_some() {
                    session.set_peer(peer);
                }
            }
            return id;
        }

        if let Some(id) = self.find_unbound_session(peer) {
            if self.promote(id, thread).is_ok() {
                return id;
            }
        }

        let id = self.create(peer, Some(thread));
        if let Some(session) = self.sessions.get_mut(&id) {
            session.mark_thread_received();
        }
        id
    }

    /// Bind a null session to `thread`. A bound thread id never changes.
    pub fn promote(&mut self, id: SessionId, thread: &str) -> Result<(), SessionError> {
        let session = self.sessions.get(&id).ok_or(SessionError::UnknownSession(id))?;
        if let Some(existing) = session.thread_id() {
            if existing != thread {
                return Err(SessionError::ThreadAlreadySet {
                    id,
                    thread: existing.to_string(),
                });
            }
        }
        let key = self.key_of(session.peer());
        let taken = self.sessions.values().any(|other| {
            other.id() != id && Self::matches_key(other, &key) && other.thread_id() == Some(thread)
        });
        if taken {
            return Err(SessionError::ThreadInUse {
                peer: key,
                thread: thread.to_string(),
            });
        }

        let session = self.sessions.get_mut(&id).ok_or(SessionError::UnknownSession(id))?;
        if session.is_null() {
            debug!(session = %id, thread, "null session bound to thread");
            session.bind_thread(thread.to_string());
        }
        session.mark_thread_received();
        Ok(())
    }

    pub fn record_send(&mut self, id: SessionId, at: Instant) -> Result<(), SessionError> {
        self.sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?
            .record_send(at);
        Ok(())
    }

    fn create(&mut self, peer: &str, thread: Option<&str>) -> SessionId {
        let kind = if self.is_pm_peer(peer) {
            SessionKind::Pm
        } else {
            SessionKind::Chat
        };
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions
            .insert(id, Session::new(id, peer, thread.map(str::to_string), kind));
        debug!(session = %id, peer, ?thread, ?kind, "session created");
        id
    }

    /// Remove a session. With `send_notice` a threaded session also yields
    /// the termination message for the peer.
    pub fn terminate(&mut self, id: SessionId, send_notice: bool) -> Option<TerminatedSession> {
        let session = self.sessions.remove(&id)?;
        let notice = if send_notice {
            session.thread_id().and_then(|thread| {
                outbound::session_terminate(session.peer(), thread)
                    .map_err(|error| {
                        warn!(session = %id, error = %error, "cannot build termination notice");
                    })
                    .ok()
            })
        } else {
            None
        };

        if let Some(control) = session.control() {
            control.session_terminated(id);
        }
        debug!(session = %id, peer = %session.peer(), "session terminated");
        Some(TerminatedSession { session, notice })
    }

    /// End every session; used when the connection goes down.
    pub fn terminate_all(&mut self, send_notice: bool) -> Vec<TerminatedSession> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.terminate(id, send_notice))
            .collect()
    }

    /// End the sessions that cannot survive `full_jid` going offline:
    /// encrypted ones with that resource, and, when the peer negotiates
    /// sessions, every one it never sent a thread id in.
    pub fn end_for_unavailable(
        &mut self,
        full_jid: &str,
        supports_negotiation: bool,
    ) -> Vec<TerminatedSession> {
        let key = self.key_of(full_jid);
        let resource = resource_part(full_jid);
        let mut doomed: Vec<(SessionId, bool)> = self
            .sessions
            .values()
            .filter(|session| Self::matches_key(session, &key))
            .filter_map(|session| {
                let same_resource = session
                    .resource()
                    .is_none_or(|own| resource.is_none_or(|gone| gone == own));
                if session.enable_encryption && same_resource {
                    Some((session.id(), false))
                } else if supports_negotiation && !session.received_thread_id() {
                    Some((session.id(), true))
                } else {
                    None
                }
            })
            .collect();
        doomed.sort();

        doomed
            .into_iter()
            .filter_map(|(id, send_notice)| self.terminate(id, send_notice))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::session::SessionControl;

    #[derive(Default)]
    struct RecordingControl {
        terminated: Mutex<Vec<SessionId>>,
    }

    impl SessionControl for RecordingControl {
        fn session_terminated(&self, session: SessionId) {
            self.terminated.lock().unwrap().push(session);
        }
    }

    #[test]
    fn null_session_is_promoted_in_place() {
        let mut store = SessionStore::new();
        let null = store.get_or_create("bob@example.com", None);
        assert!(store.get(null).unwrap().is_null());

        let received = store.receive("bob@example.com/desktop", Some("t-1"));
        assert_eq!(received, null);
        assert_eq!(store.get(null).unwrap().thread_id(), Some("t-1"));
        assert!(store.get(null).unwrap().received_thread_id());

        assert_eq!(store.get_or_create("bob@example.com", Some("t-1")), null);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn distinct_threads_get_distinct_sessions() {
        let mut store = SessionStore::new();
        let first = store.get_or_create("bob@example.com", Some("t-1"));
        let second = store.get_or_create("bob@example.com/phone", Some("t-2"));
        assert_ne!(first, second);
        assert_eq!(store.get_or_create("bob@example.com/laptop", Some("t-1")), first);
        assert_eq!(store.sessions_with("bob@example.com").len(), 2);
    }

    #[test]
    fn threadless_message_goes_to_most_recently_used_session() {
        let mut store = SessionStore::new();
        let start = Instant::now();
        let older = store.get_or_create("bob@example.com", Some("a"));
        let newer = store.get_or_create("bob@example.com", Some("b"));
        store.record_send(older, start + Duration::from_secs(5)).unwrap();
        store.record_send(newer, start).unwrap();

        assert_eq!(store.find_null_session("bob@example.com"), Some(older));

        store.receive("bob@example.com", Some("a"));
        assert_eq!(store.find_null_session("bob@example.com"), Some(newer));
    }

    #[test]
    fn bound_thread_is_immutable() {
        let mut store = SessionStore::new();
        let id = store.get_or_create("bob@example.com", Some("t-1"));
        assert_matches!(
            store.promote(id, "t-2"),
            Err(SessionError::ThreadAlreadySet { thread, .. }) if thread == "t-1"
        );
        assert!(store.promote(id, "t-1").is_ok());
        assert_matches!(
            store.promote(SessionId(999), "t-1"),
            Err(SessionError::UnknownSession(_))
        );
    }

    #[test]
    fn promotion_refuses_a_thread_owned_elsewhere() {
        let mut store = SessionStore::new();
        let threaded = store.get_or_create("bob@example.com", Some("t-1"));
        store.receive("bob@example.com", Some("t-1"));
        let null = store.get_or_create("bob@example.com", None);
        assert_ne!(null, threaded);

        assert_matches!(store.promote(null, "t-1"), Err(SessionError::ThreadInUse { .. }));
    }

    #[test]
    fn room_occupants_get_private_sessions() {
        let mut store = SessionStore::new();
        store.mark_room_joined("room@conference.example.com");

        let alice = store.get_or_create("room@conference.example.com/alice", None);
        let bob = store.get_or_create("room@conference.example.com/bob", None);
        assert_ne!(alice, bob);
        assert_eq!(store.get(alice).unwrap().kind(), SessionKind::Pm);

        let left = store.mark_room_left("room@conference.example.com");
        assert_eq!(left.len(), 2);
        assert!(store.is_empty());
        assert!(!store.is_pm_peer("room@conference.example.com/alice"));
    }

    #[test]
    fn unavailable_ends_encrypted_session_and_next_one_is_new() {
        let mut store = SessionStore::new();
        let id = store.get_or_create("bob@example.com/desktop", None);
        store.get_mut(id).unwrap().enable_encryption = true;

        let ended = store.end_for_unavailable("bob@example.com/desktop", false);
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].session.id(), id);
        assert!(ended[0].notice.is_none());
        assert!(store.get(id).is_none());

        let fresh = store.get_or_create("bob@example.com/desktop", None);
        assert_ne!(fresh, id);
        assert!(!store.get(fresh).unwrap().enable_encryption);
    }

    #[test]
    fn unavailable_of_other_resource_keeps_encrypted_session() {
        let mut store = SessionStore::new();
        let id = store.get_or_create("bob@example.com/desktop", None);
        store.get_mut(id).unwrap().enable_encryption = true;

        assert!(store.end_for_unavailable("bob@example.com/phone", false).is_empty());
        assert!(store.get(id).is_some());
    }

    #[test]
    fn negotiating_peer_loses_threadless_sessions() {
        let mut store = SessionStore::new();
        let unanswered = store.get_or_create("bob@example.com", Some("t-1"));
        let answered = store.get_or_create("bob@example.com", Some("t-2"));
        store.receive("bob@example.com/desktop", Some("t-2"));

        assert!(store.end_for_unavailable("bob@example.com/desktop", false).is_empty());

        let ended = store.end_for_unavailable("bob@example.com/desktop", true);
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].session.id(), unanswered);
        assert_eq!(
            ended[0].notice.as_ref().and_then(Stanza::thread).as_deref(),
            Some("t-1")
        );
        assert!(store.get(answered).is_some());
    }

    #[test]
    fn terminate_notifies_live_control() {
        let mut store = SessionStore::new();
        let control = Arc::new(RecordingControl::default());
        let handle: Arc<dyn SessionControl> = control.clone();

        let watched = store.get_or_create("bob@example.com", Some("t-1"));
        let orphan = store.get_or_create("bob@example.com", Some("t-2"));
        store.get_mut(watched).unwrap().set_control(&handle);

        assert_eq!(store.find_controlless_session("bob@example.com", None), Some(orphan));

        let ended = store.terminate(watched, true).unwrap();
        assert!(ended.notice.is_some());
        assert_eq!(*control.terminated.lock().unwrap(), vec![watched]);
        assert!(store.terminate(watched, true).is_none());
    }

    #[test]
    fn dropped_control_is_not_kept_alive() {
        let mut store = SessionStore::new();
        let id = store.get_or_create("bob@example.com", None);
        {
            let handle: Arc<dyn SessionControl> = Arc::new(RecordingControl::default());
            store.get_mut(id).unwrap().set_control(&handle);
            assert!(store.get(id).unwrap().has_control());
        }
        assert!(!store.get(id).unwrap().has_control());
        assert_eq!(store.find_controlless_session("bob@example.com", None), Some(id));
    }

    #[test]
    fn terminate_all_empties_the_store() {
        let mut store = SessionStore::new();
        store.get_or_create("bob@example.com", Some("t-1"));
        store.get_or_create("carol@example.com", None);

        let ended = store.terminate_all(true);
        assert_eq!(ended.len(), 2);
        assert_eq!(ended.iter().filter(|ended| ended.notice.is_some()).count(), 1);
        assert!(store.is_empty());
    }
}
