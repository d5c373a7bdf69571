mod session;
mod store;

pub use session::{Session, SessionControl, SessionId, SessionKind};
pub use store::{SessionStore, TerminatedSession};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no session with id {0}")]
    UnknownSession(SessionId),

    #[error("session {id} is already bound to thread {thread}")]
    ThreadAlreadySet { id: SessionId, thread: String },

    #[error("thread {thread} is already used by another session with {peer}")]
    ThreadInUse { peer: String, thread: String },
}
