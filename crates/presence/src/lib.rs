mod engine;
mod subscription;

pub use engine::{
    DEFAULT_SUBSCRIBE_TEXT, PresenceAction, PresenceEngine, PresenceOutcome, PresenceSettings,
};
pub use subscription::{LOOP_WINDOW, LOOP_WINDOW_EVENTS, SubscriptionEventLog, SubscriptionKind};

use tern_core::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence without a sender")]
    MissingSender,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
