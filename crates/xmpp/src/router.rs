//! Inbound stanza dispatch.
//!
//! Handlers are matched on `(kind, type, namespace)` in registration order.
//! The first handler returning [`Disposition::Consumed`] ends the dispatch;
//! when nobody claims the stanza it goes to the catch-all. Handlers receive
//! the connection context mutably, so the router is kept beside that context
//! rather than inside it.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, warn};

use crate::error::RouterError;
use crate::stanza::{Stanza, StanzaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Consumed,
    NotConsumed,
}

/// Failure reported by a handler. The stanza is then treated as unclaimed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerSlot(usize);

impl HandlerSlot {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Which values of the `type` attribute a handler accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StanzaType {
    Any,
    OneOf(Vec<String>),
}

impl StanzaType {
    pub fn of(types: &[&str]) -> Self {
        StanzaType::OneOf(types.iter().map(|value| value.to_string()).collect())
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            StanzaType::Any => true,
            StanzaType::OneOf(types) => types.iter().any(|candidate| candidate == value),
        }
    }
}

pub type Handler<C> = Box<dyn Fn(&mut C, &Stanza) -> Result<Disposition, HandlerError> + Send>;
pub type Observer<C> = Box<dyn Fn(&mut C, &Stanza) + Send>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub consumed_by: Option<HandlerSlot>,
    pub error: Option<RouterError>,
}

impl DispatchOutcome {
    pub fn consumed(&self) -> bool {
        self.consumed_by.is_some()
    }
}

struct Registration<C> {
    slot: HandlerSlot,
    kind: StanzaKind,
    stanza_type: StanzaType,
    namespace: Option<String>,
    handler: Handler<C>,
}

impl<C> Registration<C> {
    fn matches(&self, stanza: &Stanza) -> bool {
        self.kind == stanza.kind()
            && self.stanza_type.matches(stanza.stanza_type())
            && self
                .namespace
                .as_deref()
                .is_none_or(|namespace| stanza.has_namespace(namespace))
    }
}

pub struct StanzaRouter<C> {
    registrations: Vec<Registration<C>>,
    next_slot: usize,
    catch_all: Option<Observer<C>>,
    raw_observer: Option<Observer<C>>,
}

impl<C> StanzaRouter<C> {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            next_slot: 0,
            catch_all: None,
            raw_observer: None,
        }
    }

    pub fn register(
        &mut self,
        kind: StanzaKind,
        stanza_type: StanzaType,
        namespace: Option<&str>,
        handler: Handler<C>,
    ) -> HandlerSlot {
        let slot = HandlerSlot(self.next_slot);
        self.next_slot += 1;
        self.registrations.push(Registration {
            slot,
            kind,
            stanza_type,
            namespace: namespace.map(str::to_string),
            handler,
        });
        slot
    }

    pub fn unregister(&mut self, slot: HandlerSlot) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|registration| registration.slot != slot);
        before != self.registrations.len()
    }

    pub fn set_catch_all(&mut self, handler: Observer<C>) {
        self.catch_all = Some(handler);
    }

    /// Called for every stanza before matching. Failures are swallowed.
    pub fn set_raw_observer(&mut self, observer: Observer<C>) {
        self.raw_observer = Some(observer);
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Drop every handler, the catch-all and the observer.
    pub fn clear(&mut self) {
        self.registrations.clear();
        self.catch_all = None;
        self.raw_observer = None;
    }

    pub fn dispatch(&self, context: &mut C, stanza: &Stanza) -> DispatchOutcome {
        if let Some(observer) = &self.raw_observer {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer(context, stanza))) {
                debug!(reason = %panic_message(&*payload), "raw stanza observer failed");
            }
        }

        let mut outcome = DispatchOutcome::default();
        for registration in self
            .registrations
            .iter()
            .filter(|registration| registration.matches(stanza))
        {
            let slot = registration.slot;
            let result = catch_unwind(AssertUnwindSafe(|| {
                (registration.handler)(context, stanza)
            }));
            match result {
                Ok(Ok(Disposition::Consumed)) => {
                    outcome.consumed_by = Some(slot);
                    return outcome;
                }
                Ok(Ok(Disposition::NotConsumed)) => {}
                Ok(Err(handler_error)) => {
                    warn!(
                        slot = slot.0,
                        stanza = stanza.name(),
                        error = %handler_error,
                        "stanza handler failed"
                    );
                    outcome.error = Some(RouterError::HandlerFailed {
                        slot: slot.0,
                        message: handler_error.0,
                    });
                    break;
                }
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(slot = slot.0, stanza = stanza.name(), reason = %message, "stanza handler panicked");
                    outcome.error = Some(RouterError::HandlerPanicked {
                        slot: slot.0,
                        message,
                    });
                    break;
                }
            }
        }

        self.run_catch_all(context, stanza);
        outcome
    }

    fn run_catch_all(&self, context: &mut C, stanza: &Stanza) {
        debug!(
            stanza = stanza.name(),
            stanza_type = stanza.stanza_type(),
            id = stanza.id().unwrap_or_default(),
            "stanza not claimed by any handler"
        );
        if let Some(catch_all) = &self.catch_all {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| catch_all(context, stanza))) {
                error!(reason = %panic_message(&*payload), "catch-all handler panicked");
            }
        }
    }
}

impl<C> Default for StanzaRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
