//! Harness running one [`ConnectionCore`] over a scripted transport.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use tern_client::{Command, ConnectionCore, CoreHandle, CoreServices};
use tern_core::config::ConfigStore;
use tern_core::contact::Show;
use tern_core::event::{BroadcastEventBus, EventBus, EventPayload, EventSubscription};
use tern_core::registry::ContactRegistry;
use tern_security::PgpBackend;
use tern_storage::HistoryStore;
use tern_test_support::{FakePgp, ScriptHandle, ScriptedTransport, fixtures};
use tern_xmpp::{Stanza, ns};

/// Default timeout for waiting on events.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub handle: CoreHandle,
    pub script: ScriptHandle,
    pub events: EventSubscription,
    pub registry: Arc<ContactRegistry>,
    pub history: Arc<HistoryStore>,
    pub dir: TempDir,
    pub task: JoinHandle<()>,
}

pub struct Setup {
    pub config: &'static str,
    pub pgp: Option<Arc<dyn PgpBackend>>,
    pub transport: fn(ScriptedTransport) -> ScriptedTransport,
}

impl Setup {
    pub fn new(config: &'static str) -> Self {
        Self {
            config,
            pgp: None,
            transport: |transport| transport,
        }
    }

    pub fn with_pgp(self, pgp: &Arc<FakePgp>) -> Self {
        self.with_backend(Arc::clone(pgp) as Arc<dyn PgpBackend>)
    }

    pub fn with_backend(mut self, backend: Arc<dyn PgpBackend>) -> Self {
        self.pgp = Some(backend);
        self
    }

    pub fn with_transport(mut self, transport: fn(ScriptedTransport) -> ScriptedTransport) -> Self {
        self.transport = transport;
        self
    }

    pub async fn start(self) -> Harness {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = Arc::new(fixtures::config_store(self.config, dir.path()));
        let history = Arc::new(
            HistoryStore::open(&dir.path().join("history.db"))
                .await
                .expect("history opens"),
        );
        let bus = Arc::new(BroadcastEventBus::default());
        let events = bus.subscribe("*").expect("valid pattern");
        let registry = Arc::new(ContactRegistry::new());

        let (transport, script) = ScriptedTransport::new();
        let transport = (self.transport)(transport);
        let services = CoreServices {
            bus,
            registry: Arc::clone(&registry),
            pgp: self.pgp,
            history: Some(Arc::clone(&history)),
        };
        let (core, handle) =
            ConnectionCore::new("work", config, transport, services).expect("core starts");
        let task = tokio::spawn(core.run());

        Harness {
            handle,
            script,
            events,
            registry,
            history,
            dir,
            task,
        }
    }
}

impl Harness {
    pub async fn send(&self, command: Command) {
        self.handle.send(command).await.expect("loop running");
    }

    /// Go online and answer the roster request with the roster fixture.
    pub async fn online(&mut self) {
        self.send(Command::SetStatus {
            show: Show::Online,
            message: None,
        })
        .await;
        let request = self
            .script
            .sent_matching(|stanza| stanza.has_namespace(ns::ROSTER))
            .await
            .expect("roster requested");
        let id = request.id().expect("roster request id").to_string();
        self.script
            .push(fixtures::stanza_with("iq-roster-result.xml", &[("id", &id)]));
        self.wait_for(|payload| matches!(payload, EventPayload::Roster { .. }))
            .await;
    }

    pub async fn wait_for(&mut self, predicate: impl FnMut(&EventPayload) -> bool) -> EventPayload {
        self.wait_within(DEFAULT_TIMEOUT, predicate).await
    }

    pub async fn wait_within(
        &mut self,
        limit: Duration,
        mut predicate: impl FnMut(&EventPayload) -> bool,
    ) -> EventPayload {
        let events = &mut self.events;
        tokio::time::timeout(limit, async {
            loop {
                let event = events.recv().await.expect("event bus open");
                if predicate(&event.payload) {
                    return event.payload;
                }
            }
        })
        .await
        .expect("expected event was not published")
    }

    /// Every event up to the first match, plus whatever was already
    /// published on other channels by then.
    pub async fn collect_until(
        &mut self,
        mut predicate: impl FnMut(&EventPayload) -> bool,
    ) -> Vec<EventPayload> {
        let mut seen = Vec::new();
        self.wait_for(|payload| {
            seen.push(payload.clone());
            predicate(payload)
        })
        .await;
        seen.extend(self.drain_events());
        seen
    }

    /// Every event published so far that nobody waited for.
    pub fn drain_events(&mut self) -> Vec<EventPayload> {
        std::iter::from_fn(|| self.events.try_recv())
            .map(|event| event.payload)
            .collect()
    }

    pub async fn next_sent(&mut self) -> Stanza {
        self.script.next_sent().await.expect("a stanza was sent")
    }

    pub fn saved_config(&self) -> ConfigStore {
        ConfigStore::load(self.dir.path().join("config.toml")).expect("saved config loads")
    }

    /// Drop the handle and wait for the loop to close the stream.
    pub async fn stop(self) -> ScriptHandle {
        let Harness { handle, task, script, .. } = self;
        drop(handle);
        tokio::time::timeout(DEFAULT_TIMEOUT, task)
            .await
            .expect("loop stops")
            .expect("loop did not panic");
        script
    }
}
