//! The per-account connection loop.
//!
//! One task owns the stream, the router and everything handlers mutate.
//! Commands, inbound stanzas, PGP completions and the request expiry tick
//! are all taken in turn inside a single `select!`, so no two of them ever
//! touch the same account's state at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use tern_core::config::ConfigStore;
use tern_core::contact::Show;
use tern_core::event::{Event, EventBus, EventPayload};
use tern_core::registry::ContactRegistry;
use tern_security::{PgpBackend, PgpError, PgpReply, PgpRequest, SecurityCompletion, SecurityPipeline};
use tern_storage::HistoryStore;
use tern_xmpp::{
    ConnectionConfig, ConnectionError, ConnectionManager, Stanza, StanzaRouter, XmppTransport,
    outbound,
};

use crate::command::Command;
use crate::context::{ConnectionContext, PgpContext, now};
use crate::error::ClientError;
use crate::handlers;

const COMMAND_CAPACITY: usize = 64;
const EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide collaborators every connection shares.
#[derive(Clone)]
pub struct CoreServices {
    pub bus: Arc<dyn EventBus>,
    pub registry: Arc<ContactRegistry>,
    pub pgp: Option<Arc<dyn PgpBackend>>,
    pub history: Option<Arc<HistoryStore>>,
}

/// Sends commands to a running [`ConnectionCore`].
#[derive(Debug, Clone)]
pub struct CoreHandle {
    account: String,
    commands: mpsc::Sender<Command>,
}

impl CoreHandle {
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Queue a command behind every command sent before it.
    pub async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::LoopStopped(self.account.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

enum Step {
    Command(Command),
    Inbound(Result<Vec<u8>, ConnectionError>),
    Completion(SecurityCompletion<PgpContext>),
    Expire,
}

pub struct ConnectionCore<T: XmppTransport> {
    account: String,
    connection: ConnectionManager<T>,
    router: StanzaRouter<ConnectionContext>,
    context: ConnectionContext,
    security: SecurityPipeline<PgpContext>,
    completions: mpsc::UnboundedReceiver<SecurityCompletion<PgpContext>>,
    commands: mpsc::Receiver<Command>,
    bus: Arc<dyn EventBus>,
    history: Option<Arc<HistoryStore>>,
}

impl<T: XmppTransport> ConnectionCore<T> {
    pub fn new(
        account: &str,
        config: Arc<ConfigStore>,
        transport: T,
        services: CoreServices,
    ) -> Result<(Self, CoreHandle), ClientError> {
        let settings = config.account(account)?;
        let core = config.config()?.core;
        services.registry.init_account(account)?;

        let (security, completions) = SecurityPipeline::new(services.pgp);
        let connection = ConnectionManager::new(ConnectionConfig::from_account(&settings), transport);
        let context = ConnectionContext::new(
            account,
            settings,
            core,
            config,
            services.registry,
            security.is_available(),
        );
        let (sender, commands) = mpsc::channel(COMMAND_CAPACITY);

        let core = Self {
            account: account.to_string(),
            connection,
            router: StanzaRouter::new(),
            context,
            security,
            completions,
            commands,
            bus: services.bus,
            history: services.history,
        };
        let handle = CoreHandle {
            account: account.to_string(),
            commands: sender,
        };
        Ok((core, handle))
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Run until every [`CoreHandle`] is dropped. A live stream is closed
    /// on the way out.
    #[instrument(skip(self), fields(account = %self.account))]
    pub async fn run(mut self) {
        let mut expiry = tokio::time::interval(EXPIRY_INTERVAL);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("connection loop started");

        loop {
            self.context.run_deferred();
            self.flush().await;

            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => break,
                },
                inbound = self.connection.recv() => Step::Inbound(inbound),
                Some(completion) = self.completions.recv() => Step::Completion(completion),
                _ = expiry.tick() => Step::Expire,
            };

            match step {
                Step::Command(command) => self.handle_command(command).await,
                Step::Inbound(Ok(bytes)) => self.handle_inbound(&bytes),
                Step::Inbound(Err(error)) => self.connection_lost(error).await,
                Step::Completion(completion) => self.handle_completion(completion).await,
                Step::Expire => self.expire_requests(),
            }
        }

        if self.connection.is_connected() {
            self.disconnect().await;
        }
        self.flush().await;
        info!("connection loop stopped");
    }

    fn handle_inbound(&mut self, bytes: &[u8]) {
        match Stanza::parse(bytes) {
            Ok(stanza) => {
                let outcome = self.router.dispatch(&mut self.context, &stanza);
                if let Some(error) = outcome.error {
                    debug!(error = %error, "stanza dispatch reported an error");
                }
            }
            Err(error) => warn!(error = %error, "dropping unparseable frame"),
        }
    }

    /// Put queued stanzas on the wire, hand queued work to the PGP worker,
    /// write history and publish events, in that order.
    async fn flush(&mut self) {
        let effects = self.context.take_effects();
        if effects.is_empty() {
            return;
        }

        for stanza in &effects.outbox {
            if let Err(error) = self.connection.send_stanza(stanza).await {
                warn!(stanza = stanza.name(), error = %error, "failed to send stanza");
            }
        }
        for (context, request) in effects.security {
            if !self.security.submit(context, request) {
                debug!("no PGP backend, request dropped");
            }
        }
        if let Some(history) = &self.history {
            for entry in &effects.history {
                if let Err(error) = history
                    .write(entry.kind, &entry.peer, &entry.text, entry.timestamp)
                    .await
                {
                    warn!(peer = %entry.peer, error = %error, "history write failed");
                    self.publish(error.write_event());
                }
            }
        }
        for payload in effects.events {
            self.publish(payload);
        }
    }

    fn publish(&self, payload: EventPayload) {
        let name = payload.wire_name();
        match Event::for_account(self.account.as_str(), payload) {
            Ok(event) => {
                if let Err(error) = self.bus.publish(event) {
                    warn!(event = name, error = %error, "failed to publish event");
                }
            }
            Err(error) => warn!(event = name, error = %error, "event has no valid channel"),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        debug!(command = command.name(), "command received");
        match command {
            Command::SetStatus { show, message } => self.set_status(show, message).await,
            Command::SetPassphrase(passphrase) => self.security.set_passphrase(passphrase),
            Command::ListSecretKeys => {
                if !self
                    .security
                    .submit(PgpContext::SecretKeys, PgpRequest::ListSecretKeys)
                {
                    self.context.emit(EventPayload::GpgSecretKeys {
                        keys: BTreeMap::new(),
                    });
                }
            }
            Command::AskRoster => {
                let items = self.context.presence.roster_snapshot();
                self.context.emit(EventPayload::Roster {
                    connected: self.context.connected,
                    items,
                });
            }
            Command::LogLineCount(jid) => self.log_line_count(jid).await,
            Command::LogRange { jid, start, end } => self.log_range(jid, start, end).await,
            command if !self.context.connected => {
                debug!(command = command.name(), "not connected, command dropped");
            }
            command => {
                let name = command.name();
                if let Err(error) = self.context.execute(command) {
                    warn!(command = name, error = %error, "command failed");
                }
            }
        }
    }

    async fn set_status(&mut self, show: Show, message: Option<String>) {
        let message = message
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| show.to_string());

        if !matches!(show, Show::Offline | Show::Error) {
            if let Some(key_id) = self.context.signing_key().map(str::to_string) {
                self.context.submit(
                    PgpContext::Status {
                        show,
                        message: message.clone(),
                    },
                    PgpRequest::Sign {
                        text: message,
                        key_id,
                    },
                );
                return;
            }
        }
        self.apply_status(show, message, None).await;
    }

    async fn apply_status(&mut self, show: Show, message: String, signature: Option<String>) {
        if matches!(show, Show::Offline | Show::Error) {
            if self.connection.is_connected() {
                match outbound::presence(None, Show::Offline, Some(&message), None, None) {
                    Ok(presence) => self.context.send(presence),
                    Err(error) => warn!(error = %error, "cannot build unavailable presence"),
                }
                self.flush().await;
                self.disconnect().await;
            } else {
                self.context.emit(EventPayload::Status {
                    show: Show::Offline,
                    message: None,
                });
            }
            return;
        }

        let was_offline = !self.context.connected;
        if was_offline && self.connect().await.is_err() {
            return;
        }

        let priority = Some(self.context.settings.priority);
        match outbound::presence(None, show, Some(&message), priority, signature.as_deref()) {
            Ok(presence) => self.context.send(presence),
            Err(error) => warn!(error = %error, "cannot build presence"),
        }
        self.context.show = show;
        self.context.last_activity = now();
        self.context.emit(EventPayload::Status {
            show,
            message: Some(message),
        });
        if was_offline {
            self.context.request_own_vcard();
        }
    }

    #[instrument(skip(self), fields(account = %self.account))]
    async fn connect(&mut self) -> Result<(), ClientError> {
        let hostname = self.context.settings.hostname.clone();
        let Some(password) = self
            .context
            .settings
            .password
            .clone()
            .filter(|password| !password.is_empty())
        else {
            self.context.emit(EventPayload::Status {
                show: Show::Offline,
                message: None,
            });
            self.context.emit(EventPayload::Error {
                message: format!("No password configured for {}", self.context.own_bare_jid()),
            });
            return Err(ClientError::MissingPassword(self.account.clone()));
        };

        if let Err(error) = self.connection.connect(&password).await {
            self.context.emit(EventPayload::Status {
                show: Show::Offline,
                message: None,
            });
            if error.is_auth_failure() {
                self.context.emit(EventPayload::AuthFailed {
                    server: hostname,
                    message: error.to_string(),
                });
            } else {
                self.context.emit(EventPayload::Error {
                    message: format!("Could not connect to {hostname}: {error}"),
                });
            }
            return Err(error.into());
        }

        self.context.connected = true;
        self.context.last_inbound = Some(now());
        handlers::register(&mut self.router);
        self.context.request_roster();
        info!(handlers = self.router.len(), "online");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Err(error) = self.connection.disconnect().await {
            debug!(error = %error, "error while closing the stream");
        }
        self.router.clear();
        self.context.teardown();
    }

    async fn connection_lost(&mut self, error: ConnectionError) {
        warn!(error = %error, "connection lost");
        self.connection.mark_lost();
        self.router.clear();
        self.context.teardown();
        let hostname = self.context.settings.hostname.clone();
        self.context.emit(EventPayload::Error {
            message: format!("Connection to {hostname} lost: {error}"),
        });
    }

    async fn handle_completion(&mut self, completion: SecurityCompletion<PgpContext>) {
        match (completion.context, completion.reply) {
            (PgpContext::Status { show, message }, PgpReply::Signed(result)) => {
                let signature = match result {
                    Ok(signature) => Some(signature),
                    Err(PgpError::BadPassphrase) => {
                        if !self.context.connected {
                            self.context.emit(EventPayload::BadPassphrase);
                        }
                        None
                    }
                    Err(error) => {
                        warn!(error = %error, "status signing failed, sending unsigned");
                        None
                    }
                };
                self.apply_status(show, message, signature).await;
            }
            (PgpContext::Outgoing(draft), PgpReply::Encrypted(ciphertext)) => {
                if !self.context.connected {
                    debug!(to = %draft.to, "stream gone before encryption finished, message dropped");
                    return;
                }
                if let Err(error) = self.context.finish_send(draft, ciphertext) {
                    warn!(error = %error, "cannot send message");
                }
            }
            (PgpContext::Incoming(draft), PgpReply::Decrypted(result)) => {
                if !self.context.connected {
                    debug!(from = %draft.from, "stream gone before decryption finished, message dropped");
                    return;
                }
                match result {
                    Ok(plaintext) => self.context.deliver(draft, plaintext, true),
                    Err(error) => {
                        warn!(from = %draft.from, error = %error, "decryption failed");
                        if matches!(error, PgpError::BadPassphrase) {
                            self.context.emit(EventPayload::BadPassphrase);
                        }
                        self.context.emit(EventPayload::DecryptionFailed {
                            jid: draft.from,
                            message_id: draft.message_id,
                        });
                    }
                }
            }
            (PgpContext::Signature { jid, resource }, PgpReply::Verified(key_id)) => {
                if let Some(event) = self.context.presence.apply_signature(&jid, &resource, key_id) {
                    self.context.emit(event);
                }
            }
            (PgpContext::SecretKeys, PgpReply::SecretKeys(result)) => {
                let keys = result.unwrap_or_else(|error| {
                    warn!(error = %error, "cannot list secret keys");
                    BTreeMap::new()
                });
                self.context.emit(EventPayload::GpgSecretKeys { keys });
            }
            (context, reply) => warn!(?context, ?reply, "PGP reply does not match its request"),
        }
    }

    fn expire_requests(&mut self) {
        for (request_id, kind, target) in self.context.pending.expire(now()) {
            debug!(request_id = %request_id, request = kind.as_str(), target = %target, "request timed out");
            self.context.emit(EventPayload::RequestTimeout {
                request_id,
                message: kind.timeout_message().to_string(),
            });
        }
    }

    async fn log_line_count(&mut self, jid: String) {
        let peer = self.context.history_peer(&jid);
        let count = match &self.history {
            Some(history) => match history.count_lines(&peer).await {
                Ok(count) => count,
                Err(error) => {
                    self.context.emit(error.read_event());
                    return;
                }
            },
            None => 0,
        };
        self.context.emit(EventPayload::LogNbLine { jid, count });
    }

    async fn log_range(&mut self, jid: String, start: u64, end: u64) {
        let Some(history) = &self.history else {
            return;
        };
        let peer = self.context.history_peer(&jid);
        match history.read_range(&peer, start, end).await {
            Ok(lines) => {
                for line in lines {
                    self.context.emit(EventPayload::LogLine {
                        jid: jid.clone(),
                        line_number: line.line_number,
                        kind: line.kind.to_string(),
                        timestamp: line.timestamp,
                        text: line.text,
                    });
                }
            }
            Err(error) => self.context.emit(error.read_event()),
        }
    }
}

impl<T: XmppTransport> Drop for ConnectionCore<T> {
    fn drop(&mut self) {
        self.context.registry().teardown_account(&self.account);
    }
}

/// Owns one connection loop per account and hands out their handles.
pub struct Client {
    config: Arc<ConfigStore>,
    services: CoreServices,
    handles: HashMap<String, CoreHandle>,
}

impl Client {
    pub fn new(config: Arc<ConfigStore>, services: CoreServices) -> Self {
        Self {
            config,
            services,
            handles: HashMap::new(),
        }
    }

    /// The handle of `account`'s loop, spawning the loop over `transport`
    /// when none is running yet. A running loop keeps its own transport.
    pub fn connection<T: XmppTransport>(
        &mut self,
        account: &str,
        transport: T,
    ) -> Result<CoreHandle, ClientError> {
        if let Some(handle) = self.handles.get(account).filter(|handle| !handle.is_closed()) {
            debug!(account, "reusing running connection");
            return Ok(handle.clone());
        }

        let (core, handle) = ConnectionCore::new(
            account,
            Arc::clone(&self.config),
            transport,
            self.services.clone(),
        )?;
        tokio::spawn(core.run());
        self.handles.insert(account.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn handle(&self, account: &str) -> Option<&CoreHandle> {
        self.handles.get(account)
    }

    /// Drop every handle; each loop closes its stream and stops.
    pub fn shutdown(&mut self) {
        let stopped = self.handles.len();
        self.handles.clear();
        info!(stopped, "all connections released");
    }
}
