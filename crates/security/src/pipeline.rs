//! Runs PGP operations off the protocol loop.
//!
//! gpg is a subprocess with unbounded latency, so every request goes to the
//! blocking pool and its result comes back on a channel the connection loop
//! drains alongside inbound stanzas. The caller's context travels with the
//! request so the loop can pick up where it left off.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::PgpError;
use crate::backend::PgpBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgpRequest {
    Sign { text: String, key_id: String },
    Verify { text: String, signature: String },
    Encrypt { text: String, recipient: String },
    Decrypt { ciphertext: String, key_id: String },
    ListSecretKeys,
}

/// Result of a [`PgpRequest`], already reduced to what the caller acts on.
#[derive(Debug)]
pub enum PgpReply {
    Signed(Result<String, PgpError>),
    /// `None` means unverified.
    Verified(Option<String>),
    /// `None` means the message goes out unencrypted.
    Encrypted(Option<String>),
    Decrypted(Result<String, PgpError>),
    SecretKeys(Result<BTreeMap<String, String>, PgpError>),
}

#[derive(Debug)]
pub struct SecurityCompletion<C> {
    pub context: C,
    pub reply: PgpReply,
}

pub struct SecurityPipeline<C> {
    backend: Option<Arc<dyn PgpBackend>>,
    completions: mpsc::UnboundedSender<SecurityCompletion<C>>,
}

impl<C: Send + 'static> SecurityPipeline<C> {
    /// A pipeline without a backend accepts no requests.
    pub fn new(
        backend: Option<Arc<dyn PgpBackend>>,
    ) -> (Self, mpsc::UnboundedReceiver<SecurityCompletion<C>>) {
        let (completions, receiver) = mpsc::unbounded_channel();
        (
            Self {
                backend,
                completions,
            },
            receiver,
        )
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn set_passphrase(&self, passphrase: Option<String>) {
        if let Some(backend) = &self.backend {
            backend.set_passphrase(passphrase);
        }
    }

    /// Queue `request`; its completion arrives on the receiver returned by
    /// [`SecurityPipeline::new`]. Returns `false` when there is no backend.
    pub fn submit(&self, context: C, request: PgpRequest) -> bool {
        let Some(backend) = self.backend.clone() else {
            debug!("pgp request dropped, no backend");
            return false;
        };
        let completions = self.completions.clone();
        tokio::task::spawn_blocking(move || {
            let reply = execute(backend.as_ref(), request);
            if completions.send(SecurityCompletion { context, reply }).is_err() {
                debug!("pgp completion dropped, connection loop is gone");
            }
        });
        true
    }
}

fn execute(backend: &dyn PgpBackend, request: PgpRequest) -> PgpReply {
    match request {
        PgpRequest::Sign { text, key_id } => PgpReply::Signed(backend.sign(&text, &key_id)),
        PgpRequest::Verify { text, signature } => {
            PgpReply::Verified(match backend.verify(&text, &signature) {
                Ok(key_id) => key_id.filter(|key_id| !key_id.is_empty()),
                Err(error) => {
                    warn!(error = %error, "signature verification failed");
                    None
                }
            })
        }
        PgpRequest::Encrypt { text, recipient } => {
            PgpReply::Encrypted(match backend.encrypt(&text, &[recipient]) {
                Ok(ciphertext) if !ciphertext.is_empty() => Some(ciphertext),
                Ok(_) => None,
                Err(error) => {
                    warn!(error = %error, "encryption failed, sending in the clear");
                    None
                }
            })
        }
        PgpRequest::Decrypt { ciphertext, key_id } => {
            PgpReply::Decrypted(backend.decrypt(&ciphertext, &key_id))
        }
        PgpRequest::ListSecretKeys => PgpReply::SecretKeys(backend.list_secret_keys()),
    }
}
