use std::collections::BTreeMap;

#[cfg(test)]
use mockall::automock;

use crate::PgpError;

/// The OpenPGP operations the client needs. Implementations may block;
/// callers on the protocol loop go through the security pipeline.
#[cfg_attr(test, automock)]
pub trait PgpBackend: Send + Sync {
    /// Detached signature over `text`, armor stripped.
    fn sign(&self, text: &str, key_id: &str) -> Result<String, PgpError>;

    /// Key id of a good signature over `text`, `None` when it does not verify.
    fn verify(&self, text: &str, signature: &str) -> Result<Option<String>, PgpError>;

    /// Ciphertext for `recipients`, armor stripped.
    fn encrypt(&self, text: &str, recipients: &[String]) -> Result<String, PgpError>;

    fn decrypt(&self, ciphertext: &str, key_id: &str) -> Result<String, PgpError>;

    /// Secret key ids mapped to their user ids.
    fn list_secret_keys(&self) -> Result<BTreeMap<String, String>, PgpError>;

    fn set_passphrase(&self, passphrase: Option<String>);
}
