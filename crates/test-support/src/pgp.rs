//! A [`PgpBackend`] whose answers are set up by the test.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tern_security::{PgpBackend, PgpError};

#[derive(Debug, Default)]
struct FakeState {
    ciphertext: Option<String>,
    encrypt_fails: bool,
    bad_passphrase: bool,
    plaintexts: HashMap<String, String>,
    signers: HashMap<String, String>,
    secret_keys: BTreeMap<String, String>,
    passphrase: Option<String>,
    calls: Vec<&'static str>,
}

/// Signs with `sig(<text>)`, verifies only registered signatures and
/// decrypts only registered ciphertexts. Every call is recorded by name.
#[derive(Debug, Default)]
pub struct FakePgp {
    state: Mutex<FakeState>,
}

impl FakePgp {
    pub fn new() -> Self {
        Self::default()
    }

    /// `encrypt` returns `ciphertext` whatever the input.
    pub fn with_ciphertext(self, ciphertext: impl Into<String>) -> Self {
        self.state().ciphertext = Some(ciphertext.into());
        self
    }

    pub fn failing_encryption(self) -> Self {
        self.state().encrypt_fails = true;
        self
    }

    /// `sign` and `decrypt` report a bad passphrase.
    pub fn with_bad_passphrase(self) -> Self {
        self.state().bad_passphrase = true;
        self
    }

    pub fn with_plaintext(self, ciphertext: impl Into<String>, plaintext: impl Into<String>) -> Self {
        self.state()
            .plaintexts
            .insert(ciphertext.into(), plaintext.into());
        self
    }

    /// `signature` verifies as made by `key_id`.
    pub fn with_signer(self, signature: impl Into<String>, key_id: impl Into<String>) -> Self {
        self.state().signers.insert(signature.into(), key_id.into());
        self
    }

    pub fn with_secret_key(self, key_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.state()
            .secret_keys
            .insert(key_id.into(), user_id.into());
        self
    }

    /// Names of the operations called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn passphrase(&self) -> Option<String> {
        self.state().passphrase.clone()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: &'static str) -> MutexGuard<'_, FakeState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }
}

impl PgpBackend for FakePgp {
    fn sign(&self, text: &str, _key_id: &str) -> Result<String, PgpError> {
        let state = self.record("sign");
        if state.bad_passphrase {
            return Err(PgpError::BadPassphrase);
        }
        Ok(format!("sig({text})"))
    }

    fn verify(&self, _text: &str, signature: &str) -> Result<Option<String>, PgpError> {
        let state = self.record("verify");
        Ok(state.signers.get(signature).cloned())
    }

    fn encrypt(&self, text: &str, _recipients: &[String]) -> Result<String, PgpError> {
        let state = self.record("encrypt");
        if state.encrypt_fails {
            return Err(PgpError::Failed("public key not found".to_string()));
        }
        Ok(state
            .ciphertext
            .clone()
            .unwrap_or_else(|| format!("enc({text})")))
    }

    fn decrypt(&self, ciphertext: &str, _key_id: &str) -> Result<String, PgpError> {
        let state = self.record("decrypt");
        if state.bad_passphrase {
            return Err(PgpError::BadPassphrase);
        }
        state
            .plaintexts
            .get(ciphertext)
            .cloned()
            .ok_or_else(|| PgpError::Failed("decryption failed".to_string()))
    }

    fn list_secret_keys(&self) -> Result<BTreeMap<String, String>, PgpError> {
        Ok(self.record("list_secret_keys").secret_keys.clone())
    }

    fn set_passphrase(&self, passphrase: Option<String>) {
        self.record("set_passphrase").passphrase = passphrase;
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn answers_follow_the_setup() {
        let pgp = FakePgp::new()
            .with_ciphertext("XYZ")
            .with_plaintext("XYZ", "hello")
            .with_signer("iQEz", "89ABCDEF");

        assert_eq!(pgp.encrypt("hello", &["89ABCDEF".into()]).unwrap(), "XYZ");
        assert_eq!(pgp.decrypt("XYZ", "89ABCDEF").unwrap(), "hello");
        assert_matches!(pgp.decrypt("other", "89ABCDEF"), Err(PgpError::Failed(_)));
        assert_eq!(pgp.verify("status", "iQEz").unwrap().as_deref(), Some("89ABCDEF"));
        assert_eq!(pgp.verify("status", "forged").unwrap(), None);
        assert_eq!(
            pgp.calls(),
            vec!["encrypt", "decrypt", "decrypt", "verify", "verify"]
        );
    }

    #[test]
    fn bad_passphrase_fails_signing() {
        let pgp = FakePgp::new().with_bad_passphrase();
        assert_matches!(pgp.sign("Online", "89ABCDEF"), Err(PgpError::BadPassphrase));
        pgp.set_passphrase(Some("hunter2".into()));
        assert_eq!(pgp.passphrase().as_deref(), Some("hunter2"));
    }
}
