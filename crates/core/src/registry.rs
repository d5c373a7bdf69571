//! Process-wide contact and capabilities tables.
//!
//! Every account connection runs its own loop, so these tables are the only
//! state shared between loops. Writes for an account come from that account's
//! presence engine; everything else reads snapshots.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::contact::Contact;
use crate::error::RegistryError;

#[derive(Debug, Default)]
pub struct ContactRegistry {
    accounts: RwLock<HashMap<String, HashMap<String, Contact>>>,
    caps: RwLock<HashMap<String, Vec<String>>>,
}

impl ContactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the empty contact table for an account.
    pub fn init_account(&self, account: &str) -> Result<(), RegistryError> {
        let mut accounts = write(&self.accounts);
        if accounts.contains_key(account) {
            return Err(RegistryError::DuplicateAccount(account.to_string()));
        }
        accounts.insert(account.to_string(), HashMap::new());
        debug!(account = %account, "contact table initialised");
        Ok(())
    }

    /// Drop every contact of an account.
    pub fn teardown_account(&self, account: &str) {
        if write(&self.accounts).remove(account).is_some() {
            debug!(account = %account, "contact table torn down");
        }
    }

    pub fn has_account(&self, account: &str) -> bool {
        read(&self.accounts).contains_key(account)
    }

    pub fn accounts(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.accounts).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contact(&self, account: &str, jid: &str) -> Option<Contact> {
        read(&self.accounts)
            .get(account)
            .and_then(|contacts| contacts.get(jid))
            .cloned()
    }

    pub fn contacts(&self, account: &str) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = read(&self.accounts)
            .get(account)
            .map(|contacts| contacts.values().cloned().collect())
            .unwrap_or_default();
        contacts.sort_by(|left, right| left.jid.cmp(&right.jid));
        contacts
    }

    /// Apply `update` to the contact for `jid`, creating it with `Contact::new`
    /// first when it is unknown. Returns whatever `update` returns.
    pub fn with_contact<R>(
        &self,
        account: &str,
        jid: &str,
        update: impl FnOnce(&mut Contact) -> R,
    ) -> Result<R, RegistryError> {
        let mut accounts = write(&self.accounts);
        let contacts = accounts
            .get_mut(account)
            .ok_or_else(|| RegistryError::UnknownAccount(account.to_string()))?;
        let contact = contacts
            .entry(jid.to_string())
            .or_insert_with(|| Contact::new(jid));
        Ok(update(contact))
    }

    /// Apply `update` only when the contact already exists.
    pub fn update_existing<R>(
        &self,
        account: &str,
        jid: &str,
        update: impl FnOnce(&mut Contact) -> R,
    ) -> Option<R> {
        write(&self.accounts)
            .get_mut(account)
            .and_then(|contacts| contacts.get_mut(jid))
            .map(update)
    }

    pub fn remove_contact(&self, account: &str, jid: &str) -> Option<Contact> {
        write(&self.accounts)
            .get_mut(account)
            .and_then(|contacts| contacts.remove(jid))
    }

    pub fn record_caps(&self, hash: impl Into<String>, features: Vec<String>) {
        write(&self.caps).insert(hash.into(), features);
    }

    pub fn caps_features(&self, hash: &str) -> Option<Vec<String>> {
        read(&self.caps).get(hash).cloned()
    }

    /// Whether any known resource of the contact advertises `feature`.
    pub fn contact_supports(&self, account: &str, jid: &str, feature: &str) -> bool {
        let Some(contact) = self.contact(account, jid) else {
            return false;
        };
        let caps = read(&self.caps);
        contact
            .resources
            .iter()
            .filter_map(|entry| entry.caps_hash.as_deref())
            .filter_map(|hash| caps.get(hash))
            .any(|features| features.iter().any(|known| known == feature))
    }
}

// Poisoned locks are recovered; the maps hold no invariant a panic can break.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
