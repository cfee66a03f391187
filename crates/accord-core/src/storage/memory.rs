//! In-memory agreement store for development and tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use super::traits::AgreementStore;
use super::{index_keys, IndexKind};
use crate::audit::{AuditEntry, AuditHead};
use crate::error::{AccordError, Result};
use crate::types::{
    normalize_email, Account, AccountId, AgreementId, AgreementRecord, IdentityVerification,
    VerificationId,
};

#[derive(Default)]
struct MemoryState {
    agreements: HashMap<AgreementId, AgreementRecord>,
    audit: HashMap<AgreementId, Vec<AuditEntry>>,
    index: HashMap<(IndexKind, String), BTreeSet<AgreementId>>,
    indexed_keys: HashMap<AgreementId, Vec<(IndexKind, String)>>,
    accounts: HashMap<AccountId, Account>,
    verifications: HashMap<VerificationId, IdentityVerification>,
}

impl MemoryState {
    fn unindex(&mut self, id: AgreementId) {
        for key in self.indexed_keys.remove(&id).unwrap_or_default() {
            if let Some(ids) = self.index.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }
}

/// All state behind one lock so a save is observed whole or not at all.
pub struct InMemoryAgreementStore {
    state: RwLock<MemoryState>,
}

impl InMemoryAgreementStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub async fn agreement_count(&self) -> usize {
        self.state.read().await.agreements.len()
    }
}

impl Default for InMemoryAgreementStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgreementStore for InMemoryAgreementStore {
    fn label(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, record: &AgreementRecord, audit: &[AuditEntry]) -> Result<u64> {
        let id = record.id();
        let mut state = self.state.write().await;

        let stored_version = state.agreements.get(&id).map(|r| r.version);
        match stored_version {
            None if record.version != 0 => {
                return Err(AccordError::Conflict(format!(
                    "agreement '{id}' no longer exists"
                )))
            }
            Some(current) if current != record.version => {
                return Err(AccordError::Conflict(format!(
                    "agreement '{id}' is at version {current}, write was based on {}",
                    record.version
                )))
            }
            _ => {}
        }

        let keys = index_keys(record);
        for key in keys.iter().filter(|(kind, _)| kind.is_unique()) {
            if let Some(owners) = state.index.get(key) {
                if owners.iter().any(|owner| *owner != id) {
                    return Err(AccordError::Conflict(format!(
                        "{} '{}' belongs to another agreement",
                        key.0.name(),
                        key.1
                    )));
                }
            }
        }

        let chain = state.audit.get(&id);
        let mut next_index = chain.map(|c| c.len() as u64).unwrap_or(0);
        let mut last_hash = chain.and_then(|c| c.last()).map(|e| e.entry_hash.clone());
        for entry in audit {
            if entry.agreement_id != id
                || entry.index != next_index
                || entry.previous_hash != last_hash
            {
                return Err(AccordError::Conflict(format!(
                    "audit entry {} does not extend the chain of agreement '{id}'",
                    entry.index
                )));
            }
            next_index += 1;
            last_hash = Some(entry.entry_hash.clone());
        }

        let version = record.version + 1;
        let mut stored = record.clone();
        stored.version = version;

        state.unindex(id);
        for key in &keys {
            state.index.entry(key.clone()).or_default().insert(id);
        }
        state.indexed_keys.insert(id, keys);
        state.agreements.insert(id, stored);
        state
            .audit
            .entry(id)
            .or_default()
            .extend(audit.iter().cloned());
        Ok(version)
    }

    async fn load(&self, id: AgreementId) -> Result<Option<AgreementRecord>> {
        Ok(self.state.read().await.agreements.get(&id).cloned())
    }

    async fn delete(&self, id: AgreementId) -> Result<bool> {
        let mut state = self.state.write().await;
        state.unindex(id);
        state.audit.remove(&id);
        Ok(state.agreements.remove(&id).is_some())
    }

    async fn find(&self, kind: IndexKind, key: &str) -> Result<Vec<AgreementId>> {
        let state = self.state.read().await;
        Ok(state
            .index
            .get(&(kind, key.to_string()))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn audit_head(&self, id: AgreementId) -> Result<Option<AuditHead>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .get(&id)
            .and_then(|chain| chain.last())
            .map(|entry| AuditHead {
                index: entry.index,
                entry_hash: entry.entry_hash.clone(),
            }))
    }

    async fn load_audit(&self, id: AgreementId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .state
            .read()
            .await
            .audit
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        let mut state = self.state.write().await;
        let email = normalize_email(&account.email);
        if state
            .accounts
            .values()
            .any(|other| other.id != account.id && other.email == email)
        {
            return Err(AccordError::Conflict(format!(
                "email '{email}' is registered to another account"
            )));
        }
        let mut stored = account.clone();
        stored.email = email;
        state.accounts.insert(account.id, stored);
        Ok(())
    }

    async fn load_account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.state.read().await.accounts.get(&id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let email = normalize_email(email);
        Ok(self
            .state
            .read()
            .await
            .accounts
            .values()
            .find(|account| account.email == email)
            .cloned())
    }

    async fn insert_verification(&self, verification: &IdentityVerification) -> Result<()> {
        let mut state = self.state.write().await;
        if state.verifications.values().any(|v| {
            v.provider == verification.provider && v.external_ref == verification.external_ref
        }) {
            return Err(AccordError::Conflict(format!(
                "verification '{}' already recorded for {}",
                verification.external_ref, verification.provider
            )));
        }
        state
            .verifications
            .insert(verification.id, verification.clone());
        Ok(())
    }

    async fn find_verification(
        &self,
        provider: &str,
        external_ref: &str,
    ) -> Result<Option<IdentityVerification>> {
        Ok(self
            .state
            .read()
            .await
            .verifications
            .values()
            .find(|v| v.provider == provider && v.external_ref == external_ref)
            .cloned())
    }

    async fn save_verification(
        &self,
        verification: &IdentityVerification,
        account: Option<&Account>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.verifications.contains_key(&verification.id) {
            return Err(AccordError::Storage(format!(
                "verification '{}' not found",
                verification.id
            )));
        }
        if let Some(account) = account {
            if !state.accounts.contains_key(&account.id) {
                return Err(AccordError::AccountNotFound(account.id.to_string()));
            }
            state.accounts.insert(account.id, account.clone());
        }
        state
            .verifications
            .insert(verification.id, verification.clone());
        Ok(())
    }
}
