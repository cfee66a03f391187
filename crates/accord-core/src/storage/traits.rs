use async_trait::async_trait;

use super::IndexKind;
use crate::audit::{AuditEntry, AuditHead};
use crate::error::Result;
use crate::types::{
    normalize_email, Account, AccountId, AgreementId, AgreementRecord, IdentityVerification,
};

/// Trait for agreement persistence backends.
#[async_trait]
pub trait AgreementStore: Send + Sync {
    fn label(&self) -> &'static str;

    /// Atomically write the aggregate, its lookup index and `audit`.
    ///
    /// `record.version` is the version the caller loaded (0 for a new agreement). A stale
    /// version, a taken external reference or a broken audit chain fail with `Conflict`
    /// and write nothing. Returns the new version.
    async fn save(&self, record: &AgreementRecord, audit: &[AuditEntry]) -> Result<u64>;

    async fn load(&self, id: AgreementId) -> Result<Option<AgreementRecord>>;

    /// Delete an agreement together with its children and audit chain.
    async fn delete(&self, id: AgreementId) -> Result<bool>;

    async fn find(&self, kind: IndexKind, key: &str) -> Result<Vec<AgreementId>>;

    async fn audit_head(&self, id: AgreementId) -> Result<Option<AuditHead>>;

    async fn load_audit(&self, id: AgreementId) -> Result<Vec<AuditEntry>>;

    /// Insert or update an account. Emails are unique across accounts.
    async fn upsert_account(&self, account: &Account) -> Result<()>;

    async fn load_account(&self, id: AccountId) -> Result<Option<Account>>;

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>>;

    async fn insert_verification(&self, verification: &IdentityVerification) -> Result<()>;

    async fn find_verification(
        &self,
        provider: &str,
        external_ref: &str,
    ) -> Result<Option<IdentityVerification>>;

    /// Persist a verification update and, when given, the account it verified, together.
    async fn save_verification(
        &self,
        verification: &IdentityVerification,
        account: Option<&Account>,
    ) -> Result<()>;

    async fn find_by_invite_token(&self, token: &str) -> Result<Option<AgreementId>> {
        Ok(self.find(IndexKind::InviteToken, token).await?.into_iter().next())
    }

    async fn find_by_payment_ref(&self, provider_ref: &str) -> Result<Option<AgreementId>> {
        Ok(self
            .find(IndexKind::PaymentRef, provider_ref)
            .await?
            .into_iter()
            .next())
    }

    async fn find_by_envelope(&self, external_id: &str) -> Result<Option<AgreementId>> {
        Ok(self
            .find(IndexKind::Envelope, external_id)
            .await?
            .into_iter()
            .next())
    }

    async fn agreements_for_member(&self, account: AccountId) -> Result<Vec<AgreementId>> {
        self.find(IndexKind::Member, &account.to_string()).await
    }

    async fn agreements_for_email(&self, email: &str) -> Result<Vec<AgreementId>> {
        self.find(IndexKind::PartyEmail, &normalize_email(email))
            .await
    }
}
