//! Account-scoped identity verification records.

use crate::types::{AccountId, IdentityVerification, VerificationId, VerificationStatus};
use chrono::{DateTime, Utc};

/// Effect of a provider result on a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationChange {
    Unchanged,
    Approved,
    Rejected,
}

impl IdentityVerification {
    pub fn pending(
        account_id: AccountId,
        provider: impl Into<String>,
        external_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: VerificationId::generate(),
            account_id,
            provider: provider.into(),
            status: VerificationStatus::Pending,
            external_ref: external_ref.into(),
            created_at: now,
            completed_at: None,
        }
    }

    /// `pending -> approved|rejected`, once. Settled verifications never revert.
    pub fn apply_result(&mut self, status: VerificationStatus, now: DateTime<Utc>) -> VerificationChange {
        if self.status != VerificationStatus::Pending {
            return VerificationChange::Unchanged;
        }
        match status {
            VerificationStatus::Pending => VerificationChange::Unchanged,
            VerificationStatus::Approved => {
                self.status = status;
                self.completed_at = Some(now);
                VerificationChange::Approved
            }
            VerificationStatus::Rejected => {
                self.status = status;
                self.completed_at = Some(now);
                VerificationChange::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_is_sticky() {
        let mut verification =
            IdentityVerification::pending(AccountId::generate(), "persona", "inq_1", Utc::now());

        assert_eq!(
            verification.apply_result(VerificationStatus::Pending, Utc::now()),
            VerificationChange::Unchanged
        );
        assert_eq!(
            verification.apply_result(VerificationStatus::Approved, Utc::now()),
            VerificationChange::Approved
        );
        assert_eq!(
            verification.apply_result(VerificationStatus::Rejected, Utc::now()),
            VerificationChange::Unchanged
        );
        assert_eq!(verification.status, VerificationStatus::Approved);
        assert!(verification.completed_at.is_some());
    }
}
