//! Payment ledger: checkout attempts and their provider-reported outcomes.

use crate::error::{AccordError, Result};
use crate::lifecycle::LifecycleAction;
use crate::types::{
    AgreementRecord, Payment, PaymentId, PaymentMethod, PaymentOutcome, PaymentStatus,
};
use chrono::{DateTime, Utc};

/// Result of applying a provider outcome to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleResult {
    /// `pending` flipped to the carried status.
    Applied(PaymentStatus),
    /// Duplicate or late delivery for an already settled payment.
    AlreadySettled(PaymentStatus),
    /// No payment carries this reference.
    Unknown,
    /// The agreement is completed or void; its ledger is frozen.
    Closed,
}

impl SettleResult {
    pub fn succeeded_now(self) -> bool {
        self == Self::Applied(PaymentStatus::Succeeded)
    }
}

impl AgreementRecord {
    /// Record a pending checkout. Pending rows for different methods may coexist.
    pub fn record_payment_attempt(
        &mut self,
        method: PaymentMethod,
        amount_cents: u64,
        currency: &str,
        provider_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentId> {
        if self.status().is_terminal() {
            return Err(AccordError::invalid_transition(self.status(), LifecycleAction::Pay));
        }
        if provider_ref.trim().is_empty() {
            return Err(AccordError::Validation(
                "payment provider reference cannot be empty".to_string(),
            ));
        }
        if self.payment_by_ref(provider_ref).is_some() {
            return Err(AccordError::Conflict(format!(
                "payment reference '{provider_ref}' already recorded"
            )));
        }

        let payment = Payment {
            id: PaymentId::generate(),
            method,
            amount_cents,
            currency: currency.to_ascii_uppercase(),
            status: PaymentStatus::Pending,
            provider_ref: provider_ref.to_string(),
            created_at: now,
            updated_at: now,
        };
        let id = payment.id;
        self.payments.push(payment);
        Ok(id)
    }

    pub fn payment_by_ref(&self, provider_ref: &str) -> Option<&Payment> {
        self.payments.iter().find(|p| p.provider_ref == provider_ref)
    }

    /// `pending -> succeeded|failed`, once, and only while the agreement is open.
    /// Everything else is a no-op.
    pub fn settle_payment(
        &mut self,
        provider_ref: &str,
        outcome: PaymentOutcome,
        now: DateTime<Utc>,
    ) -> SettleResult {
        if self.status().is_terminal() {
            return SettleResult::Closed;
        }
        let Some(payment) = self
            .payments
            .iter_mut()
            .find(|p| p.provider_ref == provider_ref)
        else {
            return SettleResult::Unknown;
        };
        if payment.status != PaymentStatus::Pending {
            return SettleResult::AlreadySettled(payment.status);
        }
        payment.status = outcome.status();
        payment.updated_at = now;
        SettleResult::Applied(payment.status)
    }

    pub fn has_succeeded_payment(&self) -> bool {
        self.payments
            .iter()
            .any(|p| p.status == PaymentStatus::Succeeded)
    }

    pub fn pending_payments(&self) -> impl Iterator<Item = &Payment> {
        self.payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AgreementStatus;
    use crate::types::{Account, AccountId, NewAgreement};

    fn record() -> AgreementRecord {
        let owner = Account::new(AccountId::generate(), "lead@example.com").unwrap();
        let request = NewAgreement {
            rent_total_cents: 90_000,
            ..NewAgreement::default()
        };
        AgreementRecord::draft(&owner, request, Utc::now()).unwrap()
    }

    #[test]
    fn pending_attempts_for_both_methods_coexist() {
        let mut record = record();
        let now = Utc::now();
        record
            .record_payment_attempt(PaymentMethod::Card, 250, "usd", "cs_1", now)
            .unwrap();
        record
            .record_payment_attempt(PaymentMethod::Crypto, 200, "USD", "ch_1", now)
            .unwrap();

        assert_eq!(record.pending_payments().count(), 2);
        assert_eq!(record.payment_by_ref("cs_1").unwrap().currency, "USD");
        assert!(!record.has_succeeded_payment());
    }

    #[test]
    fn duplicate_reference_is_rejected() {
        let mut record = record();
        let now = Utc::now();
        record
            .record_payment_attempt(PaymentMethod::Card, 250, "USD", "cs_1", now)
            .unwrap();
        assert!(record
            .record_payment_attempt(PaymentMethod::Card, 250, "USD", "cs_1", now)
            .is_err());
    }

    #[test]
    fn settle_flips_exactly_once() {
        let mut record = record();
        let now = Utc::now();
        record
            .record_payment_attempt(PaymentMethod::Card, 250, "USD", "cs_1", now)
            .unwrap();

        let first = record.settle_payment("cs_1", PaymentOutcome::Succeeded, now);
        let replay = record.settle_payment("cs_1", PaymentOutcome::Succeeded, now);
        let late_failure = record.settle_payment("cs_1", PaymentOutcome::Failed, now);

        assert!(first.succeeded_now());
        assert_eq!(replay, SettleResult::AlreadySettled(PaymentStatus::Succeeded));
        assert_eq!(late_failure, SettleResult::AlreadySettled(PaymentStatus::Succeeded));
        assert!(record.has_succeeded_payment());
    }

    #[test]
    fn terminal_agreement_ledger_is_frozen() {
        let mut record = record();
        let now = Utc::now();
        record
            .record_payment_attempt(PaymentMethod::Crypto, 200, "USD", "ch_1", now)
            .unwrap();
        record.agreement.status = AgreementStatus::Completed;
        let before = record.clone();

        let result = record.settle_payment("ch_1", PaymentOutcome::Succeeded, now);

        assert_eq!(result, SettleResult::Closed);
        assert!(!result.succeeded_now());
        assert_eq!(record, before);
    }

    #[test]
    fn unknown_reference_is_a_no_op() {
        let mut record = record();
        let before = record.clone();
        assert_eq!(
            record.settle_payment("nope", PaymentOutcome::Succeeded, Utc::now()),
            SettleResult::Unknown
        );
        assert_eq!(record, before);
    }
}
