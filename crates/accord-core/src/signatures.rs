//! Signature tracker: e-signature envelope status per agreement.

use crate::error::{AccordError, Result};
use crate::types::{AgreementRecord, EnvelopeId, EnvelopeStatus, SignatureEnvelope};
use chrono::{DateTime, Utc};

/// What an envelope status update means for the agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeSignal {
    Unknown,
    Unchanged,
    Completed,
    Voided,
    /// The agreement is completed or void; its envelopes are frozen.
    Closed,
}

impl AgreementRecord {
    /// The envelope currently out for signature.
    pub fn active_envelope(&self) -> Option<&SignatureEnvelope> {
        self.envelopes
            .iter()
            .find(|e| e.status == EnvelopeStatus::Sent)
    }

    pub fn envelope_by_external_id(&self, external_id: &str) -> Option<&SignatureEnvelope> {
        self.envelopes.iter().find(|e| e.external_id == external_id)
    }

    pub fn record_envelope(&mut self, external_id: &str, now: DateTime<Utc>) -> Result<EnvelopeId> {
        if self.active_envelope().is_some() {
            return Err(AccordError::EnvelopeAlreadyActive);
        }
        if self.envelope_by_external_id(external_id).is_some() {
            return Err(AccordError::Conflict(format!(
                "envelope '{external_id}' already recorded"
            )));
        }
        let envelope = SignatureEnvelope {
            id: EnvelopeId::generate(),
            external_id: external_id.to_string(),
            status: EnvelopeStatus::Sent,
            created_at: now,
            updated_at: now,
        };
        let id = envelope.id;
        self.envelopes.push(envelope);
        Ok(id)
    }

    /// Apply a provider status. Settled envelopes, and every envelope of a completed or
    /// void agreement, never change again.
    pub fn update_envelope_status(
        &mut self,
        external_id: &str,
        status: EnvelopeStatus,
        now: DateTime<Utc>,
    ) -> EnvelopeSignal {
        if self.status().is_terminal() {
            return EnvelopeSignal::Closed;
        }
        let Some(envelope) = self
            .envelopes
            .iter_mut()
            .find(|e| e.external_id == external_id)
        else {
            return EnvelopeSignal::Unknown;
        };
        if envelope.status != EnvelopeStatus::Sent || status == EnvelopeStatus::Sent {
            return EnvelopeSignal::Unchanged;
        }
        envelope.status = status;
        envelope.updated_at = now;
        match status {
            EnvelopeStatus::Completed => EnvelopeSignal::Completed,
            EnvelopeStatus::Voided => EnvelopeSignal::Voided,
            EnvelopeStatus::Sent => EnvelopeSignal::Unchanged,
        }
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
    fn only_one_active_envelope() {
        let mut record = record();
        record.record_envelope("env-1", Utc::now()).unwrap();
        assert!(matches!(
            record.record_envelope("env-2", Utc::now()).unwrap_err(),
            AccordError::EnvelopeAlreadyActive
        ));
    }

    #[test]
    fn voided_envelope_frees_the_slot() {
        let mut record = record();
        record.record_envelope("env-1", Utc::now()).unwrap();
        assert_eq!(
            record.update_envelope_status("env-1", EnvelopeStatus::Voided, Utc::now()),
            EnvelopeSignal::Voided
        );
        assert!(record.active_envelope().is_none());
        record.record_envelope("env-2", Utc::now()).unwrap();
    }

    #[test]
    fn status_updates_are_idempotent() {
        let mut record = record();
        record.record_envelope("env-1", Utc::now()).unwrap();

        assert_eq!(
            record.update_envelope_status("env-1", EnvelopeStatus::Completed, Utc::now()),
            EnvelopeSignal::Completed
        );
        assert_eq!(
            record.update_envelope_status("env-1", EnvelopeStatus::Completed, Utc::now()),
            EnvelopeSignal::Unchanged
        );
        assert_eq!(
            record.update_envelope_status("env-1", EnvelopeStatus::Voided, Utc::now()),
            EnvelopeSignal::Unchanged
        );
        assert_eq!(
            record.update_envelope_status("env-x", EnvelopeStatus::Completed, Utc::now()),
            EnvelopeSignal::Unknown
        );
        assert_eq!(
            record.envelope_by_external_id("env-1").unwrap().status,
            EnvelopeStatus::Completed
        );
    }

    #[test]
    fn terminal_agreement_freezes_envelopes() {
        let mut record = record();
        record.record_envelope("env-1", Utc::now()).unwrap();
        record.agreement.status = AgreementStatus::Void;
        let before = record.clone();

        assert_eq!(
            record.update_envelope_status("env-1", EnvelopeStatus::Completed, Utc::now()),
            EnvelopeSignal::Closed
        );
        assert_eq!(record, before);
    }
}
