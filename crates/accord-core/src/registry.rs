//! Party registry: membership plus per-party verification and signature bookkeeping.

use crate::error::{AccordError, Result};
use crate::types::{
    normalize_email, validate_email, Account, AgreementRecord, Party, PartyId, PartyRole,
    PartySpec,
};
use chrono::{DateTime, Utc};

impl AgreementRecord {
    /// Add a party placeholder. Emails are unique per agreement, case-insensitively.
    pub fn add_party(&mut self, role: PartyRole, spec: &PartySpec) -> Result<PartyId> {
        let email = validate_email(&spec.email)?;
        if self.party_by_email(&email).is_some() {
            return Err(AccordError::DuplicateParty { email });
        }
        if role == PartyRole::Initiator && self.initiator_party().is_some() {
            return Err(AccordError::Validation(
                "agreement already has an initiator".to_string(),
            ));
        }

        let party = Party {
            id: PartyId::generate(),
            role,
            email,
            phone: spec.phone.clone(),
            account_id: None,
            rent_share_cents: spec.rent_share_cents,
            utilities: spec.utilities.clone(),
            chores: spec.chores.clone(),
            requires_id_verification: spec.requires_id_verification,
            id_verified: false,
            signed: false,
            signed_at: None,
            joined_at: None,
        };
        let id = party.id;
        self.parties.push(party);
        Ok(id)
    }

    pub fn initiator_party(&self) -> Option<&Party> {
        self.parties.iter().find(|p| p.role == PartyRole::Initiator)
    }

    /// Link `account` to the party addressed by `email`, creating a roommate party when
    /// none exists. Nothing is mutated unless the link succeeds.
    pub fn link_user(
        &mut self,
        email: &str,
        account: &Account,
        demo_mode: bool,
        now: DateTime<Utc>,
    ) -> Result<PartyId> {
        let email = normalize_email(email);

        if let Some(existing) = self.party_for_account(account.id) {
            if existing.email == email {
                return Ok(existing.id);
            }
            return Err(AccordError::DuplicateParty {
                email: account.email.clone(),
            });
        }

        let party_id = match self.party_by_email(&email) {
            Some(party) => {
                if party.account_id.is_some() {
                    return Err(AccordError::DuplicateParty { email });
                }
                if party.requires_id_verification
                    && !party.id_verified
                    && !account.is_verified
                    && !demo_mode
                {
                    return Err(AccordError::VerificationRequired(format!(
                        "party '{email}' must verify their identity before joining"
                    )));
                }
                party.id
            }
            None => {
                let spec = PartySpec {
                    phone: account.phone.clone(),
                    ..PartySpec::new(email.clone())
                };
                self.add_party(PartyRole::Roommate, &spec)?
            }
        };

        if let Some(party) = self.party_mut(party_id) {
            party.account_id = Some(account.id);
            party.joined_at = Some(now);
            if party.phone.is_none() {
                party.phone = account.phone.clone();
            }
            if account.is_verified || demo_mode {
                party.id_verified = true;
            }
        }
        self.agreement.updated_at = now;
        Ok(party_id)
    }

    /// Idempotent: returns `true` only the first time the party signs.
    pub fn mark_signed(&mut self, party_id: PartyId, now: DateTime<Utc>) -> Result<bool> {
        let party = self
            .party_mut(party_id)
            .ok_or_else(|| AccordError::Validation(format!("party '{party_id}' not found")))?;
        if party.signed {
            return Ok(false);
        }
        party.signed = true;
        party.signed_at = Some(now);
        Ok(true)
    }

    /// Number of parties that flipped to signed.
    pub fn mark_all_signed(&mut self, now: DateTime<Utc>) -> usize {
        let mut flipped = 0;
        for party in self.parties.iter_mut().filter(|p| !p.signed) {
            party.signed = true;
            party.signed_at = Some(now);
            flipped += 1;
        }
        flipped
    }

    pub fn unjoined_count(&self) -> usize {
        self.parties.iter().filter(|p| !p.is_joined()).count()
    }

    pub fn unsigned_count(&self) -> usize {
        self.parties.iter().filter(|p| !p.signed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, NewAgreement};

    fn record_with(roommates: Vec<PartySpec>) -> (Account, AgreementRecord) {
        let owner = Account::new(AccountId::generate(), "lead@example.com").unwrap();
        let request = NewAgreement {
            rent_total_cents: 120_000,
            roommates,
            ..NewAgreement::default()
        };
        let record = AgreementRecord::draft(&owner, request, Utc::now()).unwrap();
        (owner, record)
    }

    #[test]
    fn duplicate_email_is_rejected_case_insensitively() {
        let (_, mut record) = record_with(vec![PartySpec::new("mate@example.com")]);
        let err = record
            .add_party(PartyRole::Roommate, &PartySpec::new("MATE@Example.com"))
            .unwrap_err();
        assert!(matches!(err, AccordError::DuplicateParty { .. }));
        assert_eq!(record.parties.len(), 2);
    }

    #[test]
    fn link_is_idempotent_for_the_same_account() {
        let (_, mut record) = record_with(vec![PartySpec::new("mate@example.com")]);
        let mate = Account::new(AccountId::generate(), "mate@example.com").unwrap();

        let first = record.link_user("mate@example.com", &mate, false, Utc::now()).unwrap();
        let second = record.link_user("MATE@example.com", &mate, false, Utc::now()).unwrap();

        assert_eq!(first, second);
        assert_eq!(record.unjoined_count(), 0);
        assert_eq!(record.parties.len(), 2);
    }

    #[test]
    fn link_creates_party_when_none_exists() {
        let (_, mut record) = record_with(vec![]);
        let mate = Account::new(AccountId::generate(), "new@example.com")
            .unwrap()
            .with_phone("+15550100");

        let id = record.link_user("new@example.com", &mate, false, Utc::now()).unwrap();
        let party = record.party(id).unwrap();
        assert_eq!(party.role, PartyRole::Roommate);
        assert_eq!(party.account_id, Some(mate.id));
        assert_eq!(party.phone.as_deref(), Some("+15550100"));
    }

    #[test]
    fn verification_gate_blocks_unverified_accounts() {
        let (_, mut record) =
            record_with(vec![PartySpec::new("mate@example.com").requiring_verification()]);
        let mut mate = Account::new(AccountId::generate(), "mate@example.com").unwrap();

        let err = record
            .link_user("mate@example.com", &mate, false, Utc::now())
            .unwrap_err();
        assert!(matches!(err, AccordError::VerificationRequired(_)));
        assert_eq!(record.unjoined_count(), 1);

        mate.is_verified = true;
        let id = record.link_user("mate@example.com", &mate, false, Utc::now()).unwrap();
        assert!(record.party(id).unwrap().id_verified);
    }

    #[test]
    fn demo_mode_bypasses_verification() {
        let (_, mut record) =
            record_with(vec![PartySpec::new("mate@example.com").requiring_verification()]);
        let mate = Account::new(AccountId::generate(), "mate@example.com").unwrap();

        let id = record.link_user("mate@example.com", &mate, true, Utc::now()).unwrap();
        assert!(record.party(id).unwrap().id_verified);
    }

    #[test]
    fn party_linked_to_other_account_is_a_duplicate() {
        let (_, mut record) = record_with(vec![PartySpec::new("mate@example.com")]);
        let first = Account::new(AccountId::generate(), "mate@example.com").unwrap();
        let second = Account::new(AccountId::generate(), "mate@example.com").unwrap();

        record.link_user("mate@example.com", &first, false, Utc::now()).unwrap();
        let err = record
            .link_user("mate@example.com", &second, false, Utc::now())
            .unwrap_err();
        assert!(matches!(err, AccordError::DuplicateParty { .. }));
    }

    #[test]
    fn account_cannot_hold_two_parties() {
        let (owner, mut record) = record_with(vec![PartySpec::new("mate@example.com")]);
        let err = record
            .link_user("mate@example.com", &owner, false, Utc::now())
            .unwrap_err();
        assert!(matches!(err, AccordError::DuplicateParty { .. }));
    }

    #[test]
    fn mark_signed_only_flips_once() {
        let (owner, mut record) = record_with(vec![]);
        let party_id = record.party_for_account(owner.id).unwrap().id;

        assert!(record.mark_signed(party_id, Utc::now()).unwrap());
        let signed_at = record.party(party_id).unwrap().signed_at;
        assert!(!record.mark_signed(party_id, Utc::now()).unwrap());
        assert_eq!(record.party(party_id).unwrap().signed_at, signed_at);
        assert_eq!(record.unsigned_count(), 0);
    }
}
