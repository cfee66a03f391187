use crate::error::{AccordError, Result};
use crate::types::{Account, AccountId, AgreementRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Agreement status, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    Draft,
    AwaitingPayment,
    Paid,
    Inviting,
    Signing,
    Completed,
    Void,
}

impl AgreementStatus {
    pub const ALL: [AgreementStatus; 7] = [
        Self::Draft,
        Self::AwaitingPayment,
        Self::Paid,
        Self::Inviting,
        Self::Signing,
        Self::Completed,
        Self::Void,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::AwaitingPayment => "awaiting_payment",
            Self::Paid => "paid",
            Self::Inviting => "inviting",
            Self::Signing => "signing",
            Self::Completed => "completed",
            Self::Void => "void",
        }
    }

    /// Position in the forward order. `Void` sits outside it.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Draft => Some(0),
            Self::AwaitingPayment => Some(1),
            Self::Paid => Some(2),
            Self::Inviting => Some(3),
            Self::Signing => Some(4),
            Self::Completed => Some(5),
            Self::Void => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Void)
    }

    /// Statuses an envelope void may cancel.
    pub fn is_voidable(self) -> bool {
        matches!(
            self,
            Self::AwaitingPayment | Self::Paid | Self::Inviting | Self::Signing
        )
    }

    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.name() == value)
            .ok_or_else(|| AccordError::Validation(format!("unknown agreement status '{value}'")))
    }

    /// Edges of the lifecycle graph.
    pub fn can_transition_to(self, next: AgreementStatus) -> bool {
        use AgreementStatus::*;
        match (self, next) {
            (Draft, AwaitingPayment)
            | (AwaitingPayment, Paid)
            | (AwaitingPayment, Inviting)
            | (Paid, Inviting)
            | (Inviting, Signing)
            | (Signing, Completed) => true,
            (from, Void) => from.is_voidable(),
            _ => false,
        }
    }
}

impl fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything that can be attempted against an agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Update,
    Finalize,
    Pay,
    Invite,
    AcceptInvite,
    RevokeInvite,
    CreateEnvelope,
    Sign,
    Complete,
    SettlePayment,
    EnvelopeCompleted,
    EnvelopeVoided,
    LeaveFeedback,
}

impl LifecycleAction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Finalize => "finalize",
            Self::Pay => "pay",
            Self::Invite => "invite",
            Self::AcceptInvite => "accept invite",
            Self::RevokeInvite => "revoke invite",
            Self::CreateEnvelope => "create envelope",
            Self::Sign => "sign",
            Self::Complete => "complete",
            Self::SettlePayment => "settle payment",
            Self::EnvelopeCompleted => "complete envelope",
            Self::EnvelopeVoided => "void envelope",
            Self::LeaveFeedback => "leave feedback",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One committed status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AgreementStatus,
    pub to: AgreementStatus,
    pub action: LifecycleAction,
    pub at: DateTime<Utc>,
}

/// Runtime switches consulted by the guards.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateContext {
    /// Skips identity verification and payment gating.
    pub demo_mode: bool,
}

impl AgreementRecord {
    /// Move to `next`, refusing anything that is not an edge of the lifecycle graph.
    pub(crate) fn set_status(
        &mut self,
        next: AgreementStatus,
        action: LifecycleAction,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord> {
        let from = self.agreement.status;
        if !from.can_transition_to(next) {
            return Err(AccordError::invalid_transition(from, action));
        }
        self.agreement.status = next;
        self.agreement.updated_at = now;
        Ok(TransitionRecord {
            from,
            to: next,
            action,
            at: now,
        })
    }

    pub fn require_status(&self, allowed: &[AgreementStatus], action: LifecycleAction) -> Result<()> {
        let status = self.agreement.status;
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(AccordError::invalid_transition(status, action))
        }
    }

    pub fn require_initiator(&self, actor: AccountId, action: LifecycleAction) -> Result<()> {
        if self.is_initiator(actor) {
            Ok(())
        } else {
            Err(AccordError::PermissionDenied(format!(
                "only the initiator may {action}"
            )))
        }
    }

    /// Joined parties only.
    pub fn require_member(&self, actor: AccountId, action: LifecycleAction) -> Result<()> {
        if self.party_for_account(actor).is_some() {
            Ok(())
        } else {
            Err(AccordError::PermissionDenied(format!(
                "only a joined party may {action}"
            )))
        }
    }

    pub fn check_update(&self, actor: AccountId) -> Result<()> {
        self.require_initiator(actor, LifecycleAction::Update)?;
        self.require_status(&[AgreementStatus::Draft], LifecycleAction::Update)
    }

    pub fn check_finalize(&self, actor: &Account, gate: GateContext) -> Result<()> {
        self.require_initiator(actor.id, LifecycleAction::Finalize)?;
        self.require_status(&[AgreementStatus::Draft], LifecycleAction::Finalize)?;
        if !gate.demo_mode && !actor.is_verified {
            return Err(AccordError::VerificationRequired(
                "the initiator must complete identity verification before finalizing".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_pay(&self, actor: AccountId) -> Result<()> {
        self.require_initiator(actor, LifecycleAction::Pay)?;
        self.require_status(&[AgreementStatus::AwaitingPayment], LifecycleAction::Pay)
    }

    pub fn check_invite(&self, actor: AccountId, gate: GateContext) -> Result<()> {
        self.require_initiator(actor, LifecycleAction::Invite)?;
        match self.agreement.status {
            AgreementStatus::Paid | AgreementStatus::Inviting => Ok(()),
            AgreementStatus::AwaitingPayment
                if gate.demo_mode || self.has_succeeded_payment() =>
            {
                Ok(())
            }
            status => Err(AccordError::invalid_transition(
                status,
                LifecycleAction::Invite,
            )),
        }
    }

    pub fn check_create_envelope(&self, actor: AccountId) -> Result<()> {
        self.require_initiator(actor, LifecycleAction::CreateEnvelope)?;
        self.require_status(
            &[AgreementStatus::Inviting, AgreementStatus::Signing],
            LifecycleAction::CreateEnvelope,
        )?;
        let unjoined = self.unjoined_count();
        if unjoined > 0 {
            return Err(AccordError::PartiesNotJoined { unjoined });
        }
        if self.active_envelope().is_some() {
            return Err(AccordError::EnvelopeAlreadyActive);
        }
        Ok(())
    }

    pub fn check_sign(&self, actor: AccountId) -> Result<()> {
        self.require_member(actor, LifecycleAction::Sign)?;
        self.require_status(&[AgreementStatus::Signing], LifecycleAction::Sign)
    }

    pub fn finalize(&mut self, actor: &Account, gate: GateContext, now: DateTime<Utc>) -> Result<TransitionRecord> {
        self.check_finalize(actor, gate)?;
        self.set_status(AgreementStatus::AwaitingPayment, LifecycleAction::Finalize, now)
    }

    /// Bring the agreement into `inviting`, passing through `paid` when a settled payment
    /// exists but its webhook never advanced the status.
    pub fn open_invitations(
        &mut self,
        actor: AccountId,
        gate: GateContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransitionRecord>> {
        self.check_invite(actor, gate)?;
        let mut transitions = Vec::new();
        if self.agreement.status == AgreementStatus::AwaitingPayment && self.has_succeeded_payment() {
            transitions.push(self.set_status(AgreementStatus::Paid, LifecycleAction::Invite, now)?);
        }
        if self.agreement.status != AgreementStatus::Inviting {
            transitions.push(self.set_status(
                AgreementStatus::Inviting,
                LifecycleAction::Invite,
                now,
            )?);
        }
        Ok(transitions)
    }

    /// `inviting -> signing` once the envelope is out. Re-sends while signing keep the status.
    pub fn begin_signing(&mut self, now: DateTime<Utc>) -> Result<Option<TransitionRecord>> {
        match self.agreement.status {
            AgreementStatus::Signing => Ok(None),
            _ => self
                .set_status(AgreementStatus::Signing, LifecycleAction::CreateEnvelope, now)
                .map(Some),
        }
    }

    /// Payment success advances only from `awaiting_payment`; later successes are ledger-only.
    pub fn on_payment_succeeded(&mut self, now: DateTime<Utc>) -> Option<TransitionRecord> {
        if self.agreement.status != AgreementStatus::AwaitingPayment {
            return None;
        }
        self.set_status(AgreementStatus::Paid, LifecycleAction::SettlePayment, now)
            .ok()
    }

    /// Signature completion: every party signed, agreement completed.
    pub fn on_envelope_completed(&mut self, now: DateTime<Utc>) -> Option<TransitionRecord> {
        if self.agreement.status != AgreementStatus::Signing {
            return None;
        }
        self.mark_all_signed(now);
        self.set_status(AgreementStatus::Completed, LifecycleAction::EnvelopeCompleted, now)
            .ok()
    }

    /// Envelope void cancels any in-flight agreement. `completed` never regresses.
    pub fn on_envelope_voided(&mut self, now: DateTime<Utc>) -> Option<TransitionRecord> {
        if !self.agreement.status.is_voidable() {
            return None;
        }
        self.set_status(AgreementStatus::Void, LifecycleAction::EnvelopeVoided, now)
            .ok()
    }

    /// Manual completion fallback. `Ok(None)` when already completed.
    pub fn complete(&mut self, actor: AccountId, now: DateTime<Utc>) -> Result<Option<TransitionRecord>> {
        self.require_member(actor, LifecycleAction::Complete)?;
        match self.agreement.status {
            AgreementStatus::Completed => Ok(None),
            AgreementStatus::Signing => {
                let unsigned = self.unsigned_count();
                if unsigned > 0 {
                    return Err(AccordError::PartiesNotSigned { unsigned });
                }
                self.set_status(AgreementStatus::Completed, LifecycleAction::Complete, now)
                    .map(Some)
            }
            status => Err(AccordError::invalid_transition(
                status,
                LifecycleAction::Complete,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewAgreement, PartySpec, PaymentMethod, PaymentOutcome};
    use proptest::prelude::*;

    fn verified_initiator() -> Account {
        let mut account = Account::new(AccountId::generate(), "lead@example.com").unwrap();
        account.is_verified = true;
        account
    }

    fn draft_with(owner: &Account, roommates: &[&str]) -> AgreementRecord {
        let request = NewAgreement {
            rent_total_cents: 150_000,
            roommates: roommates.iter().map(|email| PartySpec::new(*email)).collect(),
            ..NewAgreement::default()
        };
        AgreementRecord::draft(owner, request, Utc::now()).unwrap()
    }

    #[test]
    fn graph_only_moves_forward_or_into_void() {
        for from in AgreementStatus::ALL {
            for to in AgreementStatus::ALL {
                if from.can_transition_to(to) {
                    match (from.rank(), to.rank()) {
                        (Some(a), Some(b)) => assert!(b > a, "{from} -> {to}"),
                        (_, None) => assert!(from.is_voidable()),
                        (None, Some(_)) => panic!("void must be terminal"),
                    }
                }
            }
        }
    }

    #[test]
    fn status_names_round_trip() {
        for status in AgreementStatus::ALL {
            assert_eq!(AgreementStatus::parse(status.name()).unwrap(), status);
        }
        assert!(AgreementStatus::parse("archived").is_err());
    }

    #[test]
    fn finalize_requires_verified_initiator_outside_demo() {
        let mut owner = verified_initiator();
        owner.is_verified = false;
        let mut record = draft_with(&owner, &[]);

        let err = record
            .finalize(&owner, GateContext::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, AccordError::VerificationRequired(_)));
        assert_eq!(record.status(), AgreementStatus::Draft);

        let demo = GateContext { demo_mode: true };
        record.finalize(&owner, demo, Utc::now()).unwrap();
        assert_eq!(record.status(), AgreementStatus::AwaitingPayment);
    }

    #[test]
    fn finalize_twice_is_an_invalid_transition() {
        let owner = verified_initiator();
        let mut record = draft_with(&owner, &[]);
        record.finalize(&owner, GateContext::default(), Utc::now()).unwrap();

        let err = record
            .finalize(&owner, GateContext::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            AccordError::InvalidTransition {
                status: AgreementStatus::AwaitingPayment,
                action: LifecycleAction::Finalize
            }
        ));
    }

    #[test]
    fn only_initiator_may_finalize() {
        let owner = verified_initiator();
        let mut stranger = Account::new(AccountId::generate(), "x@example.com").unwrap();
        stranger.is_verified = true;
        let mut record = draft_with(&owner, &[]);

        let err = record
            .finalize(&stranger, GateContext::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, AccordError::PermissionDenied(_)));
    }

    #[test]
    fn invite_before_payment_is_rejected_unless_settled() {
        let owner = verified_initiator();
        let mut record = draft_with(&owner, &[]);
        let now = Utc::now();
        record.finalize(&owner, GateContext::default(), now).unwrap();

        let err = record
            .open_invitations(owner.id, GateContext::default(), now)
            .unwrap_err();
        assert!(matches!(err, AccordError::InvalidTransition { .. }));

        // Settled in the ledger but the status never advanced.
        record
            .record_payment_attempt(PaymentMethod::Card, 250, "USD", "cs_1", now)
            .unwrap();
        record.settle_payment("cs_1", PaymentOutcome::Succeeded, now);

        let transitions = record
            .open_invitations(owner.id, GateContext::default(), now)
            .unwrap();
        let path: Vec<_> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(path, vec![AgreementStatus::Paid, AgreementStatus::Inviting]);
    }

    #[test]
    fn demo_mode_skips_payment_gate() {
        let owner = verified_initiator();
        let mut record = draft_with(&owner, &[]);
        let demo = GateContext { demo_mode: true };
        record.finalize(&owner, demo, Utc::now()).unwrap();

        let transitions = record.open_invitations(owner.id, demo, Utc::now()).unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(record.status(), AgreementStatus::Inviting);
    }

    #[test]
    fn envelope_requires_every_party_joined() {
        let owner = verified_initiator();
        let mut record = draft_with(&owner, &["mate@example.com"]);
        let now = Utc::now();
        record.finalize(&owner, GateContext::default(), now).unwrap();
        record.on_payment_succeeded(now).unwrap();
        record
            .open_invitations(owner.id, GateContext::default(), now)
            .unwrap();

        let err = record.check_create_envelope(owner.id).unwrap_err();
        assert!(matches!(err, AccordError::PartiesNotJoined { unjoined: 1 }));
    }

    #[test]
    fn void_never_overrides_completed() {
        let owner = verified_initiator();
        let mut record = draft_with(&owner, &[]);
        let now = Utc::now();
        record.finalize(&owner, GateContext::default(), now).unwrap();
        record.on_payment_succeeded(now).unwrap();
        record
            .open_invitations(owner.id, GateContext::default(), now)
            .unwrap();
        record.begin_signing(now).unwrap();
        record.mark_all_signed(now);

        assert!(record.complete(owner.id, now).unwrap().is_some());
        assert!(record.complete(owner.id, now).unwrap().is_none());
        assert!(record.on_envelope_voided(now).is_none());
        assert!(record.on_envelope_completed(now).is_none());
        assert_eq!(record.status(), AgreementStatus::Completed);
    }

    #[test]
    fn manual_complete_counts_unsigned_parties() {
        let owner = verified_initiator();
        let mut record = draft_with(&owner, &[]);
        let now = Utc::now();
        record.finalize(&owner, GateContext::default(), now).unwrap();
        record.on_payment_succeeded(now).unwrap();
        record
            .open_invitations(owner.id, GateContext::default(), now)
            .unwrap();
        record.begin_signing(now).unwrap();

        let err = record.complete(owner.id, now).unwrap_err();
        assert!(matches!(err, AccordError::PartiesNotSigned { unsigned: 1 }));
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Finalize,
        PaymentSucceeded,
        Invite,
        BeginSigning,
        SignAll,
        Complete,
        EnvelopeCompleted,
        EnvelopeVoided,
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Finalize),
            Just(Step::PaymentSucceeded),
            Just(Step::Invite),
            Just(Step::BeginSigning),
            Just(Step::SignAll),
            Just(Step::Complete),
            Just(Step::EnvelopeCompleted),
            Just(Step::EnvelopeVoided),
        ]
    }

    proptest! {
        #[test]
        fn status_never_moves_backwards(
            steps in proptest::collection::vec(step_strategy(), 0..40),
            demo in any::<bool>(),
        ) {
            let owner = verified_initiator();
            let mut record = draft_with(&owner, &[]);
            let gate = GateContext { demo_mode: demo };
            let now = Utc::now();

            for step in steps {
                let before = record.status();
                let _ = match step {
                    Step::Finalize => record.finalize(&owner, gate, now).map(|_| ()),
                    Step::PaymentSucceeded => {
                        record.on_payment_succeeded(now);
                        Ok(())
                    }
                    Step::Invite => record.open_invitations(owner.id, gate, now).map(|_| ()),
                    Step::BeginSigning => record
                        .check_create_envelope(owner.id)
                        .and_then(|_| record.begin_signing(now))
                        .map(|_| ()),
                    Step::SignAll => {
                        record.mark_all_signed(now);
                        Ok(())
                    }
                    Step::Complete => record.complete(owner.id, now).map(|_| ()),
                    Step::EnvelopeCompleted => {
                        record.on_envelope_completed(now);
                        Ok(())
                    }
                    Step::EnvelopeVoided => {
                        record.on_envelope_voided(now);
                        Ok(())
                    }
                };
                let after = record.status();

                if before.is_terminal() {
                    prop_assert_eq!(before, after);
                }
                match (before.rank(), after.rank()) {
                    (Some(a), Some(b)) => prop_assert!(b >= a),
                    (None, _) => prop_assert_eq!(after, AgreementStatus::Void),
                    (Some(_), None) => prop_assert!(before.is_voidable()),
                }
            }
        }
    }
}
