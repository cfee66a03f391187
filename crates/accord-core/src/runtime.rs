use crate::audit::{verify_chain, AuditEntry, AuditEvent, AuditTrail};
use crate::document::{document_key, render_agreement, DOCUMENT_NAME};
use crate::error::{AccordError, Result};
use crate::feedback::{FeedbackSummary, FeedbackView, NewFeedback};
use crate::invitations::{default_invite_ttl, IssueKind};
use crate::lifecycle::{AgreementStatus, GateContext};
use crate::locks::KeyedLocks;
use crate::payments::SettleResult;
use crate::providers::{
    BlobStore, Checkout, CheckoutRequest, CompletionEmail, EnvelopeRequest, InviteEmail, Notifier,
    PaymentProviderRegistry, Recipient, SignatureProvider, VerificationProviderRegistry,
};
use crate::signatures::EnvelopeSignal;
use crate::storage::{self, AgreementStore, StoreConfig};
use crate::types::{
    validate_email, Account, AccountId, Agreement, AgreementId, AgreementPatch, AgreementRecord,
    EnvelopeStatus, IdentityVerification, InviteId, NewAgreement, Party, PartyId, PartyRole,
    PartySpec, Payment, PaymentMethod, PaymentOutcome, SignatureEnvelope, Terms,
    VerificationId, VerificationStatus,
};
use crate::verification::VerificationChange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine configuration. Built by the binary and passed down; nothing here is global.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bypasses identity verification and payment gating for local demos.
    pub demo_mode: bool,
    pub invite_ttl: chrono::Duration,
    pub provider_timeout: Duration,
    pub notify_timeout: Duration,
    pub frontend_url: String,
    pub card_price_cents: u64,
    pub crypto_price_cents: u64,
    pub currency: String,
    pub document_container: String,
    pub storage: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            demo_mode: false,
            invite_ttl: default_invite_ttl(),
            provider_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(10),
            frontend_url: "http://localhost:3000".to_string(),
            card_price_cents: 250,
            crypto_price_cents: 200,
            currency: "USD".to_string(),
            document_container: "agreements".to_string(),
            storage: StoreConfig::Memory,
        }
    }
}

impl EngineConfig {
    fn gate(&self) -> GateContext {
        GateContext {
            demo_mode: self.demo_mode,
        }
    }

    pub fn price_for(&self, method: PaymentMethod) -> u64 {
        match method {
            PaymentMethod::Card => self.card_price_cents,
            PaymentMethod::Crypto => self.crypto_price_cents,
        }
    }

    fn frontend(&self) -> &str {
        self.frontend_url.trim_end_matches('/')
    }

    pub fn invite_link(&self, token: &str) -> String {
        format!("{}/invite/{token}", self.frontend())
    }

    pub fn download_link(&self, id: AgreementId) -> String {
        format!("{}/agreements/{id}/download", self.frontend())
    }
}

/// External collaborators the engine drives.
pub struct Collaborators {
    pub payments: PaymentProviderRegistry,
    pub signatures: Arc<dyn SignatureProvider>,
    pub verifications: VerificationProviderRegistry,
    pub notifier: Arc<dyn Notifier>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Invite row as shown to parties; the token value stays private.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteSummary {
    pub id: InviteId,
    pub email: String,
    pub is_used: bool,
    pub used_by: Option<AccountId>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgreementSnapshot {
    pub agreement: Agreement,
    pub terms: Terms,
    pub parties: Vec<Party>,
    pub invites: Vec<InviteSummary>,
    pub payments: Vec<Payment>,
    pub envelopes: Vec<SignatureEnvelope>,
    pub unjoined: usize,
    pub unsigned: usize,
    pub version: u64,
}

impl From<&AgreementRecord> for AgreementSnapshot {
    fn from(record: &AgreementRecord) -> Self {
        Self {
            agreement: record.agreement.clone(),
            terms: record.terms.clone(),
            parties: record.parties.clone(),
            invites: record
                .invites
                .iter()
                .map(|invite| InviteSummary {
                    id: invite.id,
                    email: invite.email.clone(),
                    is_used: invite.is_used,
                    used_by: invite.used_by,
                    expires_at: invite.expires_at,
                })
                .collect(),
            payments: record.payments.clone(),
            envelopes: record.envelopes.clone(),
            unjoined: record.unjoined_count(),
            unsigned: record.unsigned_count(),
            version: record.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub agreement_id: AgreementId,
    pub checkouts: Vec<Checkout>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteIssued {
    pub agreement_id: AgreementId,
    pub status: AgreementStatus,
    pub invite_id: InviteId,
    pub email: String,
    pub token: String,
    pub link: String,
    pub expires_at: DateTime<Utc>,
    pub refreshed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    Login,
    Verify,
    Register,
}

/// Public context for an invite link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteContext {
    pub agreement_id: AgreementId,
    pub title: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub initiator_email: Option<String>,
    pub email: String,
    pub party_id: Option<PartyId>,
    pub rent_share_cents: Option<u64>,
    pub requires_id_verification: bool,
    pub expires_at: DateTime<Utc>,
    pub account_exists: bool,
    pub account_verified: bool,
    pub next_step: NextStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInvite {
    pub agreement_id: AgreementId,
    pub title: String,
    pub initiator_email: Option<String>,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationStarted {
    pub verification_id: VerificationId,
    pub provider: String,
    /// Provider-side reference echoed back by the result webhook.
    pub external_ref: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub agreement_id: AgreementId,
    pub verified: bool,
    pub entries: Vec<AuditEntry>,
}

/// Result of a webhook entry point. Unknown or replayed references are `Ignored`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        reference: String,
        status: Option<AgreementStatus>,
    },
    Ignored {
        reference: String,
    },
}

impl WebhookOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    fn ignored(reference: &str) -> Self {
        Self::Ignored {
            reference: reference.to_string(),
        }
    }
}

/// Agreement lifecycle orchestrator.
///
/// Serializes work per agreement, applies the pure aggregate operations, commits the
/// aggregate with its audit entries in one store write, and keeps provider calls outside
/// the agreement lock.
pub struct AgreementEngine {
    store: Arc<dyn AgreementStore>,
    payments: PaymentProviderRegistry,
    signatures: Arc<dyn SignatureProvider>,
    verifications: VerificationProviderRegistry,
    notifier: Arc<dyn Notifier>,
    blobs: Arc<dyn BlobStore>,
    agreement_locks: KeyedLocks<AgreementId>,
    account_locks: KeyedLocks<AccountId>,
    config: EngineConfig,
}

impl AgreementEngine {
    /// Open the configured store and wire the collaborators.
    pub async fn bootstrap(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let store = storage::connect(&config.storage).await?;
        Ok(Self::with_store(store, config, collaborators))
    }

    pub fn with_store(
        store: Arc<dyn AgreementStore>,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Self {
        info!(
            store = store.label(),
            demo_mode = config.demo_mode,
            "agreement engine ready"
        );
        Self {
            store,
            payments: collaborators.payments,
            signatures: collaborators.signatures,
            verifications: collaborators.verifications,
            notifier: collaborators.notifier,
            blobs: collaborators.blobs,
            agreement_locks: KeyedLocks::new(),
            account_locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store_label(&self) -> &'static str {
        self.store.label()
    }

    pub fn payment_methods(&self) -> Vec<PaymentMethod> {
        self.payments.methods()
    }

    pub fn verification_providers(&self) -> Vec<String> {
        self.verifications.names()
    }

    // Accounts ---------------------------------------------------------------

    /// Register or refresh an account synced from the upstream identity provider.
    ///
    /// The verification badge is owned by the verification flow and is never
    /// overwritten here.
    pub async fn register_account(
        &self,
        id: AccountId,
        email: &str,
        phone: Option<String>,
        display_name: Option<String>,
    ) -> Result<Account> {
        let _guard = self.account_locks.lock(&id).await;
        let mut account = Account::new(id, email)?;
        account.phone = phone;
        account.display_name = display_name;
        if let Some(existing) = self.store.load_account(id).await? {
            account.is_verified = existing.is_verified;
            account.created_at = existing.created_at;
        }
        self.store.upsert_account(&account).await?;
        Ok(account)
    }

    pub async fn account(&self, id: AccountId) -> Result<Account> {
        self.store
            .load_account(id)
            .await?
            .ok_or_else(|| AccordError::AccountNotFound(id.to_string()))
    }

    // Drafting ---------------------------------------------------------------

    pub async fn create_agreement(
        &self,
        actor: &Account,
        request: NewAgreement,
    ) -> Result<AgreementSnapshot> {
        let now = Utc::now();
        let mut record = AgreementRecord::draft(actor, request, now)?;
        let _guard = self.agreement_locks.lock(&record.id()).await;

        let mut trail = AuditTrail::new(record.id());
        trail.append(
            Some(actor.id),
            AuditEvent::note(
                "created",
                format!("draft with {} part(y/ies)", record.parties.len()),
            ),
            now,
        );
        record.version = self.store.save(&record, trail.staged()).await?;
        info!(agreement_id = %record.id(), initiator = %actor.id, "agreement drafted");
        Ok(AgreementSnapshot::from(&record))
    }

    pub async fn update_agreement(
        &self,
        actor: &Account,
        id: AgreementId,
        patch: AgreementPatch,
    ) -> Result<AgreementSnapshot> {
        let (record, _) = self
            .mutate(id, |record, trail, now| {
                record.check_update(actor.id)?;
                record.apply_patch(patch, now)?;
                trail.append(Some(actor.id), AuditEvent::note("updated", "draft fields"), now);
                Ok(())
            })
            .await?;
        Ok(AgreementSnapshot::from(&record))
    }

    pub async fn finalize(&self, actor: &Account, id: AgreementId) -> Result<AgreementSnapshot> {
        let gate = self.config.gate();
        let (record, _) = self
            .mutate(id, |record, trail, now| {
                let transition = record.finalize(actor, gate, now)?;
                trail.append_transitions(Some(actor.id), &[transition]);
                Ok(())
            })
            .await?;
        info!(agreement_id = %id, "agreement finalized");
        Ok(AgreementSnapshot::from(&record))
    }

    // Payment ----------------------------------------------------------------

    /// Open one checkout per requested method (all registered methods when empty).
    pub async fn pay(
        &self,
        actor: &Account,
        id: AgreementId,
        methods: &[PaymentMethod],
    ) -> Result<PaymentSession> {
        self.read(id, |record| record.check_pay(actor.id)).await?;

        let methods: BTreeSet<PaymentMethod> = if methods.is_empty() {
            self.payments.methods().into_iter().collect()
        } else {
            methods.iter().copied().collect()
        };
        if methods.is_empty() {
            return Err(AccordError::Validation(
                "no payment methods are configured".to_string(),
            ));
        }

        let frontend = self.config.frontend();
        let mut checkouts = Vec::new();
        let mut last_error = None;
        for method in methods {
            let provider = self.payments.get(method).ok_or_else(|| {
                AccordError::Validation(format!("payment method '{}' is not available", method.name()))
            })?;
            let request = CheckoutRequest {
                agreement_id: id,
                amount_cents: self.config.price_for(method),
                currency: self.config.currency.clone(),
                success_url: format!("{frontend}/agreements/{id}/payment/success"),
                cancel_url: format!("{frontend}/agreements/{id}/payment/cancel"),
            };
            match self
                .call_provider(provider.provider(), provider.create_checkout(&request))
                .await
            {
                Ok(checkout) => checkouts.push(checkout),
                Err(error) => {
                    warn!(agreement_id = %id, method = method.name(), %error, "checkout creation failed");
                    last_error = Some(error);
                }
            }
        }
        if checkouts.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                AccordError::provider_unavailable("payments", "no checkout created")
            }));
        }

        let currency = self.config.currency.clone();
        let recorded = checkouts.clone();
        self.mutate(id, move |record, trail, now| {
            record.check_pay(actor.id)?;
            for checkout in &recorded {
                record.record_payment_attempt(
                    checkout.method,
                    checkout.amount_cents,
                    &currency,
                    &checkout.provider_ref,
                    now,
                )?;
                trail.append(
                    Some(actor.id),
                    AuditEvent::note(
                        "payment_started",
                        format!("{} via {} ({})", checkout.method.name(), checkout.provider, checkout.provider_ref),
                    ),
                    now,
                );
            }
            Ok(())
        })
        .await?;

        Ok(PaymentSession {
            agreement_id: id,
            checkouts,
        })
    }

    /// Payment webhook entry point. Idempotent on the provider reference.
    pub async fn settle_payment(
        &self,
        provider_ref: &str,
        outcome: PaymentOutcome,
    ) -> Result<WebhookOutcome> {
        let Some(id) = self.store.find_by_payment_ref(provider_ref).await? else {
            debug!(provider_ref, "payment webhook for unknown reference ignored");
            return Ok(WebhookOutcome::ignored(provider_ref));
        };

        let (record, result) = self
            .mutate(id, |record, trail, now| {
                let result = record.settle_payment(provider_ref, outcome, now);
                let SettleResult::Applied(status) = result else {
                    return Ok(result);
                };
                trail.append(
                    None,
                    AuditEvent::note("payment_settled", format!("{provider_ref}: {status:?}")),
                    now,
                );
                if result.succeeded_now() {
                    if let Some(transition) = record.on_payment_succeeded(now) {
                        trail.append_transitions(None, &[transition]);
                    }
                }
                Ok(result)
            })
            .await?;

        match result {
            SettleResult::Applied(_) => {}
            SettleResult::Closed => {
                debug!(agreement_id = %id, provider_ref, status = %record.status(), "payment webhook for a closed agreement ignored");
                return Ok(WebhookOutcome::ignored(provider_ref));
            }
            SettleResult::AlreadySettled(_) | SettleResult::Unknown => {
                debug!(provider_ref, "payment webhook replay ignored");
                return Ok(WebhookOutcome::ignored(provider_ref));
            }
        }
        info!(agreement_id = %id, provider_ref, status = %record.status(), "payment settled");
        Ok(WebhookOutcome::Applied {
            reference: provider_ref.to_string(),
            status: Some(record.status()),
        })
    }

    // Invitations ------------------------------------------------------------

    pub async fn invite(
        &self,
        actor: &Account,
        id: AgreementId,
        spec: PartySpec,
    ) -> Result<InviteIssued> {
        let gate = self.config.gate();
        let ttl = self.config.invite_ttl;
        let email = validate_email(&spec.email)?;

        let (record, issued) = self
            .mutate(id, |record, trail, now| {
                let transitions = record.open_invitations(actor.id, gate, now)?;
                trail.append_transitions(Some(actor.id), &transitions);

                let initiator_email = record.initiator_party().map(|p| p.email.clone());
                if initiator_email.as_deref() == Some(email.as_str()) {
                    return Err(AccordError::DuplicateParty { email: email.clone() });
                }
                match record.party_by_email(&email) {
                    Some(party) if party.is_joined() => {
                        return Err(AccordError::DuplicateParty { email: email.clone() });
                    }
                    Some(_) => {}
                    None => {
                        record.add_party(PartyRole::Roommate, &spec)?;
                        trail.append(Some(actor.id), AuditEvent::note("party_added", email.clone()), now);
                    }
                }

                let issued = record.issue_invite(&email, ttl, now)?;
                let label = match issued.kind {
                    IssueKind::Created => "invite_issued",
                    IssueKind::Refreshed => "invite_refreshed",
                    IssueKind::Replaced => "invite_replaced",
                };
                trail.append(Some(actor.id), AuditEvent::note(label, email.clone()), now);
                Ok(issued)
            })
            .await?;

        let link = self.config.invite_link(&issued.invite.token);
        self.dispatch_invite_email(InviteEmail {
            to: issued.invite.email.clone(),
            inviter: actor.label().to_string(),
            agreement_title: record.agreement.title.clone(),
            link: link.clone(),
        });
        info!(agreement_id = %id, kind = ?issued.kind, "invite issued");

        Ok(InviteIssued {
            agreement_id: id,
            status: record.status(),
            invite_id: issued.invite.id,
            email: issued.invite.email,
            token: issued.invite.token,
            link,
            expires_at: issued.invite.expires_at,
            refreshed: issued.kind == IssueKind::Refreshed,
        })
    }

    /// Public lookup behind an invite link.
    pub async fn resolve_invite(&self, token: &str) -> Result<InviteContext> {
        let id = self
            .store
            .find_by_invite_token(token)
            .await?
            .ok_or(AccordError::TokenNotFound)?;
        let record = self.load_record(id).await?;
        let invite = record.resolve_invite(token, Utc::now())?;
        let party = record.party_by_email(&invite.email);
        let account = self.store.find_account_by_email(&invite.email).await?;

        let requires_id_verification = party.map(|p| p.requires_id_verification).unwrap_or(false);
        let account_verified = account.as_ref().map(|a| a.is_verified).unwrap_or(false);
        let next_step = match &account {
            None => NextStep::Register,
            Some(_) if requires_id_verification && !account_verified && !self.config.demo_mode => {
                NextStep::Verify
            }
            Some(_) => NextStep::Login,
        };

        Ok(InviteContext {
            agreement_id: id,
            title: record.agreement.title.clone(),
            city: record.agreement.location.city.clone(),
            state: record.agreement.location.state.clone(),
            initiator_email: record.initiator_party().map(|p| p.email.clone()),
            email: invite.email.clone(),
            party_id: party.map(|p| p.id),
            rent_share_cents: party.and_then(|p| p.rent_share_cents),
            requires_id_verification,
            expires_at: invite.expires_at,
            account_exists: account.is_some(),
            account_verified,
            next_step,
        })
    }

    pub async fn accept_invite(&self, actor: &Account, token: &str) -> Result<AgreementSnapshot> {
        let id = self
            .store
            .find_by_invite_token(token)
            .await?
            .ok_or(AccordError::TokenNotFound)?;
        let demo_mode = self.config.demo_mode;

        let (record, accepted) = self
            .mutate(id, |record, trail, now| {
                let accepted = record.accept_invite(token, actor, demo_mode, now)?;
                trail.append(
                    Some(actor.id),
                    AuditEvent::note("party_joined", actor.email.clone()),
                    now,
                );
                Ok(accepted)
            })
            .await?;
        info!(agreement_id = %id, party_id = %accepted.party_id, unjoined = record.unjoined_count(), "invite accepted");
        Ok(AgreementSnapshot::from(&record))
    }

    pub async fn revoke_invite(&self, actor: &Account, token: &str) -> Result<AgreementSnapshot> {
        let id = self
            .store
            .find_by_invite_token(token)
            .await?
            .ok_or(AccordError::TokenNotFound)?;

        let (record, _) = self
            .mutate(id, |record, trail, now| {
                let revoked = record.revoke_invite(token, actor.id)?;
                trail.append(Some(actor.id), AuditEvent::note("invite_revoked", revoked.email), now);
                Ok(())
            })
            .await?;
        Ok(AgreementSnapshot::from(&record))
    }

    /// Open invites addressed to the caller's email, across agreements.
    pub async fn pending_invites(&self, actor: &Account) -> Result<Vec<PendingInvite>> {
        let now = Utc::now();
        let mut pending = Vec::new();
        for id in self.store.agreements_for_email(&actor.email).await? {
            let Some(record) = self.store.load(id).await? else {
                continue;
            };
            if record.status().is_terminal() {
                continue;
            }
            if let Some(invite) = record.pending_invite_for(&actor.email, now) {
                pending.push(PendingInvite {
                    agreement_id: id,
                    title: record.agreement.title.clone(),
                    initiator_email: record.initiator_party().map(|p| p.email.clone()),
                    token: invite.token.clone(),
                    expires_at: invite.expires_at,
                });
            }
        }
        pending.sort_by_key(|invite| invite.expires_at);
        Ok(pending)
    }

    // Signatures -------------------------------------------------------------

    /// Render the agreement, archive it, and send it out for signature.
    pub async fn create_envelope(&self, actor: &Account, id: AgreementId) -> Result<AgreementSnapshot> {
        let (version, document, request) = self
            .read(id, |record| {
                record.check_create_envelope(actor.id)?;
                let document = render_agreement(record).into_bytes();
                let request = EnvelopeRequest {
                    agreement_id: id,
                    title: record.agreement.title.clone(),
                    document_name: DOCUMENT_NAME.to_string(),
                    document: document.clone(),
                    recipients: record
                        .parties
                        .iter()
                        .map(|party| Recipient {
                            name: party.email.clone(),
                            email: party.email.clone(),
                        })
                        .collect(),
                };
                Ok((record.version, document, request))
            })
            .await?;

        let key = document_key(id);
        let location = self
            .call_provider(
                "blob-storage",
                self.blobs.put(&self.config.document_container, &key, document),
            )
            .await?;
        let provider = self.signatures.provider();
        let external_id = self
            .call_provider(provider, self.signatures.create_envelope(&request))
            .await?;

        let (record, _) = self
            .mutate(id, |record, trail, now| {
                if record.version != version {
                    warn!(agreement_id = %id, envelope = %external_id, "agreement changed while the envelope was prepared");
                    return Err(AccordError::Conflict(
                        "agreement changed while the envelope was being prepared".to_string(),
                    ));
                }
                record.check_create_envelope(actor.id)?;
                record.record_envelope(&external_id, now)?;
                trail.append(
                    Some(actor.id),
                    AuditEvent::note("envelope_sent", format!("{provider} {external_id} ({location})")),
                    now,
                );
                if let Some(transition) = record.begin_signing(now)? {
                    trail.append_transitions(Some(actor.id), &[transition]);
                }
                Ok(())
            })
            .await?;
        info!(agreement_id = %id, envelope = %external_id, "envelope sent for signature");
        Ok(AgreementSnapshot::from(&record))
    }

    /// The caller marks their own party as signed.
    pub async fn sign(&self, actor: &Account, id: AgreementId) -> Result<AgreementSnapshot> {
        let (record, _) = self
            .mutate(id, |record, trail, now| {
                record.check_sign(actor.id)?;
                let party_id = record
                    .party_for_account(actor.id)
                    .map(|p| p.id)
                    .ok_or_else(|| AccordError::PermissionDenied("not a party".to_string()))?;
                if record.mark_signed(party_id, now)? {
                    trail.append(Some(actor.id), AuditEvent::note("party_signed", actor.email.clone()), now);
                }
                Ok(())
            })
            .await?;
        Ok(AgreementSnapshot::from(&record))
    }

    /// Manual completion fallback; converges with the envelope webhook.
    pub async fn complete(&self, actor: &Account, id: AgreementId) -> Result<AgreementSnapshot> {
        let (record, completed) = self
            .mutate(id, |record, trail, now| {
                let transition = record.complete(actor.id, now)?;
                if let Some(transition) = &transition {
                    trail.append_transitions(Some(actor.id), std::slice::from_ref(transition));
                }
                Ok(transition.is_some())
            })
            .await?;
        if completed {
            info!(agreement_id = %id, "agreement completed manually");
            self.dispatch_completion_email(&record);
        }
        Ok(AgreementSnapshot::from(&record))
    }

    /// Signature webhook entry point. Idempotent on the external envelope id.
    pub async fn apply_envelope_status(
        &self,
        external_id: &str,
        status: EnvelopeStatus,
    ) -> Result<WebhookOutcome> {
        let Some(id) = self.store.find_by_envelope(external_id).await? else {
            debug!(external_id, "signature webhook for unknown envelope ignored");
            return Ok(WebhookOutcome::ignored(external_id));
        };

        let (record, (signal, completed)) = self
            .mutate(id, |record, trail, now| {
                let signal = record.update_envelope_status(external_id, status, now);
                let transition = match signal {
                    EnvelopeSignal::Unknown | EnvelopeSignal::Unchanged | EnvelopeSignal::Closed => {
                        return Ok((signal, false))
                    }
                    EnvelopeSignal::Completed => record.on_envelope_completed(now),
                    EnvelopeSignal::Voided => record.on_envelope_voided(now),
                };
                trail.append(
                    None,
                    AuditEvent::note(format!("envelope_{}", status.name()), external_id.to_string()),
                    now,
                );
                let completed = matches!(
                    transition.as_ref().map(|t| t.to),
                    Some(AgreementStatus::Completed)
                );
                if let Some(transition) = transition {
                    trail.append_transitions(None, &[transition]);
                }
                Ok((signal, completed))
            })
            .await?;

        match signal {
            EnvelopeSignal::Completed | EnvelopeSignal::Voided => {}
            EnvelopeSignal::Closed => {
                debug!(agreement_id = %id, external_id, status = %record.status(), "signature webhook for a closed agreement ignored");
                return Ok(WebhookOutcome::ignored(external_id));
            }
            EnvelopeSignal::Unknown | EnvelopeSignal::Unchanged => {
                debug!(external_id, "signature webhook replay ignored");
                return Ok(WebhookOutcome::ignored(external_id));
            }
        }
        if completed {
            self.dispatch_completion_email(&record);
        }
        info!(agreement_id = %id, envelope = external_id, status = %record.status(), "envelope status applied");
        Ok(WebhookOutcome::Applied {
            reference: external_id.to_string(),
            status: Some(record.status()),
        })
    }

    // Identity verification -------------------------------------------------

    pub async fn start_verification(
        &self,
        actor: &Account,
        provider: &str,
    ) -> Result<VerificationStarted> {
        let plugin = self.verifications.get(provider).ok_or_else(|| {
            AccordError::Validation(format!(
                "unknown verification provider '{provider}'; expected one of {}",
                self.verifications.names().join(", ")
            ))
        })?;
        let name = plugin.provider();
        let callback = format!("{}/verify/callback?provider={name}", self.config.frontend());
        let session = self
            .call_provider(name, plugin.start_verification(actor, &callback))
            .await?;

        let verification =
            IdentityVerification::pending(actor.id, name, session.external_ref.clone(), Utc::now());
        self.store.insert_verification(&verification).await?;
        info!(account_id = %actor.id, provider = name, "identity verification started");
        Ok(VerificationStarted {
            verification_id: verification.id,
            provider: name.to_string(),
            external_ref: session.external_ref,
            redirect_url: session.redirect_url,
        })
    }

    /// KYC webhook entry point. Approval flips the account badge in the same commit.
    pub async fn apply_verification_result(
        &self,
        provider: &str,
        external_ref: &str,
        status: VerificationStatus,
    ) -> Result<WebhookOutcome> {
        let provider = provider.to_ascii_lowercase();
        let Some(found) = self.store.find_verification(&provider, external_ref).await? else {
            debug!(provider = %provider, external_ref, "verification webhook for unknown reference ignored");
            return Ok(WebhookOutcome::ignored(external_ref));
        };

        let _guard = self.account_locks.lock(&found.account_id).await;
        let Some(mut verification) = self.store.find_verification(&provider, external_ref).await? else {
            return Ok(WebhookOutcome::ignored(external_ref));
        };

        match verification.apply_result(status, Utc::now()) {
            VerificationChange::Unchanged => {
                debug!(provider = %provider, external_ref, "verification webhook replay ignored");
                Ok(WebhookOutcome::ignored(external_ref))
            }
            VerificationChange::Approved => {
                let mut account = self.account(verification.account_id).await?;
                account.is_verified = true;
                self.store
                    .save_verification(&verification, Some(&account))
                    .await?;
                info!(account_id = %account.id, provider = %provider, "identity verified");
                Ok(WebhookOutcome::Applied {
                    reference: external_ref.to_string(),
                    status: None,
                })
            }
            VerificationChange::Rejected => {
                self.store.save_verification(&verification, None).await?;
                info!(account_id = %verification.account_id, provider = %provider, "identity verification rejected");
                Ok(WebhookOutcome::Applied {
                    reference: external_ref.to_string(),
                    status: None,
                })
            }
        }
    }

    // Feedback ---------------------------------------------------------------

    /// Rate another joined party of a completed agreement. Anonymous feedback is
    /// audited without an actor.
    pub async fn leave_feedback(
        &self,
        actor: &Account,
        id: AgreementId,
        request: NewFeedback,
    ) -> Result<FeedbackView> {
        let (_, view) = self
            .mutate(id, |record, trail, now| {
                let feedback = record.leave_feedback(actor.id, request, now)?;
                let author = (!feedback.is_anonymous).then_some(actor.id);
                let detail = format!("{} rated {}/5", feedback.to_account, feedback.rating);
                let view = FeedbackView::new(id, feedback);
                trail.append(author, AuditEvent::note("feedback_left", detail), now);
                Ok(view)
            })
            .await?;
        info!(agreement_id = %id, to = %view.to_account, "feedback left");
        Ok(view)
    }

    /// Every rating left on the agreement; joined parties only.
    pub async fn feedback(&self, actor: &Account, id: AgreementId) -> Result<Vec<FeedbackView>> {
        let record = self.load_record(id).await?;
        if record.party_for_account(actor.id).is_none() {
            return Err(AccordError::PermissionDenied(
                "only a joined party may view feedback".to_string(),
            ));
        }
        Ok(record.feedback_views())
    }

    /// Ratings `account` has received across all of their agreements.
    pub async fn feedback_summary(&self, account: AccountId) -> Result<FeedbackSummary> {
        self.account(account).await?;
        let mut received = Vec::new();
        for id in self.store.agreements_for_member(account).await? {
            if let Some(record) = self.store.load(id).await? {
                received.extend(record.feedback_for(account));
            }
        }
        Ok(FeedbackSummary::build(account, received))
    }

    // Inspection -------------------------------------------------------------

    pub async fn get(&self, actor: &Account, id: AgreementId) -> Result<AgreementSnapshot> {
        let record = self.load_record(id).await?;
        if !record.is_visible_to(actor) {
            return Err(AccordError::PermissionDenied(
                "not a party to this agreement".to_string(),
            ));
        }
        Ok(AgreementSnapshot::from(&record))
    }

    /// Agreements the caller belongs to or is invited to, newest first.
    pub async fn list(&self, actor: &Account) -> Result<Vec<AgreementSnapshot>> {
        let mut ids: BTreeSet<AgreementId> = self
            .store
            .agreements_for_member(actor.id)
            .await?
            .into_iter()
            .collect();
        ids.extend(self.store.agreements_for_email(&actor.email).await?);

        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.store.load(id).await? {
                snapshots.push(AgreementSnapshot::from(&record));
            }
        }
        snapshots.sort_by(|a, b| b.agreement.created_at.cmp(&a.agreement.created_at));
        Ok(snapshots)
    }

    /// The archived agreement document, or a preview rendered from the current state
    /// before an envelope has been sent.
    pub async fn document(&self, actor: &Account, id: AgreementId) -> Result<Vec<u8>> {
        let record = self.load_record(id).await?;
        if !record.is_visible_to(actor) {
            return Err(AccordError::PermissionDenied(
                "not a party to this agreement".to_string(),
            ));
        }
        let archived = self
            .call_provider(
                "blob-storage",
                self.blobs.get(&self.config.document_container, &document_key(id)),
            )
            .await?;
        Ok(archived.unwrap_or_else(|| render_agreement(&record).into_bytes()))
    }

    pub async fn audit(&self, actor: &Account, id: AgreementId) -> Result<AuditReport> {
        let record = self.load_record(id).await?;
        if !record.is_visible_to(actor) {
            return Err(AccordError::PermissionDenied(
                "not a party to this agreement".to_string(),
            ));
        }
        let entries = self.store.load_audit(id).await?;
        let verified = match verify_chain(&entries) {
            Ok(()) => true,
            Err(error) => {
                warn!(agreement_id = %id, %error, "audit chain verification failed");
                false
            }
        };
        Ok(AuditReport {
            agreement_id: id,
            verified,
            entries,
        })
    }

    // Internals ----------------------------------------------------------------

    async fn load_record(&self, id: AgreementId) -> Result<AgreementRecord> {
        self.store
            .load(id)
            .await?
            .ok_or(AccordError::AgreementNotFound(id))
    }

    /// Run a read-only check under the agreement lock.
    async fn read<T>(&self, id: AgreementId, f: impl FnOnce(&AgreementRecord) -> Result<T>) -> Result<T> {
        let _guard = self.agreement_locks.lock(&id).await;
        let record = self.load_record(id).await?;
        f(&record)
    }

    /// Load, mutate and commit one agreement under its lock.
    ///
    /// The aggregate is written only when `f` staged audit entries; every state change
    /// stages at least one, so a no-op leaves the store untouched.
    async fn mutate<T>(
        &self,
        id: AgreementId,
        f: impl FnOnce(&mut AgreementRecord, &mut AuditTrail, DateTime<Utc>) -> Result<T>,
    ) -> Result<(AgreementRecord, T)> {
        let _guard = self.agreement_locks.lock(&id).await;
        let mut record = self.load_record(id).await?;
        let mut trail = AuditTrail::resume(id, self.store.audit_head(id).await?);

        let value = f(&mut record, &mut trail, Utc::now())?;
        if !trail.is_empty() {
            record.version = self.store.save(&record, trail.staged()).await?;
        }
        Ok((record, value))
    }

    async fn call_provider<T>(
        &self,
        provider: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.provider_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error @ AccordError::ProviderUnavailable { .. })) => Err(error),
            Ok(Err(error)) => Err(AccordError::provider_unavailable(provider, error.to_string())),
            Err(_) => Err(AccordError::provider_unavailable(
                provider,
                format!("no response within {}ms", timeout.as_millis()),
            )),
        }
    }

    fn dispatch_invite_email(&self, email: InviteEmail) {
        let notifier = self.notifier.clone();
        let timeout = self.config.notify_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, notifier.send_invite_email(&email)).await {
                Ok(Ok(())) => debug!(to = %email.to, "invite email sent"),
                Ok(Err(error)) => warn!(to = %email.to, %error, "invite email failed"),
                Err(_) => warn!(to = %email.to, "invite email timed out"),
            }
        });
    }

    fn dispatch_completion_email(&self, record: &AgreementRecord) {
        let email = CompletionEmail {
            to: record.parties.iter().map(|p| p.email.clone()).collect(),
            agreement_title: record.agreement.title.clone(),
            link: self.config.download_link(record.id()),
        };
        let notifier = self.notifier.clone();
        let timeout = self.config.notify_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, notifier.send_completion_email(&email)).await {
                Ok(Ok(())) => debug!(recipients = email.to.len(), "completion email sent"),
                Ok(Err(error)) => warn!(%error, "completion email failed"),
                Err(_) => warn!("completion email timed out"),
            }
        });
    }
}
