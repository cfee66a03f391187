//! Accord core: the roommate agreement lifecycle.
//!
//! This crate owns the agreement aggregate (parties, invitations, payments and signature
//! envelopes), the lifecycle state machine that gates every operation, a hash-chained
//! audit trail, and the persistence seam. Providers are reached only through the traits
//! in [`providers`].

#![deny(unsafe_code)]

pub mod audit;
pub mod document;
pub mod error;
pub mod feedback;
pub mod invitations;
pub mod lifecycle;
pub mod locks;
pub mod payments;
pub mod providers;
pub mod registry;
pub mod runtime;
pub mod signatures;
pub mod storage;
pub mod types;
pub mod verification;

pub use audit::{verify_chain, AuditEntry, AuditEvent, AuditHead, AuditTrail};
pub use document::{document_key, render_agreement, DOCUMENT_NAME};
pub use error::{AccordError, Result};
pub use feedback::{
    CategoryAverages, CategoryRatings, Feedback, FeedbackSummary, FeedbackView, NewFeedback,
};
pub use invitations::{default_invite_ttl, generate_token, AcceptedInvite, IssueKind, IssuedInvite};
pub use lifecycle::{AgreementStatus, GateContext, LifecycleAction, TransitionRecord};
pub use locks::{KeyedGuard, KeyedLocks};
pub use payments::SettleResult;
pub use providers::{
    BlobStore, Checkout, CheckoutRequest, CompletionEmail, EnvelopeRequest, InviteEmail, Notifier,
    PaymentProvider, PaymentProviderRegistry, Recipient, SignatureProvider, VerificationProvider,
    VerificationProviderRegistry, VerificationSession,
};
pub use runtime::{
    AgreementEngine, AgreementSnapshot, AuditReport, Collaborators, EngineConfig, InviteContext,
    InviteIssued, InviteSummary, NextStep, PaymentSession, PendingInvite, VerificationStarted,
    WebhookOutcome,
};
pub use signatures::EnvelopeSignal;
pub use storage::{AgreementStore, InMemoryAgreementStore, PostgresAgreementStore, StoreConfig};
pub use types::{
    Account, AccountId, Agreement, AgreementId, AgreementPatch, AgreementRecord, EnvelopeId,
    EnvelopeStatus, FeedbackId, GuestRules, IdentityVerification, InviteId, InviteToken, NewAgreement, Party,
    PartyId, PartyRole, PartySpec, Payment, PaymentId, PaymentMethod, PaymentOutcome,
    PaymentStatus, PetRules, PropertyLocation, QuietHours, SignatureEnvelope, Terms,
    VerificationId, VerificationStatus, DEFAULT_TITLE,
};
pub use verification::VerificationChange;
