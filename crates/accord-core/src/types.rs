use crate::error::{AccordError, Result};
use crate::feedback::Feedback;
use crate::lifecycle::AgreementStatus;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn parse(value: &str) -> Result<Self> {
                Uuid::parse_str(value.trim()).map(Self).map_err(|_| {
                    AccordError::Validation(format!(
                        "'{}' is not a valid {}",
                        value,
                        stringify!($name)
                    ))
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Agreement identifier.
    AgreementId
);
uuid_id!(
    /// Account identifier issued by the upstream identity provider sync.
    AccountId
);
uuid_id!(PartyId);
uuid_id!(InviteId);
uuid_id!(PaymentId);
uuid_id!(EnvelopeId);
uuid_id!(VerificationId);
uuid_id!(FeedbackId);

/// Lower-cases and trims an email so it can be used as an identity key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Normalize and sanity-check an email address.
pub fn validate_email(email: &str) -> Result<String> {
    let normalized = normalize_email(email);
    let valid = match normalized.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
                && !normalized.chars().any(char::is_whitespace)
        }
        None => false,
    };

    if valid {
        Ok(normalized)
    } else {
        Err(AccordError::Validation(format!(
            "'{}' is not a valid email address",
            email.trim()
        )))
    }
}

/// Account known to the core. Created only by the upstream authentication collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    /// Account-scoped badge, flipped only by an approved identity verification.
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, email: &str) -> Result<Self> {
        Ok(Self {
            id,
            email: validate_email(email)?,
            phone: None,
            display_name: None,
            is_verified: false,
            created_at: Utc::now(),
        })
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Initiator,
    Roommate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyLocation {
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

impl PropertyLocation {
    /// Single-line rendering used in documents and invite context.
    pub fn one_line(&self) -> String {
        [
            &self.address_line1,
            &self.address_line2,
            &self.city,
            &self.state,
            &self.postal_code,
            &self.country,
        ]
        .iter()
        .filter_map(|part| part.as_deref())
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    /// "HH:MM", 24h clock.
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestRules {
    pub max_consecutive_nights: u32,
    pub notice_hours: u32,
}

impl Default for GuestRules {
    fn default() -> Self {
        Self {
            max_consecutive_nights: 3,
            notice_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PetRules {
    pub allowed: bool,
    pub notes: Option<String>,
}

/// House rules attached 1:1 to an agreement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Terms {
    pub quiet_hours: Option<QuietHours>,
    pub guest_rules: Option<GuestRules>,
    pub pet_rules: Option<PetRules>,
    pub deposit_cents: Option<u64>,
    pub deposit_forfeit_reasons: Vec<String>,
    pub additional_rules: Option<String>,
    pub no_offensive_clause_ack: bool,
}

impl Terms {
    pub fn validate(&self) -> Result<()> {
        if let Some(quiet) = &self.quiet_hours {
            for (label, value) in [("start", &quiet.start), ("end", &quiet.end)] {
                NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
                    AccordError::Validation(format!(
                        "quiet_hours.{label} must be HH:MM, got '{value}'"
                    ))
                })?;
            }
        }
        Ok(())
    }
}

/// Roommate placeholder supplied at creation or invite time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartySpec {
    pub email: String,
    pub phone: Option<String>,
    pub rent_share_cents: Option<u64>,
    /// Free-form utility name -> monthly share in cents.
    pub utilities: BTreeMap<String, u64>,
    /// Free-form chore name -> schedule/notes.
    pub chores: BTreeMap<String, String>,
    pub requires_id_verification: bool,
}

impl PartySpec {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Self::default()
        }
    }

    pub fn with_rent_share(mut self, cents: u64) -> Self {
        self.rent_share_cents = Some(cents);
        self
    }

    pub fn requiring_verification(mut self) -> Self {
        self.requires_id_verification = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub id: PartyId,
    pub role: PartyRole,
    pub email: String,
    pub phone: Option<String>,
    pub account_id: Option<AccountId>,
    pub rent_share_cents: Option<u64>,
    pub utilities: BTreeMap<String, u64>,
    pub chores: BTreeMap<String, String>,
    pub requires_id_verification: bool,
    pub id_verified: bool,
    pub signed: bool,
    pub signed_at: Option<DateTime<Utc>>,
    pub joined_at: Option<DateTime<Utc>>,
}

impl Party {
    pub fn is_joined(&self) -> bool {
        self.account_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteToken {
    pub id: InviteId,
    pub email: String,
    pub token: String,
    pub is_used: bool,
    pub used_by: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl InviteToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Crypto,
}

impl PaymentMethod {
    pub fn name(self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Crypto => "crypto",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "card" => Ok(Self::Card),
            "crypto" | "solana" => Ok(Self::Crypto),
            other => Err(AccordError::Validation(format!(
                "unknown payment method '{other}'; expected card or crypto"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

/// Terminal outcome delivered by a payment webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

impl PaymentOutcome {
    pub fn status(self) -> PaymentStatus {
        match self {
            Self::Succeeded => PaymentStatus::Succeeded,
            Self::Failed => PaymentStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub method: PaymentMethod,
    pub amount_cents: u64,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Sent,
    Completed,
    Voided,
}

impl EnvelopeStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Voided => "voided",
        }
    }

    /// Parse provider status strings; statuses the core does not track yield `None`.
    pub fn from_provider(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sent" => Some(Self::Sent),
            "completed" => Some(Self::Completed),
            "voided" | "declined" => Some(Self::Voided),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub id: EnvelopeId,
    pub external_id: String,
    pub status: EnvelopeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Approved,
    Rejected,
}

impl VerificationStatus {
    pub fn from_provider(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pending" | "created" | "started" => Some(Self::Pending),
            "approved" | "completed" | "verified" => Some(Self::Approved),
            "rejected" | "declined" | "failed" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityVerification {
    pub id: VerificationId,
    pub account_id: AccountId,
    pub provider: String,
    pub status: VerificationStatus,
    pub external_ref: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    pub id: AgreementId,
    pub initiator_id: AccountId,
    pub title: String,
    pub location: PropertyLocation,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub rent_total_cents: u64,
    pub status: AgreementStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client request for a new draft agreement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewAgreement {
    pub title: Option<String>,
    pub location: PropertyLocation,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub rent_total_cents: u64,
    pub terms: Terms,
    pub roommates: Vec<PartySpec>,
}

/// Partial update of draft agreement fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementPatch {
    pub title: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub rent_total_cents: Option<u64>,
    pub terms: Option<Terms>,
}

pub const DEFAULT_TITLE: &str = "Roommate Agreement";

/// The agreement aggregate: the unit of locking, loading and atomic commit.
///
/// Parties, invites, payments and envelopes never exist outside their agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementRecord {
    pub agreement: Agreement,
    pub terms: Terms,
    pub parties: Vec<Party>,
    pub invites: Vec<InviteToken>,
    pub payments: Vec<Payment>,
    pub envelopes: Vec<SignatureEnvelope>,
    /// Post-completion ratings between roommates.
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    /// Optimistic concurrency version; bumped by the store on every commit.
    pub version: u64,
}

impl AgreementRecord {
    /// Build a draft aggregate with its terms, initiator party and roommate placeholders.
    pub fn draft(initiator: &Account, request: NewAgreement, now: DateTime<Utc>) -> Result<Self> {
        if request.rent_total_cents == 0 {
            return Err(AccordError::Validation(
                "rent_total_cents must be greater than zero".to_string(),
            ));
        }
        validate_dates(request.start_date, request.end_date)?;
        request.terms.validate()?;

        let title = request
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        let mut record = Self {
            agreement: Agreement {
                id: AgreementId::generate(),
                initiator_id: initiator.id,
                title,
                location: request.location,
                start_date: request.start_date,
                end_date: request.end_date,
                rent_total_cents: request.rent_total_cents,
                status: AgreementStatus::Draft,
                created_at: now,
                updated_at: now,
            },
            terms: request.terms,
            parties: Vec::new(),
            invites: Vec::new(),
            payments: Vec::new(),
            envelopes: Vec::new(),
            feedback: Vec::new(),
            version: 0,
        };

        let initiator_spec = PartySpec {
            phone: initiator.phone.clone(),
            ..PartySpec::new(initiator.email.clone())
        };
        let party_id = record.add_party(PartyRole::Initiator, &initiator_spec)?;
        if let Some(party) = record.party_mut(party_id) {
            party.account_id = Some(initiator.id);
            party.id_verified = initiator.is_verified;
            party.joined_at = Some(now);
        }

        for roommate in &request.roommates {
            record.add_party(PartyRole::Roommate, roommate)?;
        }

        Ok(record)
    }

    pub fn id(&self) -> AgreementId {
        self.agreement.id
    }

    pub fn status(&self) -> AgreementStatus {
        self.agreement.status
    }

    pub fn is_initiator(&self, account: AccountId) -> bool {
        self.agreement.initiator_id == account
    }

    pub fn party(&self, id: PartyId) -> Option<&Party> {
        self.parties.iter().find(|p| p.id == id)
    }

    pub fn party_mut(&mut self, id: PartyId) -> Option<&mut Party> {
        self.parties.iter_mut().find(|p| p.id == id)
    }

    pub fn party_by_email(&self, email: &str) -> Option<&Party> {
        let email = normalize_email(email);
        self.parties.iter().find(|p| p.email == email)
    }

    pub fn party_for_account(&self, account: AccountId) -> Option<&Party> {
        self.parties.iter().find(|p| p.account_id == Some(account))
    }

    /// Parties and invitees may inspect the agreement.
    pub fn is_visible_to(&self, account: &Account) -> bool {
        self.party_for_account(account.id).is_some()
            || self.party_by_email(&account.email).is_some()
    }

    /// Apply a draft patch. Lifecycle gating happens in the state machine.
    pub fn apply_patch(&mut self, patch: AgreementPatch, now: DateTime<Utc>) -> Result<()> {
        let start_date = patch.start_date.or(self.agreement.start_date);
        let end_date = patch.end_date.or(self.agreement.end_date);
        validate_dates(start_date, end_date)?;
        if patch.rent_total_cents == Some(0) {
            return Err(AccordError::Validation(
                "rent_total_cents must be greater than zero".to_string(),
            ));
        }
        if let Some(terms) = &patch.terms {
            terms.validate()?;
        }

        let agreement = &mut self.agreement;
        if let Some(title) = patch.title.map(|t| t.trim().to_string()) {
            if title.is_empty() {
                return Err(AccordError::Validation("title cannot be empty".to_string()));
            }
            agreement.title = title;
        }
        let location = &mut agreement.location;
        for (slot, value) in [
            (&mut location.address_line1, patch.address_line1),
            (&mut location.address_line2, patch.address_line2),
            (&mut location.city, patch.city),
            (&mut location.state, patch.state),
            (&mut location.postal_code, patch.postal_code),
            (&mut location.country, patch.country),
        ] {
            if value.is_some() {
                *slot = value;
            }
        }
        agreement.start_date = start_date;
        agreement.end_date = end_date;
        if let Some(rent) = patch.rent_total_cents {
            agreement.rent_total_cents = rent;
        }
        if let Some(terms) = patch.terms {
            self.terms = terms;
        }
        self.agreement.updated_at = now;
        Ok(())
    }
}

fn validate_dates(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<()> {
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(AccordError::Validation(format!(
                "end_date {end} is before start_date {start}"
            )));
        }
    }
    Ok(())
}
