//! Provider webhook authentication and payload normalization.
//!
//! Deliveries are signed with a keyed blake3 digest of the raw body, using a secret shared
//! with each source. Each parser returns `None` for events the core does not track; the
//! handlers still acknowledge those so providers stop retrying.

use accord_core::{EnvelopeStatus, PaymentOutcome, VerificationStatus};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Header carrying the hex digest of the delivery.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Secret name for the e-signature webhook, which has no provider path segment.
pub const SIGNATURE_SOURCE: &str = "signatures";

const KEY_CONTEXT: &str = "accord 2024 webhook signature v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no webhook secret configured for '{0}'")]
    NotConfigured(String),
    #[error("missing x-webhook-signature header")]
    Missing,
    #[error("malformed x-webhook-signature header")]
    Malformed,
    #[error("webhook signature mismatch")]
    Mismatch,
}

/// Per-source webhook secrets, keyed by lowercase source name (`stripe`, `coinbase`,
/// `signatures`, `persona`, ...).
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    secrets: BTreeMap<String, String>,
    /// Accept unsigned deliveries from sources without a secret. Local demos only.
    pub allow_unsigned: bool,
}

impl WebhookSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, source: &str, secret: impl Into<String>) -> Self {
        self.insert(source, secret);
        self
    }

    pub fn insert(&mut self, source: &str, secret: impl Into<String>) {
        self.secrets
            .insert(source.trim().to_ascii_lowercase(), secret.into());
    }

    /// Parse `source=secret`.
    pub fn parse_entry(entry: &str) -> Option<(String, String)> {
        let (source, secret) = entry.split_once('=')?;
        let (source, secret) = (source.trim(), secret.trim());
        if source.is_empty() || secret.is_empty() {
            return None;
        }
        Some((source.to_ascii_lowercase(), secret.to_string()))
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    /// Check `signature` against the raw `body` delivered for `source`.
    pub fn verify(
        &self,
        source: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), SignatureError> {
        let source = source.to_ascii_lowercase();
        let Some(secret) = self.secrets.get(&source) else {
            if self.allow_unsigned {
                return Ok(());
            }
            return Err(SignatureError::NotConfigured(source));
        };
        let signature = signature.ok_or(SignatureError::Missing)?;
        let claimed =
            blake3::Hash::from_hex(signature.trim()).map_err(|_| SignatureError::Malformed)?;
        // `blake3::Hash` equality is constant time.
        if claimed == digest(secret, body) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

fn digest(secret: &str, body: &[u8]) -> blake3::Hash {
    let key = blake3::derive_key(KEY_CONTEXT, secret.as_bytes());
    blake3::keyed_hash(&key, body)
}

/// Hex signature a source sends for `body`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    digest(secret, body).to_hex().to_string()
}

/// A payment event reduced to the provider reference and its terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub provider_ref: String,
    pub outcome: PaymentOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEvent {
    pub envelope_id: String,
    pub status: EnvelopeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationEvent {
    pub external_ref: String,
    pub status: VerificationStatus,
}

fn str_at<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_outcome(value: &str) -> Option<PaymentOutcome> {
    match value.to_ascii_lowercase().as_str() {
        "succeeded" | "success" | "paid" | "confirmed" => Some(PaymentOutcome::Succeeded),
        "failed" | "failure" => Some(PaymentOutcome::Failed),
        _ => None,
    }
}

/// Accepts the normalized `{provider_ref, outcome}` shape from any provider, otherwise the
/// provider's native event shape.
pub fn parse_payment_event(provider: &str, payload: &Value) -> Option<PaymentEvent> {
    if let Some(provider_ref) = str_at(payload, "/provider_ref") {
        let outcome = str_at(payload, "/outcome").and_then(parse_outcome)?;
        return Some(PaymentEvent {
            provider_ref: provider_ref.to_string(),
            outcome,
        });
    }

    let (outcome, provider_ref) = match provider.to_ascii_lowercase().as_str() {
        "stripe" | "card" => {
            let outcome = match str_at(payload, "/type")? {
                "checkout.session.completed" => PaymentOutcome::Succeeded,
                "payment_intent.payment_failed" | "checkout.session.expired" => {
                    PaymentOutcome::Failed
                }
                _ => return None,
            };
            (outcome, str_at(payload, "/data/object/id")?)
        }
        "coinbase" | "crypto" => {
            let outcome = match str_at(payload, "/event/type")? {
                "charge:confirmed" => PaymentOutcome::Succeeded,
                "charge:failed" => PaymentOutcome::Failed,
                _ => return None,
            };
            (outcome, str_at(payload, "/event/data/id")?)
        }
        _ => return None,
    };

    Some(PaymentEvent {
        provider_ref: provider_ref.to_string(),
        outcome,
    })
}

pub fn parse_signature_event(payload: &Value) -> Option<SignatureEvent> {
    let envelope_id =
        str_at(payload, "/envelopeId").or_else(|| str_at(payload, "/envelope_id"))?;
    let status = EnvelopeStatus::from_provider(str_at(payload, "/status")?)?;
    Some(SignatureEvent {
        envelope_id: envelope_id.to_string(),
        status,
    })
}

/// Pending results carry no decision and are dropped.
pub fn parse_verification_event(payload: &Value) -> Option<VerificationEvent> {
    let external_ref =
        str_at(payload, "/verification_id").or_else(|| str_at(payload, "/external_ref"))?;
    let status = VerificationStatus::from_provider(str_at(payload, "/status")?)?;
    if status == VerificationStatus::Pending {
        return None;
    }
    Some(VerificationEvent {
        external_ref: external_ref.to_string(),
        status,
    })
}
