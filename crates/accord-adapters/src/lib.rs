//! Provider adapters for Accord.
//!
//! Deterministic stand-ins for the hosted checkout, e-signature, identity verification,
//! mail and blob services, plus a filesystem blob store for single-node deployments.

#![deny(unsafe_code)]

use accord_core::error::{AccordError, Result};
use accord_core::providers::{
    BlobStore, Checkout, CheckoutRequest, CompletionEmail, EnvelopeRequest, InviteEmail, Notifier,
    PaymentProvider, SignatureProvider, VerificationProvider, VerificationSession,
};
use accord_core::types::{Account, PaymentMethod};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Mock card checkout shaped like a hosted Stripe session.
#[derive(Debug, Clone, Default)]
pub struct MockCardCheckout;

#[async_trait]
impl PaymentProvider for MockCardCheckout {
    fn provider(&self) -> &'static str {
        "stripe"
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<Checkout> {
        let provider_ref = format!("cs_test_{}", short_id());
        Ok(Checkout {
            method: PaymentMethod::Card,
            provider: self.provider().to_string(),
            checkout_url: format!("https://checkout.stripe.test/c/pay/{provider_ref}"),
            provider_ref,
            amount_cents: request.amount_cents,
            currency: request.currency.clone(),
        })
    }
}

/// Mock crypto checkout shaped like a Coinbase Commerce charge.
#[derive(Debug, Clone, Default)]
pub struct MockCryptoCheckout;

#[async_trait]
impl PaymentProvider for MockCryptoCheckout {
    fn provider(&self) -> &'static str {
        "coinbase"
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::Crypto
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<Checkout> {
        let provider_ref = format!("charge_{}", short_id());
        Ok(Checkout {
            method: PaymentMethod::Crypto,
            provider: self.provider().to_string(),
            checkout_url: format!("https://commerce.coinbase.test/charges/{provider_ref}"),
            provider_ref,
            amount_cents: request.amount_cents,
            currency: request.currency.clone(),
        })
    }
}

/// Deterministic failing checkout useful for outage testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailPaymentProvider {
    provider_name: &'static str,
    method: PaymentMethod,
    reason: String,
}

impl AlwaysFailPaymentProvider {
    pub fn new(provider_name: &'static str, method: PaymentMethod, reason: impl Into<String>) -> Self {
        Self {
            provider_name,
            method,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PaymentProvider for AlwaysFailPaymentProvider {
    fn provider(&self) -> &'static str {
        self.provider_name
    }

    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn create_checkout(&self, _request: &CheckoutRequest) -> Result<Checkout> {
        Err(AccordError::provider_unavailable(
            self.provider_name,
            self.reason.clone(),
        ))
    }
}

/// Mock e-signature service. Envelope ids embed a digest of the signed document.
#[derive(Debug, Default)]
pub struct MockSignatureProvider {
    sent: DashMap<String, Vec<String>>,
}

impl MockSignatureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recipient emails of a sent envelope.
    pub fn recipients(&self, external_id: &str) -> Option<Vec<String>> {
        self.sent.get(external_id).map(|entry| entry.value().clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

#[async_trait]
impl SignatureProvider for MockSignatureProvider {
    fn provider(&self) -> &'static str {
        "docusign"
    }

    async fn create_envelope(&self, request: &EnvelopeRequest) -> Result<String> {
        if request.recipients.is_empty() {
            return Err(AccordError::Validation(
                "an envelope needs at least one recipient".to_string(),
            ));
        }
        let digest = blake3::hash(&request.document).to_hex();
        let external_id = format!("env-{}-{}", &digest.as_str()[..12], short_id());
        self.sent.insert(
            external_id.clone(),
            request.recipients.iter().map(|r| r.email.clone()).collect(),
        );
        Ok(external_id)
    }
}

/// Mock hosted identity check. One instance per provider name.
#[derive(Debug, Clone)]
pub struct MockVerificationProvider {
    name: &'static str,
    host: &'static str,
}

impl MockVerificationProvider {
    pub fn idme() -> Self {
        Self {
            name: "idme",
            host: "api.idmelabs.test",
        }
    }

    pub fn onfido() -> Self {
        Self {
            name: "onfido",
            host: "sdk.onfido.test",
        }
    }

    pub fn persona() -> Self {
        Self {
            name: "persona",
            host: "withpersona.test",
        }
    }

    pub fn all() -> Vec<Self> {
        vec![Self::idme(), Self::onfido(), Self::persona()]
    }
}

#[async_trait]
impl VerificationProvider for MockVerificationProvider {
    fn provider(&self) -> &'static str {
        self.name
    }

    async fn start_verification(
        &self,
        account: &Account,
        callback_url: &str,
    ) -> Result<VerificationSession> {
        let external_ref = format!("{}_{}", self.name, short_id());
        Ok(VerificationSession {
            redirect_url: format!(
                "https://{}/verify?ref={external_ref}&account={}&redirect_uri={callback_url}",
                self.host, account.id
            ),
            external_ref,
        })
    }
}

/// Notifier that only logs. Used when no mail transport is configured.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send_invite_email(&self, email: &InviteEmail) -> Result<()> {
        info!(
            to = %email.to,
            inviter = %email.inviter,
            link = %email.link,
            "invite email"
        );
        Ok(())
    }

    async fn send_completion_email(&self, email: &CompletionEmail) -> Result<()> {
        let payload = serde_json::to_string(email)
            .map_err(|e| AccordError::Serialization(e.to_string()))?;
        info!(recipients = email.to.len(), %payload, "completion email");
        Ok(())
    }
}

/// Notifier that keeps every message for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    invites: Mutex<Vec<InviteEmail>>,
    completions: Mutex<Vec<CompletionEmail>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn invites(&self) -> Vec<InviteEmail> {
        self.invites.lock().await.clone()
    }

    pub async fn completions(&self) -> Vec<CompletionEmail> {
        self.completions.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_invite_email(&self, email: &InviteEmail) -> Result<()> {
        self.invites.lock().await.push(email.clone());
        Ok(())
    }

    async fn send_completion_email(&self, email: &CompletionEmail) -> Result<()> {
        self.completions.lock().await.push(email.clone());
        Ok(())
    }
}

/// Process-local blob store.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: DashMap<(String, String), Vec<u8>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<String> {
        self.objects
            .insert((container.to_string(), key.to_string()), bytes);
        Ok(format!("memory://{container}/{key}"))
    }

    async fn get(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .get(&(container.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn delete(&self, container: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .remove(&(container.to_string(), key.to_string()))
            .is_some())
    }
}

/// Blob store rooted at a local directory: `<root>/<container>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, container: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(container).join(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if container.is_empty() || key.is_empty() || escapes {
            return Err(AccordError::Validation(format!(
                "invalid blob location '{container}/{key}'"
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn blob_err(context: &str, path: &Path, error: std::io::Error) -> AccordError {
    AccordError::Storage(format!("{context} {}: {error}", path.display()))
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<String> {
        let path = self.path_for(container, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| blob_err("create", parent, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| blob_err("write", &path, e))?;
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(container, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(blob_err("read", &path, e)),
        }
    }

    async fn delete(&self, container: &str, key: &str) -> Result<bool> {
        let path = self.path_for(container, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(blob_err("delete", &path, e)),
        }
    }
}
