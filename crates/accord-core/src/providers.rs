//! Collaborator seams: checkout, e-signature, identity verification, mail and blob storage.
//!
//! Implementations live in `accord-adapters`; the engine only sees these traits.

use crate::error::Result;
use crate::types::{Account, AgreementId, PaymentMethod};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub agreement_id: AgreementId,
    pub amount_cents: u64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
}

/// Hosted checkout session created by a payment provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkout {
    pub method: PaymentMethod,
    pub provider: String,
    pub provider_ref: String,
    pub checkout_url: String,
    pub amount_cents: u64,
    pub currency: String,
}

/// Payment rail plug-in. One provider per method.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn provider(&self) -> &'static str;

    fn method(&self) -> PaymentMethod;

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<Checkout>;
}

/// Registry for payment provider plug-ins, keyed by method.
#[derive(Default)]
pub struct PaymentProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl PaymentProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn get(&self, method: PaymentMethod) -> Option<Arc<dyn PaymentProvider>> {
        self.providers.get(&method).cloned()
    }

    pub fn has(&self, method: PaymentMethod) -> bool {
        self.providers.contains_key(&method)
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        let mut methods: Vec<_> = self.providers.keys().copied().collect();
        methods.sort_by_key(|m| m.name());
        methods
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct EnvelopeRequest {
    pub agreement_id: AgreementId,
    pub title: String,
    pub document_name: String,
    pub document: Vec<u8>,
    pub recipients: Vec<Recipient>,
}

#[async_trait]
pub trait SignatureProvider: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Send the document out for signature; returns the provider's envelope id.
    async fn create_envelope(&self, request: &EnvelopeRequest) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationSession {
    pub external_ref: String,
    pub redirect_url: String,
}

#[async_trait]
pub trait VerificationProvider: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn start_verification(
        &self,
        account: &Account,
        callback_url: &str,
    ) -> Result<VerificationSession>;
}

#[derive(Default)]
pub struct VerificationProviderRegistry {
    providers: HashMap<String, Arc<dyn VerificationProvider>>,
}

impl VerificationProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn VerificationProvider>) {
        self.providers
            .insert(provider.provider().to_string(), provider);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn VerificationProvider>> {
        self.providers.get(&provider.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InviteEmail {
    pub to: String,
    pub inviter: String,
    pub agreement_title: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionEmail {
    pub to: Vec<String>,
    pub agreement_title: String,
    pub link: String,
}

/// Outbound mail. Delivery is best-effort; failures never roll back lifecycle state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_invite_email(&self, email: &InviteEmail) -> Result<()>;

    async fn send_completion_email(&self, email: &CompletionEmail) -> Result<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes`, returning a locator for the object.
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<String>;

    async fn get(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, container: &str, key: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyCard;

    #[async_trait]
    impl PaymentProvider for DummyCard {
        fn provider(&self) -> &'static str {
            "dummy"
        }

        fn method(&self) -> PaymentMethod {
            PaymentMethod::Card
        }

        async fn create_checkout(&self, request: &CheckoutRequest) -> Result<Checkout> {
            Ok(Checkout {
                method: PaymentMethod::Card,
                provider: "dummy".to_string(),
                provider_ref: "cs_dummy".to_string(),
                checkout_url: request.success_url.clone(),
                amount_cents: request.amount_cents,
                currency: request.currency.clone(),
            })
        }
    }

    #[test]
    fn payment_registry_roundtrip() {
        let mut registry = PaymentProviderRegistry::new();
        registry.register(Arc::new(DummyCard));
        assert!(registry.has(PaymentMethod::Card));
        assert!(!registry.has(PaymentMethod::Crypto));
        assert_eq!(registry.methods(), vec![PaymentMethod::Card]);
    }
}
