//! Agreement persistence backends.
//!
//! The agreement aggregate is the unit of commit: a save writes the record, its lookup
//! index and any staged audit entries together, or nothing at all.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryAgreementStore;
pub use postgres::PostgresAgreementStore;
pub use traits::AgreementStore;

use crate::error::{AccordError, Result};
use crate::types::AgreementRecord;
use std::sync::Arc;

/// Persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// Keep everything in process memory.
    #[default]
    Memory,
    /// Persist aggregates, audit chains, accounts and verifications in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Open the configured backend, creating its schema if needed.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn AgreementStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(InMemoryAgreementStore::new())),
        StoreConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresAgreementStore::connect(database_url, *max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Secondary lookups maintained for every stored agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    InviteToken,
    PaymentRef,
    Envelope,
    Member,
    PartyEmail,
}

impl IndexKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::InviteToken => "invite_token",
            Self::PaymentRef => "payment_ref",
            Self::Envelope => "envelope",
            Self::Member => "member",
            Self::PartyEmail => "party_email",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "invite_token" => Ok(Self::InviteToken),
            "payment_ref" => Ok(Self::PaymentRef),
            "envelope" => Ok(Self::Envelope),
            "member" => Ok(Self::Member),
            "party_email" => Ok(Self::PartyEmail),
            other => Err(AccordError::Storage(format!("unknown index kind '{other}'"))),
        }
    }

    /// External references that may belong to one agreement only.
    pub fn is_unique(self) -> bool {
        matches!(self, Self::InviteToken | Self::PaymentRef | Self::Envelope)
    }
}

pub fn index_keys(record: &AgreementRecord) -> Vec<(IndexKind, String)> {
    let mut keys = Vec::new();
    keys.extend(
        record
            .invites
            .iter()
            .map(|i| (IndexKind::InviteToken, i.token.clone())),
    );
    keys.extend(
        record
            .payments
            .iter()
            .map(|p| (IndexKind::PaymentRef, p.provider_ref.clone())),
    );
    keys.extend(
        record
            .envelopes
            .iter()
            .map(|e| (IndexKind::Envelope, e.external_id.clone())),
    );
    for party in &record.parties {
        keys.push((IndexKind::PartyEmail, party.email.clone()));
        if let Some(account) = party.account_id {
            keys.push((IndexKind::Member, account.to_string()));
        }
    }
    keys.sort();
    keys.dedup();
    keys
}
