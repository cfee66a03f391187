use crate::error::{AccordError, Result};
use crate::lifecycle::{AgreementStatus, TransitionRecord};
use crate::types::{AccountId, AgreementId};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened, as recorded in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub action: String,
    pub from_status: Option<AgreementStatus>,
    pub to_status: Option<AgreementStatus>,
    pub detail: String,
}

impl AuditEvent {
    pub fn note(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            from_status: None,
            to_status: None,
            detail: detail.into(),
        }
    }

    pub fn transition(record: &TransitionRecord) -> Self {
        Self {
            action: record.action.name().replace(' ', "_"),
            from_status: Some(record.from),
            to_status: Some(record.to),
            detail: format!("{} -> {}", record.from, record.to),
        }
    }
}

/// Hash-chained audit entry for one agreement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub entry_id: String,
    pub index: u64,
    pub agreement_id: AgreementId,
    pub actor: Option<AccountId>,
    pub event: AuditEvent,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Position of the last committed entry, enough to extend the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditHead {
    pub index: u64,
    pub entry_hash: String,
}

/// Append-only audit chain. Entries are never edited; corrections are new entries.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    agreement_id: AgreementId,
    next_index: u64,
    last_hash: Option<String>,
    staged: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new(agreement_id: AgreementId) -> Self {
        Self::resume(agreement_id, None)
    }

    /// Continue a persisted chain from its head.
    pub fn resume(agreement_id: AgreementId, head: Option<AuditHead>) -> Self {
        let (next_index, last_hash) = match head {
            Some(head) => (head.index + 1, Some(head.entry_hash)),
            None => (0, None),
        };
        Self {
            agreement_id,
            next_index,
            last_hash,
            staged: Vec::new(),
        }
    }

    /// Stage the next entry; it becomes durable when the store commits it with the aggregate.
    pub fn append(&mut self, actor: Option<AccountId>, event: AuditEvent, now: DateTime<Utc>) -> &AuditEntry {
        let entry = build_entry(
            self.agreement_id,
            self.next_index,
            actor,
            event,
            now,
            self.last_hash.clone(),
        );
        self.next_index += 1;
        self.last_hash = Some(entry.entry_hash.clone());
        self.staged.push(entry);
        &self.staged[self.staged.len() - 1]
    }

    pub fn append_transitions(&mut self, actor: Option<AccountId>, transitions: &[TransitionRecord]) {
        for transition in transitions {
            self.append(actor, AuditEvent::transition(transition), transition.at);
        }
    }

    pub fn staged(&self) -> &[AuditEntry] {
        &self.staged
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

fn build_entry(
    agreement_id: AgreementId,
    index: u64,
    actor: Option<AccountId>,
    event: AuditEvent,
    timestamp: DateTime<Utc>,
    previous_hash: Option<String>,
) -> AuditEntry {
    let entry_id = Uuid::new_v4().to_string();
    // Postgres keeps microseconds; hash what survives a round trip.
    let timestamp = timestamp.trunc_subsecs(6);
    let entry_hash = compute_entry_hash(
        &entry_id,
        index,
        agreement_id,
        actor,
        &event,
        timestamp,
        previous_hash.as_deref(),
    );
    AuditEntry {
        entry_id,
        index,
        agreement_id,
        actor,
        event,
        timestamp,
        previous_hash,
        entry_hash,
    }
}

/// Verify a persisted chain end to end: contiguous indexes, linked and untampered hashes.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<()> {
    let mut previous_hash: Option<&str> = None;
    for (expected_index, entry) in entries.iter().enumerate() {
        if entry.index != expected_index as u64 {
            return Err(AccordError::Storage(format!(
                "audit index gap at position {} (found {})",
                expected_index, entry.index
            )));
        }
        if entry.previous_hash.as_deref() != previous_hash {
            return Err(AccordError::Storage(format!(
                "audit entry {} does not link to its predecessor",
                entry.index
            )));
        }
        let expected_hash = compute_entry_hash(
            &entry.entry_id,
            entry.index,
            entry.agreement_id,
            entry.actor,
            &entry.event,
            entry.timestamp,
            entry.previous_hash.as_deref(),
        );
        if entry.entry_hash != expected_hash {
            return Err(AccordError::Storage(format!(
                "audit entry {} hash mismatch",
                entry.index
            )));
        }
        previous_hash = Some(&entry.entry_hash);
    }
    Ok(())
}

fn compute_entry_hash(
    entry_id: &str,
    index: u64,
    agreement_id: AgreementId,
    actor: Option<AccountId>,
    event: &AuditEvent,
    timestamp: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "entry_id": entry_id,
        "index": index,
        "agreement_id": agreement_id,
        "actor": actor,
        "event": event,
        "timestamp": timestamp,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
