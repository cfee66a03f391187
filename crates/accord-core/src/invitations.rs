//! Invitation manager: single-use, expiring join tokens.

use crate::error::{AccordError, Result};
use crate::lifecycle::{AgreementStatus, LifecycleAction};
use crate::types::{
    normalize_email, validate_email, Account, AccountId, AgreementRecord, InviteId, InviteToken,
    PartyId,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

pub const TOKEN_BYTES: usize = 32;

pub fn default_invite_ttl() -> Duration {
    Duration::days(7)
}

/// 32 bytes from the OS CSPRNG, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// How `issue_invite` treated the (agreement, email) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    Created,
    Refreshed,
    Replaced,
}

#[derive(Debug, Clone)]
pub struct IssuedInvite {
    pub invite: InviteToken,
    pub kind: IssueKind,
}

/// Outcome of a successful accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedInvite {
    pub party_id: PartyId,
    pub invite_id: InviteId,
}

impl AgreementRecord {
    pub fn invite_by_token(&self, token: &str) -> Option<&InviteToken> {
        self.invites.iter().find(|invite| invite.token == token)
    }

    pub fn invite_for_email(&self, email: &str) -> Option<&InviteToken> {
        let email = normalize_email(email);
        self.invites.iter().find(|invite| invite.email == email)
    }

    /// Issue or refresh the invite for `email`. Keeps at most one row per email.
    pub fn issue_invite(&mut self, email: &str, ttl: Duration, now: DateTime<Utc>) -> Result<IssuedInvite> {
        let email = validate_email(email)?;
        let expires_at = now + ttl;

        if let Some(position) = self.invites.iter().position(|i| i.email == email) {
            let current = &mut self.invites[position];
            if current.is_used {
                return Err(AccordError::TokenAlreadyUsed);
            }
            let kind = if current.is_expired(now) {
                current.id = InviteId::generate();
                current.token = generate_token();
                current.created_at = now;
                IssueKind::Replaced
            } else {
                IssueKind::Refreshed
            };
            current.expires_at = expires_at;
            return Ok(IssuedInvite {
                invite: current.clone(),
                kind,
            });
        }

        let invite = InviteToken {
            id: InviteId::generate(),
            email,
            token: generate_token(),
            is_used: false,
            used_by: None,
            created_at: now,
            expires_at,
        };
        self.invites.push(invite.clone());
        Ok(IssuedInvite {
            invite,
            kind: IssueKind::Created,
        })
    }

    /// Validate a token for use: it must exist, be unused and unexpired.
    pub fn resolve_invite(&self, token: &str, now: DateTime<Utc>) -> Result<&InviteToken> {
        let invite = self.invite_by_token(token).ok_or(AccordError::TokenNotFound)?;
        if invite.is_used {
            return Err(AccordError::TokenAlreadyUsed);
        }
        if invite.is_expired(now) {
            return Err(AccordError::TokenExpired);
        }
        Ok(invite)
    }

    /// Accept an invite as `account`. Either the party is linked and the token consumed,
    /// or nothing changes.
    pub fn accept_invite(
        &mut self,
        token: &str,
        account: &Account,
        demo_mode: bool,
        now: DateTime<Utc>,
    ) -> Result<AcceptedInvite> {
        let invite = self.resolve_invite(token, now)?;
        let (invite_id, email) = (invite.id, invite.email.clone());

        self.require_status(&[AgreementStatus::Inviting], LifecycleAction::AcceptInvite)?;
        if normalize_email(&account.email) != email {
            return Err(AccordError::EmailMismatch);
        }

        let party_id = self.link_user(&email, account, demo_mode, now)?;
        if let Some(invite) = self.invites.iter_mut().find(|i| i.id == invite_id) {
            invite.is_used = true;
            invite.used_by = Some(account.id);
        }
        Ok(AcceptedInvite { party_id, invite_id })
    }

    /// Initiator-only. The token row is deleted outright.
    pub fn revoke_invite(&mut self, token: &str, requester: AccountId) -> Result<InviteToken> {
        self.require_initiator(requester, LifecycleAction::RevokeInvite)?;
        if self.status().is_terminal() {
            return Err(AccordError::invalid_transition(
                self.status(),
                LifecycleAction::RevokeInvite,
            ));
        }
        let position = self
            .invites
            .iter()
            .position(|invite| invite.token == token)
            .ok_or(AccordError::TokenNotFound)?;
        Ok(self.invites.remove(position))
    }

    /// Unused, unexpired invite addressed to `email`, if any.
    pub fn pending_invite_for(&self, email: &str, now: DateTime<Utc>) -> Option<&InviteToken> {
        self.invite_for_email(email)
            .filter(|invite| !invite.is_used && !invite.is_expired(now))
    }
}
