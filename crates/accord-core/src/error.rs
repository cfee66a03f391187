use crate::lifecycle::{AgreementStatus, LifecycleAction};
use crate::types::AgreementId;
use thiserror::Error;

/// Accord core errors.
///
/// Everything above `AgreementNotFound` is client-correctable: the request can be
/// fixed and retried. Webhook entry points never surface these for unknown or
/// replayed references.
#[derive(Debug, Error)]
pub enum AccordError {
    #[error("cannot {action} while agreement is {status}")]
    InvalidTransition {
        status: AgreementStatus,
        action: LifecycleAction,
    },

    #[error("party with email '{email}' already exists on this agreement")]
    DuplicateParty { email: String },

    #[error("identity verification required: {0}")]
    VerificationRequired(String),

    #[error("{unjoined} part(y/ies) have not joined the agreement yet")]
    PartiesNotJoined { unjoined: usize },

    #[error("{unsigned} part(y/ies) have not signed the agreement yet")]
    PartiesNotSigned { unsigned: usize },

    #[error("this invite was sent to a different email address")]
    EmailMismatch,

    #[error("invite token has expired")]
    TokenExpired,

    #[error("invite token has already been used")]
    TokenAlreadyUsed,

    #[error("invite token not found")]
    TokenNotFound,

    #[error("agreement already has an active signature envelope")]
    EnvelopeAlreadyActive,

    #[error("feedback for this roommate was already submitted")]
    FeedbackAlreadyGiven,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("agreement '{0}' not found")]
    AgreementNotFound(AgreementId),

    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AccordError {
    pub fn invalid_transition(status: AgreementStatus, action: LifecycleAction) -> Self {
        Self::InvalidTransition { status, action }
    }

    pub fn provider_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// True for errors the caller can fix by changing the request or the agreement state.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::ProviderUnavailable { .. }
                | Self::Conflict(_)
                | Self::Storage(_)
                | Self::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AccordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_status_and_action() {
        let err = AccordError::invalid_transition(AgreementStatus::Draft, LifecycleAction::Invite);
        assert_eq!(err.to_string(), "cannot invite while agreement is draft");
    }

    #[test]
    fn provider_failures_are_not_client_errors() {
        assert!(!AccordError::provider_unavailable("stripe", "timeout").is_client_error());
        assert!(AccordError::TokenExpired.is_client_error());
    }
}
