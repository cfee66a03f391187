//! Roommate feedback: ratings parties leave each other once an agreement is completed.

use crate::error::{AccordError, Result};
use crate::lifecycle::{AgreementStatus, LifecycleAction};
use crate::types::{AccountId, AgreementId, AgreementRecord, FeedbackId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;
pub const MAX_COMMENT_CHARS: usize = 1000;

fn check_rating(field: &str, value: u8) -> Result<()> {
    if (MIN_RATING..=MAX_RATING).contains(&value) {
        Ok(())
    } else {
        Err(AccordError::Validation(format!(
            "{field} must be between {MIN_RATING} and {MAX_RATING}"
        )))
    }
}

/// Optional per-category scores, each 1-5.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CategoryRatings {
    pub cleanliness: Option<u8>,
    pub communication: Option<u8>,
    pub respect: Option<u8>,
    pub reliability: Option<u8>,
    pub noise_level: Option<u8>,
}

impl CategoryRatings {
    pub fn entries(&self) -> [(&'static str, Option<u8>); 5] {
        [
            ("cleanliness", self.cleanliness),
            ("communication", self.communication),
            ("respect", self.respect),
            ("reliability", self.reliability),
            ("noise_level", self.noise_level),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.entries() {
            if let Some(value) = value {
                check_rating(name, value)?;
            }
        }
        Ok(())
    }
}

/// Mean score per category; `None` where nobody rated that category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryAverages {
    pub cleanliness: Option<f64>,
    pub communication: Option<f64>,
    pub respect: Option<f64>,
    pub reliability: Option<f64>,
    pub noise_level: Option<f64>,
}

impl CategoryAverages {
    fn from_ratings<'a>(ratings: impl Iterator<Item = &'a CategoryRatings>) -> Self {
        let mut totals = [(0u32, 0u32); 5];
        for rating in ratings {
            for (slot, (_, value)) in totals.iter_mut().zip(rating.entries()) {
                if let Some(value) = value {
                    slot.0 += u32::from(value);
                    slot.1 += 1;
                }
            }
        }
        let [cleanliness, communication, respect, reliability, noise_level] =
            totals.map(|(sum, count)| (count > 0).then(|| round2(f64::from(sum) / f64::from(count))));
        Self {
            cleanliness,
            communication,
            respect,
            reliability,
            noise_level,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeedback {
    pub to_account: AccountId,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub categories: Option<CategoryRatings>,
    #[serde(default)]
    pub is_anonymous: bool,
}

/// A stored rating. The author is always kept so the one-per-pair rule holds; views hide it
/// for anonymous feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: FeedbackId,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub rating: u8,
    pub comment: Option<String>,
    pub categories: Option<CategoryRatings>,
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
}

/// Feedback as shown to parties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackView {
    pub id: FeedbackId,
    pub agreement_id: AgreementId,
    pub from_account: Option<AccountId>,
    pub to_account: AccountId,
    pub rating: u8,
    pub comment: Option<String>,
    pub categories: Option<CategoryRatings>,
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
}

impl FeedbackView {
    pub fn new(agreement_id: AgreementId, feedback: &Feedback) -> Self {
        Self {
            id: feedback.id,
            agreement_id,
            from_account: (!feedback.is_anonymous).then_some(feedback.from_account),
            to_account: feedback.to_account,
            rating: feedback.rating,
            comment: feedback.comment.clone(),
            categories: feedback.categories,
            is_anonymous: feedback.is_anonymous,
            created_at: feedback.created_at,
        }
    }
}

/// Ratings one account has received across agreements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub account_id: AccountId,
    pub total_ratings: usize,
    pub average_rating: f64,
    pub category_averages: CategoryAverages,
    /// Most recent first.
    pub recent: Vec<FeedbackView>,
}

pub const RECENT_FEEDBACK: usize = 5;

impl FeedbackSummary {
    /// `received` holds every (agreement, feedback) addressed to `account_id`.
    pub fn build(account_id: AccountId, mut received: Vec<FeedbackView>) -> Self {
        received.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total_ratings = received.len();
        let average_rating = if total_ratings == 0 {
            0.0
        } else {
            let sum: u32 = received.iter().map(|f| u32::from(f.rating)).sum();
            round2(f64::from(sum) / total_ratings as f64)
        };
        let category_averages =
            CategoryAverages::from_ratings(received.iter().filter_map(|f| f.categories.as_ref()));
        received.truncate(RECENT_FEEDBACK);
        Self {
            account_id,
            total_ratings,
            average_rating,
            category_averages,
            recent: received,
        }
    }
}

impl AgreementRecord {
    /// One rating per (author, subject) pair, between joined parties of a completed agreement.
    pub fn leave_feedback(
        &mut self,
        from: AccountId,
        request: NewFeedback,
        now: DateTime<Utc>,
    ) -> Result<&Feedback> {
        self.require_member(from, LifecycleAction::LeaveFeedback)?;
        self.require_status(&[AgreementStatus::Completed], LifecycleAction::LeaveFeedback)?;
        if request.to_account == from {
            return Err(AccordError::Validation("cannot rate yourself".to_string()));
        }
        if self.party_for_account(request.to_account).is_none() {
            return Err(AccordError::Validation(format!(
                "account '{}' is not a party to this agreement",
                request.to_account
            )));
        }
        check_rating("rating", request.rating)?;
        if let Some(categories) = &request.categories {
            categories.validate()?;
        }
        let comment = request
            .comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if comment
            .as_ref()
            .is_some_and(|c| c.chars().count() > MAX_COMMENT_CHARS)
        {
            return Err(AccordError::Validation(format!(
                "comment must be at most {MAX_COMMENT_CHARS} characters"
            )));
        }
        if self
            .feedback
            .iter()
            .any(|f| f.from_account == from && f.to_account == request.to_account)
        {
            return Err(AccordError::FeedbackAlreadyGiven);
        }

        self.feedback.push(Feedback {
            id: FeedbackId::generate(),
            from_account: from,
            to_account: request.to_account,
            rating: request.rating,
            comment,
            categories: request.categories,
            is_anonymous: request.is_anonymous,
            created_at: now,
        });
        Ok(&self.feedback[self.feedback.len() - 1])
    }

    pub fn feedback_views(&self) -> Vec<FeedbackView> {
        self.feedback
            .iter()
            .map(|f| FeedbackView::new(self.id(), f))
            .collect()
    }

    pub fn feedback_for(&self, account: AccountId) -> impl Iterator<Item = FeedbackView> + '_ {
        self.feedback
            .iter()
            .filter(move |f| f.to_account == account)
            .map(move |f| FeedbackView::new(self.id(), f))
    }
}
