//! Plain-text rendering of an agreement for signature and archival.

use crate::types::{AgreementId, AgreementRecord, PartyRole};
use std::fmt::Write as _;

pub const DOCUMENT_NAME: &str = "agreement.txt";

/// Blob key of the rendered agreement within the document container.
pub fn document_key(agreement_id: AgreementId) -> String {
    format!("{agreement_id}/{DOCUMENT_NAME}")
}

fn dollars(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

pub fn render_agreement(record: &AgreementRecord) -> String {
    let agreement = &record.agreement;
    let terms = &record.terms;
    let mut out = String::new();

    // Writing into a String cannot fail.
    let _ = writeln!(out, "{}", agreement.title.to_uppercase());
    let _ = writeln!(out, "Agreement ID: {}", agreement.id);
    let location = agreement.location.one_line();
    if !location.is_empty() {
        let _ = writeln!(out, "Property: {location}");
    }
    match (agreement.start_date, agreement.end_date) {
        (Some(start), Some(end)) => {
            let _ = writeln!(out, "Term: {start} to {end}");
        }
        (Some(start), None) => {
            let _ = writeln!(out, "Term: from {start}, month to month");
        }
        _ => {}
    }
    let _ = writeln!(out, "Total monthly rent: {}", dollars(agreement.rent_total_cents));

    let _ = writeln!(out, "\nPARTIES");
    for party in &record.parties {
        let role = match party.role {
            PartyRole::Initiator => "initiator",
            PartyRole::Roommate => "roommate",
        };
        let _ = write!(out, "- {} ({role})", party.email);
        if let Some(share) = party.rent_share_cents {
            let _ = write!(out, ", rent share {}", dollars(share));
        }
        let _ = writeln!(out);
        for (utility, cents) in &party.utilities {
            let _ = writeln!(out, "    utility {utility}: {}", dollars(*cents));
        }
        for (chore, schedule) in &party.chores {
            let _ = writeln!(out, "    chore {chore}: {schedule}");
        }
    }

    let _ = writeln!(out, "\nHOUSE RULES");
    if let Some(quiet) = &terms.quiet_hours {
        let _ = writeln!(out, "Quiet hours: {} to {}", quiet.start, quiet.end);
    }
    if let Some(guests) = &terms.guest_rules {
        let _ = writeln!(
            out,
            "Guests: at most {} consecutive nights, {} hours notice",
            guests.max_consecutive_nights, guests.notice_hours
        );
    }
    if let Some(pets) = &terms.pet_rules {
        let _ = write!(
            out,
            "Pets: {}",
            if pets.allowed { "allowed" } else { "not allowed" }
        );
        if let Some(notes) = pets.notes.as_deref().filter(|n| !n.is_empty()) {
            let _ = write!(out, " ({notes})");
        }
        let _ = writeln!(out);
    }
    if let Some(deposit) = terms.deposit_cents {
        let _ = writeln!(out, "Security deposit: {}", dollars(deposit));
        for reason in &terms.deposit_forfeit_reasons {
            let _ = writeln!(out, "    forfeited for: {reason}");
        }
    }
    if let Some(rules) = terms.additional_rules.as_deref().filter(|r| !r.trim().is_empty()) {
        let _ = writeln!(out, "Additional rules:\n{rules}");
    }
    if terms.no_offensive_clause_ack {
        let _ = writeln!(
            out,
            "All parties acknowledge that no clause of this agreement is intended to be offensive or discriminatory."
        );
    }

    let _ = writeln!(out, "\nSIGNATURES");
    for party in &record.parties {
        let _ = writeln!(out, "{}: ______________________  Date: __________", party.email);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Account, AccountId, NewAgreement, PartySpec, PetRules, QuietHours, Terms};
    use chrono::Utc;

    #[test]
    fn renders_parties_and_terms() {
        let owner = Account::new(AccountId::generate(), "lead@example.com").unwrap();
        let mut mate = PartySpec::new("mate@example.com").with_rent_share(60_050);
        mate.chores.insert("dishes".to_string(), "weekdays".to_string());
        let request = NewAgreement {
            rent_total_cents: 120_100,
            terms: Terms {
                quiet_hours: Some(QuietHours {
                    start: "22:00".to_string(),
                    end: "07:00".to_string(),
                }),
                pet_rules: Some(PetRules {
                    allowed: false,
                    notes: Some("fish ok".to_string()),
                }),
                ..Terms::default()
            },
            roommates: vec![mate],
            ..NewAgreement::default()
        };
        let record = AgreementRecord::draft(&owner, request, Utc::now()).unwrap();

        let text = render_agreement(&record);
        assert!(text.starts_with("ROOMMATE AGREEMENT"));
        assert!(text.contains("Total monthly rent: $1201.00"));
        assert!(text.contains("- mate@example.com (roommate), rent share $600.50"));
        assert!(text.contains("chore dishes: weekdays"));
        assert!(text.contains("Quiet hours: 22:00 to 07:00"));
        assert!(text.contains("Pets: not allowed (fish ok)"));
        assert_eq!(
            document_key(record.id()),
            format!("{}/agreement.txt", record.id())
        );
    }
}
