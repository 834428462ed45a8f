//! Phone number canonicalization and send-candidate selection.
//!
//! Numbers are reduced to digits and mapped onto a [`NumberingPlan`]. Plans
//! that migrated mobile numbers from an N-digit to an (N+1)-digit subscriber
//! number by inserting a fixed digit after the area code (Brazil's ninth
//! digit) get that digit inserted, so every way of typing the same mobile
//! number lands on one canonical form.
//!
//! The resolver never invents the legacy (shorter) form on its own: that
//! string may belong to a different subscriber. A legacy id is only accepted
//! when the network itself reports it for the canonical number, see
//! [`PhoneNumberResolver::reconcile_transport_id`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Jid;

lazy_static::lazy_static! {
    /// Brazilian numbering plan: `55`, two-digit DDD, 8 -> 9 digit mobile migration.
    pub static ref BRAZIL: NumberingPlan = NumberingPlan {
        country_code: "55".into(),
        area_code_len: 2,
        area_codes: [
            "11", "12", "13", "14", "15", "16", "17", "18", "19",
            "21", "22", "24", "27", "28",
            "31", "32", "33", "34", "35", "37", "38",
            "41", "42", "43", "44", "45", "46", "47", "48", "49",
            "51", "53", "54", "55",
            "61", "62", "63", "64", "65", "66", "67", "68", "69",
            "71", "73", "74", "75", "77", "79",
            "81", "82", "83", "84", "85", "86", "87", "88", "89",
            "91", "92", "93", "94", "95", "96", "97", "98", "99",
        ]
        .iter()
        .map(|code| code.to_string())
        .collect(),
        legacy_subscriber_len: 8,
        inserted_digit: '9',
        mobile_leading_digits: "6789".into(),
    };
}

/// Describes how national numbers of one country are laid out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NumberingPlan {
    /// Country calling code, digits only.
    pub country_code: String,
    /// Number of digits in an area code.
    pub area_code_len: usize,
    /// Valid area codes; empty accepts any.
    pub area_codes: Vec<String>,
    /// Subscriber number length before the migration.
    pub legacy_subscriber_len: usize,
    /// Digit inserted after the area code by the migration.
    pub inserted_digit: char,
    /// First digits of legacy subscriber numbers that were mobile (and migrated).
    pub mobile_leading_digits: String,
}

impl Default for NumberingPlan {
    fn default() -> Self {
        BRAZIL.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoneError {
    #[error("phone number {0:?} contains no digits")]
    NoDigits(String),
}

/// Candidates computed for one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneCandidate {
    pub raw_input: String,
    pub normalized: String,
    /// Ordered and deduplicated ids to attempt.
    pub candidates: Vec<String>,
}

impl PhoneCandidate {
    /// Move `id` to the front of the list, dropping any later duplicate.
    pub fn promote(&mut self, id: &str) {
        self.candidates.retain(|candidate| candidate != id);
        self.candidates.insert(0, id.to_string());
    }
}

/// Outcome of comparing a transport-reported id against the canonical number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The transport reported the canonical number itself.
    Identical,
    /// The transport reported the provable pre-migration form of the number.
    LegacyForm(String),
    /// The reported id cannot be proven to be the same subscriber.
    Rejected,
}

impl Reconciliation {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Reconciliation::Rejected)
    }
}

/// Canonicalizes raw phone input according to one [`NumberingPlan`].
#[derive(Debug, Clone)]
pub struct PhoneNumberResolver {
    plan: NumberingPlan,
    area_codes: HashSet<String>,
}

impl Default for PhoneNumberResolver {
    fn default() -> Self {
        Self::new(NumberingPlan::default())
    }
}

impl PhoneNumberResolver {
    pub fn new(plan: NumberingPlan) -> Self {
        let area_codes = plan.area_codes.iter().cloned().collect();
        Self { plan, area_codes }
    }

    pub fn plan(&self) -> &NumberingPlan {
        &self.plan
    }

    /// Canonical form of `raw`. Idempotent; unknown shapes pass through as digits.
    pub fn normalize(&self, raw: &str) -> String {
        let digits = digits_only(raw);
        let cc = self.plan.country_code.as_str();

        if let Some(national) = digits.strip_prefix(cc) {
            if let Some(national) = self.canonical_national(national) {
                return format!("{cc}{national}");
            }
        }

        match self.canonical_national(&digits) {
            Some(national) => format!("{cc}{national}"),
            None => digits,
        }
    }

    /// Ordered send candidates: the canonical form first, then the input as given.
    pub fn build_candidates(&self, raw: &str) -> Result<PhoneCandidate, PhoneError> {
        let as_given = digits_only(raw);
        if as_given.is_empty() {
            return Err(PhoneError::NoDigits(raw.to_string()));
        }

        let normalized = self.normalize(raw);
        let mut candidates = vec![normalized.clone()];
        if as_given != normalized {
            candidates.push(as_given);
        }

        Ok(PhoneCandidate {
            raw_input: raw.to_string(),
            normalized,
            candidates,
        })
    }

    /// Decide whether `reported` (an id the transport resolved `normalized` to)
    /// is the same subscriber.
    pub fn reconcile_transport_id(&self, normalized: &str, reported: &str) -> Reconciliation {
        let Some(user) = reported_user(reported) else {
            return Reconciliation::Rejected;
        };

        if user == normalized {
            return Reconciliation::Identical;
        }

        match self.legacy_form(normalized) {
            Some(legacy) if legacy == user => Reconciliation::LegacyForm(user),
            _ => Reconciliation::Rejected,
        }
    }

    /// Pre-migration form of a canonical mobile number, if it has one.
    fn legacy_form(&self, normalized: &str) -> Option<String> {
        let cc = self.plan.country_code.len();
        let split = cc + self.plan.area_code_len;
        let expected_len = split + self.plan.legacy_subscriber_len + 1;

        if normalized.len() != expected_len
            || !normalized.starts_with(&self.plan.country_code)
            || !normalized.bytes().all(|b| b.is_ascii_digit())
            || normalized[split..].chars().next() != Some(self.plan.inserted_digit)
        {
            return None;
        }

        Some(format!("{}{}", &normalized[..split], &normalized[split + 1..]))
    }

    /// Canonical national number (area code + subscriber), or `None` when
    /// `national` does not fit the plan.
    fn canonical_national(&self, national: &str) -> Option<String> {
        let area_len = self.plan.area_code_len;
        let legacy_len = self.plan.legacy_subscriber_len;
        if national.len() != area_len + legacy_len && national.len() != area_len + legacy_len + 1 {
            return None;
        }

        let (area, subscriber) = national.split_at(area_len);
        if !self.area_codes.is_empty() && !self.area_codes.contains(area) {
            return None;
        }

        let first = subscriber.chars().next()?;
        if subscriber.len() == legacy_len {
            if self.plan.mobile_leading_digits.contains(first) {
                Some(format!("{area}{}{subscriber}", self.plan.inserted_digit))
            } else {
                // landline, never migrated
                Some(national.to_string())
            }
        } else if first == self.plan.inserted_digit {
            Some(national.to_string())
        } else {
            None
        }
    }
}

/// Digits of `raw` with trunk/international leading zeros removed.
fn digits_only(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.trim_start_matches('0').to_string()
}

/// User part of a transport-reported id (`5543...@s.whatsapp.net`, `5543...:3@...`
/// or bare digits), only when it is purely numeric.
fn reported_user(reported: &str) -> Option<String> {
    let user = match reported.parse::<Jid>() {
        Ok(jid) if jid.is_user() => jid.user,
        // groups and broadcast lists never stand for a subscriber
        Ok(jid) if !jid.user.is_empty() => return None,
        _ => reported.trim().to_string(),
    };

    (!user.is_empty() && user.bytes().all(|b| b.is_ascii_digit())).then_some(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PhoneNumberResolver {
        PhoneNumberResolver::default()
    }

    #[test]
    fn test_normalize_known_forms() {
        let r = resolver();
        assert_eq!(r.normalize("43991402403"), "5543991402403");
        assert_eq!(r.normalize("4391402403"), "5543991402403");
        assert_eq!(r.normalize("5543991402403"), "5543991402403");
        assert_eq!(r.normalize("554391402403"), "5543991402403");
    }

    #[test]
    fn test_normalize_strips_formatting_and_prefixes() {
        let r = resolver();
        assert_eq!(r.normalize("+55 (43) 99140-2403"), "5543991402403");
        assert_eq!(r.normalize("(43) 9140-2403"), "5543991402403");
        assert_eq!(r.normalize("0 43 99140 2403"), "5543991402403");
        assert_eq!(r.normalize("00 55 43 99140 2403"), "5543991402403");
    }

    #[test]
    fn test_landline_gets_no_inserted_digit() {
        let r = resolver();
        assert_eq!(r.normalize("4333334444"), "554333334444");
        assert_eq!(r.normalize("554333334444"), "554333334444");
    }

    #[test]
    fn test_unknown_shapes_pass_through() {
        let r = resolver();
        // invalid area code
        assert_eq!(r.normalize("1091402403"), "1091402403");
        // foreign number
        assert_eq!(r.normalize("+1 415 555 2671"), "14155552671");
        // 9-digit local without the inserted digit
        assert_eq!(r.normalize("43891402403"), "43891402403");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let r = resolver();
        let inputs = [
            "43991402403",
            "4391402403",
            "5543991402403",
            "554391402403",
            "4333334444",
            "5555912345678",
            "5591234567",
            "5533334444",
            "14155552671",
            "1091402403",
            "43891402403",
            "123",
            "",
            "0000",
            "+55 (11) 98765-4321",
            "551198765432",
        ];
        for input in inputs {
            let once = r.normalize(input);
            assert_eq!(r.normalize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_candidates_order_and_dedup() {
        let r = resolver();

        let c = r.build_candidates("4391402403").unwrap();
        assert_eq!(c.normalized, "5543991402403");
        assert_eq!(c.candidates, vec!["5543991402403", "4391402403"]);

        let c = r.build_candidates("+55 43 99140-2403").unwrap();
        assert_eq!(c.candidates, vec!["5543991402403"]);
    }

    #[test]
    fn test_candidates_never_include_legacy_form() {
        let c = resolver().build_candidates("5543991402403").unwrap();
        assert!(!c.candidates.contains(&"554391402403".to_string()));
    }

    #[test]
    fn test_candidates_reject_empty_input() {
        assert_eq!(
            resolver().build_candidates("n/a"),
            Err(PhoneError::NoDigits("n/a".into()))
        );
    }

    #[test]
    fn test_promote() {
        let mut c = resolver().build_candidates("4391402403").unwrap();
        c.promote("554391402403");
        assert_eq!(
            c.candidates,
            vec!["554391402403", "5543991402403", "4391402403"]
        );
        c.promote("5543991402403");
        assert_eq!(
            c.candidates,
            vec!["5543991402403", "554391402403", "4391402403"]
        );
    }

    #[test]
    fn test_reconcile_accepts_legacy_form() {
        let r = resolver();
        assert_eq!(
            r.reconcile_transport_id("5543991402403", "554391402403"),
            Reconciliation::LegacyForm("554391402403".into())
        );
        assert!(r
            .reconcile_transport_id("5543991402403", "554391402403@s.whatsapp.net")
            .is_accepted());
        assert_eq!(
            r.reconcile_transport_id("5543991402403", "5543991402403@c.us"),
            Reconciliation::Identical
        );
    }

    #[test]
    fn test_reconcile_rejects_other_subscribers() {
        let r = resolver();
        assert_eq!(
            r.reconcile_transport_id("5543991402403", "5543991402404"),
            Reconciliation::Rejected
        );
        // right length, wrong digit removed
        assert_eq!(
            r.reconcile_transport_id("5543991402403", "554399140240"),
            Reconciliation::Rejected
        );
        // inserted digit missing but suffix differs
        assert_eq!(
            r.reconcile_transport_id("5543991402403", "554391402404"),
            Reconciliation::Rejected
        );
        assert_eq!(
            r.reconcile_transport_id("5543991402403", "554391402403@g.us"),
            Reconciliation::Rejected
        );
        // landline has no legacy form
        assert_eq!(
            r.reconcile_transport_id("554333334444", "55433333444"),
            Reconciliation::Rejected
        );
        assert_eq!(
            r.reconcile_transport_id("5543991402403", "status@broadcast"),
            Reconciliation::Rejected
        );
    }
}
