//! Policy-driven field validation, ending in a guarded terminal transition:
//! `received -> validated` or `received -> rejected`. Re-invocation on a lead
//! that already left `received` is a no-op returning the current status.

use sqlx::postgres::PgPool;

use crate::api::IngestError;
use crate::normalize::normalize_postal;
use crate::policy::ValidationRules;

/// Domains rejected when `disposable_email_blocklist_enabled` is set.
const DISPOSABLE_EMAIL_DOMAINS: &[&str] = &[
    "10minutemail.com",
    "dispostable.com",
    "getnada.com",
    "guerrillamail.com",
    "maildrop.cc",
    "mailinator.com",
    "sharklasers.com",
    "tempmail.com",
    "trashmail.com",
    "yopmail.com",
];

/// The lead fields validation looks at, as stored at ingest.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeadFields<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub phone: &'a str,
    pub postal_code: &'a str,
    pub country_code: &'a str,
    pub city: Option<&'a str>,
    pub region_code: Option<&'a str>,
    pub message: Option<&'a str>,
}

impl<'a> LeadFields<'a> {
    fn get(&self, field: &str) -> Option<&'a str> {
        match field {
            "name" => Some(self.name),
            "email" => Some(self.email),
            "phone" => Some(self.phone),
            "postal_code" => Some(self.postal_code),
            "country_code" => Some(self.country_code),
            "city" => self.city,
            "region_code" => self.region_code,
            "message" => self.message,
            _ => None,
        }
    }
}

/// Apply the rules; `Some(reason)` means reject. Checks run in the order the
/// policy table documents them, first failure wins.
pub fn check(rules: &ValidationRules, lead: &LeadFields) -> Option<String> {
    for field in &rules.required_fields {
        let empty = lead
            .get(field)
            .map_or(true, |value| value.trim().is_empty());
        if empty {
            return Some(format!("missing_required_field:{field}"));
        }
    }

    if let Some(allowed) = &rules.allowed_postal_codes {
        if !allowed.is_empty() {
            let postal = normalize_postal(lead.postal_code);
            if !allowed.iter().any(|p| normalize_postal(p) == postal) {
                return Some("postal_not_allowed".to_owned());
            }
        }
    }

    if let Some(allowed) = &rules.allowed_cities {
        if !allowed.is_empty() {
            if let Some(city) = lead.city {
                let city = city.trim().to_lowercase();
                if !allowed.iter().any(|c| c.trim().to_lowercase() == city) {
                    return Some("city_not_allowed".to_owned());
                }
            }
        }
    }

    let mut allowed_countries: Vec<String> = Vec::new();
    if let Some(region) = &rules.phone_region {
        allowed_countries.push(region.trim().to_uppercase());
    }
    if let Some(codes) = &rules.allowed_country_codes {
        allowed_countries.extend(codes.iter().map(|c| c.trim().to_uppercase()));
    }
    if !allowed_countries.is_empty() {
        let country = lead.country_code.trim().to_uppercase();
        if !allowed_countries.contains(&country) {
            return Some("country_not_allowed".to_owned());
        }
    }

    if rules.disposable_email_blocklist_enabled {
        if let Some(domain) = lead.email.trim().rsplit('@').next() {
            let domain = domain.to_lowercase();
            if DISPOSABLE_EMAIL_DOMAINS.contains(&domain.as_str()) {
                return Some("disposable_email".to_owned());
            }
        }
    }

    None
}

#[derive(Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Validated,
    Rejected(String),
    /// The lead had already left `received`; nothing was changed.
    AlreadySettled(String),
}

pub async fn run(
    pool: &PgPool,
    lead_id: i64,
    rules: &ValidationRules,
    fields: &LeadFields<'_>,
) -> Result<ValidationOutcome, IngestError> {
    if let Some(reason) = check(rules, fields) {
        let updated = sqlx::query(
            r#"
UPDATE leads
SET status = 'rejected'::lead_status,
    validation_reason = $2,
    rejected_at = NOW(),
    updated_at = NOW()
WHERE id = $1 AND status = 'received'::lead_status
            "#,
        )
        .bind(lead_id)
        .bind(&reason)
        .execute(pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(ValidationOutcome::AlreadySettled(
                current_status(pool, lead_id).await?,
            ));
        }
        return Ok(ValidationOutcome::Rejected(reason));
    }

    let updated = sqlx::query(
        r#"
UPDATE leads
SET status = 'validated'::lead_status,
    updated_at = NOW()
WHERE id = $1 AND status = 'received'::lead_status
        "#,
    )
    .bind(lead_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(ValidationOutcome::AlreadySettled(
            current_status(pool, lead_id).await?,
        ));
    }
    Ok(ValidationOutcome::Validated)
}

async fn current_status(pool: &PgPool, lead_id: i64) -> Result<String, IngestError> {
    let (status,): (String,) =
        sqlx::query_as("SELECT status::text FROM leads WHERE id = $1")
            .bind(lead_id)
            .fetch_one(pool)
            .await?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lead<'a>() -> LeadFields<'a> {
        LeadFields {
            name: "Jane",
            email: "j@x.com",
            phone: "+15125550123",
            postal_code: "78701",
            country_code: "US",
            city: Some("Austin"),
            region_code: Some("TX"),
            message: Some("call me"),
        }
    }

    fn rules(value: serde_json::Value) -> ValidationRules {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn empty_rules_accept_everything() {
        assert_eq!(check(&ValidationRules::default(), &lead()), None);
    }

    #[test]
    fn required_fields_reject_with_the_field_name() {
        let first_rules = rules(json!({"required_fields": ["name", "message", "city"]}));
        assert_eq!(check(&first_rules, &lead()), None);

        let mut missing = lead();
        missing.message = Some("   ");
        assert_eq!(
            check(&first_rules, &missing),
            Some("missing_required_field:message".to_owned())
        );

        let second_rules = rules(json!({"required_fields": ["not_a_field"]}));
        assert_eq!(
            check(&second_rules, &lead()),
            Some("missing_required_field:not_a_field".to_owned())
        );
    }

    #[test]
    fn postal_allowlist_compares_normalized() {
        let rules = rules(json!({"allowed_postal_codes": ["78701"]}));
        assert_eq!(check(&rules, &lead()), None);

        let mut other = lead();
        other.postal_code = " 78702 ";
        assert_eq!(check(&rules, &other), Some("postal_not_allowed".to_owned()));
    }

    #[test]
    fn city_allowlist_is_case_insensitive_and_skips_absent_city() {
        let rules = rules(json!({"allowed_cities": ["austin"]}));
        assert_eq!(check(&rules, &lead()), None);

        let mut elsewhere = lead();
        elsewhere.city = Some("Dallas");
        assert_eq!(
            check(&rules, &elsewhere),
            Some("city_not_allowed".to_owned())
        );

        let mut unknown = lead();
        unknown.city = None;
        assert_eq!(check(&rules, &unknown), None);
    }

    #[test]
    fn country_allowlist_merges_phone_region() {
        let first_rules = rules(json!({"phone_region": "us"}));
        assert_eq!(check(&first_rules, &lead()), None);

        let second_rules = rules(json!({"allowed_country_codes": ["CA"]}));
        assert_eq!(
            check(&second_rules, &lead()),
            Some("country_not_allowed".to_owned())
        );

        let rules = rules(json!({"phone_region": "US", "allowed_country_codes": ["CA"]}));
        assert_eq!(check(&rules, &lead()), None);
    }

    #[test]
    fn disposable_email_blocklist() {
        let rules = rules(json!({"disposable_email_blocklist_enabled": true}));
        assert_eq!(check(&rules, &lead()), None);

        let mut throwaway = lead();
        throwaway.email = "x@Mailinator.com";
        assert_eq!(
            check(&rules, &throwaway),
            Some("disposable_email".to_owned())
        );
    }
}
