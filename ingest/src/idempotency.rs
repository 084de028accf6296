//! Ingestion idempotency: every request bearing the same
//! `(source_id, idempotency_key)` maps to the same lead row, no matter how
//! many callers race.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;

use crate::api::IngestError;
use crate::classifier::Classification;

static IDEMPOTENCY_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._:-]{16,128}$").unwrap());

pub fn canonicalize_idempotency_key(key: &str) -> Result<String, IngestError> {
    let k = key.trim();
    if !IDEMPOTENCY_KEY_RE.is_match(k) {
        return Err(IngestError::InvalidIdempotencyKeyFormat);
    }
    Ok(k.to_owned())
}

/// Server-side key derivation for clients that do not send one. The field
/// order is fixed; changing it would re-key every replayed submission.
pub fn derive_idempotency_key(
    source_id: i64,
    name: &str,
    email: &str,
    phone: &str,
    country_code: &str,
    postal_code: &str,
    message: Option<&str>,
) -> Result<String, IngestError> {
    let email_part = email.trim().to_lowercase();
    let phone_part: String = phone.chars().filter(|c| !c.is_whitespace()).collect();
    let postal_part = postal_code.trim().to_uppercase();

    if email_part.is_empty() {
        return Err(IngestError::IdempotencyDerivationFailed("email"));
    }
    if phone_part.is_empty() {
        return Err(IngestError::IdempotencyDerivationFailed("phone"));
    }
    if postal_part.is_empty() {
        return Err(IngestError::IdempotencyDerivationFailed("postal_code"));
    }

    let mut hasher = Sha256::new();
    hasher.update(source_id.to_string());
    hasher.update("|");
    hasher.update(name.trim());
    hasher.update("|");
    hasher.update(&email_part);
    hasher.update("|");
    hasher.update(&phone_part);
    hasher.update("|");
    hasher.update(country_code.trim().to_uppercase());
    hasher.update("|");
    hasher.update(&postal_part);
    hasher.update("|");
    hasher.update(message.unwrap_or("").trim());

    Ok(hex::encode(hasher.finalize()))
}

/// Everything needed to create the lead row at ingest.
#[derive(Debug)]
pub struct NewLead<'a> {
    pub classification: Classification,
    pub idempotency_key: &'a str,
    pub name: &'a str,
    pub email: &'a str,
    pub phone: &'a str,
    pub postal_code: &'a str,
    pub country_code: &'a str,
    pub city: Option<&'a str>,
    pub region_code: Option<&'a str>,
    pub message: Option<&'a str>,
    pub consent: bool,
    pub gdpr_consent: Option<bool>,
    pub utm_source: Option<&'a str>,
    pub utm_medium: Option<&'a str>,
    pub utm_campaign: Option<&'a str>,
    pub ip_address: Option<String>,
    pub user_agent: Option<&'a str>,
    pub normalized_email: Option<String>,
    pub normalized_phone: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct InsertedLead {
    pub lead_id: i64,
    pub status: String,
    pub buyer_id: Option<i64>,
    pub price: Option<f64>,
    /// True when this statement created the row; false on a replay.
    pub created_new: bool,
}

/// Race-safe insert: a single upsert statement. Both of two racing callers
/// get the winning row back, and `xmax = 0` tells them apart (only a freshly
/// inserted row has no updater transaction).
pub async fn insert_lead(pool: &PgPool, lead: &NewLead<'_>) -> Result<InsertedLead, IngestError> {
    let row: InsertedLead = sqlx::query_as(
        r#"
INSERT INTO leads (
    source_id, offer_id, market_id, vertical_id, idempotency_key,
    name, email, phone, postal_code, country_code, city, region_code, message,
    consent, gdpr_consent, utm_source, utm_medium, utm_campaign,
    ip_address, user_agent, normalized_email, normalized_phone
)
VALUES (
    $1, $2, $3, $4, $5,
    $6, $7, $8, $9, $10, $11, $12, $13,
    $14, $15, $16, $17, $18,
    $19::inet, $20, $21, $22
)
ON CONFLICT (source_id, idempotency_key) DO UPDATE SET updated_at = NOW()
RETURNING
    id AS lead_id,
    status::text AS status,
    buyer_id,
    price::float8 AS price,
    (xmax = 0) AS created_new
        "#,
    )
    .bind(lead.classification.source_id)
    .bind(lead.classification.offer_id)
    .bind(lead.classification.market_id)
    .bind(lead.classification.vertical_id)
    .bind(lead.idempotency_key)
    .bind(lead.name)
    .bind(lead.email)
    .bind(lead.phone)
    .bind(lead.postal_code)
    .bind(lead.country_code)
    .bind(lead.city)
    .bind(lead.region_code)
    .bind(lead.message)
    .bind(lead.consent)
    .bind(lead.gdpr_consent)
    .bind(lead.utm_source)
    .bind(lead.utm_medium)
    .bind(lead.utm_campaign)
    .bind(lead.ip_address.as_deref())
    .bind(lead.user_agent)
    .bind(lead.normalized_email.as_deref())
    .bind(lead.normalized_phone.as_deref())
    .fetch_one(pool)
    .await?;

    Ok(row)
}
