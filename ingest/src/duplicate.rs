//! Window-bounded duplicate detection over normalized contact keys.
//!
//! Runs after the lead row is committed and before the validator's terminal
//! transition. Reads committed data only: two in-flight firsts cannot see
//! each other, which the window policy tolerates.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::api::IngestError;
use crate::policy::{DuplicateAction, DuplicatePolicy, IncludeSources, MatchKey, MatchMode};

/// What duplicate detection needs to know about the just-inserted lead.
#[derive(Debug)]
pub struct DuplicateInput<'a> {
    pub lead_id: i64,
    pub offer_id: i64,
    pub source_id: i64,
    pub normalized_phone: Option<&'a str>,
    pub normalized_email: Option<&'a str>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DuplicateOutcome {
    NotDuplicate,
    Duplicate {
        matched_lead_id: i64,
        action: DuplicateAction,
        reason_code: String,
    },
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    matched_lead_id: i64,
    phone_match: i32,
    email_match: i32,
    #[allow(dead_code)]
    matched_created_at: DateTime<Utc>,
}

pub async fn run(
    pool: &PgPool,
    policy: &DuplicatePolicy,
    input: &DuplicateInput<'_>,
) -> Result<DuplicateOutcome, IngestError> {
    if !policy.enabled {
        return Ok(DuplicateOutcome::NotDuplicate);
    }

    let norm_phone = if policy.keys.contains(&MatchKey::Phone) {
        input.normalized_phone
    } else {
        None
    };
    let norm_email = if policy.keys.contains(&MatchKey::Email) {
        input.normalized_email
    } else {
        None
    };

    // A lead missing one of the policy's minimum fields is not comparable;
    // skip rather than half-match.
    for field in &policy.min_fields {
        let present = match field {
            MatchKey::Phone => norm_phone.is_some(),
            MatchKey::Email => norm_email.is_some(),
        };
        if !present {
            return Ok(DuplicateOutcome::NotDuplicate);
        }
    }

    if norm_phone.is_none() && norm_email.is_none() {
        return Ok(DuplicateOutcome::NotDuplicate);
    }

    let include_any = policy.include_sources == IncludeSources::Any;
    let require_all = policy.match_mode == MatchMode::All;

    let candidate: Option<CandidateRow> = sqlx::query_as(
        r#"
SELECT
    l.id AS matched_lead_id,
    l.created_at AS matched_created_at,
    (CASE WHEN $4::text IS NOT NULL AND l.normalized_phone = $4 THEN 1 ELSE 0 END) AS phone_match,
    (CASE WHEN $5::text IS NOT NULL AND l.normalized_email = $5 THEN 1 ELSE 0 END) AS email_match
FROM leads l
WHERE l.offer_id = $1
  AND l.id <> $2
  AND l.created_at >= NOW() - make_interval(hours => $3)
  AND NOT (l.status::text = ANY($6))
  AND ($7 OR l.source_id = $8)
  AND (
        ($4::text IS NOT NULL AND l.normalized_phone = $4)
     OR ($5::text IS NOT NULL AND l.normalized_email = $5)
  )
  AND (
        NOT $9
     OR (($4::text IS NULL OR l.normalized_phone = $4)
         AND ($5::text IS NULL OR l.normalized_email = $5))
  )
ORDER BY l.created_at DESC, l.id DESC
LIMIT 1
        "#,
    )
    .bind(input.offer_id)
    .bind(input.lead_id)
    .bind(policy.window_hours)
    .bind(norm_phone)
    .bind(norm_email)
    .bind(&policy.exclude_statuses)
    .bind(include_any)
    .bind(input.source_id)
    .bind(require_all)
    .fetch_optional(pool)
    .await?;

    let Some(candidate) = candidate else {
        return Ok(DuplicateOutcome::NotDuplicate);
    };

    apply_action(pool, policy, input, &candidate).await?;

    let mut matched_keys: Vec<&str> = Vec::new();
    if candidate.phone_match == 1 {
        matched_keys.push("phone");
    }
    if candidate.email_match == 1 {
        matched_keys.push("email");
    }

    sqlx::query(
        r#"
INSERT INTO duplicate_events
    (lead_id, matched_lead_id, matched_keys, window_hours, match_mode, include_sources, action, reason_code)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (lead_id, matched_lead_id) DO NOTHING
        "#,
    )
    .bind(input.lead_id)
    .bind(candidate.matched_lead_id)
    .bind(&matched_keys)
    .bind(policy.window_hours)
    .bind(policy.match_mode.as_str())
    .bind(policy.include_sources.as_str())
    .bind(policy.action.as_str())
    .bind(&policy.reason_code)
    .execute(pool)
    .await?;

    Ok(DuplicateOutcome::Duplicate {
        matched_lead_id: candidate.matched_lead_id,
        action: policy.action,
        reason_code: policy.reason_code.clone(),
    })
}

async fn apply_action(
    pool: &PgPool,
    policy: &DuplicatePolicy,
    input: &DuplicateInput<'_>,
    candidate: &CandidateRow,
) -> Result<(), IngestError> {
    match policy.action {
        // Guarded: only a lead still in `received` gets rejected; later
        // states are never clobbered, which makes re-runs no-ops.
        DuplicateAction::Reject => {
            sqlx::query(
                r#"
UPDATE leads
SET updated_at = NOW(),
    is_duplicate = TRUE,
    duplicate_of_lead_id = $2,
    status = CASE WHEN status = 'received'::lead_status THEN 'rejected'::lead_status ELSE status END,
    validation_reason = CASE WHEN status = 'received'::lead_status THEN $3 ELSE validation_reason END,
    rejected_at = CASE WHEN status = 'received'::lead_status THEN NOW() ELSE rejected_at END
WHERE id = $1
                "#,
            )
            .bind(input.lead_id)
            .bind(candidate.matched_lead_id)
            .bind(&policy.reason_code)
            .execute(pool)
            .await?;
        }
        DuplicateAction::Flag => {
            sqlx::query(
                r#"
UPDATE leads
SET updated_at = NOW(),
    is_duplicate = TRUE,
    duplicate_of_lead_id = $2
WHERE id = $1
                "#,
            )
            .bind(input.lead_id)
            .bind(candidate.matched_lead_id)
            .execute(pool)
            .await?;
        }
        DuplicateAction::Accept => {
            sqlx::query(
                r#"
UPDATE leads
SET updated_at = NOW(),
    duplicate_of_lead_id = $2
WHERE id = $1
                "#,
            )
            .bind(input.lead_id)
            .bind(candidate.matched_lead_id)
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}
