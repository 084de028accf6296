//! The ingestion front door: `POST /api/leads`.
//!
//! Classification, idempotency and input errors surface synchronously and
//! never create a lead row. Everything after the insert is recorded on the
//! lead itself; the client always gets 202 with the lead's current status.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::Json;
use axum_client_ip::InsecureClientIp;
use metrics::counter;
use serde::Deserialize;
use tracing::instrument;

use crate::api::{IngestError, IngestResponse};
use crate::classifier::{self, Classification};
use crate::duplicate::{self, DuplicateInput, DuplicateOutcome};
use crate::idempotency::{self, InsertedLead, NewLead};
use crate::normalize;
use crate::policy::DuplicateAction;
use crate::router::AppState;
use crate::routing::{self, RouteInput, RouteOutcome};
use crate::validator::{self, LeadFields, ValidationOutcome};

#[derive(Debug, Deserialize)]
pub struct LeadSubmission {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub postal_code: String,

    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_key: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    #[serde(default)]
    pub consent: bool,
    #[serde(default)]
    pub gdpr_consent: Option<bool>,
}

fn default_country_code() -> String {
    "US".to_owned()
}

#[instrument(skip_all, fields(source_key, lead_id, status, user_agent))]
pub async fn post_lead(
    State(state): State<AppState>,
    ip: Option<InsecureClientIp>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), IngestError> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));
    tracing::Span::current().record("user_agent", user_agent);

    let submission: LeadSubmission = serde_json::from_slice(&body)
        .map_err(|e| IngestError::RequestParsing(e.to_string()))?;
    if let Some(source_key) = &submission.source_key {
        tracing::Span::current().record("source_key", source_key.as_str());
    }

    let response = tokio::time::timeout(
        state.request_timeout,
        process(&state, ip, &uri, &headers, &submission),
    )
    .await
    .map_err(|_| IngestError::RequestTimeout)??;

    tracing::Span::current().record("lead_id", response.lead_id);
    tracing::Span::current().record("status", response.status.as_str());

    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn process(
    state: &AppState,
    ip: Option<InsecureClientIp>,
    uri: &Uri,
    headers: &HeaderMap,
    submission: &LeadSubmission,
) -> Result<IngestResponse, IngestError> {
    let source_id_header = match headers.get("source_id") {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .ok_or(IngestError::InvalidSourceIdHeader)?,
        ),
        None => None,
    };
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok());

    let classification = classifier::resolve(
        &state.pool,
        source_id_header,
        submission.source_key.as_deref(),
        host,
        uri.path(),
    )
    .await?;

    let idempotency_key = match &submission.idempotency_key {
        Some(key) => idempotency::canonicalize_idempotency_key(key)?,
        None => idempotency::derive_idempotency_key(
            classification.source_id,
            &submission.name,
            &submission.email,
            &submission.phone,
            &submission.country_code,
            &submission.postal_code,
            submission.message.as_deref(),
        )?,
    };

    let postal_code = submission.postal_code.trim();
    let new_lead = NewLead {
        classification,
        idempotency_key: &idempotency_key,
        name: submission.name.trim(),
        email: &submission.email,
        phone: &submission.phone,
        postal_code,
        country_code: &submission.country_code,
        city: submission.city.as_deref(),
        region_code: submission.region_code.as_deref(),
        message: submission.message.as_deref(),
        consent: submission.consent,
        gdpr_consent: submission.gdpr_consent,
        utm_source: submission.utm_source.as_deref(),
        utm_medium: submission.utm_medium.as_deref(),
        utm_campaign: submission.utm_campaign.as_deref(),
        ip_address: ip.map(|InsecureClientIp(addr)| addr.to_string()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok()),
        normalized_email: normalize::normalize_email(&submission.email),
        normalized_phone: normalize::normalize_phone(&submission.phone),
    };

    let inserted = idempotency::insert_lead(&state.pool, &new_lead).await?;

    if !inserted.created_new {
        // Replay: same lead id, whatever status it has reached by now.
        counter!("leads_replayed_total").increment(1);
        return Ok(respond(&classification, &inserted, inserted.status.clone()));
    }

    counter!("leads_received_total").increment(1);

    let rules = state
        .policy_cache
        .validation_rules(&state.pool, classification.offer_id)
        .await?;

    let dup_outcome = duplicate::run(
        &state.pool,
        &rules.duplicate_detection,
        &DuplicateInput {
            lead_id: inserted.lead_id,
            offer_id: classification.offer_id,
            source_id: classification.source_id,
            normalized_phone: new_lead.normalized_phone.as_deref(),
            normalized_email: new_lead.normalized_email.as_deref(),
        },
    )
    .await?;

    if let DuplicateOutcome::Duplicate {
        action: DuplicateAction::Reject,
        ..
    } = dup_outcome
    {
        counter!("leads_rejected_total", "reason" => "duplicate").increment(1);
        return Ok(respond(&classification, &inserted, "rejected".to_owned()));
    }

    let fields = LeadFields {
        name: &submission.name,
        email: &submission.email,
        phone: &submission.phone,
        postal_code,
        country_code: &submission.country_code,
        city: submission.city.as_deref(),
        region_code: submission.region_code.as_deref(),
        message: submission.message.as_deref(),
    };
    match validator::run(&state.pool, inserted.lead_id, &rules, &fields).await? {
        ValidationOutcome::Validated => {}
        ValidationOutcome::Rejected(_) => {
            counter!("leads_rejected_total", "reason" => "validation").increment(1);
            return Ok(respond(&classification, &inserted, "rejected".to_owned()));
        }
        ValidationOutcome::AlreadySettled(status) => {
            return Ok(respond(&classification, &inserted, status));
        }
    }

    let routing_config = state
        .policy_cache
        .routing_config(&state.pool, classification.offer_id)
        .await?;

    let outcome = routing::route_lead(
        &state.pool,
        &routing_config,
        &RouteInput {
            lead_id: inserted.lead_id,
            offer_id: classification.offer_id,
            market_id: classification.market_id,
            postal_code,
            city: submission.city.as_deref(),
        },
        state.delivery_max_attempts,
    )
    .await?;

    match outcome {
        RouteOutcome::Routed { buyer_id, price } => Ok(IngestResponse {
            lead_id: inserted.lead_id,
            status: "routed".to_owned(),
            buyer_id: Some(buyer_id),
            source_id: classification.source_id,
            offer_id: classification.offer_id,
            market_id: classification.market_id,
            vertical_id: classification.vertical_id,
            price,
        }),
        RouteOutcome::AlreadyRouted => {
            let current = current_lead(&state.pool, inserted.lead_id).await?;
            Ok(respond(&classification, &current, current.status.clone()))
        }
        RouteOutcome::NoRoute | RouteOutcome::NoRouteExclusiveFailClosed => {
            Ok(respond(&classification, &inserted, "validated".to_owned()))
        }
    }
}

fn respond(
    classification: &Classification,
    lead: &InsertedLead,
    status: String,
) -> IngestResponse {
    IngestResponse {
        lead_id: lead.lead_id,
        status,
        buyer_id: lead.buyer_id,
        source_id: classification.source_id,
        offer_id: classification.offer_id,
        market_id: classification.market_id,
        vertical_id: classification.vertical_id,
        price: lead.price,
    }
}

async fn current_lead(
    pool: &sqlx::PgPool,
    lead_id: i64,
) -> Result<InsertedLead, IngestError> {
    let lead: InsertedLead = sqlx::query_as(
        r#"
SELECT id AS lead_id, status::text AS status, buyer_id, price::float8 AS price, FALSE AS created_new
FROM leads
WHERE id = $1
        "#,
    )
    .bind(lead_id)
    .fetch_one(pool)
    .await?;
    Ok(lead)
}
