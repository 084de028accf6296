//! Queue consumer executing webhook deliveries.
//!
//! The queue hands jobs out at-least-once, so every step here must tolerate
//! replays: lead state is re-read on every attempt, the `delivered`
//! transition is a conditional UPDATE, and attempt rows are append-only with
//! gap-free numbering.

use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use http::StatusCode;
use metrics::counter;
use reqwest::header;
use serde_json::json;
use sqlx::postgres::PgPool;
use tokio::sync::Semaphore;
use tracing::error;
use uuid::Uuid;

use leadgen_common::audit::record_lead_event;
use leadgen_common::db::is_unique_violation;
use leadgen_common::health::HealthHandle;
use leadgen_common::pgqueue::{DeliveryJob, DeliveryQueue};
use leadgen_common::retry::RetrySchedule;

use crate::error::WorkerError;
use crate::payload::{build_payload, sign, EVENT_LEAD_DELIVERED, USER_AGENT};

const MAX_ERROR_LEN: usize = 500;

/// Attempt outcome classification, persisted on every attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    TransientFailure,
    PermanentFailure,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::TransientFailure => "transient_failure",
            Outcome::PermanentFailure => "permanent_failure",
            Outcome::Timeout => "timeout",
        }
    }

    /// Timeouts keep their own outcome label but are retried like any other
    /// transient failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::TransientFailure | Outcome::Timeout)
    }
}

/// 2xx succeeds; 408, 429 and 5xx are worth retrying; any other 4xx is the
/// buyer telling us to stop.
pub fn classify_status(status: StatusCode) -> Outcome {
    if status.is_success() {
        Outcome::Success
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Outcome::TransientFailure
    } else {
        Outcome::PermanentFailure
    }
}

pub fn classify_error(error: &reqwest::Error) -> Outcome {
    if error.is_timeout() {
        Outcome::Timeout
    } else {
        // Connect refusals, DNS failures, resets: all retryable.
        Outcome::TransientFailure
    }
}

/// Authoritative lead state re-read per attempt, with the effective delivery
/// channel already joined in.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeadDelivery {
    pub id: i64,
    pub status: String,
    pub buyer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub postal_code: String,
    pub message: Option<String>,
    pub price: Option<f64>,
    pub source_key: String,
    pub buyer_webhook_url: Option<String>,
    pub buyer_webhook_secret: Option<String>,
    pub webhook_url_override: Option<String>,
    pub webhook_secret_override: Option<String>,
}

impl LeadDelivery {
    /// BuyerOffer overrides beat Buyer defaults.
    pub fn effective_webhook_url(&self) -> Option<&str> {
        self.webhook_url_override
            .as_deref()
            .or(self.buyer_webhook_url.as_deref())
    }

    pub fn effective_webhook_secret(&self) -> Option<&str> {
        self.webhook_secret_override
            .as_deref()
            .or(self.buyer_webhook_secret.as_deref())
    }
}

/// A worker polling the delivery queue and spawning bounded delivery tasks.
pub struct DeliveryWorker {
    /// Used to mark jobs we have consumed.
    name: String,
    queue: Arc<DeliveryQueue>,
    pool: PgPool,
    poll_interval: time::Duration,
    client: reqwest::Client,
    max_concurrent_jobs: usize,
    retry_schedule: RetrySchedule,
    liveness: HealthHandle,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: Arc<DeliveryQueue>,
        pool: PgPool,
        poll_interval: time::Duration,
        connect_timeout: time::Duration,
        total_timeout: time::Duration,
        max_concurrent_jobs: usize,
        retry_schedule: RetrySchedule,
        liveness: HealthHandle,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .timeout(total_timeout)
            .build()
            .expect("failed to construct reqwest client for delivery worker");

        Self {
            name: name.to_owned(),
            queue,
            pool,
            poll_interval,
            client,
            max_concurrent_jobs,
            retry_schedule,
            liveness,
        }
    }

    /// Wait until a job becomes available in our queue.
    async fn wait_for_job(&self) -> Result<DeliveryJob, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            if let Some(job) = self.queue.dequeue(&self.name).await? {
                return Ok(job);
            }
        }
    }

    /// Run this worker to continuously process jobs as they become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));

        loop {
            metrics::gauge!("delivery_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64,
            );

            let job = self.wait_for_job().await?;
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore has been closed");

            let pool = self.pool.clone();
            let queue = self.queue.clone();
            let client = self.client.clone();
            let retry_schedule = self.retry_schedule.clone();

            tokio::spawn(async move {
                let lead_id = job.lead_id;
                let result =
                    process_delivery_job(pool, queue, client, retry_schedule, job).await;
                drop(permit);
                if let Err(err) = result {
                    error!("failed to process delivery job for lead {}: {}", lead_id, err);
                }
            });
        }
    }
}

pub async fn process_delivery_job(
    pool: PgPool,
    queue: Arc<DeliveryQueue>,
    client: reqwest::Client,
    retry_schedule: RetrySchedule,
    job: DeliveryJob,
) -> Result<(), WorkerError> {
    let Some(lead) = load_lead(&pool, job.lead_id).await? else {
        // Lead is gone entirely; nothing to deliver.
        queue.ack_completed(job.complete()).await?;
        return Ok(());
    };

    match lead.status.as_str() {
        // Another worker already finished this lead.
        "delivered" | "accepted" | "rejected" => {
            queue.ack_completed(job.complete()).await?;
            return Ok(());
        }
        "routed" if lead.buyer_id.is_some() => {}
        // Out-of-band state; not this worker's concern.
        _ => {
            queue.ack_completed(job.complete()).await?;
            return Ok(());
        }
    }

    let Some(url) = lead.effective_webhook_url().map(str::to_owned) else {
        let delivery_id = Uuid::now_v7();
        record_attempt(
            &pool,
            lead.id,
            Outcome::PermanentFailure,
            None,
            Some("no_channel"),
            delivery_id,
        )
        .await?;
        record_lead_event(&pool, lead.id, "delivery_no_channel", json!({})).await?;
        counter!("delivery_attempts_total", "outcome" => "permanent_failure").increment(1);
        queue.ack_completed(job.complete()).await?;
        return Ok(());
    };

    let delivery_id = Uuid::now_v7();
    let delivered_at = Utc::now();
    let payload = build_payload(&lead, delivered_at);
    let body = serde_json::to_string(&payload)?;

    let mut request = client
        .post(&url)
        .header("X-LeadGen-Delivery-Id", delivery_id.to_string())
        .header("X-LeadGen-Event", EVENT_LEAD_DELIVERED);
    if let Some(secret) = lead.effective_webhook_secret() {
        request = request.header("X-Webhook-Signature", sign(secret, &body));
    }

    let send_result = request.body(body).send().await;

    let (outcome, http_status, error_msg) = match send_result {
        Ok(response) => {
            let status = response.status();
            let outcome = classify_status(status);
            let error_msg = if outcome == Outcome::Success {
                None
            } else {
                Some(format!("HTTP {}", status.as_u16()))
            };
            (outcome, Some(status.as_u16() as i32), error_msg)
        }
        Err(error) => {
            let outcome = classify_error(&error);
            (outcome, None, Some(sanitize_error(error)))
        }
    };

    let attempt_number = record_attempt(
        &pool,
        lead.id,
        outcome,
        http_status,
        error_msg.as_deref(),
        delivery_id,
    )
    .await?;

    counter!("delivery_attempts_total", "outcome" => outcome.as_str()).increment(1);

    match outcome {
        Outcome::Success => {
            let updated = sqlx::query(
                r#"
UPDATE leads
SET status = 'delivered'::lead_status,
    delivered_at = NOW(),
    updated_at = NOW()
WHERE id = $1 AND status = 'routed'::lead_status
                "#,
            )
            .bind(lead.id)
            .execute(&pool)
            .await?
            .rows_affected();

            if updated == 1 {
                record_lead_event(
                    &pool,
                    lead.id,
                    "delivered",
                    json!({"attempt_number": attempt_number}),
                )
                .await?;
                counter!("leads_delivered_total").increment(1);
            }
            // Zero rows means another worker won; the wire may have seen a
            // duplicate POST, the status flipped exactly once. Still ack.
            queue.ack_completed(job.complete()).await?;
        }
        Outcome::TransientFailure | Outcome::Timeout => {
            if job.attempt < job.max_attempts {
                let next_attempt = (job.attempt + 1) as u32;
                let delay = retry_schedule.delay_before(next_attempt);
                let retryable = job
                    .retry(error_msg.unwrap_or_default())
                    .expect("attempts remain");
                queue.ack_retryable(retryable, delay).await?;
            } else {
                record_lead_event(
                    &pool,
                    lead.id,
                    "delivery_retry_exhausted",
                    json!({"attempts": attempt_number}),
                )
                .await?;
                counter!("delivery_retry_exhausted_total").increment(1);
                // Lead stays routed, surfaced via monitoring and replay.
                queue
                    .ack_failed(job.fail(error_msg.unwrap_or_else(|| "retry_exhausted".to_owned())))
                    .await?;
            }
        }
        Outcome::PermanentFailure => {
            queue
                .ack_failed(job.fail(error_msg.unwrap_or_default()))
                .await?;
        }
    }

    Ok(())
}

async fn load_lead(pool: &PgPool, lead_id: i64) -> Result<Option<LeadDelivery>, WorkerError> {
    let lead: Option<LeadDelivery> = sqlx::query_as(
        r#"
SELECT
    l.id,
    l.status::text AS status,
    l.buyer_id,
    l.created_at,
    l.idempotency_key,
    l.name,
    l.email,
    l.phone,
    l.postal_code,
    l.message,
    l.price::float8 AS price,
    s.source_key,
    b.webhook_url AS buyer_webhook_url,
    b.webhook_secret AS buyer_webhook_secret,
    bo.webhook_url_override,
    bo.webhook_secret_override
FROM leads l
JOIN sources s ON s.id = l.source_id
LEFT JOIN buyers b ON b.id = l.buyer_id
LEFT JOIN buyer_offers bo ON bo.buyer_id = l.buyer_id AND bo.offer_id = l.offer_id
WHERE l.id = $1
        "#,
    )
    .bind(lead_id)
    .fetch_optional(pool)
    .await?;

    Ok(lead)
}

/// Append the next attempt row. Numbers are allocated as count+1 under a
/// unique constraint; a losing racer re-reads and tries again, keeping the
/// sequence gap-free.
async fn record_attempt(
    pool: &PgPool,
    lead_id: i64,
    outcome: Outcome,
    http_status: Option<i32>,
    error: Option<&str>,
    delivery_id: Uuid,
) -> Result<i32, WorkerError> {
    for _ in 0..3 {
        let result = sqlx::query_as::<_, (i32,)>(
            r#"
INSERT INTO delivery_attempts (lead_id, attempt_number, outcome, http_status, error, delivery_id)
SELECT $1, COALESCE(MAX(attempt_number), 0) + 1, $2::delivery_outcome, $3, $4, $5
FROM delivery_attempts
WHERE lead_id = $1
RETURNING attempt_number
            "#,
        )
        .bind(lead_id)
        .bind(outcome.as_str())
        .bind(http_status)
        .bind(error)
        .bind(delivery_id)
        .fetch_one(pool)
        .await;

        match result {
            Ok((attempt_number,)) => return Ok(attempt_number),
            Err(e) if is_unique_violation(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(WorkerError::AttemptContention(lead_id))
}

/// Never persist secrets or full payloads; URLs can carry credentials.
fn sanitize_error(error: reqwest::Error) -> String {
    let mut message = error.without_url().to_string();
    message.truncate(MAX_ERROR_LEN);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK), Outcome::Success);
        assert_eq!(classify_status(StatusCode::CREATED), Outcome::Success);

        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            Outcome::TransientFailure
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Outcome::TransientFailure
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            Outcome::TransientFailure
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Outcome::TransientFailure
        );

        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            Outcome::PermanentFailure
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            Outcome::PermanentFailure
        );
        assert_eq!(
            classify_status(StatusCode::GONE),
            Outcome::PermanentFailure
        );
    }

    #[test]
    fn retryable_outcomes() {
        assert!(Outcome::TransientFailure.is_retryable());
        assert!(Outcome::Timeout.is_retryable());
        assert!(!Outcome::Success.is_retryable());
        assert!(!Outcome::PermanentFailure.is_retryable());
    }

    #[test]
    fn channel_resolution_prefers_overrides() {
        let mut lead = LeadDelivery {
            id: 1,
            status: "routed".to_owned(),
            buyer_id: Some(1),
            created_at: Utc::now(),
            idempotency_key: "k".repeat(16),
            name: String::new(),
            email: String::new(),
            phone: String::new(),
            postal_code: String::new(),
            message: None,
            price: None,
            source_key: "src".to_owned(),
            buyer_webhook_url: Some("https://default.example/hook".to_owned()),
            buyer_webhook_secret: Some("default-secret".to_owned()),
            webhook_url_override: None,
            webhook_secret_override: None,
        };

        assert_eq!(
            lead.effective_webhook_url(),
            Some("https://default.example/hook")
        );
        assert_eq!(lead.effective_webhook_secret(), Some("default-secret"));

        lead.webhook_url_override = Some("https://override.example/hook".to_owned());
        lead.webhook_secret_override = Some("override-secret".to_owned());
        assert_eq!(
            lead.effective_webhook_url(),
            Some("https://override.example/hook")
        );
        assert_eq!(lead.effective_webhook_secret(), Some("override-secret"));

        lead.buyer_webhook_url = None;
        lead.webhook_url_override = None;
        assert_eq!(lead.effective_webhook_url(), None);
    }
}
