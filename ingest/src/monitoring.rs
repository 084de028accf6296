//! Operator surface for delivery recovery: routed leads without a successful
//! attempt are visible here and can be re-enqueued.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::IngestError;
use crate::router::AppState;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct StuckDelivery {
    pub lead_id: i64,
    pub buyer_id: Option<i64>,
    pub routed_at: Option<DateTime<Utc>>,
    pub attempts: i64,
}

#[derive(Debug, Serialize)]
pub struct StuckDeliveries {
    pub deliveries: Vec<StuckDelivery>,
}

/// Routed leads with no successful attempt and no live queue job.
pub async fn stuck_deliveries(
    State(state): State<AppState>,
) -> Result<Json<StuckDeliveries>, IngestError> {
    let deliveries: Vec<StuckDelivery> = sqlx::query_as(
        r#"
SELECT
    l.id AS lead_id,
    l.buyer_id,
    l.routed_at,
    (SELECT COUNT(*) FROM delivery_attempts da WHERE da.lead_id = l.id) AS attempts
FROM leads l
WHERE l.status = 'routed'::lead_status
  AND NOT EXISTS (
        SELECT 1 FROM delivery_attempts da
        WHERE da.lead_id = l.id AND da.outcome = 'success'::delivery_outcome
  )
  AND NOT EXISTS (
        SELECT 1 FROM delivery_jobs dj
        WHERE dj.lead_id = l.id
          AND dj.status IN ('available'::delivery_job_status, 'running'::delivery_job_status)
  )
ORDER BY l.routed_at
LIMIT 100
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(StuckDeliveries { deliveries }))
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub requeued: u64,
}

/// Re-enqueue every stuck delivery. Idempotent: leads that already have a
/// live job are skipped.
pub async fn replay_stuck_deliveries(
    State(state): State<AppState>,
) -> Result<Json<ReplayResponse>, IngestError> {
    let requeued = sqlx::query(
        r#"
INSERT INTO delivery_jobs (lead_id, status, attempt, max_attempts, scheduled_at)
SELECT l.id, 'available'::delivery_job_status, 0, $1, NOW()
FROM leads l
WHERE l.status = 'routed'::lead_status
  AND NOT EXISTS (
        SELECT 1 FROM delivery_attempts da
        WHERE da.lead_id = l.id AND da.outcome = 'success'::delivery_outcome
  )
  AND NOT EXISTS (
        SELECT 1 FROM delivery_jobs dj
        WHERE dj.lead_id = l.id
          AND dj.status IN ('available'::delivery_job_status, 'running'::delivery_job_status)
  )
        "#,
    )
    .bind(state.delivery_max_attempts)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if requeued > 0 {
        tracing::info!(requeued, "re-enqueued stuck deliveries");
    }

    Ok(Json(ReplayResponse { requeued }))
}
