//! Append-only audit trail for lead state machine outcomes. Routing and
//! delivery decisions that do not change the lead row (`no_route`,
//! `already_routed`, `retry_exhausted`) are only observable here.

use serde_json::Value;

pub async fn record_lead_event<'c, E>(
    executor: E,
    lead_id: i64,
    event: &str,
    detail: Value,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("INSERT INTO lead_events (lead_id, event, detail) VALUES ($1, $2, $3)")
        .bind(lead_id)
        .bind(event)
        .bind(detail)
        .execute(executor)
        .await?;

    Ok(())
}
