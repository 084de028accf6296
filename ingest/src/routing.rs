//! Buyer selection and the guarded `validated -> routed` transition.
//!
//! The conditional UPDATE with `buyer_id IS NULL` in its WHERE clause is the
//! sole mechanism preventing double-assignment under concurrent routers; the
//! delivery job is enqueued in the same transaction so exactly one work item
//! exists per successful transition.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::PgPool;

use leadgen_common::audit::record_lead_event;
use leadgen_common::pgqueue;

use crate::api::IngestError;
use crate::policy::{ExclusivityBehavior, RoutingConfig, Strategy, TieBreaker};

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EligibleBuyer {
    pub buyer_id: i64,
    pub routing_priority: i32,
    pub price: Option<f64>,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct RouteInput<'a> {
    pub lead_id: i64,
    pub offer_id: i64,
    pub market_id: i64,
    pub postal_code: &'a str,
    pub city: Option<&'a str>,
}

#[derive(Debug, PartialEq)]
pub enum RouteOutcome {
    Routed { buyer_id: i64, price: Option<f64> },
    /// Another worker won the guarded transition first.
    AlreadyRouted,
    NoRoute,
    NoRouteExclusiveFailClosed,
}

pub async fn route_lead(
    pool: &PgPool,
    config: &RoutingConfig,
    input: &RouteInput<'_>,
    delivery_max_attempts: i32,
) -> Result<RouteOutcome, IngestError> {
    let eligible = eligible_buyers(pool, config, input).await?;

    let candidate = match exclusive_grant(pool, input).await? {
        Some(grant) => {
            match eligible.iter().find(|b| b.buyer_id == grant.buyer_id) {
                Some(buyer) => Some(buyer.clone()),
                None => match config.exclusivity_behavior {
                    ExclusivityBehavior::FailClosed => {
                        record_lead_event(
                            pool,
                            input.lead_id,
                            "no_route_exclusive_fail_closed",
                            json!({
                                "exclusive_buyer_id": grant.buyer_id,
                                "scope_type": grant.scope_type,
                                "scope_value": grant.scope_value,
                            }),
                        )
                        .await?;
                        return Ok(RouteOutcome::NoRouteExclusiveFailClosed);
                    }
                    ExclusivityBehavior::FallbackAllowed => None,
                },
            }
        }
        None => None,
    };

    let candidate = match candidate {
        Some(candidate) => candidate,
        None => {
            if eligible.is_empty() {
                record_lead_event(pool, input.lead_id, "no_route", json!({})).await?;
                return Ok(RouteOutcome::NoRoute);
            }
            select_candidate(&eligible, config, input.lead_id)
                .expect("non-empty eligible set always yields a candidate")
        }
    };

    let price = effective_price(pool, input.offer_id, candidate.price).await?;

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r#"
UPDATE leads
SET status = 'routed'::lead_status,
    buyer_id = $2,
    price = $3,
    routed_at = NOW(),
    updated_at = NOW()
WHERE id = $1
  AND status = 'validated'::lead_status
  AND buyer_id IS NULL
        "#,
    )
    .bind(input.lead_id)
    .bind(candidate.buyer_id)
    .bind(price)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        drop(tx);
        record_lead_event(pool, input.lead_id, "already_routed", json!({})).await?;
        return Ok(RouteOutcome::AlreadyRouted);
    }

    pgqueue::enqueue_delivery(&mut *tx, input.lead_id, delivery_max_attempts).await?;
    record_lead_event(
        &mut *tx,
        input.lead_id,
        "routed",
        json!({"buyer_id": candidate.buyer_id, "strategy": strategy_name(config.strategy)}),
    )
    .await?;
    tx.commit().await?;

    metrics::counter!("leads_routed_total").increment(1);

    Ok(RouteOutcome::Routed {
        buyer_id: candidate.buyer_id,
        price,
    })
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Priority => "priority",
        Strategy::Rotation => "rotation",
        Strategy::Weighted => "weighted",
    }
}

async fn eligible_buyers(
    pool: &PgPool,
    config: &RoutingConfig,
    input: &RouteInput<'_>,
) -> Result<Vec<EligibleBuyer>, IngestError> {
    let rows: Vec<EligibleBuyer> = sqlx::query_as(
        r#"
SELECT DISTINCT
    bo.buyer_id,
    bo.routing_priority,
    bo.price::float8 AS price,
    (SELECT MAX(dl.delivered_at) FROM leads dl
      WHERE dl.buyer_id = bo.buyer_id AND dl.offer_id = bo.offer_id) AS last_delivered_at
FROM buyer_offers bo
JOIN buyers b ON b.id = bo.buyer_id
JOIN buyer_service_areas bsa ON bsa.buyer_id = bo.buyer_id
WHERE bo.offer_id = $1
  AND bo.is_active
  AND b.is_active
  AND bsa.is_active
  AND bsa.market_id = $2
  AND (
        (bsa.scope_type = 'postal_code' AND bsa.scope_value = $3)
     OR ($4::text IS NOT NULL AND bsa.scope_type = 'city' AND bsa.scope_value = $4)
  )
  AND (NOT $5 OR bo.pause_until IS NULL OR bo.pause_until <= NOW())
  AND (bo.min_balance_required IS NULL OR b.balance >= bo.min_balance_required)
  AND (NOT $6 OR (
        (bo.capacity_per_day IS NULL OR
         (SELECT COUNT(*) FROM leads cd
           WHERE cd.buyer_id = bo.buyer_id AND cd.offer_id = bo.offer_id
             AND cd.delivered_at >= date_trunc('day', NOW())) < bo.capacity_per_day)
    AND (bo.capacity_per_hour IS NULL OR
         (SELECT COUNT(*) FROM leads ch
           WHERE ch.buyer_id = bo.buyer_id AND ch.offer_id = bo.offer_id
             AND ch.delivered_at >= date_trunc('hour', NOW())) < bo.capacity_per_hour)
  ))
        "#,
    )
    .bind(input.offer_id)
    .bind(input.market_id)
    .bind(input.postal_code)
    .bind(input.city)
    .bind(config.respect_pause)
    .bind(config.respect_capacity)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[derive(Debug, sqlx::FromRow)]
struct ExclusiveGrant {
    buyer_id: i64,
    scope_type: String,
    scope_value: String,
}

/// Postal scope takes precedence over city scope when both carry grants.
async fn exclusive_grant(
    pool: &PgPool,
    input: &RouteInput<'_>,
) -> Result<Option<ExclusiveGrant>, IngestError> {
    let row: Option<ExclusiveGrant> = sqlx::query_as(
        r#"
SELECT oe.buyer_id, oe.scope_type, oe.scope_value
FROM offer_exclusivities oe
WHERE oe.offer_id = $1
  AND oe.is_active
  AND (
        (oe.scope_type = 'postal_code' AND oe.scope_value = $2)
     OR ($3::text IS NOT NULL AND oe.scope_type = 'city' AND oe.scope_value = $3)
  )
ORDER BY CASE oe.scope_type WHEN 'postal_code' THEN 0 ELSE 1 END
LIMIT 1
        "#,
    )
    .bind(input.offer_id)
    .bind(input.postal_code)
    .bind(input.city)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

async fn effective_price(
    pool: &PgPool,
    offer_id: i64,
    buyer_offer_price: Option<f64>,
) -> Result<Option<f64>, IngestError> {
    if buyer_offer_price.is_some() {
        return Ok(buyer_offer_price);
    }
    let (default_price,): (Option<f64>,) =
        sqlx::query_as("SELECT default_price::float8 FROM offers WHERE id = $1")
            .bind(offer_id)
            .fetch_one(pool)
            .await?;
    Ok(default_price)
}

/// Pure strategy selection over an eligible set. Deterministic for a given
/// `(eligible set, config, lead_id)` so replayed routing picks the same
/// buyer.
pub fn select_candidate(
    eligible: &[EligibleBuyer],
    config: &RoutingConfig,
    lead_id: i64,
) -> Option<EligibleBuyer> {
    if eligible.is_empty() {
        return None;
    }

    match config.strategy {
        Strategy::Priority => {
            let mut ordered: Vec<&EligibleBuyer> = eligible.iter().collect();
            ordered.sort_by(|a, b| compare_tie_breakers(a, b, &config.tie_breakers));
            ordered.first().map(|b| (*b).clone())
        }
        Strategy::Rotation => {
            let top = eligible
                .iter()
                .map(|b| b.routing_priority)
                .max()
                .expect("non-empty");
            let mut tier: Vec<&EligibleBuyer> = eligible
                .iter()
                .filter(|b| b.routing_priority == top)
                .collect();
            // Least recently delivered first; a buyer that never received a
            // lead sorts before all that have.
            tier.sort_by(|a, b| {
                match (a.last_delivered_at, b.last_delivered_at) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(x), Some(y)) => x.cmp(&y),
                }
                .then_with(|| compare_tie_breakers(a, b, &config.tie_breakers))
            });
            tier.first().map(|b| (*b).clone())
        }
        Strategy::Weighted => {
            let mut ordered: Vec<&EligibleBuyer> = eligible.iter().collect();
            ordered.sort_by_key(|b| b.buyer_id);
            let total: u64 = ordered
                .iter()
                .map(|b| b.routing_priority.max(1) as u64)
                .sum();
            let mut pick = (lead_id.unsigned_abs()) % total;
            for buyer in ordered {
                let weight = buyer.routing_priority.max(1) as u64;
                if pick < weight {
                    return Some(buyer.clone());
                }
                pick -= weight;
            }
            unreachable!("pick is always within total weight")
        }
    }
}

fn compare_tie_breakers(
    a: &EligibleBuyer,
    b: &EligibleBuyer,
    tie_breakers: &[TieBreaker],
) -> std::cmp::Ordering {
    for breaker in tie_breakers {
        let ordering = match breaker {
            TieBreaker::RoutingPriorityDesc => b.routing_priority.cmp(&a.routing_priority),
            TieBreaker::BuyerIdAsc => a.buyer_id.cmp(&b.buyer_id),
        };
        if ordering != std::cmp::Ordering::Equal {
            return ordering;
        }
    }
    // Last-resort determinism if the configured breakers do not decide.
    a.buyer_id.cmp(&b.buyer_id)
}
