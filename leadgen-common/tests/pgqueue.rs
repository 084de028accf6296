use std::time::Duration;

use sqlx::PgPool;

use leadgen_common::pgqueue::{enqueue_delivery, DeliveryQueue, JobStatus};

async fn seed_lead(pool: &PgPool) -> i64 {
    let (market_id,): (i64,) = sqlx::query_as(
        "INSERT INTO markets (name, timezone, currency) VALUES ('austin', 'America/Chicago', 'USD') RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    let (vertical_id,): (i64,) = sqlx::query_as(
        "INSERT INTO verticals (name, slug) VALUES ('Plumbing', 'plumbing') RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    let (offer_id,): (i64,) = sqlx::query_as(
        "INSERT INTO offers (market_id, vertical_id, name) VALUES ($1, $2, 'plumbing-austin') RETURNING id",
    )
    .bind(market_id)
    .bind(vertical_id)
    .fetch_one(pool)
    .await
    .unwrap();
    let (source_id,): (i64,) = sqlx::query_as(
        "INSERT INTO sources (offer_id, source_key, kind, name) VALUES ($1, 'aus-plb-v1', 'landing_page', 'Austin LP') RETURNING id",
    )
    .bind(offer_id)
    .fetch_one(pool)
    .await
    .unwrap();
    let (lead_id,): (i64,) = sqlx::query_as(
        r#"
INSERT INTO leads (source_id, offer_id, market_id, vertical_id, idempotency_key,
                   name, email, phone, postal_code, status)
VALUES ($1, $2, $3, $4, 'idem_0000000000000001', 'Jane', 'j@x.com', '+15125550123', '78701',
        'routed'::lead_status)
RETURNING id
        "#,
    )
    .bind(source_id)
    .bind(offer_id)
    .bind(market_id)
    .bind(vertical_id)
    .fetch_one(pool)
    .await
    .unwrap();
    lead_id
}

#[sqlx::test(migrations = "../migrations")]
async fn enqueue_then_dequeue_marks_running(pool: PgPool) {
    let lead_id = seed_lead(&pool).await;
    let queue = DeliveryQueue::new_from_pool(pool.clone(), Duration::from_secs(30));

    enqueue_delivery(&pool, lead_id, 3).await.unwrap();

    let job = queue.dequeue("worker-1").await.unwrap().expect("one job");
    assert_eq!(job.lead_id, lead_id);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.attempted_by.contains(&"worker-1".to_owned()));

    // The job is invisible while running.
    assert!(queue.dequeue("worker-2").await.unwrap().is_none());
}

#[sqlx::test(migrations = "../migrations")]
async fn completed_jobs_are_never_handed_out_again(pool: PgPool) {
    let lead_id = seed_lead(&pool).await;
    let queue = DeliveryQueue::new_from_pool(pool.clone(), Duration::from_secs(30));

    enqueue_delivery(&pool, lead_id, 3).await.unwrap();
    let job = queue.dequeue("worker-1").await.unwrap().unwrap();
    queue.ack_completed(job.complete()).await.unwrap();

    assert!(queue.dequeue("worker-1").await.unwrap().is_none());
}

#[sqlx::test(migrations = "../migrations")]
async fn retried_jobs_come_back_after_the_delay(pool: PgPool) {
    let lead_id = seed_lead(&pool).await;
    let queue = DeliveryQueue::new_from_pool(pool.clone(), Duration::from_secs(30));

    enqueue_delivery(&pool, lead_id, 3).await.unwrap();
    let job = queue.dequeue("worker-1").await.unwrap().unwrap();
    let retryable = job.retry("HTTP 503").unwrap();
    queue
        .ack_retryable(retryable, Duration::from_secs(3600))
        .await
        .unwrap();

    // Not due yet.
    assert!(queue.dequeue("worker-1").await.unwrap().is_none());

    sqlx::query("UPDATE delivery_jobs SET scheduled_at = NOW()")
        .execute(&pool)
        .await
        .unwrap();
    let retried = queue.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(retried.attempt, 2);
}

#[sqlx::test(migrations = "../migrations")]
async fn a_lapsed_visibility_window_re_dequeues_the_job(pool: PgPool) {
    let lead_id = seed_lead(&pool).await;
    // Tiny visibility window stands in for a crashed worker.
    let queue = DeliveryQueue::new_from_pool(pool.clone(), Duration::from_millis(100));

    enqueue_delivery(&pool, lead_id, 3).await.unwrap();
    let first = queue.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(first.attempt, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = queue.dequeue("worker-2").await.unwrap().expect("reclaimed");
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempt, 2);
    assert!(second.attempted_by.contains(&"worker-1".to_owned()));
    assert!(second.attempted_by.contains(&"worker-2".to_owned()));
}

#[sqlx::test(migrations = "../migrations")]
async fn failed_jobs_stay_for_operators_but_never_run(pool: PgPool) {
    let lead_id = seed_lead(&pool).await;
    let queue = DeliveryQueue::new_from_pool(pool.clone(), Duration::from_secs(30));

    enqueue_delivery(&pool, lead_id, 1).await.unwrap();
    let job = queue.dequeue("worker-1").await.unwrap().unwrap();
    queue.ack_failed(job.fail("HTTP 410")).await.unwrap();

    assert!(queue.dequeue("worker-1").await.unwrap().is_none());

    let (status, last_error): (String, Option<String>) = sqlx::query_as(
        "SELECT status::text, last_error FROM delivery_jobs WHERE lead_id = $1",
    )
    .bind(lead_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(last_error.as_deref(), Some("HTTP 410"));
}
