//! Consume delivery jobs and run webhook deliveries.
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use envconfig::Envconfig;

use delivery_worker::config::Config;
use delivery_worker::error::WorkerError;
use delivery_worker::worker::DeliveryWorker;
use leadgen_common::db;
use leadgen_common::health::HealthRegistry;
use leadgen_common::metrics::{serve, setup_metrics_router};
use leadgen_common::pgqueue::DeliveryQueue;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");
    let retry_schedule = config
        .retry_schedule()
        .expect("invalid BACKOFF_SCHEDULE");

    let pool = db::get_pool(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to postgres");
    let queue = Arc::new(DeliveryQueue::new_from_pool(
        pool.clone(),
        config.visibility_timeout(),
    ));

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("delivery_worker", Duration::from_secs(30))
        .await;

    let worker = DeliveryWorker::new(
        &config.worker_name,
        queue,
        pool,
        config.poll_interval.0,
        config.connect_timeout.0,
        config.total_timeout.0,
        config.max_concurrent_jobs,
        retry_schedule,
        worker_liveness,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router()
            .route("/health", get(move || std::future::ready(liveness.get_status())));
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await
}
