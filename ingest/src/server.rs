use std::future::Future;
use std::net::SocketAddr;

use eyre::Result;
use tokio::net::TcpListener;

use leadgen_common::db;

use crate::config::Config;
use crate::router::{router, AppState};

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let pool = db::get_pool(&config.database_url, config.max_pg_connections).await?;

    let state = AppState::new(pool, &config);
    let app = router(state, config.export_prometheus);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
