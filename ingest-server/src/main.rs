use envconfig::Envconfig;
use tokio::signal;

use ingest::config::Config;
use ingest::server::serve;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let listener = tokio::net::TcpListener::bind(config.bind())
        .await
        .expect("failed to bind");

    match serve(config, listener, shutdown()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to run ingest http server, {}", e),
    }
}
