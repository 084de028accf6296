use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Error as SqlxError;

/// Session-level timeouts applied to every pooled connection. The ingest
/// request path must fail fast rather than queue behind a slow statement.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseTimeouts {
    pub statement_timeout: Duration,
    pub lock_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseTimeouts {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_millis(2_000),
            lock_timeout: Duration::from_millis(500),
            acquire_timeout: Duration::from_millis(1_000),
        }
    }
}

pub async fn get_pool(url: &str, max_connections: u32) -> Result<PgPool, SqlxError> {
    get_pool_with_timeouts(url, max_connections, DatabaseTimeouts::default()).await
}

pub async fn get_pool_with_timeouts(
    url: &str,
    max_connections: u32,
    timeouts: DatabaseTimeouts,
) -> Result<PgPool, SqlxError> {
    let stmt_ms = timeouts.statement_timeout.as_millis();
    let lock_ms = timeouts.lock_timeout.as_millis();

    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeouts.acquire_timeout)
        .test_before_acquire(true)
        // SET commands do not accept bind parameters.
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = '{stmt_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!("SET lock_timeout = '{lock_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await
}

/// SQLSTATE 23505, the only constraint violation the core recovers from
/// (idempotent insert races, attempt-number races).
pub fn is_unique_violation(error: &SqlxError) -> bool {
    match error {
        SqlxError::Database(db_error) => db_error
            .code()
            .is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}
