use leadgen_common::pgqueue;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred: {0}")]
    Queue(#[from] pgqueue::QueueError),
    #[error("a database error occurred: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to serialize webhook payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("could not allocate an attempt number for lead {0}")]
    AttemptContention(i64),
}
