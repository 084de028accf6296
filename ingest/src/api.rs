use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use leadgen_common::pgqueue::QueueError;

/// Body of the 202 response for `POST /api/leads`. Idempotent replays
/// return the same `lead_id` with whatever status the lead has reached.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub lead_id: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_id: Option<i64>,
    pub source_id: i64,
    pub offer_id: i64,
    pub market_id: i64,
    pub vertical_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to parse request body: {0}")]
    RequestParsing(String),
    #[error("source_id header is not a valid integer")]
    InvalidSourceIdHeader,

    #[error("no active source with id {0}")]
    InvalidSource(i64),
    #[error("no active source with key {0:?}")]
    InvalidSourceKey(String),
    #[error("source key {0:?} is malformed")]
    InvalidSourceKeyFormat(String),
    #[error("no source mapped for host {hostname:?} and path {path:?}")]
    UnmappedSource { hostname: String, path: String },
    #[error("multiple sources map host {hostname:?} at equal prefix length")]
    AmbiguousSourceMapping { hostname: String, path: String },
    #[error("request carries no Host header")]
    MissingHostHeader,

    #[error("idempotency key is malformed")]
    InvalidIdempotencyKeyFormat,
    #[error("cannot derive idempotency key: {0} is empty")]
    IdempotencyDerivationFailed(&'static str),

    #[error("policy for offer {offer_id} is misconfigured: {detail}")]
    PolicyMisconfigured { offer_id: i64, detail: String },

    #[error("request deadline exceeded")]
    RequestTimeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("delivery queue error: {0}")]
    Queue(#[from] QueueError),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::RequestParsing(_) => "invalid_request_body",
            IngestError::InvalidSourceIdHeader => "invalid_source_id_header",
            IngestError::InvalidSource(_) => "invalid_source",
            IngestError::InvalidSourceKey(_) => "invalid_source_key",
            IngestError::InvalidSourceKeyFormat(_) => "invalid_source_key_format",
            IngestError::UnmappedSource { .. } => "unmapped_source",
            IngestError::AmbiguousSourceMapping { .. } => "ambiguous_source_mapping",
            IngestError::MissingHostHeader => "missing_host_header",
            IngestError::InvalidIdempotencyKeyFormat => "invalid_idempotency_key_format",
            IngestError::IdempotencyDerivationFailed(_) => "idempotency_derivation_failed",
            IngestError::PolicyMisconfigured { .. } => "policy_misconfigured",
            IngestError::RequestTimeout => "request_timeout",
            IngestError::Database(_) => "database_error",
            IngestError::Queue(_) => "queue_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            IngestError::RequestParsing(_)
            | IngestError::InvalidSourceIdHeader
            | IngestError::InvalidSource(_)
            | IngestError::InvalidSourceKey(_)
            | IngestError::InvalidSourceKeyFormat(_)
            | IngestError::UnmappedSource { .. }
            | IngestError::MissingHostHeader
            | IngestError::InvalidIdempotencyKeyFormat
            | IngestError::IdempotencyDerivationFailed(_) => StatusCode::BAD_REQUEST,

            IngestError::AmbiguousSourceMapping { .. } => StatusCode::CONFLICT,

            IngestError::RequestTimeout => StatusCode::SERVICE_UNAVAILABLE,

            IngestError::PolicyMisconfigured { .. }
            | IngestError::Database(_)
            | IngestError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("ingest request failed: {}", self);
        }
        let body = json!({
            "detail": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_mapping_is_a_conflict_everything_else_client_side_is_400() {
        let ambiguous = IngestError::AmbiguousSourceMapping {
            hostname: "example.com".to_owned(),
            path: "/quote".to_owned(),
        };
        assert_eq!(ambiguous.status(), StatusCode::CONFLICT);
        assert_eq!(ambiguous.code(), "ambiguous_source_mapping");

        for err in [
            IngestError::InvalidSource(9),
            IngestError::InvalidSourceKey("nope".to_owned()),
            IngestError::InvalidSourceKeyFormat("!".to_owned()),
            IngestError::UnmappedSource {
                hostname: "example.com".to_owned(),
                path: "/".to_owned(),
            },
            IngestError::MissingHostHeader,
            IngestError::InvalidIdempotencyKeyFormat,
            IngestError::IdempotencyDerivationFailed("email"),
        ] {
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{err}");
        }
    }

    #[test]
    fn policy_misconfiguration_is_a_server_fault() {
        let err = IngestError::PolicyMisconfigured {
            offer_id: 3,
            detail: "unknown field `frobnicate`".to_owned(),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "policy_misconfigured");
    }
}
