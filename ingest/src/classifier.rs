//! Inbound request -> `(source, offer, market, vertical)` resolution.
//!
//! Resolution order is strict: an explicit source id wins over a source key,
//! which wins over HTTP `Host` + path-prefix mapping. Resolution depends only
//! on the sources and offers tables, never on validation or routing
//! configuration.

use std::sync::LazyLock;

use regex::Regex;
use sqlx::postgres::PgPool;

use crate::api::IngestError;

static SOURCE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{1,127}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct Classification {
    pub source_id: i64,
    pub offer_id: i64,
    pub market_id: i64,
    pub vertical_id: i64,
}

pub fn canonicalize_source_key(source_key: &str) -> Result<String, IngestError> {
    let k = source_key.trim();
    if !SOURCE_KEY_RE.is_match(k) {
        return Err(IngestError::InvalidSourceKeyFormat(source_key.to_owned()));
    }
    Ok(k.to_owned())
}

/// Lowercase and strip any port, keeping IPv6 literals intact:
/// `Example.COM:8443` -> `example.com`, `[::1]:8080` -> `[::1]`.
pub fn canonicalize_hostname(host: &str) -> Option<String> {
    let h = host.trim().to_lowercase();
    if h.is_empty() {
        return None;
    }
    let h = if h.starts_with('[') {
        match h.find(']') {
            Some(end) => h[..=end].to_owned(),
            None => h,
        }
    } else if let Some(colon) = h.find(':') {
        h[..colon].to_owned()
    } else {
        h
    };
    if h.is_empty() {
        return None;
    }
    Some(h)
}

pub fn canonicalize_path(path: &str) -> String {
    let p = path.trim();
    if p.is_empty() {
        return "/".to_owned();
    }
    if p.starts_with('/') {
        p.to_owned()
    } else {
        format!("/{p}")
    }
}

#[derive(sqlx::FromRow)]
struct HttpCandidate {
    source_id: i64,
    offer_id: i64,
    market_id: i64,
    vertical_id: i64,
    prefix_len: i32,
}

pub async fn resolve(
    pool: &PgPool,
    source_id: Option<i64>,
    source_key: Option<&str>,
    request_host: Option<&str>,
    request_path: &str,
) -> Result<Classification, IngestError> {
    if let Some(source_id) = source_id {
        let row: Option<Classification> = sqlx::query_as(
            r#"
SELECT s.id AS source_id, s.offer_id, o.market_id, o.vertical_id
FROM sources s
JOIN offers o ON o.id = s.offer_id
WHERE s.is_active AND s.id = $1
LIMIT 1
            "#,
        )
        .bind(source_id)
        .fetch_optional(pool)
        .await?;

        return row.ok_or(IngestError::InvalidSource(source_id));
    }

    if let Some(source_key) = source_key {
        let key = canonicalize_source_key(source_key)?;
        let row: Option<Classification> = sqlx::query_as(
            r#"
SELECT s.id AS source_id, s.offer_id, o.market_id, o.vertical_id
FROM sources s
JOIN offers o ON o.id = s.offer_id
WHERE s.is_active AND s.source_key = $1
LIMIT 1
            "#,
        )
        .bind(&key)
        .fetch_optional(pool)
        .await?;

        return row.ok_or(IngestError::InvalidSourceKey(key));
    }

    let hostname = request_host
        .and_then(canonicalize_hostname)
        .ok_or(IngestError::MissingHostHeader)?;
    let path = canonicalize_path(request_path);

    // Longest matching path prefix wins; a tie between the top two is an
    // ambiguity the caller must resolve administratively (409).
    let rows: Vec<HttpCandidate> = sqlx::query_as(
        r#"
SELECT
    s.id AS source_id,
    s.offer_id,
    o.market_id,
    o.vertical_id,
    LENGTH(COALESCE(s.path_prefix, '')) AS prefix_len
FROM sources s
JOIN offers o ON o.id = s.offer_id
WHERE s.is_active
  AND s.hostname = $1
  AND (s.path_prefix IS NULL OR left($2, length(s.path_prefix)) = s.path_prefix)
ORDER BY prefix_len DESC, s.id ASC
LIMIT 2
        "#,
    )
    .bind(&hostname)
    .bind(&path)
    .fetch_all(pool)
    .await?;

    match rows.as_slice() {
        [] => Err(IngestError::UnmappedSource { hostname, path }),
        [only] => Ok(to_classification(only)),
        [first, second] => {
            if first.prefix_len == second.prefix_len {
                Err(IngestError::AmbiguousSourceMapping { hostname, path })
            } else {
                Ok(to_classification(first))
            }
        }
        _ => unreachable!("LIMIT 2"),
    }
}

fn to_classification(row: &HttpCandidate) -> Classification {
    Classification {
        source_id: row.source_id,
        offer_id: row.offer_id,
        market_id: row.market_id,
        vertical_id: row.vertical_id,
    }
}
