//! Validation and routing behavior lives as data on the offer, not as code.
//! Policies are parsed into typed structs at load time; unknown keys are a
//! configuration error, surfaced loudly instead of silently ignored.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use sqlx::postgres::PgPool;

use crate::api::IngestError;

const MAX_WINDOW_HOURS: i32 = 8760;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRules {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub allowed_postal_codes: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_cities: Option<Vec<String>>,
    #[serde(default)]
    pub phone_region: Option<String>,
    #[serde(default)]
    pub allowed_country_codes: Option<Vec<String>>,
    #[serde(default)]
    pub disposable_email_blocklist_enabled: bool,
    #[serde(default)]
    pub duplicate_detection: DuplicatePolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuplicatePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_window_hours")]
    pub window_hours: i32,
    #[serde(default)]
    pub scope: DuplicateScope,
    #[serde(default = "default_keys")]
    pub keys: Vec<MatchKey>,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub exclude_statuses: Vec<String>,
    #[serde(default)]
    pub include_sources: IncludeSources,
    #[serde(default)]
    pub action: DuplicateAction,
    #[serde(default = "default_reason_code")]
    pub reason_code: String,
    #[serde(default)]
    pub min_fields: Vec<MatchKey>,
    /// Informational; normalization is fixed in code.
    #[serde(default)]
    pub normalize: Option<serde_json::Value>,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            window_hours: default_window_hours(),
            scope: DuplicateScope::Offer,
            keys: default_keys(),
            match_mode: MatchMode::Any,
            exclude_statuses: Vec::new(),
            include_sources: IncludeSources::Any,
            action: DuplicateAction::Reject,
            reason_code: default_reason_code(),
            min_fields: Vec::new(),
            normalize: None,
        }
    }
}

fn default_window_hours() -> i32 {
    24
}

fn default_keys() -> Vec<MatchKey> {
    vec![MatchKey::Phone, MatchKey::Email]
}

fn default_reason_code() -> String {
    "duplicate".to_owned()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateScope {
    #[default]
    Offer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKey {
    Phone,
    Email,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Any,
    All,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Any => "any",
            MatchMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeSources {
    #[default]
    Any,
    SameSourceOnly,
}

impl IncludeSources {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncludeSources::Any => "any",
            IncludeSources::SameSourceOnly => "same_source_only",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAction {
    #[default]
    Reject,
    Flag,
    Accept,
}

impl DuplicateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateAction::Reject => "reject",
            DuplicateAction::Flag => "flag",
            DuplicateAction::Accept => "accept",
        }
    }
}

impl ValidationRules {
    /// Structural checks serde cannot express. Fail closed.
    pub fn validate(&self) -> Result<(), String> {
        let dup = &self.duplicate_detection;
        if dup.enabled && !(1..=MAX_WINDOW_HOURS).contains(&dup.window_hours) {
            return Err(format!(
                "duplicate_detection.window_hours must be within 1..={MAX_WINDOW_HOURS}, got {}",
                dup.window_hours
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub exclusivity_behavior: ExclusivityBehavior,
    #[serde(default = "default_tie_breakers")]
    pub tie_breakers: Vec<TieBreaker>,
    #[serde(default = "default_true")]
    pub respect_capacity: bool,
    #[serde(default = "default_true")]
    pub respect_pause: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Priority,
            exclusivity_behavior: ExclusivityBehavior::FailClosed,
            tie_breakers: default_tie_breakers(),
            respect_capacity: true,
            respect_pause: true,
        }
    }
}

fn default_tie_breakers() -> Vec<TieBreaker> {
    vec![TieBreaker::RoutingPriorityDesc, TieBreaker::BuyerIdAsc]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Priority,
    Rotation,
    Weighted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusivityBehavior {
    #[default]
    FailClosed,
    FallbackAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreaker {
    RoutingPriorityDesc,
    BuyerIdAsc,
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    rules: serde_json::Value,
}

/// Load the active validation policy for an offer. An offer without one gets
/// the permissive defaults; a policy that fails to parse halts the lead with
/// `policy_misconfigured` rather than guessing.
pub async fn load_validation_rules(
    pool: &PgPool,
    offer_id: i64,
) -> Result<ValidationRules, IngestError> {
    let row: Option<PolicyRow> = sqlx::query_as(
        r#"
SELECT vp.rules
FROM validation_policies vp
JOIN offers o ON o.validation_policy_id = vp.id
WHERE o.id = $1 AND vp.is_active
LIMIT 1
        "#,
    )
    .bind(offer_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(ValidationRules::default());
    };

    let rules: ValidationRules =
        serde_json::from_value(row.rules).map_err(|e| IngestError::PolicyMisconfigured {
            offer_id,
            detail: e.to_string(),
        })?;
    rules
        .validate()
        .map_err(|detail| IngestError::PolicyMisconfigured { offer_id, detail })?;

    Ok(rules)
}

#[derive(sqlx::FromRow)]
struct RoutingPolicyRow {
    config: serde_json::Value,
}

pub async fn load_routing_config(
    pool: &PgPool,
    offer_id: i64,
) -> Result<RoutingConfig, IngestError> {
    let row: Option<RoutingPolicyRow> = sqlx::query_as(
        r#"
SELECT rp.config
FROM routing_policies rp
JOIN offers o ON o.routing_policy_id = rp.id
WHERE o.id = $1 AND rp.is_active
LIMIT 1
        "#,
    )
    .bind(offer_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(RoutingConfig::default());
    };

    serde_json::from_value(row.config).map_err(|e| IngestError::PolicyMisconfigured {
        offer_id,
        detail: e.to_string(),
    })
}

/// Read-mostly in-process cache for policy objects. Staleness is bounded by
/// the TTL; policies are versioned rows, so a stale read is simply the
/// previous version.
pub struct PolicyCache {
    ttl: Duration,
    validation: RwLock<HashMap<i64, (Instant, Arc<ValidationRules>)>>,
    routing: RwLock<HashMap<i64, (Instant, Arc<RoutingConfig>)>>,
}

impl PolicyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            validation: RwLock::new(HashMap::new()),
            routing: RwLock::new(HashMap::new()),
        }
    }

    pub async fn validation_rules(
        &self,
        pool: &PgPool,
        offer_id: i64,
    ) -> Result<Arc<ValidationRules>, IngestError> {
        if let Some(cached) = fresh(&self.validation, offer_id, self.ttl) {
            return Ok(cached);
        }
        let loaded = Arc::new(load_validation_rules(pool, offer_id).await?);
        store(&self.validation, offer_id, loaded.clone());
        Ok(loaded)
    }

    pub async fn routing_config(
        &self,
        pool: &PgPool,
        offer_id: i64,
    ) -> Result<Arc<RoutingConfig>, IngestError> {
        if let Some(cached) = fresh(&self.routing, offer_id, self.ttl) {
            return Ok(cached);
        }
        let loaded = Arc::new(load_routing_config(pool, offer_id).await?);
        store(&self.routing, offer_id, loaded.clone());
        Ok(loaded)
    }
}

fn fresh<T>(
    map: &RwLock<HashMap<i64, (Instant, Arc<T>)>>,
    key: i64,
    ttl: Duration,
) -> Option<Arc<T>> {
    let guard = map.read().expect("poisoned policy cache lock");
    let (loaded_at, value) = guard.get(&key)?;
    if loaded_at.elapsed() < ttl {
        Some(value.clone())
    } else {
        None
    }
}

fn store<T>(map: &RwLock<HashMap<i64, (Instant, Arc<T>)>>, key: i64, value: Arc<T>) {
    map.write()
        .expect("poisoned policy cache lock")
        .insert(key, (Instant::now(), value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_rules_parse_the_enumerated_keys() {
        let rules: ValidationRules = serde_json::from_value(json!({
            "required_fields": ["name", "email"],
            "allowed_postal_codes": ["78701", "78702"],
            "allowed_cities": ["Austin"],
            "allowed_country_codes": ["US", "CA"],
            "disposable_email_blocklist_enabled": true,
            "duplicate_detection": {
                "enabled": true,
                "window_hours": 24,
                "scope": "offer",
                "keys": ["phone"],
                "match_mode": "any",
                "action": "reject",
                "reason_code": "duplicate_recent"
            }
        }))
        .unwrap();

        assert!(rules.disposable_email_blocklist_enabled);
        assert_eq!(rules.duplicate_detection.keys, vec![MatchKey::Phone]);
        assert_eq!(rules.duplicate_detection.action, DuplicateAction::Reject);
        assert_eq!(rules.duplicate_detection.reason_code, "duplicate_recent");
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected_loudly() {
        let result = serde_json::from_value::<ValidationRules>(json!({
            "required_fields": [],
            "frobnicate": true
        }));
        assert!(result.is_err());

        let result = serde_json::from_value::<RoutingConfig>(json!({
            "strategy": "priority",
            "surprise": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_window_bounds_are_enforced() {
        for bad in [0, -1, 8761] {
            let rules: ValidationRules = serde_json::from_value(json!({
                "duplicate_detection": {"enabled": true, "window_hours": bad}
            }))
            .unwrap();
            assert!(rules.validate().is_err(), "window_hours={bad}");
        }

        // A disabled policy does not care about its window.
        let rules: ValidationRules = serde_json::from_value(json!({
            "duplicate_detection": {"enabled": false, "window_hours": 0}
        }))
        .unwrap();
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn routing_config_defaults() {
        let config: RoutingConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.strategy, Strategy::Priority);
        assert_eq!(config.exclusivity_behavior, ExclusivityBehavior::FailClosed);
        assert_eq!(
            config.tie_breakers,
            vec![TieBreaker::RoutingPriorityDesc, TieBreaker::BuyerIdAsc]
        );
        assert!(config.respect_capacity);
        assert!(config.respect_pause);

        let config: RoutingConfig = serde_json::from_value(json!({
            "strategy": "weighted",
            "exclusivity_behavior": "fallback_allowed",
            "respect_capacity": false
        }))
        .unwrap();
        assert_eq!(config.strategy, Strategy::Weighted);
        assert_eq!(
            config.exclusivity_behavior,
            ExclusivityBehavior::FallbackAllowed
        );
        assert!(!config.respect_capacity);
    }
}
