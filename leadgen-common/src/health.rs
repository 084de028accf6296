//! Liveness reporting for the long-running loops of a service.
//!
//! Each component (ingest dispatcher, delivery worker loop) registers and
//! must keep reporting healthy within its deadline; a component that goes
//! quiet is considered stalled and fails the whole probe. Liveness and
//! readiness should use separate registries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Set when a component is newly registered.
    Starting,
    /// Recently reported healthy, must report again before the deadline.
    HealthyUntil(DateTime<Utc>),
    Unhealthy,
    /// Set when the HealthyUntil deadline is missed.
    Stalled,
}

impl ComponentStatus {
    fn label(&self) -> &'static str {
        match self {
            ComponentStatus::Starting => "starting",
            ComponentStatus::HealthyUntil(_) => "healthy",
            ComponentStatus::Unhealthy => "unhealthy",
            ComponentStatus::Stalled => "stalled",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub components: HashMap<String, &'static str>,
    #[serde(skip)]
    pub healthy: bool,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, Json(self)).into_response()
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the deadline.
    pub async fn report_healthy(&self) {
        let until = Utc::now() + self.deadline;
        self.report_status(ComponentStatus::HealthyUntil(until)).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err);
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    map.insert(message.component, message.status);
                } else {
                    // Poisoned lock: the probes will fail and the process restart.
                    warn!("poisoned HealthRegistry lock");
                }
            }
        });

        registry
    }

    /// Register a component; hand the returned handle to its loop.
    pub async fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall process status; usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        let now = Utc::now();
        // Unhealthy until at least one component has registered.
        let mut healthy = !components.is_empty();
        let mut out = HashMap::with_capacity(components.len());

        for (name, status) in components.iter() {
            let effective = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                healthy = false;
            }
            out.insert(name.clone(), effective.label());
        }

        if !healthy {
            warn!("{} health check failed: {:?}", self.name, out);
        }

        HealthStatus {
            status: if healthy { "healthy" } else { "unhealthy" },
            components: out,
            healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", Duration::from_secs(30)).await;

        // Starting is not healthy.
        wait_until(|| registry.get_status().components.len() == 1).await;
        assert!(!registry.get_status().healthy);

        handle.report_healthy().await;
        wait_until(|| registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("worker"),
            Some(&"healthy")
        );

        handle.report_status(ComponentStatus::Unhealthy).await;
        wait_until(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn stale_report_stalls_the_component() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", Duration::from_secs(30)).await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                Utc::now() - chrono::Duration::seconds(1),
            ))
            .await;
        wait_until(|| {
            registry.get_status().components.get("worker") == Some(&"stalled")
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..50 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(check());
    }
}
