//! Subsystem health tracking.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const SUBSYSTEM_CATALOG: &str = "catalog";
pub const SUBSYSTEM_MOUNTER: &str = "mounter";
pub const SUBSYSTEM_MONITOR: &str = "monitor";

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub version: &'static str,
    pub subsystems: Vec<SubsystemHealth>,
}

/// Subsystem health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Health checker that tracks subsystem status.
#[derive(Clone, Default)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checker with the daemon's standard subsystems registered as healthy.
    pub async fn with_standard_subsystems() -> Self {
        let checker = Self::new();
        for name in [SUBSYSTEM_CATALOG, SUBSYSTEM_MOUNTER, SUBSYSTEM_MONITOR] {
            checker.register_subsystem(name).await;
        }
        checker
    }

    /// Register a subsystem for health tracking. Re-registering is a no-op.
    pub async fn register_subsystem(&self, name: &str) {
        let mut subsystems = self.subsystems.write().await;
        if subsystems.iter().any(|s| s.name == name) {
            return;
        }
        subsystems.push(SubsystemHealth {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        });
    }

    /// Update subsystem health status.
    pub async fn update_subsystem(&self, name: &str, status: HealthStatus, message: Option<String>) {
        let mut subsystems = self.subsystems.write().await;
        if let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) {
            subsystem.status = status;
            subsystem.message = message;
        }
    }

    pub async fn mark_healthy(&self, name: &str) {
        self.update_subsystem(name, HealthStatus::Healthy, None).await;
    }

    pub async fn mark_degraded(&self, name: &str, message: impl Into<String>) {
        self.update_subsystem(name, HealthStatus::Degraded, Some(message.into())).await;
    }

    /// Get overall health status.
    ///
    /// Returns:
    /// - Healthy: All subsystems healthy
    /// - Degraded: At least one subsystem degraded, none unhealthy
    /// - Unhealthy: At least one subsystem unhealthy
    pub async fn get_health(&self) -> HealthCheck {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck { status, version: env!("CARGO_PKG_VERSION"), subsystems }
    }

    /// Readiness check - are all subsystems healthy?
    pub async fn is_ready(&self) -> bool {
        self.get_health().await.status == HealthStatus::Healthy
    }
}
