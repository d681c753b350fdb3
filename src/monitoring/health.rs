//! Health tracking for the resilience core
//!
//! Components:
//! - fast_cache: in-process tier answers probes
//! - secondary_cache: Redis tier (absent tier is reported healthy)
//! - recovery: degraded while any circuit breaker is open

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComponentStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "degraded")]
    Degraded,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentStatus::Healthy => write!(f, "healthy"),
            ComponentStatus::Degraded => write!(f, "degraded"),
            ComponentStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    FastCache,
    SecondaryCache,
    Recovery,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::FastCache => "fast_cache",
            Component::SecondaryCache => "secondary_cache",
            Component::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: ComponentStatus,
    pub timestamp: String,
    pub uptime_seconds: f64,
    pub components: ComponentHealth,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub fast_cache: ComponentStatus,
    pub secondary_cache: ComponentStatus,
    pub recovery: ComponentStatus,
}

impl Default for ComponentHealth {
    fn default() -> Self {
        Self {
            fast_cache: ComponentStatus::Unhealthy,
            secondary_cache: ComponentStatus::Healthy,
            recovery: ComponentStatus::Healthy,
        }
    }
}

impl ComponentHealth {
    /// The fast tier and the recovery layer decide health. The secondary
    /// tier is best effort, so its failure only degrades.
    pub fn overall(&self) -> ComponentStatus {
        let secondary = match self.secondary_cache {
            ComponentStatus::Unhealthy => ComponentStatus::Degraded,
            other => other,
        };
        self.fast_cache.max(self.recovery).max(secondary)
    }
}

/// Tracks application health
pub struct HealthTracker {
    is_ready: AtomicBool,
    components: parking_lot::RwLock<ComponentHealth>,
    startup_time: std::time::Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            is_ready: AtomicBool::new(false),
            components: parking_lot::RwLock::new(ComponentHealth::default()),
            startup_time: std::time::Instant::now(),
        }
    }

    /// Mark system as ready
    pub fn mark_ready(&self) {
        self.is_ready.store(true, Ordering::SeqCst);
        tracing::info!("System marked as ready");
    }

    pub fn mark_not_ready(&self) {
        self.is_ready.store(false, Ordering::SeqCst);
        tracing::warn!("System marked as not ready");
    }

    pub fn set_component_status(&self, component: Component, status: ComponentStatus) {
        let mut components = self.components.write();
        let slot = match component {
            Component::FastCache => &mut components.fast_cache,
            Component::SecondaryCache => &mut components.secondary_cache,
            Component::Recovery => &mut components.recovery,
        };
        if *slot != status {
            tracing::info!(component = component.as_str(), from = %slot, to = %status, "Component status changed");
        }
        *slot = status;
    }

    pub fn get_status(&self) -> HealthStatus {
        let components = self.components.read().clone();
        let status = components.overall();
        let message = match status {
            ComponentStatus::Healthy => None,
            _ => Some(describe(&components)),
        };

        HealthStatus {
            status,
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: self.startup_time.elapsed().as_secs_f64(),
            components,
            message,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(components: &ComponentHealth) -> String {
    [
        (Component::FastCache, components.fast_cache),
        (Component::SecondaryCache, components.secondary_cache),
        (Component::Recovery, components.recovery),
    ]
    .iter()
    .filter(|(_, s)| *s != ComponentStatus::Healthy)
    .map(|(c, s)| format!("{} {}", c.as_str(), s))
    .collect::<Vec<_>>()
    .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_tracker_creation() {
        let tracker = HealthTracker::new();
        assert!(!tracker.is_ready());
        // fast tier has not been probed yet
        assert_eq!(tracker.get_status().status, ComponentStatus::Unhealthy);
    }

    #[test]
    fn test_mark_ready() {
        let tracker = HealthTracker::new();
        tracker.mark_ready();
        assert!(tracker.is_ready());
    }

    #[test]
    fn test_overall_health_calculation() {
        let tracker = HealthTracker::new();
        tracker.set_component_status(Component::FastCache, ComponentStatus::Healthy);
        assert_eq!(tracker.get_status().status, ComponentStatus::Healthy);
        assert!(tracker.get_status().message.is_none());

        // losing Redis only degrades
        tracker.set_component_status(Component::SecondaryCache, ComponentStatus::Unhealthy);
        let status = tracker.get_status();
        assert_eq!(status.status, ComponentStatus::Degraded);
        assert_eq!(status.message.as_deref(), Some("secondary_cache unhealthy"));

        tracker.set_component_status(Component::FastCache, ComponentStatus::Unhealthy);
        assert_eq!(tracker.get_status().status, ComponentStatus::Unhealthy);
    }

    #[test]
    fn test_open_circuit_degrades() {
        let tracker = HealthTracker::new();
        tracker.set_component_status(Component::FastCache, ComponentStatus::Healthy);
        tracker.set_component_status(Component::Recovery, ComponentStatus::Degraded);
        assert_eq!(tracker.get_status().status, ComponentStatus::Degraded);
    }
}
