//! Audit trail for operator-relevant orbiter events.
//!
//! Events are emitted through `tracing` with `target: "audit"` so they can be
//! routed separately from diagnostic logs by the subscriber's filter.

use std::sync::Arc;

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Audit,
    Info,
    Warn,
    Error,
    Debug,
}

/// Orbiter specific audit logger
#[derive(Debug)]
pub struct OrbiterAuditLogger {
    component: String,
    enabled: bool,
}

impl OrbiterAuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            enabled: true,
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            component: String::new(),
            enabled: false,
        }
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>, object_ids: &[&str]) {
        if !self.enabled {
            return;
        }
        let message = message.as_ref();
        match level {
            LogLevel::Error => {
                tracing::error!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Audit | LogLevel::Info => {
                tracing::info!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
        }
    }

    // Machine events
    pub fn machine_created(&self, pool: &str, machine_id: &str) {
        self.log(
            LogLevel::Audit,
            format!("Machine created: {} in pool {}", machine_id, pool),
            &[machine_id],
        );
    }

    pub fn machine_removed(&self, pool: &str, machine_id: &str) {
        self.log(
            LogLevel::Audit,
            format!("Machine removed: {} from pool {}", machine_id, pool),
            &[machine_id],
        );
    }

    pub fn machine_replaced(&self, old_id: &str, new_id: &str) {
        self.log(
            LogLevel::Audit,
            format!("Machine replaced: {} by {}", old_id, new_id),
            &[old_id, new_id],
        );
    }

    pub fn machine_rebooted(&self, machine_id: &str) {
        self.log(
            LogLevel::Audit,
            format!("Machine rebooted: {}", machine_id),
            &[machine_id],
        );
    }

    pub fn rollback(&self, pool: &str, machine_id: &str) {
        self.log(
            LogLevel::Warn,
            format!("Rolled back machine {} in pool {}", machine_id, pool),
            &[machine_id],
        );
    }

    pub fn requirement_changed(&self, machine_id: &str, what: &str) {
        self.log(
            LogLevel::Audit,
            format!("Requirement changed for {}: {}", machine_id, what),
            &[machine_id],
        );
    }

    // Cluster events
    pub fn cluster_initialized(&self, cluster_id: &str, first_node: &str) {
        self.log(
            LogLevel::Audit,
            format!("Cluster initialized: {} on {}", cluster_id, first_node),
            &[cluster_id, first_node],
        );
    }

    pub fn node_joined(&self, cluster_id: &str, node: &str) {
        self.log(
            LogLevel::Audit,
            format!("Node joined cluster {}: {}", cluster_id, node),
            &[cluster_id, node],
        );
    }

    pub fn node_deleted(&self, cluster_id: &str, node: &str) {
        self.log(
            LogLevel::Audit,
            format!("Node deleted from cluster {}: {}", cluster_id, node),
            &[cluster_id, node],
        );
    }

    pub fn upgrade_step(&self, machine_id: &str, from: &str, to: &str) {
        self.log(
            LogLevel::Audit,
            format!("Upgrading {} from {} to {}", machine_id, from, to),
            &[machine_id],
        );
    }

    // Orb events
    pub fn migrated(&self, kind: &str) {
        self.log(
            LogLevel::Info,
            format!("Desired state migrated: {}", kind),
            &[],
        );
    }

    pub fn orb_destroyed(&self, orb_id: &str) {
        self.log(LogLevel::Audit, format!("Orb destroyed: {}", orb_id), &[orb_id]);
    }
}

pub fn create_audit_logger(component: &str) -> Arc<OrbiterAuditLogger> {
    Arc::new(OrbiterAuditLogger::new(component))
}
