//! Audit trail for secret use by mapping resources

use crate::config::AuditConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    /// `namespace/name` of the mapping resource
    pub resource: String,
    pub role: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    DocumentResolved,
    DocumentWritten,
    AccessDenied,
    ResolutionFailed,
}

#[derive(Debug, Clone)]
pub struct AuditLogger {
    enabled: bool,
    log_all_access: bool,
}

impl AuditLogger {
    pub fn new(enabled: bool, log_all_access: bool) -> Self {
        Self {
            enabled,
            log_all_access,
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(config.enabled, config.log_all_access)
    }

    /// Whether `event_type` would be emitted.
    pub fn records(&self, event_type: AuditEventType) -> bool {
        if !self.enabled {
            return false;
        }
        // Unchanged resolutions happen every tick
        self.log_all_access || event_type != AuditEventType::DocumentResolved
    }

    pub fn log_event(&self, event: AuditEvent) {
        if !self.records(event.event_type) {
            return;
        }

        if event.success {
            info!(
                target: "secrets_sync::audit",
                event_type = ?event.event_type,
                resource = %event.resource,
                role = ?event.role,
                "Audit event"
            );
        } else {
            warn!(
                target: "secrets_sync::audit",
                event_type = ?event.event_type,
                resource = %event.resource,
                role = ?event.role,
                error = ?event.error_message,
                "Audit event failed"
            );
        }
    }

    pub fn resolved(&self, resource: &str, role: &str) {
        self.log_event(event(AuditEventType::DocumentResolved, resource, role, None));
    }

    pub fn written(&self, resource: &str, role: &str) {
        self.log_event(event(AuditEventType::DocumentWritten, resource, role, None));
    }

    pub fn denied(&self, resource: &str, role: &str) {
        self.log_event(event(
            AuditEventType::AccessDenied,
            resource,
            role,
            Some(format!("role '{}' not allowed in namespace", role)),
        ));
    }

    pub fn failed(&self, resource: &str, role: &str, error: &str) {
        self.log_event(event(
            AuditEventType::ResolutionFailed,
            resource,
            role,
            Some(error.to_string()),
        ));
    }
}

fn event(
    event_type: AuditEventType,
    resource: &str,
    role: &str,
    error_message: Option<String>,
) -> AuditEvent {
    AuditEvent {
        timestamp: chrono::Utc::now(),
        event_type,
        resource: resource.to_string(),
        role: (!role.is_empty()).then(|| role.to_string()),
        success: error_message.is_none(),
        error_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routine_resolution_needs_log_all_access() {
        let quiet = AuditLogger::new(true, false);
        assert!(!quiet.records(AuditEventType::DocumentResolved));
        assert!(quiet.records(AuditEventType::AccessDenied));
        assert!(quiet.records(AuditEventType::DocumentWritten));

        let verbose = AuditLogger::new(true, true);
        assert!(verbose.records(AuditEventType::DocumentResolved));

        let disabled = AuditLogger::new(false, true);
        assert!(!disabled.records(AuditEventType::AccessDenied));
    }

    #[test]
    fn test_event_without_role() {
        let e = event(AuditEventType::ResolutionFailed, "ns/a", "", Some("boom".into()));
        assert_eq!(e.role, None);
        assert!(!e.success);

        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["event_type"], "resolution_failed");
    }
}
