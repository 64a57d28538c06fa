use evintake_auth::Principal;
use evintake_contracts::AuditResult;
use evintake_ledger::AuditEntry;

use crate::store::EvidenceStore;

pub const ACTION_EVIDENCE_UPLOAD: &str = "evidence.upload";
pub const ACTION_FACT_UPSERT: &str = "fact.upsert";
pub const ACTION_FACT_DELETE: &str = "fact.delete";
pub const ACTION_APPLICATION_CREATE: &str = "application.create";
pub const ACTION_APPLICATION_STATUS_CHANGE: &str = "application.status_change";
pub const ACTION_EVALUATION_RUN: &str = "evaluation.run";
pub const ACTION_EXPORT_CREATE: &str = "export.create";
pub const ACTION_EXPORT_DOWNLOAD: &str = "export.download";

/// Who an audit entry is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub tenant_id: String,
    pub actor_id: String,
    pub actor_role: String,
}

impl Actor {
    /// Used before a caller has been identified.
    pub fn anonymous() -> Self {
        Self {
            tenant_id: "unknown".to_string(),
            actor_id: "anonymous".to_string(),
            actor_role: "none".to_string(),
        }
    }

    pub fn entry(
        &self,
        correlation_id: &str,
        action: &'static str,
        resource_type: &'static str,
        resource_id: impl Into<String>,
        result: AuditResult,
        metadata: serde_json::Value,
    ) -> AuditEntry {
        AuditEntry {
            correlation_id: correlation_id.to_string(),
            tenant_id: self.tenant_id.clone(),
            actor_id: self.actor_id.clone(),
            actor_role: self.actor_role.clone(),
            action,
            resource_type,
            resource_id: resource_id.into(),
            result,
            metadata,
        }
    }
}

impl From<&Principal> for Actor {
    fn from(principal: &Principal) -> Self {
        Self {
            tenant_id: principal.tenant_id.clone(),
            actor_id: principal.user_id.clone(),
            actor_role: principal.role.as_str().to_string(),
        }
    }
}

pub fn trace(entry: &AuditEntry) {
    tracing::info!(
        target: "audit",
        correlation_id = %entry.correlation_id,
        tenant_id = %entry.tenant_id,
        actor_id = %entry.actor_id,
        actor_role = %entry.actor_role,
        action = entry.action,
        resource_type = entry.resource_type,
        resource_id = %entry.resource_id,
        result = entry.result.as_str(),
        metadata = %entry.metadata,
        "audit"
    );
}

/// Mirrors the entry to tracing and appends it. A failed append is logged and
/// never reaches the caller.
pub async fn record(store: &dyn EvidenceStore, entry: AuditEntry) {
    trace(&entry);
    if let Err(err) = store.append_audit(&entry).await {
        tracing::warn!(
            correlation_id = %entry.correlation_id,
            action = entry.action,
            error = %err,
            "audit.append_failed"
        );
    }
}
