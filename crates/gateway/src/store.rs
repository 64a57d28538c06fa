use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evintake_ledger::{AuditEntry, EvidenceLedger, EvidenceRecord, LedgerError};

/// The persistence calls the upload pipeline and the audit helper make.
/// Implemented by [`EvidenceLedger`]; tests substitute an in-memory store.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn cached_response(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, LedgerError>;

    async fn cache_response(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        response_json: &str,
    ) -> Result<(), LedgerError>;

    async fn evidence_exists(&self, tenant_id: &str, evidence_id: &str)
    -> Result<bool, LedgerError>;

    async fn find_recent_by_hash(
        &self,
        tenant_id: &str,
        sha256_hash_server: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<String>, LedgerError>;

    /// Writes the evidence row and its success audit entry atomically.
    async fn insert_evidence(
        &self,
        record: &EvidenceRecord,
        audit: &AuditEntry,
    ) -> Result<(), LedgerError>;

    async fn storage_references(&self, storage_path: &str) -> Result<i64, LedgerError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<String, LedgerError>;
}

#[async_trait]
impl EvidenceStore for EvidenceLedger {
    async fn cached_response(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, LedgerError> {
        self.get_idempotent_response(tenant_id, idempotency_key)
            .await
    }

    async fn cache_response(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        response_json: &str,
    ) -> Result<(), LedgerError> {
        self.put_idempotent_response(tenant_id, idempotency_key, response_json)
            .await
    }

    async fn evidence_exists(
        &self,
        tenant_id: &str,
        evidence_id: &str,
    ) -> Result<bool, LedgerError> {
        EvidenceLedger::evidence_exists(self, tenant_id, evidence_id).await
    }

    async fn find_recent_by_hash(
        &self,
        tenant_id: &str,
        sha256_hash_server: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<String>, LedgerError> {
        EvidenceLedger::find_recent_by_hash(self, tenant_id, sha256_hash_server, since).await
    }

    async fn insert_evidence(
        &self,
        record: &EvidenceRecord,
        audit: &AuditEntry,
    ) -> Result<(), LedgerError> {
        self.insert_evidence_with_audit(record, audit).await
    }

    async fn storage_references(&self, storage_path: &str) -> Result<i64, LedgerError> {
        self.count_storage_references(storage_path).await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<String, LedgerError> {
        EvidenceLedger::append_audit(self, entry).await
    }
}
