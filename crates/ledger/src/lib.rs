use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use evintake_contracts::AuditResult;
use serde::Serialize;
use sqlx::Row;
use sqlx::postgres::{PgPoolOptions, PgRow};
use ulid::Ulid;

mod applications;
mod exports;

pub use applications::{ApplicationRecord, ApplicationPage, FactRecord, NewApplication};
pub use exports::{ExportRecord, NewExport};

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    /// A unique constraint rejected the write; carries the constraint name.
    UniqueViolation(String),
    NotFound,
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "ledger operation timed out"),
            LedgerError::UniqueViolation(constraint) => {
                write!(f, "ledger unique constraint violated: {}", constraint)
            }
            LedgerError::NotFound => write!(f, "ledger row not found"),
            LedgerError::Sqlx(err) => write!(f, "ledger sql error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &value
            && db_err.is_unique_violation()
        {
            return LedgerError::UniqueViolation(db_err.constraint().unwrap_or("").to_string());
        }
        if matches!(value, sqlx::Error::RowNotFound) {
            return LedgerError::NotFound;
        }
        LedgerError::Sqlx(value)
    }
}

pub(crate) fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

/// One row of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub correlation_id: String,
    pub tenant_id: String,
    pub actor_id: String,
    pub actor_role: String,
    pub action: &'static str,
    pub resource_type: &'static str,
    pub resource_id: String,
    pub result: AuditResult,
    pub metadata: serde_json::Value,
}

/// A persisted evidence upload. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceRecord {
    pub tenant_id: String,
    pub evidence_id: String,
    pub application_id: String,
    pub evidence_type: String,
    pub mime_type: String,
    pub mime_type_detected: String,
    pub file_size_bytes: i64,
    pub sha256_hash_device: String,
    pub sha256_hash_server: String,
    pub captured_at_device: DateTime<Utc>,
    pub captured_at_server: DateTime<Utc>,
    pub time_drift_seconds: f64,
    pub gps_latitude: f64,
    pub gps_longitude: f64,
    pub gps_accuracy_meters: f64,
    pub exif_present: bool,
    pub exif_data: Option<serde_json::Value>,
    pub exif_gps_latitude: Option<f64>,
    pub exif_gps_longitude: Option<f64>,
    pub exif_datetime: Option<DateTime<Utc>>,
    pub uploader_id: String,
    pub uploader_role: String,
    pub storage_path: String,
    pub integrity_passed: bool,
    pub integrity_issues: Vec<String>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

const EVIDENCE_COLUMNS: &str = "tenant_id, evidence_id, application_id, evidence_type, mime_type, mime_type_detected, file_size_bytes, sha256_hash_device, sha256_hash_server, captured_at_device, captured_at_server, time_drift_seconds, gps_latitude, gps_longitude, gps_accuracy_meters, exif_present, exif_data, exif_gps_latitude, exif_gps_longitude, exif_datetime, uploader_id, uploader_role, storage_path, integrity_passed, integrity_issues, correlation_id, created_at";

fn evidence_from_row(row: &PgRow) -> Result<EvidenceRecord, sqlx::Error> {
    let issues: serde_json::Value = row.try_get("integrity_issues")?;
    let integrity_issues = serde_json::from_value::<Vec<String>>(issues)
        .map_err(|e| decode_error(format!("integrity_issues: {}", e)))?;

    Ok(EvidenceRecord {
        tenant_id: row.try_get("tenant_id")?,
        evidence_id: row.try_get("evidence_id")?,
        application_id: row.try_get("application_id")?,
        evidence_type: row.try_get("evidence_type")?,
        mime_type: row.try_get("mime_type")?,
        mime_type_detected: row.try_get("mime_type_detected")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        sha256_hash_device: row.try_get("sha256_hash_device")?,
        sha256_hash_server: row.try_get("sha256_hash_server")?,
        captured_at_device: row.try_get("captured_at_device")?,
        captured_at_server: row.try_get("captured_at_server")?,
        time_drift_seconds: row.try_get("time_drift_seconds")?,
        gps_latitude: row.try_get("gps_latitude")?,
        gps_longitude: row.try_get("gps_longitude")?,
        gps_accuracy_meters: row.try_get("gps_accuracy_meters")?,
        exif_present: row.try_get("exif_present")?,
        exif_data: row.try_get("exif_data")?,
        exif_gps_latitude: row.try_get("exif_gps_latitude")?,
        exif_gps_longitude: row.try_get("exif_gps_longitude")?,
        exif_datetime: row.try_get("exif_datetime")?,
        uploader_id: row.try_get("uploader_id")?,
        uploader_role: row.try_get("uploader_role")?,
        storage_path: row.try_get("storage_path")?,
        integrity_passed: row.try_get("integrity_passed")?,
        integrity_issues,
        correlation_id: row.try_get("correlation_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct EvidenceLedger {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl EvidenceLedger {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let ledger = Self::connect(db_url, write_timeout).await?;
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), LedgerError> {
        self.bounded(async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
    }

    pub(crate) fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    /// Runs one store call under the configured write timeout.
    pub(crate) async fn bounded<T, F>(&self, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        Ok(tokio::time::timeout(self.write_timeout, fut)
            .await
            .map_err(|_| LedgerError::Timeout)??)
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<String, LedgerError> {
        let audit_id = Ulid::new().to_string();

        self.bounded(async {
            insert_audit(&self.pool, &audit_id, entry).await?;
            Ok::<(), sqlx::Error>(())
        })
        .await?;

        Ok(audit_id)
    }

    pub async fn evidence_exists(
        &self,
        tenant_id: &str,
        evidence_id: &str,
    ) -> Result<bool, LedgerError> {
        self.bounded(async {
            let row = sqlx::query(
                "SELECT EXISTS (SELECT 1 FROM evintake_evidence WHERE tenant_id = $1 AND evidence_id = $2) AS present",
            )
            .bind(tenant_id)
            .bind(evidence_id)
            .fetch_one(&self.pool)
            .await?;
            row.try_get::<bool, _>("present")
        })
        .await
    }

    /// Most recent evidence id in this tenant carrying `sha256_hash_server`
    /// and created at or after `since`.
    pub async fn find_recent_by_hash(
        &self,
        tenant_id: &str,
        sha256_hash_server: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<String>, LedgerError> {
        self.bounded(async {
            let row = sqlx::query(
                "SELECT evidence_id FROM evintake_evidence WHERE tenant_id = $1 AND sha256_hash_server = $2 AND created_at >= $3 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(tenant_id)
            .bind(sha256_hash_server)
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|r| r.try_get::<String, _>("evidence_id")).transpose()
        })
        .await
    }

    /// Inserts the evidence row and its success audit entry atomically. The
    /// `(tenant_id, evidence_id)` primary key settles concurrent uploads of the
    /// same id: the loser gets [`LedgerError::UniqueViolation`].
    pub async fn insert_evidence_with_audit(
        &self,
        record: &EvidenceRecord,
        audit: &AuditEntry,
    ) -> Result<(), LedgerError> {
        let issues_json = serde_json::to_value(&record.integrity_issues)
            .unwrap_or_else(|_| serde_json::json!([]));
        let audit_id = Ulid::new().to_string();

        self.bounded(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO evintake_evidence (tenant_id, evidence_id, application_id, evidence_type, mime_type, mime_type_detected, file_size_bytes, sha256_hash_device, sha256_hash_server, captured_at_device, captured_at_server, time_drift_seconds, gps_latitude, gps_longitude, gps_accuracy_meters, exif_present, exif_data, exif_gps_latitude, exif_gps_longitude, exif_datetime, uploader_id, uploader_role, storage_path, integrity_passed, integrity_issues, correlation_id, created_at, updated_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25,$26,$27,$27)",
            )
            .bind(&record.tenant_id)
            .bind(&record.evidence_id)
            .bind(&record.application_id)
            .bind(&record.evidence_type)
            .bind(&record.mime_type)
            .bind(&record.mime_type_detected)
            .bind(record.file_size_bytes)
            .bind(&record.sha256_hash_device)
            .bind(&record.sha256_hash_server)
            .bind(record.captured_at_device)
            .bind(record.captured_at_server)
            .bind(record.time_drift_seconds)
            .bind(record.gps_latitude)
            .bind(record.gps_longitude)
            .bind(record.gps_accuracy_meters)
            .bind(record.exif_present)
            .bind(&record.exif_data)
            .bind(record.exif_gps_latitude)
            .bind(record.exif_gps_longitude)
            .bind(record.exif_datetime)
            .bind(&record.uploader_id)
            .bind(&record.uploader_role)
            .bind(&record.storage_path)
            .bind(record.integrity_passed)
            .bind(&issues_json)
            .bind(&record.correlation_id)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;

            insert_audit(&mut *tx, &audit_id, audit).await?;

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
    }

    pub async fn get_evidence(
        &self,
        tenant_id: &str,
        evidence_id: &str,
    ) -> Result<Option<EvidenceRecord>, LedgerError> {
        let sql = format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evintake_evidence WHERE tenant_id = $1 AND evidence_id = $2"
        );
        self.bounded(async {
            let row = sqlx::query(&sql)
                .bind(tenant_id)
                .bind(evidence_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(evidence_from_row).transpose()
        })
        .await
    }

    pub async fn list_evidence_for_application(
        &self,
        tenant_id: &str,
        application_id: &str,
    ) -> Result<Vec<EvidenceRecord>, LedgerError> {
        let sql = format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evintake_evidence WHERE tenant_id = $1 AND application_id = $2 ORDER BY created_at ASC, evidence_id ASC"
        );
        self.bounded(async {
            let rows = sqlx::query(&sql)
                .bind(tenant_id)
                .bind(application_id)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(evidence_from_row).collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    /// How many evidence rows (any tenant) point at a storage path.
    pub async fn count_storage_references(&self, storage_path: &str) -> Result<i64, LedgerError> {
        self.bounded(async {
            let row = sqlx::query(
                "SELECT COUNT(*) AS refs FROM evintake_evidence WHERE storage_path = $1",
            )
            .bind(storage_path)
            .fetch_one(&self.pool)
            .await?;
            row.try_get::<i64, _>("refs")
        })
        .await
    }

    pub async fn get_idempotent_response(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, LedgerError> {
        self.bounded(async {
            let row = sqlx::query(
                "SELECT response_json FROM evintake_idempotency_cache WHERE tenant_id = $1 AND idempotency_key = $2",
            )
            .bind(tenant_id)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|r| r.try_get::<String, _>("response_json"))
                .transpose()
        })
        .await
    }

    /// First writer wins; a later write under the same key is ignored.
    pub async fn put_idempotent_response(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        response_json: &str,
    ) -> Result<(), LedgerError> {
        self.bounded(async {
            sqlx::query(
                "INSERT INTO evintake_idempotency_cache (tenant_id, idempotency_key, response_json) VALUES ($1, $2, $3) ON CONFLICT (tenant_id, idempotency_key) DO NOTHING",
            )
            .bind(tenant_id)
            .bind(idempotency_key)
            .bind(response_json)
            .execute(&self.pool)
            .await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
    }

    pub async fn sweep_idempotency(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        self.bounded(async {
            let result =
                sqlx::query("DELETE FROM evintake_idempotency_cache WHERE created_at < $1")
                    .bind(older_than)
                    .execute(&self.pool)
                    .await?;
            Ok::<u64, sqlx::Error>(result.rows_affected())
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_audit<'e, E>(executor: E, audit_id: &str, entry: &AuditEntry) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO evintake_audit_log (audit_id, correlation_id, tenant_id, actor_id, actor_role, action, resource_type, resource_id, result, metadata) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
    )
    .bind(audit_id)
    .bind(&entry.correlation_id)
    .bind(&entry.tenant_id)
    .bind(&entry.actor_id)
    .bind(&entry.actor_role)
    .bind(entry.action)
    .bind(entry.resource_type)
    .bind(&entry.resource_id)
    .bind(entry.result.as_str())
    .bind(&entry.metadata)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn migrate_url(db_url: &str) -> Result<(), sqlx::Error> {
    let pool = sqlx::PgPool::connect(db_url).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}
