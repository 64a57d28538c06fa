use chrono::{DateTime, Utc};
use evintake_contracts::export::ExportStatus;
use serde::Serialize;
use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::{EvidenceLedger, LedgerError, decode_error};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRecord {
    pub export_id: String,
    pub tenant_id: String,
    pub application_id: String,
    pub format: String,
    pub include_metadata: bool,
    pub sign_package: bool,
    pub status: ExportStatus,
    pub file_count: Option<i32>,
    pub total_size_bytes: Option<i64>,
    pub storage_path: Option<String>,
    pub signature: Option<String>,
    pub error_message: Option<String>,
    pub created_by: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewExport {
    pub export_id: String,
    pub tenant_id: String,
    pub application_id: String,
    pub include_metadata: bool,
    pub sign_package: bool,
    pub created_by: String,
    pub correlation_id: String,
    pub expires_at: DateTime<Utc>,
}

const EXPORT_COLUMNS: &str = "export_id, tenant_id, application_id, format, include_metadata, sign_package, status, file_count, total_size_bytes, storage_path, signature, error_message, created_by, correlation_id, created_at, completed_at, expires_at";

fn export_from_row(row: &PgRow) -> Result<ExportRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = ExportStatus::parse(&status)
        .ok_or_else(|| decode_error(format!("unknown export status `{}`", status)))?;

    Ok(ExportRecord {
        export_id: row.try_get("export_id")?,
        tenant_id: row.try_get("tenant_id")?,
        application_id: row.try_get("application_id")?,
        format: row.try_get("format")?,
        include_metadata: row.try_get("include_metadata")?,
        sign_package: row.try_get("sign_package")?,
        status,
        file_count: row.try_get("file_count")?,
        total_size_bytes: row.try_get("total_size_bytes")?,
        storage_path: row.try_get("storage_path")?,
        signature: row.try_get("signature")?,
        error_message: row.try_get("error_message")?,
        created_by: row.try_get("created_by")?,
        correlation_id: row.try_get("correlation_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

impl EvidenceLedger {
    pub async fn create_export(&self, export: &NewExport) -> Result<ExportRecord, LedgerError> {
        let sql = format!(
            "INSERT INTO evintake_exports (export_id, tenant_id, application_id, include_metadata, sign_package, status, created_by, correlation_id, expires_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) RETURNING {EXPORT_COLUMNS}"
        );
        self.bounded(async {
            let row = sqlx::query(&sql)
                .bind(&export.export_id)
                .bind(&export.tenant_id)
                .bind(&export.application_id)
                .bind(export.include_metadata)
                .bind(export.sign_package)
                .bind(ExportStatus::Pending.as_str())
                .bind(&export.created_by)
                .bind(&export.correlation_id)
                .bind(export.expires_at)
                .fetch_one(self.pool())
                .await?;
            export_from_row(&row)
        })
        .await
    }

    pub async fn mark_export_processing(&self, export_id: &str) -> Result<(), LedgerError> {
        self.set_export_status(export_id, ExportStatus::Pending, ExportStatus::Processing)
            .await
    }

    pub async fn complete_export(
        &self,
        export_id: &str,
        file_count: i32,
        total_size_bytes: i64,
        storage_path: &str,
        signature: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.bounded(async {
            let result = sqlx::query(
                "UPDATE evintake_exports SET status = $2, file_count = $3, total_size_bytes = $4, storage_path = $5, signature = $6, completed_at = now() WHERE export_id = $1 AND status = $7",
            )
            .bind(export_id)
            .bind(ExportStatus::Completed.as_str())
            .bind(file_count)
            .bind(total_size_bytes)
            .bind(storage_path)
            .bind(signature)
            .bind(ExportStatus::Processing.as_str())
            .execute(self.pool())
            .await?;
            if result.rows_affected() == 0 {
                return Err(sqlx::Error::RowNotFound);
            }
            Ok::<(), sqlx::Error>(())
        })
        .await
    }

    /// Any non-terminal export can fail.
    pub async fn fail_export(&self, export_id: &str, error_message: &str) -> Result<(), LedgerError> {
        self.bounded(async {
            sqlx::query(
                "UPDATE evintake_exports SET status = $2, error_message = $3, completed_at = now() WHERE export_id = $1 AND status IN ('pending', 'processing')",
            )
            .bind(export_id)
            .bind(ExportStatus::Failed.as_str())
            .bind(error_message)
            .execute(self.pool())
            .await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
    }

    async fn set_export_status(
        &self,
        export_id: &str,
        from: ExportStatus,
        to: ExportStatus,
    ) -> Result<(), LedgerError> {
        self.bounded(async {
            let result = sqlx::query(
                "UPDATE evintake_exports SET status = $3 WHERE export_id = $1 AND status = $2",
            )
            .bind(export_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(self.pool())
            .await?;
            if result.rows_affected() == 0 {
                return Err(sqlx::Error::RowNotFound);
            }
            Ok::<(), sqlx::Error>(())
        })
        .await
    }

    pub async fn get_export(
        &self,
        tenant_id: &str,
        export_id: &str,
    ) -> Result<Option<ExportRecord>, LedgerError> {
        let sql = format!(
            "SELECT {EXPORT_COLUMNS} FROM evintake_exports WHERE tenant_id = $1 AND export_id = $2"
        );
        self.bounded(async {
            let row = sqlx::query(&sql)
                .bind(tenant_id)
                .bind(export_id)
                .fetch_optional(self.pool())
                .await?;
            row.as_ref().map(export_from_row).transpose()
        })
        .await
    }

    pub async fn list_exports(
        &self,
        tenant_id: &str,
        application_id: Option<&str>,
    ) -> Result<Vec<ExportRecord>, LedgerError> {
        let sql = format!(
            "SELECT {EXPORT_COLUMNS} FROM evintake_exports WHERE tenant_id = $1 AND ($2::text IS NULL OR application_id = $2) ORDER BY created_at DESC, export_id DESC LIMIT 100"
        );
        self.bounded(async {
            let rows = sqlx::query(&sql)
                .bind(tenant_id)
                .bind(application_id)
                .fetch_all(self.pool())
                .await?;
            rows.iter()
                .map(export_from_row)
                .collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }
}
