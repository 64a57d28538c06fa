use chrono::{DateTime, Utc};
use evintake_contracts::decision::{ApplicationStatus, DecisionSnapshot, Recommendation, TriggerType};
use evintake_contracts::facts::{FactEntry, FactType, FactsSnapshot, ValidatedFact};
use evintake_evaluation::snapshot::SnapshotDraft;
use evintake_evaluation::status::StatusStamp;
use serde::Serialize;
use sqlx::Row;
use sqlx::postgres::PgRow;
use ulid::Ulid;

use crate::{EvidenceLedger, LedgerError, decode_error};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationRecord {
    pub application_id: String,
    pub tenant_id: String,
    pub applicant_id: String,
    pub application_type: String,
    pub business_name: Option<String>,
    pub business_address: Option<String>,
    pub status: ApplicationStatus,
    pub latest_snapshot_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewApplication {
    pub tenant_id: String,
    pub applicant_id: String,
    pub application_type: String,
    pub business_name: Option<String>,
    pub business_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationPage {
    pub items: Vec<ApplicationRecord>,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactRecord {
    pub fact_id: String,
    pub application_id: String,
    pub fact_name: String,
    pub fact_type: FactType,
    pub fact_value: serde_json::Value,
    pub supporting_evidence_id: Option<String>,
    pub extractor_id: Option<String>,
    pub extraction_confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const APPLICATION_COLUMNS: &str = "application_id, tenant_id, applicant_id, application_type, business_name, business_address, status, latest_snapshot_id, created_at, updated_at, submitted_at, reviewed_at, decided_at";

const FACT_COLUMNS: &str = "fact_id, application_id, fact_name, fact_type, fact_value, supporting_evidence_id, extractor_id, extraction_confidence, created_at, updated_at";

const SNAPSHOT_COLUMNS: &str = "snapshot_id, application_id, snapshot_version, trigger_type, trigger_metadata, facts_snapshot, rule_outcomes, overall_recommendation, snapshot_hash, signature, created_at";

fn application_from_row(row: &PgRow) -> Result<ApplicationRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = ApplicationStatus::parse(&status)
        .ok_or_else(|| decode_error(format!("unknown application status `{}`", status)))?;

    Ok(ApplicationRecord {
        application_id: row.try_get("application_id")?,
        tenant_id: row.try_get("tenant_id")?,
        applicant_id: row.try_get("applicant_id")?,
        application_type: row.try_get("application_type")?,
        business_name: row.try_get("business_name")?,
        business_address: row.try_get("business_address")?,
        status,
        latest_snapshot_id: row.try_get("latest_snapshot_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        submitted_at: row.try_get("submitted_at")?,
        reviewed_at: row.try_get("reviewed_at")?,
        decided_at: row.try_get("decided_at")?,
    })
}

fn fact_from_row(row: &PgRow) -> Result<FactRecord, sqlx::Error> {
    let fact_type: String = row.try_get("fact_type")?;
    let fact_type = FactType::parse(&fact_type)
        .ok_or_else(|| decode_error(format!("unknown fact type `{}`", fact_type)))?;

    Ok(FactRecord {
        fact_id: row.try_get("fact_id")?,
        application_id: row.try_get("application_id")?,
        fact_name: row.try_get("fact_name")?,
        fact_type,
        fact_value: row.try_get("fact_value")?,
        supporting_evidence_id: row.try_get("supporting_evidence_id")?,
        extractor_id: row.try_get("extractor_id")?,
        extraction_confidence: row.try_get("extraction_confidence")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<DecisionSnapshot, sqlx::Error> {
    let trigger_type: String = row.try_get("trigger_type")?;
    let trigger_type = TriggerType::parse(&trigger_type)
        .ok_or_else(|| decode_error(format!("unknown trigger type `{}`", trigger_type)))?;
    let recommendation: String = row.try_get("overall_recommendation")?;
    let overall_recommendation = Recommendation::parse(&recommendation)
        .ok_or_else(|| decode_error(format!("unknown recommendation `{}`", recommendation)))?;

    let facts_snapshot = serde_json::from_value(row.try_get("facts_snapshot")?)
        .map_err(|e| decode_error(format!("facts_snapshot: {}", e)))?;
    let rule_outcomes = serde_json::from_value(row.try_get("rule_outcomes")?)
        .map_err(|e| decode_error(format!("rule_outcomes: {}", e)))?;

    Ok(DecisionSnapshot {
        snapshot_id: row.try_get("snapshot_id")?,
        application_id: row.try_get("application_id")?,
        snapshot_version: row.try_get("snapshot_version")?,
        trigger_type,
        trigger_metadata: row.try_get("trigger_metadata")?,
        facts_snapshot,
        rule_outcomes,
        overall_recommendation,
        snapshot_hash: row.try_get("snapshot_hash")?,
        signature: row.try_get("signature")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Flattens stored facts into the mapping rules evaluate and snapshots hash.
pub(crate) fn facts_snapshot_from(facts: &[FactRecord]) -> FactsSnapshot {
    facts
        .iter()
        .map(|fact| {
            (
                fact.fact_name.clone(),
                FactEntry {
                    value: fact.fact_value.clone(),
                    fact_type: fact.fact_type,
                    supporting_evidence_id: fact.supporting_evidence_id.clone(),
                    confidence: fact.extraction_confidence,
                },
            )
        })
        .collect()
}

impl EvidenceLedger {
    pub async fn create_application(
        &self,
        application: &NewApplication,
    ) -> Result<ApplicationRecord, LedgerError> {
        let application_id = format!("app_{}", Ulid::new());
        let sql = format!(
            "INSERT INTO evintake_applications (application_id, tenant_id, applicant_id, application_type, business_name, business_address, status) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {APPLICATION_COLUMNS}"
        );

        self.bounded(async {
            let row = sqlx::query(&sql)
                .bind(&application_id)
                .bind(&application.tenant_id)
                .bind(&application.applicant_id)
                .bind(&application.application_type)
                .bind(&application.business_name)
                .bind(&application.business_address)
                .bind(ApplicationStatus::Draft.as_str())
                .fetch_one(self.pool())
                .await?;
            application_from_row(&row)
        })
        .await
    }

    /// Unscoped lookup; callers compare `tenant_id` themselves.
    pub async fn get_application(
        &self,
        application_id: &str,
    ) -> Result<Option<ApplicationRecord>, LedgerError> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM evintake_applications WHERE application_id = $1"
        );
        self.bounded(async {
            let row = sqlx::query(&sql)
                .bind(application_id)
                .fetch_optional(self.pool())
                .await?;
            row.as_ref().map(application_from_row).transpose()
        })
        .await
    }

    pub async fn list_applications(
        &self,
        tenant_id: &str,
        status: Option<ApplicationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<ApplicationPage, LedgerError> {
        let status = status.map(|s| s.as_str());
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM evintake_applications WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2) ORDER BY created_at DESC, application_id DESC LIMIT $3 OFFSET $4"
        );

        self.bounded(async {
            let total_row = sqlx::query(
                "SELECT COUNT(*) AS total FROM evintake_applications WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)",
            )
            .bind(tenant_id)
            .bind(status)
            .fetch_one(self.pool())
            .await?;
            let total: i64 = total_row.try_get("total")?;

            let rows = sqlx::query(&sql)
                .bind(tenant_id)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?;
            let items = rows
                .iter()
                .map(application_from_row)
                .collect::<Result<Vec<_>, _>>()?;

            Ok::<ApplicationPage, sqlx::Error>(ApplicationPage { items, total })
        })
        .await
    }

    /// Compare-and-set on `status`. Returns `None` when the row is no longer in
    /// `from` (a concurrent transition won).
    pub async fn update_application_status(
        &self,
        application_id: &str,
        from: ApplicationStatus,
        to: ApplicationStatus,
        stamp: StatusStamp,
    ) -> Result<Option<ApplicationRecord>, LedgerError> {
        let stamp_column = match stamp {
            StatusStamp::Submitted => ", submitted_at = now()",
            StatusStamp::Reviewed => ", reviewed_at = now()",
            StatusStamp::Decided => ", decided_at = now()",
            StatusStamp::Nothing => "",
        };
        let sql = format!(
            "UPDATE evintake_applications SET status = $3, updated_at = now(){stamp_column} WHERE application_id = $1 AND status = $2 RETURNING {APPLICATION_COLUMNS}"
        );

        self.bounded(async {
            let row = sqlx::query(&sql)
                .bind(application_id)
                .bind(from.as_str())
                .bind(to.as_str())
                .fetch_optional(self.pool())
                .await?;
            row.as_ref().map(application_from_row).transpose()
        })
        .await
    }

    /// Upserts every fact in one transaction; the `(application_id, fact_name)`
    /// constraint makes concurrent writers last-write-wins.
    pub async fn upsert_facts(
        &self,
        application_id: &str,
        facts: &[ValidatedFact],
    ) -> Result<Vec<FactRecord>, LedgerError> {
        let sql = format!(
            "INSERT INTO evintake_application_facts (fact_id, application_id, fact_name, fact_type, fact_value, supporting_evidence_id, extractor_id, extraction_confidence) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (application_id, fact_name) DO UPDATE SET fact_type = EXCLUDED.fact_type, fact_value = EXCLUDED.fact_value, supporting_evidence_id = EXCLUDED.supporting_evidence_id, extractor_id = EXCLUDED.extractor_id, extraction_confidence = EXCLUDED.extraction_confidence, updated_at = now() RETURNING {FACT_COLUMNS}"
        );

        self.bounded(async {
            let mut tx = self.pool().begin().await?;
            let mut stored = Vec::with_capacity(facts.len());

            for fact in facts {
                let row = sqlx::query(&sql)
                    .bind(format!("fact_{}", Ulid::new()))
                    .bind(application_id)
                    .bind(&fact.fact_name)
                    .bind(fact.value.fact_type().as_str())
                    .bind(fact.value.to_json())
                    .bind(&fact.supporting_evidence_id)
                    .bind(&fact.extractor_id)
                    .bind(fact.extraction_confidence)
                    .fetch_one(&mut *tx)
                    .await?;
                stored.push(fact_from_row(&row)?);
            }

            tx.commit().await?;
            Ok::<Vec<FactRecord>, sqlx::Error>(stored)
        })
        .await
    }

    pub async fn list_facts(&self, application_id: &str) -> Result<Vec<FactRecord>, LedgerError> {
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM evintake_application_facts WHERE application_id = $1 ORDER BY fact_name ASC"
        );
        self.bounded(async {
            let rows = sqlx::query(&sql)
                .bind(application_id)
                .fetch_all(self.pool())
                .await?;
            rows.iter().map(fact_from_row).collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    /// `true` when a row was removed.
    pub async fn delete_fact(
        &self,
        application_id: &str,
        fact_name: &str,
    ) -> Result<bool, LedgerError> {
        self.bounded(async {
            let result = sqlx::query(
                "DELETE FROM evintake_application_facts WHERE application_id = $1 AND fact_name = $2",
            )
            .bind(application_id)
            .bind(fact_name)
            .execute(self.pool())
            .await?;
            Ok::<bool, sqlx::Error>(result.rows_affected() > 0)
        })
        .await
    }

    pub async fn load_facts_snapshot(
        &self,
        application_id: &str,
    ) -> Result<FactsSnapshot, LedgerError> {
        let facts = self.list_facts(application_id).await?;
        Ok(facts_snapshot_from(&facts))
    }

    /// Assigns the next version with an atomic increment on the application
    /// row, inserts the snapshot, and moves `latest_snapshot_id`, all in one
    /// transaction. Concurrent commits serialize on the row lock and each get
    /// a distinct, gap-free version.
    pub async fn commit_snapshot(
        &self,
        draft: SnapshotDraft,
    ) -> Result<DecisionSnapshot, LedgerError> {
        let facts_json =
            serde_json::to_value(&draft.facts_snapshot).unwrap_or_else(|_| serde_json::json!({}));
        let outcomes_json =
            serde_json::to_value(&draft.rule_outcomes).unwrap_or_else(|_| serde_json::json!([]));

        let version = self
            .bounded(async {
                let mut tx = self.pool().begin().await?;

                let row = sqlx::query(
                    "UPDATE evintake_applications SET snapshot_version_seq = snapshot_version_seq + 1 WHERE application_id = $1 RETURNING snapshot_version_seq",
                )
                .bind(&draft.application_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
                let version: i64 = row.try_get("snapshot_version_seq")?;

                sqlx::query(
                    "INSERT INTO evintake_decision_snapshots (snapshot_id, application_id, snapshot_version, trigger_type, trigger_metadata, facts_snapshot, rule_outcomes, overall_recommendation, snapshot_hash, signature, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
                )
                .bind(&draft.snapshot_id)
                .bind(&draft.application_id)
                .bind(version)
                .bind(draft.trigger_type.as_str())
                .bind(&draft.trigger_metadata)
                .bind(&facts_json)
                .bind(&outcomes_json)
                .bind(draft.overall_recommendation.as_str())
                .bind(&draft.snapshot_hash)
                .bind(&draft.signature)
                .bind(draft.created_at)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE evintake_applications SET latest_snapshot_id = $2, updated_at = now() WHERE application_id = $1",
                )
                .bind(&draft.application_id)
                .bind(&draft.snapshot_id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok::<i64, sqlx::Error>(version)
            })
            .await?;

        Ok(draft.into_snapshot(version))
    }

    pub async fn get_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<Option<DecisionSnapshot>, LedgerError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM evintake_decision_snapshots WHERE snapshot_id = $1"
        );
        self.bounded(async {
            let row = sqlx::query(&sql)
                .bind(snapshot_id)
                .fetch_optional(self.pool())
                .await?;
            row.as_ref().map(snapshot_from_row).transpose()
        })
        .await
    }

    pub async fn list_snapshots(
        &self,
        application_id: &str,
    ) -> Result<Vec<DecisionSnapshot>, LedgerError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM evintake_decision_snapshots WHERE application_id = $1 ORDER BY snapshot_version ASC"
        );
        self.bounded(async {
            let rows = sqlx::query(&sql)
                .bind(application_id)
                .fetch_all(self.pool())
                .await?;
            rows.iter().map(snapshot_from_row).collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facts_snapshot_keys_by_name_and_carries_confidence() {
        let now = Utc::now();
        let record = |name: &str, value: serde_json::Value, confidence: Option<f64>| FactRecord {
            fact_id: format!("fact_{}", name),
            application_id: "app_1".to_string(),
            fact_name: name.to_string(),
            fact_type: FactType::Number,
            fact_value: value,
            supporting_evidence_id: Some("ev-1".to_string()),
            extractor_id: None,
            extraction_confidence: confidence,
            created_at: now,
            updated_at: now,
        };

        let snapshot = facts_snapshot_from(&[
            record("seating_capacity", serde_json::json!(48), Some(0.8)),
            record("floor_area_sqm", serde_json::json!(120.5), None),
        ]);

        assert_eq!(
            snapshot.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["floor_area_sqm", "seating_capacity"]
        );
        let entry = &snapshot["seating_capacity"];
        assert_eq!(entry.value, serde_json::json!(48));
        assert_eq!(entry.confidence, Some(0.8));
        assert_eq!(entry.supporting_evidence_id.as_deref(), Some("ev-1"));
    }
}
