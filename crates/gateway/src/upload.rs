//! Evidence ingestion.
//!
//! [`UploadPipeline::run`] executes the stages in a fixed order. Each stage
//! either advances or returns an [`UploadRejection`]; the single exit in `run`
//! turns every rejection into exactly one audit entry and one metric. The only
//! exit that writes no audit row is an idempotent replay, which has no side
//! effects to record.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Multipart;
use axum::extract::multipart::Field;
use axum::http::StatusCode;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use evintake_auth::{AuthError, Principal};
use evintake_contracts::{
    AuditResult, EvidenceMetadata, EvidenceResponse, EvidenceType, EvidenceUploadRequest,
    IntegrityCheckResult,
};
use evintake_integrity::validator::drift_seconds;
use evintake_integrity::{
    ExifMetadata, FileTooLarge, HashingStream, IntegrityInput, IntegrityThresholds,
    check_content_length, extract_exif, failed_checks, global_max_size_bytes, policy_for,
    validate_integrity,
};
use evintake_ledger::{EvidenceRecord, LedgerError};

use crate::audit::{self, ACTION_EVIDENCE_UPLOAD, Actor};
use crate::config::MAX_WINDOW_DAYS;
use crate::metrics::Metrics;
use crate::problem::Problem;
use crate::storage::BlobStore;
use crate::store::EvidenceStore;

const RESOURCE_TYPE: &str = "evidence";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    Missing(&'static str),
    OutOfOrder,
    Malformed(String),
    Read(String),
}

impl std::fmt::Display for BodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyError::Missing(name) => write!(f, "multipart field `{}` is required", name),
            BodyError::OutOfOrder => {
                write!(f, "multipart field `metadata` must precede field `file`")
            }
            BodyError::Malformed(msg) => write!(f, "malformed multipart body: {}", msg),
            BodyError::Read(msg) => write!(f, "failed to read file: {}", msg),
        }
    }
}

impl std::error::Error for BodyError {}

/// The two parts of an upload request: a JSON `metadata` part, then the
/// `file` part, which is consumed chunk by chunk.
#[async_trait]
pub trait UploadBody: Send {
    async fn metadata(&mut self) -> Result<String, BodyError>;

    async fn next_file_chunk(&mut self) -> Result<Option<Bytes>, BodyError>;
}

enum BodyState<'a> {
    Fresh(&'a mut Multipart),
    AfterMetadata(&'a mut Multipart),
    File(Field<'a>),
    Done,
}

pub struct MultipartBody<'a> {
    state: BodyState<'a>,
}

impl<'a> MultipartBody<'a> {
    pub fn new(multipart: &'a mut Multipart) -> Self {
        Self {
            state: BodyState::Fresh(multipart),
        }
    }
}

#[async_trait]
impl<'a> UploadBody for MultipartBody<'a> {
    async fn metadata(&mut self) -> Result<String, BodyError> {
        let BodyState::Fresh(multipart) = std::mem::replace(&mut self.state, BodyState::Done)
        else {
            return Err(BodyError::OutOfOrder);
        };

        loop {
            let Some(field) = multipart
                .next_field()
                .await
                .map_err(|err| BodyError::Malformed(err.body_text()))?
            else {
                return Err(BodyError::Missing("metadata"));
            };

            let name = field.name().map(str::to_owned);
            match name.as_deref() {
                Some("metadata") => {
                    let text = field
                        .text()
                        .await
                        .map_err(|err| BodyError::Malformed(err.body_text()))?;
                    self.state = BodyState::AfterMetadata(multipart);
                    return Ok(text);
                }
                Some("file") => return Err(BodyError::OutOfOrder),
                _ => continue,
            }
        }
    }

    async fn next_file_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        loop {
            match std::mem::replace(&mut self.state, BodyState::Done) {
                BodyState::AfterMetadata(multipart) => {
                    let field = multipart
                        .next_field()
                        .await
                        .map_err(|err| BodyError::Malformed(err.body_text()))?;
                    match field {
                        Some(field) if field.name() == Some("file") => {
                            self.state = BodyState::File(field);
                        }
                        _ => return Err(BodyError::Missing("file")),
                    }
                }
                BodyState::File(mut field) => {
                    let chunk = field
                        .chunk()
                        .await
                        .map_err(|err| BodyError::Read(err.body_text()))?;
                    if chunk.is_some() {
                        self.state = BodyState::File(field);
                    }
                    return Ok(chunk);
                }
                BodyState::Done => return Ok(None),
                BodyState::Fresh(_) => return Err(BodyError::OutOfOrder),
            }
        }
    }
}

/// A request whose multipart framing could not be opened at all. Reading it
/// fails at the metadata stage, so the rejection is still audited.
pub struct UnreadableBody(pub String);

#[async_trait]
impl UploadBody for UnreadableBody {
    async fn metadata(&mut self) -> Result<String, BodyError> {
        Err(BodyError::Malformed(self.0.clone()))
    }

    async fn next_file_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        Err(BodyError::Malformed(self.0.clone()))
    }
}

/// Why an upload stopped. Each variant maps to one response code.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadRejection {
    AuthenticationRequired,
    AuthenticationInvalid(String),
    AuthUnavailable(String),
    FileTooLarge(FileTooLarge),
    InvalidEvidenceJson(String),
    InvalidRequest(String),
    DuplicateEvidenceId(String),
    FileReadError(String),
    DuplicateContent { original_evidence_id: String },
    IntegrityValidationFailed(Box<IntegrityCheckResult>),
    StorageUploadFailed(String),
    DatabaseWriteFailed(String),
    StoreUnavailable(String),
    Internal(String),
}

impl UploadRejection {
    pub fn code(&self) -> &'static str {
        match self {
            UploadRejection::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            UploadRejection::AuthenticationInvalid(_) => "AUTHENTICATION_INVALID",
            UploadRejection::AuthUnavailable(_) => "SERVICE_UNAVAILABLE",
            UploadRejection::FileTooLarge(_) => "FILE_TOO_LARGE",
            UploadRejection::InvalidEvidenceJson(_) => "INVALID_EVIDENCE_JSON",
            UploadRejection::InvalidRequest(_) => "INVALID_REQUEST",
            UploadRejection::DuplicateEvidenceId(_) => "DUPLICATE_EVIDENCE_ID",
            UploadRejection::FileReadError(_) => "FILE_READ_ERROR",
            UploadRejection::DuplicateContent { .. } => "DUPLICATE_CONTENT",
            UploadRejection::IntegrityValidationFailed(_) => "INTEGRITY_VALIDATION_FAILED",
            UploadRejection::StorageUploadFailed(_) => "STORAGE_UPLOAD_FAILED",
            UploadRejection::DatabaseWriteFailed(_) => "DATABASE_WRITE_FAILED",
            UploadRejection::StoreUnavailable(_) => "SERVICE_UNAVAILABLE",
            UploadRejection::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UploadRejection::AuthenticationRequired
            | UploadRejection::AuthenticationInvalid(_) => StatusCode::UNAUTHORIZED,
            UploadRejection::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            UploadRejection::InvalidEvidenceJson(_) | UploadRejection::InvalidRequest(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            UploadRejection::DuplicateEvidenceId(_) | UploadRejection::DuplicateContent { .. } => {
                StatusCode::CONFLICT
            }
            UploadRejection::IntegrityValidationFailed(_) => StatusCode::BAD_REQUEST,
            UploadRejection::AuthUnavailable(_) | UploadRejection::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            UploadRejection::FileReadError(_)
            | UploadRejection::StorageUploadFailed(_)
            | UploadRejection::DatabaseWriteFailed(_)
            | UploadRejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            UploadRejection::AuthenticationRequired => "Authentication Required",
            UploadRejection::AuthenticationInvalid(_) => "Invalid Credentials",
            UploadRejection::AuthUnavailable(_) | UploadRejection::StoreUnavailable(_) => {
                "Service Unavailable"
            }
            UploadRejection::FileTooLarge(_) => "File Size Exceeds Limit",
            UploadRejection::InvalidEvidenceJson(_) => "Invalid Evidence Metadata",
            UploadRejection::InvalidRequest(_) => "Invalid Request",
            UploadRejection::DuplicateEvidenceId(_) => "Evidence ID Already Exists",
            UploadRejection::FileReadError(_) => "Failed to Read File",
            UploadRejection::DuplicateContent { .. } => "Duplicate Content Detected",
            UploadRejection::IntegrityValidationFailed(_) => "Integrity Validation Failed",
            UploadRejection::StorageUploadFailed(_) => "Failed to Upload to Storage",
            UploadRejection::DatabaseWriteFailed(_) => "Failed to Save Evidence",
            UploadRejection::Internal(_) => "Internal Error",
        }
    }

    fn detail(&self, replay_window_days: u64) -> serde_json::Value {
        match self {
            UploadRejection::AuthenticationRequired => {
                serde_json::json!("a bearer token is required")
            }
            UploadRejection::FileTooLarge(err) => serde_json::json!(err.to_string()),
            UploadRejection::DuplicateEvidenceId(id) => {
                serde_json::json!(format!("evidence {} already exists", id))
            }
            UploadRejection::DuplicateContent {
                original_evidence_id,
            } => serde_json::json!({
                "message": format!(
                    "this file was already uploaded within {} days",
                    replay_window_days
                ),
                "original_evidence_id": original_evidence_id,
            }),
            UploadRejection::IntegrityValidationFailed(result) => {
                serde_json::json!({ "integrity_check": result })
            }
            UploadRejection::AuthenticationInvalid(msg)
            | UploadRejection::AuthUnavailable(msg)
            | UploadRejection::InvalidEvidenceJson(msg)
            | UploadRejection::InvalidRequest(msg)
            | UploadRejection::FileReadError(msg)
            | UploadRejection::StorageUploadFailed(msg)
            | UploadRejection::DatabaseWriteFailed(msg)
            | UploadRejection::StoreUnavailable(msg)
            | UploadRejection::Internal(msg) => serde_json::json!(msg),
        }
    }

    pub fn audit_result(&self) -> AuditResult {
        if self.status().is_server_error() {
            AuditResult::Failure
        } else {
            AuditResult::Rejected
        }
    }

    fn audit_metadata(&self) -> serde_json::Value {
        let reason = self.code().to_ascii_lowercase();
        match self {
            UploadRejection::FileTooLarge(err) => serde_json::json!({
                "reason": reason,
                "size": err.observed_bytes,
                "limit": err.limit_bytes,
            }),
            UploadRejection::DuplicateContent {
                original_evidence_id,
            } => serde_json::json!({
                "reason": reason,
                "original_evidence_id": original_evidence_id,
            }),
            UploadRejection::IntegrityValidationFailed(result) => serde_json::json!({
                "reason": reason,
                "failed_checks": failed_checks(result),
                "issues": result.issues,
            }),
            UploadRejection::AuthenticationRequired | UploadRejection::DuplicateEvidenceId(_) => {
                serde_json::json!({ "reason": reason })
            }
            other => serde_json::json!({
                "reason": reason,
                "detail": other.detail(0),
            }),
        }
    }

    pub fn to_problem(&self, replay_window_days: u64) -> Problem {
        Problem::new(
            self.status(),
            self.code(),
            self.title(),
            self.detail(replay_window_days),
        )
    }
}

/// Knobs for [`UploadPipeline`], derived from the gateway config.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub auth_required: bool,
    pub thresholds: IntegrityThresholds,
    pub replay_window_days: u64,
    pub presign_ttl: Duration,
}

pub struct UploadRequest<'a> {
    pub correlation_id: &'a str,
    pub auth: Result<Option<Principal>, AuthError>,
    pub content_length: Option<u64>,
    pub idempotency_key: Option<String>,
}

/// A successful upload. `body` is the exact JSON returned to the client, so a
/// replay is byte-identical to the original response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Created { evidence_id: String, body: String },
    Replayed { body: String },
}

impl UploadOutcome {
    pub fn body(&self) -> &str {
        match self {
            UploadOutcome::Created { body, .. } | UploadOutcome::Replayed { body } => body,
        }
    }
}

struct ExitContext {
    actor: Actor,
    resource_id: String,
}

pub struct UploadPipeline<'a> {
    pub store: &'a dyn EvidenceStore,
    pub blobs: &'a dyn BlobStore,
    pub metrics: &'a Metrics,
    pub settings: &'a UploadSettings,
}

impl UploadPipeline<'_> {
    pub async fn run<B>(
        &self,
        req: UploadRequest<'_>,
        body: &mut B,
    ) -> Result<UploadOutcome, UploadRejection>
    where
        B: UploadBody + ?Sized,
    {
        let mut exit = ExitContext {
            actor: Actor::anonymous(),
            resource_id: "precheck".to_string(),
        };
        let correlation_id = req.correlation_id;

        let result = self.stages(req, body, &mut exit).await;

        match &result {
            Ok(UploadOutcome::Created { evidence_id, .. }) => {
                self.metrics.observe_upload("created");
                tracing::info!(
                    correlation_id = %correlation_id,
                    tenant_id = %exit.actor.tenant_id,
                    evidence_id = %evidence_id,
                    "evidence.upload.created"
                );
            }
            Ok(UploadOutcome::Replayed { .. }) => {
                self.metrics.observe_upload("idempotent_replay");
                tracing::info!(
                    correlation_id = %correlation_id,
                    tenant_id = %exit.actor.tenant_id,
                    "evidence.upload.idempotent_replay"
                );
            }
            Err(rejection) => {
                self.metrics.observe_upload(rejection.code());
                let entry = exit.actor.entry(
                    correlation_id,
                    ACTION_EVIDENCE_UPLOAD,
                    RESOURCE_TYPE,
                    exit.resource_id.clone(),
                    rejection.audit_result(),
                    rejection.audit_metadata(),
                );
                audit::record(self.store, entry).await;
            }
        }

        result
    }

    async fn stages<B>(
        &self,
        req: UploadRequest<'_>,
        body: &mut B,
        exit: &mut ExitContext,
    ) -> Result<UploadOutcome, UploadRejection>
    where
        B: UploadBody + ?Sized,
    {
        let principal = self.authenticate(req.auth)?;
        exit.actor = Actor::from(&principal);

        check_content_length(req.content_length, global_max_size_bytes())
            .map_err(UploadRejection::FileTooLarge)?;

        if let Some(key) = req.idempotency_key.as_deref() {
            let cached = self
                .store
                .cached_response(&principal.tenant_id, key)
                .await
                .map_err(store_unavailable)?;
            if let Some(body) = cached {
                return Ok(UploadOutcome::Replayed { body });
            }
        }

        let metadata = parse_metadata(body).await?;
        exit.resource_id = metadata.evidence_id.clone();

        if self
            .store
            .evidence_exists(&principal.tenant_id, &metadata.evidence_id)
            .await
            .map_err(store_unavailable)?
        {
            return Err(UploadRejection::DuplicateEvidenceId(
                metadata.evidence_id.clone(),
            ));
        }

        let mut stream = HashingStream::new(policy_for(metadata.evidence_type).max_size_bytes);
        loop {
            match body.next_file_chunk().await {
                Ok(Some(chunk)) => stream
                    .update(&chunk)
                    .map_err(UploadRejection::FileTooLarge)?,
                Ok(None) => break,
                Err(BodyError::Read(msg)) => return Err(UploadRejection::FileReadError(msg)),
                Err(err) => return Err(UploadRejection::InvalidRequest(err.to_string())),
            }
        }
        let payload = stream.finish();

        let since = replay_window_start(Utc::now(), self.settings.replay_window_days);
        if let Some(original_evidence_id) = self
            .store
            .find_recent_by_hash(&principal.tenant_id, &payload.sha256_hex, since)
            .await
            .map_err(store_unavailable)?
        {
            return Err(UploadRejection::DuplicateContent {
                original_evidence_id,
            });
        }

        let exif = if metadata.evidence_type == EvidenceType::Photo {
            extract_exif(&payload.bytes)
        } else {
            ExifMetadata::default()
        };
        if let Some(err) = exif.error.as_deref()
            && metadata.evidence_type == EvidenceType::Photo
        {
            tracing::debug!(evidence_id = %metadata.evidence_id, error = err, "exif.unreadable");
        }

        let verdict = validate_integrity(
            &IntegrityInput {
                metadata: &metadata,
                server_sha256: &payload.sha256_hex,
                server_size_bytes: payload.size_bytes,
                bytes: &payload.bytes,
                exif: &exif,
                received_at: Utc::now(),
            },
            &self.settings.thresholds,
        );
        if !verdict.result.integrity_passed {
            self.metrics
                .observe_integrity_failures(&failed_checks(&verdict.result));
            return Err(UploadRejection::IntegrityValidationFailed(Box::new(
                verdict.result,
            )));
        }

        let storage_path = self
            .blobs
            .put(&payload.bytes, &payload.sha256_hex, verdict.detected_mime)
            .await
            .map_err(|err| UploadRejection::StorageUploadFailed(err.to_string()))?;

        let captured_at_server = Utc::now();
        let time_drift_seconds = drift_seconds(captured_at_server, metadata.captured_at_device);

        let record = EvidenceRecord {
            tenant_id: principal.tenant_id.clone(),
            evidence_id: metadata.evidence_id.clone(),
            application_id: metadata.application_id.clone(),
            evidence_type: metadata.evidence_type.as_str().to_string(),
            mime_type: metadata.mime_type.clone(),
            mime_type_detected: verdict.detected_mime.to_string(),
            file_size_bytes: i64::try_from(payload.size_bytes).unwrap_or(i64::MAX),
            sha256_hash_device: metadata.sha256_hash_device.clone(),
            sha256_hash_server: payload.sha256_hex.clone(),
            captured_at_device: metadata.captured_at_device,
            captured_at_server,
            time_drift_seconds,
            gps_latitude: metadata.gps.latitude,
            gps_longitude: metadata.gps.longitude,
            gps_accuracy_meters: metadata.gps.accuracy_meters,
            exif_present: exif.has_exif,
            exif_data: exif.has_exif.then(|| exif.raw_json()),
            exif_gps_latitude: exif.gps_latitude,
            exif_gps_longitude: exif.gps_longitude,
            exif_datetime: exif.captured_at.map(|ts| ts.and_utc()),
            uploader_id: principal.user_id.clone(),
            uploader_role: principal.role.as_str().to_string(),
            storage_path: storage_path.clone(),
            integrity_passed: verdict.result.integrity_passed,
            integrity_issues: verdict.result.issues.clone(),
            correlation_id: req.correlation_id.to_string(),
            created_at: captured_at_server,
        };
        let success = exit.actor.entry(
            req.correlation_id,
            ACTION_EVIDENCE_UPLOAD,
            RESOURCE_TYPE,
            metadata.evidence_id.clone(),
            AuditResult::Success,
            serde_json::json!({
                "application_id": metadata.application_id,
                "hash": payload.sha256_hex,
                "size": payload.size_bytes,
                "type": metadata.evidence_type.as_str(),
            }),
        );

        if let Err(err) = self.store.insert_evidence(&record, &success).await {
            self.release_blob(&storage_path).await;
            return Err(match err {
                LedgerError::UniqueViolation(_) => {
                    UploadRejection::DuplicateEvidenceId(metadata.evidence_id.clone())
                }
                other => UploadRejection::DatabaseWriteFailed(other.to_string()),
            });
        }
        audit::trace(&success);

        let storage_uri = match self.blobs.presign(&storage_path, self.settings.presign_ttl) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(storage_path = %storage_path, error = %err, "blob.presign_failed");
                storage_path.clone()
            }
        };
        let response = EvidenceResponse {
            evidence_id: record.evidence_id.clone(),
            application_id: record.application_id.clone(),
            storage_uri,
            integrity_passed: verdict.result.integrity_passed,
            integrity_check: verdict.result,
            created_at: record.created_at,
        };
        let body = serde_json::to_string(&response)
            .map_err(|err| UploadRejection::Internal(err.to_string()))?;

        if let Some(key) = req.idempotency_key.as_deref()
            && let Err(err) = self
                .store
                .cache_response(&principal.tenant_id, key, &body)
                .await
        {
            tracing::warn!(
                correlation_id = %req.correlation_id,
                error = %err,
                "idempotency.cache_write_failed"
            );
        }

        Ok(UploadOutcome::Created {
            evidence_id: record.evidence_id,
            body,
        })
    }

    fn authenticate(
        &self,
        auth: Result<Option<Principal>, AuthError>,
    ) -> Result<Principal, UploadRejection> {
        match auth {
            Ok(Some(principal)) => Ok(principal),
            Ok(None) if self.settings.auth_required => Err(UploadRejection::AuthenticationRequired),
            Ok(None) => Ok(Principal::development()),
            Err(err) if err.code == "ERR_AUTH_UNAVAILABLE" => {
                Err(UploadRejection::AuthUnavailable(err.message))
            }
            Err(err) => Err(UploadRejection::AuthenticationInvalid(err.message)),
        }
    }

    /// Best-effort removal of a blob written for a record that was never
    /// persisted. Content-addressed paths may be shared, so a path still
    /// referenced by any evidence row is kept.
    async fn release_blob(&self, storage_path: &str) {
        match self.store.storage_references(storage_path).await {
            Ok(0) => {
                if let Err(err) = self.blobs.delete(storage_path).await {
                    tracing::warn!(storage_path, error = %err, "blob.compensating_delete_failed");
                }
            }
            Ok(refs) => {
                tracing::debug!(storage_path, refs, "blob.compensating_delete_skipped");
            }
            Err(err) => {
                tracing::warn!(storage_path, error = %err, "blob.reference_count_failed");
            }
        }
    }
}

fn store_unavailable(err: LedgerError) -> UploadRejection {
    UploadRejection::StoreUnavailable(err.to_string())
}

/// Oldest upload time that still counts as a replay. Windows past
/// `MAX_WINDOW_DAYS` are capped so the bound stays a storable timestamp.
fn replay_window_start(now: DateTime<Utc>, window_days: u64) -> DateTime<Utc> {
    let days = window_days.min(MAX_WINDOW_DAYS) as i64;
    now - chrono::Duration::days(days)
}

async fn parse_metadata<B>(body: &mut B) -> Result<EvidenceMetadata, UploadRejection>
where
    B: UploadBody + ?Sized,
{
    let text = body
        .metadata()
        .await
        .map_err(|err| UploadRejection::InvalidEvidenceJson(err.to_string()))?;
    let request = serde_json::from_str::<EvidenceUploadRequest>(&text)
        .map_err(|err| UploadRejection::InvalidEvidenceJson(err.to_string()))?;
    request
        .validate()
        .map_err(UploadRejection::InvalidEvidenceJson)
}
