use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{Duration as ChronoDuration, Utc};
use evintake_contracts::AuditResult;
use evintake_contracts::export::{ExportRequest, ExportStatus};
use evintake_ledger::{ExportRecord, NewExport};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use ulid::Ulid;

use super::{AppState, RequestScope, client_key, ledger_problem, tenant_application};
use crate::audit::{self, ACTION_EXPORT_CREATE, ACTION_EXPORT_DOWNLOAD, Actor};
use crate::config::MAX_WINDOW_DAYS;
use crate::export::{PackageRequest, run_export};
use crate::problem::{Problem, correlation_headers, json_response};
use crate::storage::BlobError;

#[derive(Debug, Serialize)]
struct ExportAccepted<'a> {
    export_id: &'a str,
    status: ExportStatus,
    created_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ExportList {
    items: Vec<ExportRecord>,
}

#[derive(Debug, Serialize)]
struct DownloadLink {
    download_url: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub(super) struct ListExportsQuery {
    #[serde(default)]
    application_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct BlobQuery {
    expires: i64,
    sig: String,
}

fn new_export_id() -> String {
    format!("exp_{}", Ulid::new())
}

fn invalid_signature(detail: impl Into<serde_json::Value>) -> Problem {
    Problem::new(
        StatusCode::FORBIDDEN,
        "INVALID_SIGNATURE",
        "Invalid Signature",
        detail,
    )
}

/// Expiry wins over readiness: an expired export is gone whatever its status.
fn download_gate(export: &ExportRecord, now: chrono::DateTime<Utc>) -> Result<&str, Problem> {
    if export.expires_at <= now {
        return Err(Problem::new(
            StatusCode::GONE,
            "EXPORT_EXPIRED",
            "Export Expired",
            format!("export {} expired at {}", export.export_id, export.expires_at),
        ));
    }
    match (&export.status, export.storage_path.as_deref()) {
        (ExportStatus::Completed, Some(path)) => Ok(path),
        _ => Err(Problem::new(
            StatusCode::CONFLICT,
            "EXPORT_NOT_READY",
            "Export Not Ready",
            format!(
                "export {} is {}",
                export.export_id,
                export.status.as_str()
            ),
        )),
    }
}

fn blob_content_type(path: &str) -> &'static str {
    if path.starts_with("exports/") {
        "application/zip"
    } else {
        "application/octet-stream"
    }
}

pub(super) async fn create_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ExportRequest>, JsonRejection>,
) -> Response {
    let scope = RequestScope::begin("/v1/exports", "POST", &headers);
    let span = tracing::info_span!(
        "export.create",
        correlation_id = %scope.correlation_id(),
        export_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let Json(req) =
            body.map_err(|rejection| Problem::invalid_request(rejection.body_text()))?;
        let application_id = req.application_id.trim().to_string();
        tenant_application(&state, &principal.tenant_id, &application_id).await?;

        let now = Utc::now();
        let retention_days = state.config.export_retention_days.min(MAX_WINDOW_DAYS) as i64;
        let new_export = NewExport {
            export_id: new_export_id(),
            tenant_id: principal.tenant_id.clone(),
            application_id: application_id.clone(),
            include_metadata: req.include_metadata,
            sign_package: req.sign_package,
            created_by: principal.user_id.clone(),
            correlation_id: scope.correlation_id().to_string(),
            expires_at: now + ChronoDuration::days(retention_days),
        };
        let export = state
            .ledger
            .create_export(&new_export)
            .await
            .map_err(ledger_problem)?;
        tracing::Span::current().record("export_id", export.export_id.as_str());

        let entry = Actor::from(&principal).entry(
            scope.correlation_id(),
            ACTION_EXPORT_CREATE,
            "export",
            export.export_id.clone(),
            AuditResult::Success,
            serde_json::json!({
                "application_id": application_id,
                "include_metadata": export.include_metadata,
                "sign_package": export.sign_package,
            }),
        );
        audit::record(&state.ledger, entry).await;

        tokio::spawn(run_export(
            state.ledger.clone(),
            state.blobs.clone(),
            state.signer.clone(),
            principal.tenant_id.clone(),
            PackageRequest {
                export_id: export.export_id.clone(),
                application_id,
                include_metadata: export.include_metadata,
                sign_package: export.sign_package,
                generated_at: now,
            },
        ));

        Ok(json_response(
            StatusCode::ACCEPTED,
            scope.correlation_id(),
            &ExportAccepted {
                export_id: &export.export_id,
                status: export.status,
                created_at: export.created_at,
                expires_at: export.expires_at,
            },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn list_exports(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListExportsQuery>, QueryRejection>,
) -> Response {
    let scope = RequestScope::begin("/v1/exports", "GET", &headers);
    let span = tracing::info_span!(
        "export.list",
        correlation_id = %scope.correlation_id(),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let Query(query) =
            query.map_err(|rejection| Problem::invalid_request(rejection.body_text()))?;
        let application_id = query
            .application_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let items = state
            .ledger
            .list_exports(&principal.tenant_id, application_id)
            .await
            .map_err(ledger_problem)?;
        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &ExportList { items },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn get_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(export_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/exports/{export_id}", "GET", &headers);
    let span = tracing::info_span!(
        "export.get",
        correlation_id = %scope.correlation_id(),
        export_id = %export_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let export = state
            .ledger
            .get_export(&principal.tenant_id, &export_id)
            .await
            .map_err(ledger_problem)?
            .ok_or_else(|| Problem::not_found(format!("export {} not found", export_id)))?;
        Ok(json_response(StatusCode::OK, scope.correlation_id(), &export))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn download_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(export_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/exports/{export_id}/download", "GET", &headers);
    let span = tracing::info_span!(
        "export.download",
        correlation_id = %scope.correlation_id(),
        export_id = %export_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let export = state
            .ledger
            .get_export(&principal.tenant_id, &export_id)
            .await
            .map_err(ledger_problem)?
            .ok_or_else(|| Problem::not_found(format!("export {} not found", export_id)))?;

        let path = download_gate(&export, Utc::now())?;
        let ttl = state.presign_ttl();
        let download_url = state.blobs.presign(path, ttl).map_err(|err| {
            tracing::warn!(error = %err, "blob.presign_failed");
            Problem::internal("could not sign the download url")
        })?;

        let entry = Actor::from(&principal).entry(
            scope.correlation_id(),
            ACTION_EXPORT_DOWNLOAD,
            "export",
            export.export_id.clone(),
            AuditResult::Success,
            serde_json::json!({ "application_id": export.application_id }),
        );
        audit::record(&state.ledger, entry).await;

        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &DownloadLink {
                download_url,
                expires_in: ttl.as_secs(),
            },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

/// Serves a blob behind a presigned URL. The signature is the credential, so
/// no bearer token is needed.
pub(super) async fn get_blob(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
    query: Result<Query<BlobQuery>, QueryRejection>,
) -> Response {
    let scope = RequestScope::begin("/v1/blobs/{*path}", "GET", &headers);
    let span = tracing::info_span!(
        "blob.get",
        correlation_id = %scope.correlation_id(),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        state.enforce_rate_limit(&client_key(&Ok(None), &headers))?;
        let Query(query) = query
            .map_err(|_| invalid_signature("expires and sig query parameters are required"))?;

        state
            .url_signer
            .verify_at(&path, query.expires, &query.sig, Utc::now())
            .map_err(|err| match err {
                BlobError::Expired => invalid_signature("the download url has expired"),
                _ => invalid_signature("the download url signature is invalid"),
            })?;

        let bytes = state.blobs.get(&path).await.map_err(|err| match err {
            BlobError::NotFound => Problem::not_found("blob not found"),
            other => {
                tracing::warn!(error = %other, "blob.read_failed");
                Problem::internal("blob could not be read")
            }
        })?;

        let mut response_headers = correlation_headers(scope.correlation_id());
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(blob_content_type(&path)),
        );
        Ok((StatusCode::OK, response_headers, bytes).into_response())
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}
