use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use evintake_ledger::EvidenceRecord;
use serde::Serialize;
use tracing::Instrument;

use super::{AppState, RequestScope, client_key, ledger_problem, raw_json_response};
use crate::problem::{Problem, json_response};
use crate::upload::{MultipartBody, UnreadableBody, UploadPipeline, UploadRequest};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const IDEMPOTENCY_KEY_MAX_LEN: usize = 255;

#[derive(Debug, Serialize)]
struct EvidenceView<'a> {
    #[serde(flatten)]
    record: &'a EvidenceRecord,
    download_url: String,
}

#[derive(Debug, Serialize)]
struct EvidenceList<'a> {
    application_id: &'a str,
    items: Vec<EvidenceView<'a>>,
    total: usize,
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && v.len() <= IDEMPOTENCY_KEY_MAX_LEN)
        .map(str::to_string)
}

fn view<'a>(state: &AppState, record: &'a EvidenceRecord) -> EvidenceView<'a> {
    let download_url = match state.blobs.presign(&record.storage_path, state.presign_ttl()) {
        Ok(url) => url,
        Err(err) => {
            tracing::warn!(
                evidence_id = %record.evidence_id,
                error = %err,
                "blob.presign_failed"
            );
            String::new()
        }
    };
    EvidenceView {
        record,
        download_url,
    }
}

pub(super) async fn upload_evidence(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let scope = RequestScope::begin("/v1/evidence", "POST", &headers);
    let span = tracing::info_span!(
        "evidence.upload",
        correlation_id = %scope.correlation_id(),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let auth = state.authenticator.resolve(&headers).await;
        state.enforce_rate_limit(&client_key(&auth, &headers))?;

        let settings = state.upload_settings();
        let pipeline = UploadPipeline {
            store: &state.ledger,
            blobs: state.blobs.as_ref(),
            metrics: &state.metrics,
            settings: &settings,
        };
        let req = UploadRequest {
            correlation_id: scope.correlation_id(),
            auth,
            content_length: content_length(&headers),
            idempotency_key: idempotency_key(&headers),
        };

        let outcome = match multipart {
            Ok(mut multipart) => {
                let mut body = MultipartBody::new(&mut multipart);
                pipeline.run(req, &mut body).await
            }
            Err(rejection) => {
                let mut body = UnreadableBody(rejection.body_text());
                pipeline.run(req, &mut body).await
            }
        };

        match outcome {
            Ok(outcome) => Ok(raw_json_response(
                StatusCode::CREATED,
                scope.correlation_id(),
                outcome.body().to_string(),
            )),
            Err(rejection) => Err(rejection.to_problem(settings.replay_window_days)),
        }
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn get_evidence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(evidence_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/evidence/{evidence_id}", "GET", &headers);
    let span = tracing::info_span!(
        "evidence.get",
        correlation_id = %scope.correlation_id(),
        evidence_id = %evidence_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let record = state
            .ledger
            .get_evidence(&principal.tenant_id, &evidence_id)
            .await
            .map_err(ledger_problem)?
            .ok_or_else(|| Problem::not_found(format!("evidence {} not found", evidence_id)))?;

        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &view(&state, &record),
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn list_application_evidence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/applications/{application_id}/evidence", "GET", &headers);
    let span = tracing::info_span!(
        "evidence.list",
        correlation_id = %scope.correlation_id(),
        application_id = %application_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let records = state
            .ledger
            .list_evidence_for_application(&principal.tenant_id, &application_id)
            .await
            .map_err(ledger_problem)?;

        let items = records
            .iter()
            .map(|record| view(&state, record))
            .collect::<Vec<_>>();
        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &EvidenceList {
                application_id: &application_id,
                total: items.len(),
                items,
            },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}
