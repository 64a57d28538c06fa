use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use evintake_contracts::AuditResult;
use evintake_contracts::decision::ApplicationStatus;
use evintake_contracts::facts::{FactSubmission, ValidatedFact};
use evintake_evaluation::status::check_transition;
use evintake_ledger::{FactRecord, NewApplication};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::{AppState, RequestScope, ledger_problem, tenant_application};
use crate::audit::{
    self, ACTION_APPLICATION_CREATE, ACTION_APPLICATION_STATUS_CHANGE, ACTION_FACT_DELETE,
    ACTION_FACT_UPSERT, Actor,
};
use crate::problem::{Problem, correlation_headers, json_response};

const APPLICATION_TYPE_MAX_LEN: usize = 100;
const BUSINESS_FIELD_MAX_LEN: usize = 500;
const DEFAULT_PAGE_LIMIT: i64 = 20;
const MAX_PAGE_LIMIT: i64 = 100;
const MAX_FACTS_PER_BATCH: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct CreateApplicationRequest {
    application_type: String,
    #[serde(default)]
    business_name: Option<String>,
    #[serde(default)]
    business_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ListApplicationsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct StatusUpdateRequest {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct FactBatchRequest {
    facts: Vec<FactSubmission>,
}

#[derive(Debug, Serialize)]
struct FactList<'a> {
    application_id: &'a str,
    facts: Vec<FactRecord>,
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Problem> {
    body.map(|Json(value)| value)
        .map_err(|rejection| Problem::invalid_request(rejection.body_text()))
}

fn optional_text(field: &str, raw: Option<String>, max_len: usize) -> Result<Option<String>, Problem> {
    let Some(value) = raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if value.len() > max_len {
        return Err(Problem::invalid_request(format!(
            "{} must be at most {} characters",
            field, max_len
        )));
    }
    Ok(Some(value))
}

fn page_bounds(query: &ListApplicationsQuery) -> Result<(i64, i64), Problem> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
        return Err(Problem::invalid_request(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_LIMIT
        )));
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(Problem::invalid_request("offset must not be negative"));
    }
    Ok((limit, offset))
}

/// Validates every submission, reporting the first bad one by position.
fn validate_facts(facts: Vec<FactSubmission>) -> Result<Vec<ValidatedFact>, Problem> {
    if facts.is_empty() || facts.len() > MAX_FACTS_PER_BATCH {
        return Err(Problem::invalid_request(format!(
            "facts must contain 1..={} entries",
            MAX_FACTS_PER_BATCH
        )));
    }

    facts
        .into_iter()
        .enumerate()
        .map(|(index, submission)| {
            let fact_name = submission.fact_name.clone();
            submission.validate().map_err(|message| {
                Problem::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "INVALID_FACT_VALUE",
                    "Invalid Fact Value",
                    serde_json::json!({
                        "index": index,
                        "fact_name": fact_name,
                        "message": message,
                    }),
                )
            })
        })
        .collect()
}

pub(super) async fn create_application(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateApplicationRequest>, JsonRejection>,
) -> Response {
    let scope = RequestScope::begin("/v1/applications", "POST", &headers);
    let span = tracing::info_span!(
        "application.create",
        correlation_id = %scope.correlation_id(),
        tenant_id = tracing::field::Empty,
        application_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        tracing::Span::current().record("tenant_id", principal.tenant_id.as_str());
        let req = json_body(body)?;

        let application_type = req.application_type.trim().to_string();
        if application_type.is_empty() || application_type.len() > APPLICATION_TYPE_MAX_LEN {
            return Err(Problem::invalid_request(format!(
                "application_type must be 1..={} characters",
                APPLICATION_TYPE_MAX_LEN
            )));
        }
        let new_application = NewApplication {
            tenant_id: principal.tenant_id.clone(),
            applicant_id: principal.user_id.clone(),
            application_type,
            business_name: optional_text("business_name", req.business_name, BUSINESS_FIELD_MAX_LEN)?,
            business_address: optional_text(
                "business_address",
                req.business_address,
                BUSINESS_FIELD_MAX_LEN,
            )?,
        };

        let application = state
            .ledger
            .create_application(&new_application)
            .await
            .map_err(ledger_problem)?;
        tracing::Span::current().record("application_id", application.application_id.as_str());

        let entry = Actor::from(&principal).entry(
            scope.correlation_id(),
            ACTION_APPLICATION_CREATE,
            "application",
            application.application_id.clone(),
            AuditResult::Success,
            serde_json::json!({ "application_type": application.application_type }),
        );
        audit::record(&state.ledger, entry).await;

        Ok(json_response(
            StatusCode::CREATED,
            scope.correlation_id(),
            &application,
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn list_applications(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListApplicationsQuery>, QueryRejection>,
) -> Response {
    let scope = RequestScope::begin("/v1/applications", "GET", &headers);
    let span = tracing::info_span!(
        "application.list",
        correlation_id = %scope.correlation_id(),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let Query(query) =
            query.map_err(|rejection| Problem::invalid_request(rejection.body_text()))?;

        let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => None,
            Some(raw) => Some(ApplicationStatus::parse(raw).ok_or_else(|| {
                Problem::invalid_request(format!("unknown application status `{}`", raw))
            })?),
        };
        let (limit, offset) = page_bounds(&query)?;

        let page = state
            .ledger
            .list_applications(&principal.tenant_id, status, limit, offset)
            .await
            .map_err(ledger_problem)?;
        Ok(json_response(StatusCode::OK, scope.correlation_id(), &page))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn get_application(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/applications/{application_id}", "GET", &headers);
    let span = tracing::info_span!(
        "application.get",
        correlation_id = %scope.correlation_id(),
        application_id = %application_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let application = tenant_application(&state, &principal.tenant_id, &application_id).await?;
        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &application,
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    body: Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> Response {
    let scope = RequestScope::begin("/v1/applications/{application_id}/status", "PATCH", &headers);
    let span = tracing::info_span!(
        "application.status_change",
        correlation_id = %scope.correlation_id(),
        application_id = %application_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let actor = Actor::from(&principal);
        let req = json_body(body)?;
        let to = ApplicationStatus::parse(req.status.trim()).ok_or_else(|| {
            Problem::invalid_request(format!("unknown application status `{}`", req.status))
        })?;

        let application = tenant_application(&state, &principal.tenant_id, &application_id).await?;
        let from = application.status;

        let rejected = |message: String| {
            Problem::new(
                StatusCode::CONFLICT,
                "INVALID_STATUS_TRANSITION",
                "Invalid Status Transition",
                message,
            )
        };

        let outcome = match check_transition(from, to) {
            Err(err) => Err(rejected(err.to_string())),
            Ok(stamp) => state
                .ledger
                .update_application_status(&application_id, from, to, stamp)
                .await
                .map_err(ledger_problem)?
                .ok_or_else(|| {
                    rejected(format!(
                        "application {} changed status concurrently",
                        application_id
                    ))
                }),
        };

        let (audit_result, metadata) = match &outcome {
            Ok(_) => (
                AuditResult::Success,
                serde_json::json!({ "from": from.as_str(), "to": to.as_str() }),
            ),
            Err(problem) => (
                AuditResult::Rejected,
                serde_json::json!({
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "reason": problem.detail,
                }),
            ),
        };
        let entry = actor.entry(
            scope.correlation_id(),
            ACTION_APPLICATION_STATUS_CHANGE,
            "application",
            application_id.clone(),
            audit_result,
            metadata,
        );
        audit::record(&state.ledger, entry).await;

        let updated = outcome?;
        Ok(json_response(StatusCode::OK, scope.correlation_id(), &updated))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn upsert_facts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    body: Result<Json<FactBatchRequest>, JsonRejection>,
) -> Response {
    let scope = RequestScope::begin("/v1/applications/{application_id}/facts", "POST", &headers);
    let span = tracing::info_span!(
        "fact.upsert",
        correlation_id = %scope.correlation_id(),
        application_id = %application_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let req = json_body(body)?;
        tenant_application(&state, &principal.tenant_id, &application_id).await?;

        let actor = Actor::from(&principal);
        let facts = match validate_facts(req.facts) {
            Ok(facts) => facts,
            Err(problem) => {
                let entry = actor.entry(
                    scope.correlation_id(),
                    ACTION_FACT_UPSERT,
                    "application",
                    application_id.clone(),
                    AuditResult::Rejected,
                    serde_json::json!({ "reason": problem.code, "detail": problem.detail }),
                );
                audit::record(&state.ledger, entry).await;
                return Err(problem);
            }
        };

        let stored = state
            .ledger
            .upsert_facts(&application_id, &facts)
            .await
            .map_err(ledger_problem)?;

        let entry = actor.entry(
            scope.correlation_id(),
            ACTION_FACT_UPSERT,
            "application",
            application_id.clone(),
            AuditResult::Success,
            serde_json::json!({
                "fact_names": stored.iter().map(|f| f.fact_name.as_str()).collect::<Vec<_>>(),
            }),
        );
        audit::record(&state.ledger, entry).await;

        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &FactList {
                application_id: &application_id,
                facts: stored,
            },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn list_facts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/applications/{application_id}/facts", "GET", &headers);
    let span = tracing::info_span!(
        "fact.list",
        correlation_id = %scope.correlation_id(),
        application_id = %application_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        tenant_application(&state, &principal.tenant_id, &application_id).await?;
        let facts = state
            .ledger
            .list_facts(&application_id)
            .await
            .map_err(ledger_problem)?;
        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &FactList {
                application_id: &application_id,
                facts,
            },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn delete_fact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((application_id, fact_name)): Path<(String, String)>,
) -> Response {
    let scope = RequestScope::begin(
        "/v1/applications/{application_id}/facts/{fact_name}",
        "DELETE",
        &headers,
    );
    let span = tracing::info_span!(
        "fact.delete",
        correlation_id = %scope.correlation_id(),
        application_id = %application_id,
        fact_name = %fact_name,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        tenant_application(&state, &principal.tenant_id, &application_id).await?;

        let removed = state
            .ledger
            .delete_fact(&application_id, &fact_name)
            .await
            .map_err(ledger_problem)?;
        if !removed {
            return Err(Problem::not_found(format!(
                "fact {} not found on application {}",
                fact_name, application_id
            )));
        }

        let entry = Actor::from(&principal).entry(
            scope.correlation_id(),
            ACTION_FACT_DELETE,
            "application",
            application_id.clone(),
            AuditResult::Success,
            serde_json::json!({ "fact_name": fact_name }),
        );
        audit::record(&state.ledger, entry).await;

        Ok((
            StatusCode::NO_CONTENT,
            correlation_headers(scope.correlation_id()),
        )
            .into_response())
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}
