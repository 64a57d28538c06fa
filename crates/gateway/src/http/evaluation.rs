use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Utc};
use evintake_auth::Principal;
use evintake_contracts::AuditResult;
use evintake_contracts::decision::{DecisionSnapshot, Recommendation, RuleOutcome, TriggerType};
use evintake_evaluation::EvaluationError;
use evintake_evaluation::snapshot::{SnapshotBuilder, verify_snapshot_hash};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::{AppState, RequestScope, ledger_problem, tenant_application};
use crate::audit::{self, ACTION_EVALUATION_RUN, Actor};
use crate::problem::{Problem, json_response};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct EvaluateRequest {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    rule_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct EvaluationResponse<'a> {
    snapshot_id: &'a str,
    application_id: &'a str,
    snapshot_version: i64,
    overall_recommendation: Recommendation,
    rule_outcomes: &'a [RuleOutcome],
    facts_count: usize,
    rules_evaluated: usize,
    snapshot_hash: &'a str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SnapshotSummary<'a> {
    snapshot_id: &'a str,
    application_id: &'a str,
    snapshot_version: i64,
    trigger_type: TriggerType,
    overall_recommendation: Recommendation,
    rules_passed: usize,
    rules_failed: usize,
    rules_warned: usize,
    facts_count: usize,
    snapshot_hash: &'a str,
    signature_present: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SnapshotVerification<'a> {
    snapshot_id: &'a str,
    snapshot_hash: &'a str,
    hash_valid: bool,
    signature_present: bool,
}

#[derive(Debug, Serialize)]
struct SnapshotList<'a> {
    application_id: &'a str,
    snapshots: Vec<DecisionSnapshot>,
    total: usize,
}

/// An empty body means defaults; anything else must be a valid request object.
fn parse_evaluate_body(body: &[u8]) -> Result<EvaluateRequest, Problem> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(EvaluateRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| Problem::invalid_request(format!("invalid evaluate request: {}", err)))
}

fn summarize(snapshot: &DecisionSnapshot) -> SnapshotSummary<'_> {
    use evintake_contracts::decision::RuleVerdict;

    let count = |verdict: RuleVerdict| {
        snapshot
            .rule_outcomes
            .iter()
            .filter(|o| o.outcome == verdict)
            .count()
    };
    SnapshotSummary {
        snapshot_id: &snapshot.snapshot_id,
        application_id: &snapshot.application_id,
        snapshot_version: snapshot.snapshot_version,
        trigger_type: snapshot.trigger_type,
        overall_recommendation: snapshot.overall_recommendation,
        rules_passed: count(RuleVerdict::Pass),
        rules_failed: count(RuleVerdict::Fail),
        rules_warned: count(RuleVerdict::Warn),
        facts_count: snapshot.facts_snapshot.len(),
        snapshot_hash: &snapshot.snapshot_hash,
        signature_present: snapshot.signature.is_some(),
        created_at: snapshot.created_at,
    }
}

/// Loads a snapshot and checks its owning application belongs to the caller.
async fn tenant_snapshot(
    state: &AppState,
    principal: &Principal,
    snapshot_id: &str,
) -> Result<DecisionSnapshot, Problem> {
    let snapshot = state
        .ledger
        .get_snapshot(snapshot_id)
        .await
        .map_err(ledger_problem)?
        .ok_or_else(|| Problem::not_found(format!("snapshot {} not found", snapshot_id)))?;

    let application = state
        .ledger
        .get_application(&snapshot.application_id)
        .await
        .map_err(ledger_problem)?
        .ok_or_else(|| {
            Problem::not_found(format!(
                "application {} not found",
                snapshot.application_id
            ))
        })?;
    if application.tenant_id != principal.tenant_id {
        return Err(Problem::forbidden("snapshot belongs to another tenant"));
    }
    Ok(snapshot)
}

pub(super) async fn evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
    body: Bytes,
) -> Response {
    let scope = RequestScope::begin(
        "/v1/applications/{application_id}/evaluate",
        "POST",
        &headers,
    );
    let span = tracing::info_span!(
        "evaluation.run",
        correlation_id = %scope.correlation_id(),
        application_id = %application_id,
        snapshot_id = tracing::field::Empty,
        recommendation = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let req = parse_evaluate_body(&body)?;
        tenant_application(&state, &principal.tenant_id, &application_id).await?;
        let actor = Actor::from(&principal);

        let facts = state
            .ledger
            .load_facts_snapshot(&application_id)
            .await
            .map_err(ledger_problem)?;

        let evaluation = match state.engine.evaluate(&facts, req.rule_ids.as_deref()) {
            Ok(evaluation) => evaluation,
            Err(EvaluationError::UnknownRules(unknown)) => {
                let entry = actor.entry(
                    scope.correlation_id(),
                    ACTION_EVALUATION_RUN,
                    "application",
                    application_id.clone(),
                    AuditResult::Rejected,
                    serde_json::json!({ "reason": "UNKNOWN_RULE", "unknown_rule_ids": unknown }),
                );
                audit::record(&state.ledger, entry).await;
                return Err(Problem::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "UNKNOWN_RULE",
                    "Unknown Rule",
                    serde_json::json!({ "unknown_rule_ids": unknown }),
                ));
            }
        };
        let facts_count = evaluation.facts_count;
        let rules_evaluated = evaluation.rules_evaluated;

        let trigger_metadata = serde_json::json!({
            "triggered_by": principal.user_id,
            "force": req.force,
            "rule_ids": req.rule_ids,
        });
        let draft = SnapshotBuilder::new(Some(state.signer.as_ref())).build(
            &application_id,
            TriggerType::OnDemand,
            trigger_metadata,
            facts,
            evaluation,
            Utc::now(),
        );
        let snapshot = state
            .ledger
            .commit_snapshot(draft)
            .await
            .map_err(ledger_problem)?;

        let recommendation = snapshot.overall_recommendation.as_str();
        tracing::Span::current().record("snapshot_id", snapshot.snapshot_id.as_str());
        tracing::Span::current().record("recommendation", recommendation);
        state.metrics.observe_evaluation(recommendation);

        let entry = actor.entry(
            scope.correlation_id(),
            ACTION_EVALUATION_RUN,
            "snapshot",
            snapshot.snapshot_id.clone(),
            AuditResult::Success,
            serde_json::json!({
                "application_id": application_id,
                "snapshot_version": snapshot.snapshot_version,
                "overall_recommendation": recommendation,
                "snapshot_hash": snapshot.snapshot_hash,
            }),
        );
        audit::record(&state.ledger, entry).await;

        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &EvaluationResponse {
                snapshot_id: &snapshot.snapshot_id,
                application_id: &snapshot.application_id,
                snapshot_version: snapshot.snapshot_version,
                overall_recommendation: snapshot.overall_recommendation,
                rule_outcomes: &snapshot.rule_outcomes,
                facts_count,
                rules_evaluated,
                snapshot_hash: &snapshot.snapshot_hash,
                timestamp: snapshot.created_at,
            },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn list_snapshots(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(application_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin(
        "/v1/applications/{application_id}/snapshots",
        "GET",
        &headers,
    );
    let span = tracing::info_span!(
        "snapshot.list",
        correlation_id = %scope.correlation_id(),
        application_id = %application_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        tenant_application(&state, &principal.tenant_id, &application_id).await?;
        let snapshots = state
            .ledger
            .list_snapshots(&application_id)
            .await
            .map_err(ledger_problem)?;
        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &SnapshotList {
                application_id: &application_id,
                total: snapshots.len(),
                snapshots,
            },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn get_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(snapshot_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/snapshots/{snapshot_id}", "GET", &headers);
    let span = tracing::info_span!(
        "snapshot.get",
        correlation_id = %scope.correlation_id(),
        snapshot_id = %snapshot_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let snapshot = tenant_snapshot(&state, &principal, &snapshot_id).await?;
        Ok(json_response(StatusCode::OK, scope.correlation_id(), &snapshot))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn get_snapshot_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(snapshot_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/snapshots/{snapshot_id}/summary", "GET", &headers);
    let span = tracing::info_span!(
        "snapshot.summary",
        correlation_id = %scope.correlation_id(),
        snapshot_id = %snapshot_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let snapshot = tenant_snapshot(&state, &principal, &snapshot_id).await?;
        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &summarize(&snapshot),
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}

pub(super) async fn verify_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(snapshot_id): Path<String>,
) -> Response {
    let scope = RequestScope::begin("/v1/snapshots/{snapshot_id}/verify", "GET", &headers);
    let span = tracing::info_span!(
        "snapshot.verify",
        correlation_id = %scope.correlation_id(),
        snapshot_id = %snapshot_id,
        hash_valid = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = state.principal(&headers).await?;
        let snapshot = tenant_snapshot(&state, &principal, &snapshot_id).await?;
        let hash_valid = verify_snapshot_hash(&snapshot);
        tracing::Span::current().record("hash_valid", hash_valid);
        if !hash_valid {
            tracing::warn!(snapshot_id = %snapshot.snapshot_id, "snapshot.hash_mismatch");
        }

        Ok(json_response(
            StatusCode::OK,
            scope.correlation_id(),
            &SnapshotVerification {
                snapshot_id: &snapshot.snapshot_id,
                snapshot_hash: &snapshot.snapshot_hash,
                hash_valid,
                signature_present: snapshot.signature.is_some(),
            },
        ))
    }
    .instrument(span.clone())
    .await;

    scope.finish(&state, &span, result)
}
