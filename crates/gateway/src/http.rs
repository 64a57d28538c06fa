use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use evintake_auth::{AuthError, Authenticator, Hs256Authenticator, OidcAuthenticator, Principal};
use evintake_contracts::Signer;
use evintake_contracts::canonical::sha256_hex;
use evintake_evaluation::EvaluationEngine;
use evintake_integrity::global_max_size_bytes;
use evintake_ledger::{ApplicationRecord, EvidenceLedger, LedgerError};
use serde::Serialize;
use ulid::Ulid;

use crate::config::{AuthMode, GatewayConfig, StartupError};
use crate::metrics::Metrics;
use crate::problem::{CORRELATION_HEADER, Problem, correlation_headers, sanitize_correlation_id};
use crate::rate_limit::ClientRateLimits;
use crate::signer::{Rs256Signer, UnsignedSigner};
use crate::storage::{BlobStore, FsBlobStore, UrlSigner};
use crate::upload::UploadSettings;

mod applications;
mod evaluation;
mod evidence;
mod exports;

/// Room for the metadata part and multipart framing on top of the largest
/// evidence file.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    authenticator: Authenticator,
    ledger: EvidenceLedger,
    blobs: Arc<dyn BlobStore>,
    url_signer: UrlSigner,
    signer: Arc<dyn Signer>,
    engine: Arc<EvaluationEngine>,
    metrics: Metrics,
    rate_limits: ClientRateLimits,
}

impl AppState {
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn rate_limits(&self) -> &ClientRateLimits {
        &self.rate_limits
    }

    fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            auth_required: self.config.auth_required,
            thresholds: self.config.thresholds,
            replay_window_days: self.config.replay_window_days,
            presign_ttl: self.presign_ttl(),
        }
    }

    fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.config.presign_ttl_secs)
    }

    fn enforce_rate_limit(&self, client_key: &str) -> Result<(), Problem> {
        self.rate_limits.check(client_key).map_err(|retry_after| {
            tracing::info!(client_key, retry_after, "rate_limit.exceeded");
            Problem::rate_limited(retry_after)
        })
    }

    /// Resolves the caller, applies the client rate limit, and falls back to
    /// the development principal when auth is optional.
    async fn principal(&self, headers: &HeaderMap) -> Result<Principal, Problem> {
        let auth = self.authenticator.resolve(headers).await;
        self.enforce_rate_limit(&client_key(&auth, headers))?;
        require_principal(auth, self.config.auth_required)
    }
}

pub async fn build_state(config: GatewayConfig) -> Result<AppState, StartupError> {
    let authenticator = match config.auth_mode {
        AuthMode::None => Authenticator::Disabled,
        AuthMode::Hs256 => {
            let hs256 = config.hs256.clone().ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "hs256 auth mode requires a jwt secret".to_string(),
            })?;
            Authenticator::Hs256(Hs256Authenticator::new(hs256).map_err(auth_startup_error)?)
        }
        AuthMode::Oidc => {
            let oidc = config.oidc.clone().ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc auth mode requires oidc config".to_string(),
            })?;
            Authenticator::Oidc(
                OidcAuthenticator::new(oidc)
                    .await
                    .map_err(auth_startup_error)?,
            )
        }
    };

    let ledger = EvidenceLedger::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.ledger_write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_LEDGER_UNAVAILABLE",
        message: format!("failed to initialize ledger: {}", err),
    })?;

    let presign_secret = match config.presign_secret.as_deref() {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            tracing::warn!("no presign secret configured; presigned urls last for this process only");
            ephemeral_secret()
        }
    };
    let url_signer =
        UrlSigner::new(&presign_secret, &config.public_base_url).map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("presign secret is unusable: {}", err),
        })?;

    tokio::fs::create_dir_all(&config.blob_root)
        .await
        .map_err(|err| StartupError {
            code: "ERR_BLOB_STORE_UNAVAILABLE",
            message: format!(
                "failed to create blob root {}: {}",
                config.blob_root.display(),
                err
            ),
        })?;
    let blobs: Arc<dyn BlobStore> =
        Arc::new(FsBlobStore::new(config.blob_root.clone(), url_signer.clone()));

    let signer: Arc<dyn Signer> = match config.signing_key_path.as_deref() {
        Some(private_path) => Arc::new(Rs256Signer::load(
            private_path,
            config.signing_public_key_path.as_deref(),
        )?),
        None => {
            tracing::warn!("no signing key configured; snapshots and exports are unsigned");
            Arc::new(UnsignedSigner)
        }
    };

    let metrics = Metrics::new().map_err(|err| StartupError {
        code: "ERR_METRICS_INIT",
        message: format!("failed to register metrics: {}", err),
    })?;

    let rate_limits = ClientRateLimits::new(config.rate_limit_per_minute, config.rate_limit_per_hour);

    Ok(AppState {
        config,
        authenticator,
        ledger,
        blobs,
        url_signer,
        signer,
        engine: Arc::new(EvaluationEngine::default()),
        metrics,
        rate_limits,
    })
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    Ok(router_with_state(build_state(config).await?))
}

pub fn router_with_state(state: AppState) -> Router {
    let upload_limit = usize::try_from(global_max_size_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(
            "/v1/evidence",
            post(evidence::upload_evidence).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/v1/evidence/{evidence_id}", get(evidence::get_evidence))
        .route(
            "/v1/applications",
            post(applications::create_application).get(applications::list_applications),
        )
        .route(
            "/v1/applications/{application_id}",
            get(applications::get_application),
        )
        .route(
            "/v1/applications/{application_id}/status",
            patch(applications::update_status),
        )
        .route(
            "/v1/applications/{application_id}/evidence",
            get(evidence::list_application_evidence),
        )
        .route(
            "/v1/applications/{application_id}/facts",
            post(applications::upsert_facts).get(applications::list_facts),
        )
        .route(
            "/v1/applications/{application_id}/facts/{fact_name}",
            delete(applications::delete_fact),
        )
        .route(
            "/v1/applications/{application_id}/evaluate",
            post(evaluation::evaluate),
        )
        .route(
            "/v1/applications/{application_id}/snapshots",
            get(evaluation::list_snapshots),
        )
        .route("/v1/snapshots/{snapshot_id}", get(evaluation::get_snapshot))
        .route(
            "/v1/snapshots/{snapshot_id}/summary",
            get(evaluation::get_snapshot_summary),
        )
        .route(
            "/v1/snapshots/{snapshot_id}/verify",
            get(evaluation::verify_snapshot),
        )
        .route(
            "/v1/exports",
            post(exports::create_export).get(exports::list_exports),
        )
        .route("/v1/exports/{export_id}", get(exports::get_export))
        .route(
            "/v1/exports/{export_id}/download",
            get(exports::download_export),
        )
        .route("/v1/blobs/{*path}", get(exports::get_blob))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("database", state.ledger.ping().await.is_ok());
    checks.insert("blob_store", state.blobs.health().await);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.config.metrics_require_auth {
        let auth = state.authenticator.resolve(&headers).await;
        if let Err(problem) = require_principal(auth, true) {
            return problem.into_response_with(&correlation_id(&headers));
        }
    }

    match state.metrics.render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Per-request bookkeeping shared by every `/v1` handler: the correlation id,
/// and the latency and outcome recorded on the handler span and in metrics.
pub(crate) struct RequestScope {
    route: &'static str,
    method: &'static str,
    correlation_id: String,
    started: Instant,
}

impl RequestScope {
    fn begin(route: &'static str, method: &'static str, headers: &HeaderMap) -> Self {
        Self {
            route,
            method,
            correlation_id: correlation_id(headers),
            started: Instant::now(),
        }
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn finish(
        self,
        state: &AppState,
        span: &tracing::Span,
        result: Result<Response, Problem>,
    ) -> Response {
        let response = match result {
            Ok(response) => response,
            Err(problem) => problem.into_response_with(&self.correlation_id),
        };

        let status = response.status();
        let elapsed = self.started.elapsed();
        span.record("latency_ms", elapsed.as_millis() as u64);
        span.record("outcome", outcome_label(status));
        state
            .metrics
            .observe_http_request(self.route, self.method, status.as_u16(), elapsed);

        response
    }
}

fn outcome_label(status: StatusCode) -> &'static str {
    if status.is_success() {
        "ok"
    } else if status.is_client_error() {
        "rejected"
    } else {
        "error"
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_correlation_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

/// Rate-limit key: the authenticated principal when there is one, otherwise
/// the first `X-Forwarded-For` hop.
fn client_key(auth: &Result<Option<Principal>, AuthError>, headers: &HeaderMap) -> String {
    if let Ok(Some(principal)) = auth {
        return format!("principal:{}:{}", principal.tenant_id, principal.user_id);
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|ip| format!("ip:{}", ip))
        .unwrap_or_else(|| "ip:unknown".to_string())
}

fn require_principal(
    auth: Result<Option<Principal>, AuthError>,
    auth_required: bool,
) -> Result<Principal, Problem> {
    match auth {
        Ok(Some(principal)) => Ok(principal),
        Ok(None) if auth_required => Err(Problem::new(
            StatusCode::UNAUTHORIZED,
            "AUTHENTICATION_REQUIRED",
            "Authentication Required",
            "a bearer token is required",
        )),
        Ok(None) => Ok(Principal::development()),
        Err(err) => Err(auth_problem(err)),
    }
}

fn auth_problem(err: AuthError) -> Problem {
    if err.code == "ERR_AUTH_UNAVAILABLE" {
        return Problem::unavailable(err.message);
    }
    Problem::new(
        StatusCode::UNAUTHORIZED,
        "AUTHENTICATION_INVALID",
        "Invalid Credentials",
        err.message,
    )
}

fn auth_startup_error(err: AuthError) -> StartupError {
    StartupError {
        code: err.code,
        message: err.message,
    }
}

fn ledger_problem(err: LedgerError) -> Problem {
    tracing::warn!(error = %err, "ledger.call_failed");
    match err {
        LedgerError::Timeout => Problem::unavailable("the persistent store timed out"),
        LedgerError::NotFound => Problem::not_found("resource not found"),
        LedgerError::UniqueViolation(_) => Problem::new(
            StatusCode::CONFLICT,
            "CONFLICT",
            "Conflict",
            "the resource already exists",
        ),
        LedgerError::Sqlx(_) => Problem::internal("the persistent store failed"),
    }
}

/// Loads an application owned by `tenant_id`. Applications of other tenants
/// are indistinguishable from missing ones.
async fn tenant_application(
    state: &AppState,
    tenant_id: &str,
    application_id: &str,
) -> Result<ApplicationRecord, Problem> {
    match state.ledger.get_application(application_id).await {
        Ok(Some(app)) if app.tenant_id == tenant_id => Ok(app),
        Ok(_) => Err(Problem::not_found(format!(
            "application {} not found",
            application_id
        ))),
        Err(err) => Err(ledger_problem(err)),
    }
}

fn raw_json_response(status: StatusCode, correlation_id: &str, body: String) -> Response {
    let mut headers = correlation_headers(correlation_id);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    (status, headers, body).into_response()
}

fn ephemeral_secret() -> Vec<u8> {
    let seed = format!("{}:{}:{}", Ulid::new(), Ulid::new(), std::process::id());
    sha256_hex(seed.as_bytes()).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use evintake_contracts::Role;

    fn principal() -> Principal {
        Principal {
            user_id: "user-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            role: Role::Supervisor,
        }
    }

    #[test]
    fn client_key_prefers_principal_then_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );

        assert_eq!(
            client_key(&Ok(Some(principal())), &headers),
            "principal:tenant-a:user-1"
        );
        assert_eq!(client_key(&Ok(None), &headers), "ip:203.0.113.7");
        assert_eq!(client_key(&Ok(None), &HeaderMap::new()), "ip:unknown");
    }

    #[test]
    fn missing_credentials_fall_back_only_when_optional() {
        let dev = require_principal(Ok(None), false).expect("optional auth should fall back");
        assert_eq!(dev, Principal::development());

        let err = require_principal(Ok(None), true).expect_err("required auth must reject");
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.code, "AUTHENTICATION_REQUIRED");
    }

    #[test]
    fn auth_errors_map_to_invalid_or_unavailable() {
        let invalid = auth_problem(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "bad token".to_string(),
        });
        assert_eq!(invalid.code, "AUTHENTICATION_INVALID");
        assert_eq!(invalid.status, StatusCode::UNAUTHORIZED);

        let unavailable = auth_problem(AuthError {
            code: "ERR_AUTH_UNAVAILABLE",
            message: "jwks fetch failed".to_string(),
        });
        assert_eq!(unavailable.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn correlation_id_is_sanitized_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, HeaderValue::from_static("req-42<>"));
        assert_eq!(correlation_id(&headers), "req-42");

        let generated = correlation_id(&HeaderMap::new());
        assert!(generated.parse::<Ulid>().is_ok());
    }

    #[test]
    fn ledger_timeouts_are_unavailable() {
        assert_eq!(
            ledger_problem(LedgerError::Timeout).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ledger_problem(LedgerError::NotFound).status,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn ephemeral_secrets_differ() {
        assert_ne!(ephemeral_secret(), ephemeral_secret());
        assert_eq!(ephemeral_secret().len(), 64);
    }
}
