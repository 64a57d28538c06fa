use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use sha2::Digest;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const JWT_SECRET: &str = "smoke-test-secret-0123456789";
const PRESIGN_SECRET: &str = "smoke-presign-secret-0123456789";

fn test_db_url() -> Option<String> {
    std::env::var("EVINTAKE_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

/// A gateway bound to an ephemeral port, backed by a throwaway schema and a
/// temporary blob root.
struct Gateway {
    addr: SocketAddr,
    client: reqwest::Client,
    admin: sqlx::PgPool,
    schema: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
    _blob_root: tempfile::TempDir,
}

impl Gateway {
    async fn start(db_url: &str) -> Self {
        let schema = format!("evintake_smoke_{}", ulid::Ulid::new()).to_lowercase();
        let admin = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .expect("DB connect should succeed");
        sqlx::query(&format!("CREATE SCHEMA {}", schema))
            .execute(&admin)
            .await
            .expect("create schema should succeed");

        let blob_root = tempfile::tempdir().expect("tempdir should be created");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");

        let config = evintake_gateway::config::GatewayConfig::from_kv(&HashMap::from([
            ("EVINTAKE_BIND_ADDR".to_string(), addr.to_string()),
            (
                "EVINTAKE_DB_URL".to_string(),
                schema_db_url(db_url, &schema),
            ),
            ("EVINTAKE_AUTH_MODE".to_string(), "hs256".to_string()),
            ("EVINTAKE_AUTH_REQUIRED".to_string(), "true".to_string()),
            ("EVINTAKE_JWT_SECRET".to_string(), JWT_SECRET.to_string()),
            (
                "EVINTAKE_PRESIGN_SECRET".to_string(),
                PRESIGN_SECRET.to_string(),
            ),
            (
                "EVINTAKE_PUBLIC_BASE_URL".to_string(),
                format!("http://{}", addr),
            ),
            (
                "EVINTAKE_BLOB_ROOT".to_string(),
                blob_root.path().to_string_lossy().to_string(),
            ),
            (
                "EVINTAKE_IDEMPOTENCY_SWEEP_INTERVAL_SECS".to_string(),
                "0".to_string(),
            ),
        ]))
        .expect("gateway config should be valid");

        let app = evintake_gateway::http::router(config)
            .await
            .expect("gateway router should init");
        let (shutdown, task) = spawn_server(listener, app);

        let gateway = Self {
            addr,
            client: reqwest::Client::new(),
            admin,
            schema,
            shutdown: Some(shutdown),
            task,
            _blob_root: blob_root,
        };
        gateway.wait_for_healthz().await;
        gateway
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn wait_for_healthz(&self) {
        let url = self.url("/healthz");
        for _ in 0..50 {
            if let Ok(response) = self.client.get(&url).send().await
                && response.status().is_success()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server did not become ready at {}", url);
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.task.await;
        let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await;
    }
}

fn spawn_server(
    listener: TcpListener,
    app: Router,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    (shutdown_tx, handle)
}

fn bearer(user_id: &str, tenant_id: &str, role: &str) -> String {
    let claims = serde_json::json!({
        "sub": user_id,
        "tenant_id": tenant_id,
        "role": role,
        "exp": 4_000_000_000u64,
    });
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("token encode should succeed");
    format!("Bearer {}", token)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(bytes))
}

fn pdf_bytes(seed: &str) -> Vec<u8> {
    let mut bytes = b"%PDF-1.4\n".to_vec();
    bytes.extend_from_slice(format!("smoke evidence {}\n", seed).as_bytes());
    bytes.extend(std::iter::repeat_n(b'x', 2048));
    bytes
}

fn upload_form(evidence_id: &str, application_id: &str, bytes: &[u8]) -> Form {
    let metadata = serde_json::json!({
        "evidence_id": evidence_id,
        "application_id": application_id,
        "evidence_type": "document",
        "sha256_hash_device": sha256_hex(bytes),
        "captured_at_device": chrono::Utc::now().to_rfc3339(),
        "gps_coordinates": {"latitude": 47.6062, "longitude": -122.3321, "accuracy_meters": 8.0},
        "mime_type": "application/pdf",
        "file_size_bytes": bytes.len(),
    });
    Form::new()
        .text("metadata", metadata.to_string())
        .part(
            "file",
            Part::bytes(bytes.to_vec())
                .file_name(format!("{}.pdf", evidence_id))
                .mime_str("application/pdf")
                .expect("mime should parse"),
        )
}

async fn json_of(response: reqwest::Response) -> serde_json::Value {
    response
        .json::<serde_json::Value>()
        .await
        .expect("response should be valid JSON")
}

async fn create_application(gateway: &Gateway, auth: &str) -> String {
    let response = gateway
        .client
        .post(gateway.url("/v1/applications"))
        .header("authorization", auth)
        .json(&serde_json::json!({
            "application_type": "food_service_permit",
            "business_name": "Harbor Noodle Bar",
        }))
        .send()
        .await
        .expect("create application should succeed");
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_of(response).await;
    assert_eq!(body["status"], "draft");
    body["application_id"]
        .as_str()
        .expect("application_id should exist")
        .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_upload_rejects_duplicates_and_replays_idempotent_requests() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping e2e smoke test; set EVINTAKE_TEST_DB_URL to enable");
        return;
    };
    let gateway = Gateway::start(&db_url).await;
    let auth = bearer("inspector-1", "county-a", "inspector");

    let unauthenticated = gateway
        .client
        .post(gateway.url("/v1/evidence"))
        .multipart(upload_form("ev-anon", "app_smoke", &pdf_bytes("anon")))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let bytes = pdf_bytes("first");
    let response = gateway
        .client
        .post(gateway.url("/v1/evidence"))
        .header("authorization", &auth)
        .header("x-correlation-id", "smoke-upload-1")
        .header("idempotency-key", "smoke-key-1")
        .multipart(upload_form("ev-smoke-1", "app_smoke", &bytes))
        .send()
        .await
        .expect("upload should complete");
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response
            .headers()
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok()),
        Some("smoke-upload-1")
    );
    let created = json_of(response).await;
    assert_eq!(created["evidence_id"], "ev-smoke-1");
    assert_eq!(created["integrity_passed"], true);

    let replay = gateway
        .client
        .post(gateway.url("/v1/evidence"))
        .header("authorization", &auth)
        .header("idempotency-key", "smoke-key-1")
        .multipart(upload_form("ev-smoke-1", "app_smoke", &bytes))
        .send()
        .await
        .expect("replay should complete");
    assert_eq!(replay.status(), StatusCode::CREATED);
    assert_eq!(json_of(replay).await, created);

    let duplicate_id = gateway
        .client
        .post(gateway.url("/v1/evidence"))
        .header("authorization", &auth)
        .multipart(upload_form("ev-smoke-1", "app_smoke", &pdf_bytes("other")))
        .send()
        .await
        .expect("duplicate id upload should complete");
    assert_eq!(duplicate_id.status(), StatusCode::CONFLICT);
    assert_eq!(json_of(duplicate_id).await["code"], "DUPLICATE_EVIDENCE_ID");

    let duplicate_content = gateway
        .client
        .post(gateway.url("/v1/evidence"))
        .header("authorization", &auth)
        .multipart(upload_form("ev-smoke-2", "app_smoke", &bytes))
        .send()
        .await
        .expect("duplicate content upload should complete");
    assert_eq!(duplicate_content.status(), StatusCode::CONFLICT);
    let body = json_of(duplicate_content).await;
    assert_eq!(body["code"], "DUPLICATE_CONTENT");
    assert_eq!(body["detail"]["original_evidence_id"], "ev-smoke-1");

    let mut trailing = upload_form("ev-smoke-3", "app_smoke", &pdf_bytes("third"));
    trailing = trailing.text("ignored", "trailing part");
    let mismatch = gateway
        .client
        .post(gateway.url("/v1/evidence"))
        .header("authorization", &auth)
        .multipart(
            Form::new()
                .text(
                    "metadata",
                    serde_json::json!({
                        "evidence_id": "ev-smoke-4",
                        "application_id": "app_smoke",
                        "evidence_type": "document",
                        "sha256_hash_device": "0".repeat(64),
                        "captured_at_device": chrono::Utc::now().to_rfc3339(),
                        "gps_coordinates": {"latitude": 47.6, "longitude": -122.3, "accuracy_meters": 8.0},
                        "mime_type": "application/pdf",
                        "file_size_bytes": pdf_bytes("fourth").len(),
                    })
                    .to_string(),
                )
                .part("file", Part::bytes(pdf_bytes("fourth")).file_name("ev.pdf")),
        )
        .send()
        .await
        .expect("mismatched upload should complete");
    assert_eq!(mismatch.status(), StatusCode::BAD_REQUEST);
    let body = json_of(mismatch).await;
    assert_eq!(body["code"], "INTEGRITY_VALIDATION_FAILED");
    assert_eq!(body["detail"]["integrity_check"]["integrity_passed"], false);

    let accepted = gateway
        .client
        .post(gateway.url("/v1/evidence"))
        .header("authorization", &auth)
        .multipart(trailing)
        .send()
        .await
        .expect("upload with trailing part should complete");
    assert_eq!(accepted.status(), StatusCode::CREATED);

    let fetched = gateway
        .client
        .get(gateway.url("/v1/evidence/ev-smoke-1"))
        .header("authorization", &auth)
        .send()
        .await
        .expect("get evidence should complete");
    assert_eq!(fetched.status(), StatusCode::OK);
    let fetched = json_of(fetched).await;
    assert_eq!(fetched["sha256_hash_server"], sha256_hex(&bytes));
    let download_url = fetched["download_url"]
        .as_str()
        .expect("download_url should exist")
        .to_string();

    let blob = gateway
        .client
        .get(&download_url)
        .send()
        .await
        .expect("blob download should complete");
    assert_eq!(blob.status(), StatusCode::OK);
    assert_eq!(
        blob.bytes().await.expect("blob body should read").as_ref(),
        bytes.as_slice()
    );

    let forged = gateway
        .client
        .get(format!("{}0", download_url))
        .send()
        .await
        .expect("forged download should complete");
    assert_eq!(forged.status(), StatusCode::FORBIDDEN);

    let other_tenant = gateway
        .client
        .get(gateway.url("/v1/evidence/ev-smoke-1"))
        .header("authorization", bearer("inspector-9", "county-b", "inspector"))
        .send()
        .await
        .expect("cross-tenant get should complete");
    assert_eq!(other_tenant.status(), StatusCode::NOT_FOUND);

    let audit_rows: Vec<(String, String)> = sqlx::query_as(&format!(
        "SELECT action, result FROM {}.evintake_audit_log WHERE resource_id = 'ev-smoke-1' ORDER BY occurred_at",
        gateway.schema
    ))
    .fetch_all(&gateway.admin)
    .await
    .expect("audit rows should load");
    assert_eq!(
        audit_rows,
        vec![
            ("evidence.upload".to_string(), "success".to_string()),
            ("evidence.upload".to_string(), "rejected".to_string()),
        ]
    );

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_application_facts_evaluation_and_snapshots() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping e2e smoke test; set EVINTAKE_TEST_DB_URL to enable");
        return;
    };
    let gateway = Gateway::start(&db_url).await;
    let auth = bearer("owner-1", "county-a", "applicant_owner");
    let application_id = create_application(&gateway, &auth).await;

    let empty = gateway
        .client
        .post(gateway.url(&format!("/v1/applications/{}/evaluate", application_id)))
        .header("authorization", &auth)
        .send()
        .await
        .expect("evaluate should complete");
    assert_eq!(empty.status(), StatusCode::OK);
    let empty = json_of(empty).await;
    assert_eq!(empty["overall_recommendation"], "insufficient_data");
    assert_eq!(empty["snapshot_version"], 1);

    let bad_fact = gateway
        .client
        .post(gateway.url(&format!("/v1/applications/{}/facts", application_id)))
        .header("authorization", &auth)
        .json(&serde_json::json!({"facts": [
            {"fact_name": "seating_capacity", "fact_type": "integer", "fact_value": 40},
            {"fact_name": "has_grease_trap", "fact_type": "boolean", "fact_value": "yes"},
        ]}))
        .send()
        .await
        .expect("fact upsert should complete");
    assert_eq!(bad_fact.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_of(bad_fact).await;
    assert_eq!(body["code"], "INVALID_FACT_VALUE");
    assert_eq!(body["detail"]["index"], 1);

    let facts = gateway
        .client
        .post(gateway.url(&format!("/v1/applications/{}/facts", application_id)))
        .header("authorization", &auth)
        .json(&serde_json::json!({"facts": [
            {"fact_name": "seating_capacity", "fact_type": "integer", "fact_value": 40},
            {"fact_name": "inspection_date", "fact_type": "date", "fact_value": "2026-05-01"},
        ]}))
        .send()
        .await
        .expect("fact upsert should complete");
    assert_eq!(facts.status(), StatusCode::OK);
    assert_eq!(
        json_of(facts).await["facts"]
            .as_array()
            .map(|facts| facts.len()),
        Some(2)
    );

    let unknown_rule = gateway
        .client
        .post(gateway.url(&format!("/v1/applications/{}/evaluate", application_id)))
        .header("authorization", &auth)
        .json(&serde_json::json!({"rule_ids": ["R999_NOPE"]}))
        .send()
        .await
        .expect("evaluate should complete");
    assert_eq!(unknown_rule.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        json_of(unknown_rule).await["detail"]["unknown_rule_ids"],
        serde_json::json!(["R999_NOPE"])
    );

    let evaluated = gateway
        .client
        .post(gateway.url(&format!("/v1/applications/{}/evaluate", application_id)))
        .header("authorization", &auth)
        .json(&serde_json::json!({"force": true}))
        .send()
        .await
        .expect("evaluate should complete");
    assert_eq!(evaluated.status(), StatusCode::OK);
    let evaluated = json_of(evaluated).await;
    assert_eq!(evaluated["overall_recommendation"], "approved");
    assert_eq!(evaluated["snapshot_version"], 2);
    assert_eq!(evaluated["facts_count"], 2);
    let snapshot_id = evaluated["snapshot_id"]
        .as_str()
        .expect("snapshot_id should exist")
        .to_string();

    let verify = gateway
        .client
        .get(gateway.url(&format!("/v1/snapshots/{}/verify", snapshot_id)))
        .header("authorization", &auth)
        .send()
        .await
        .expect("verify should complete");
    assert_eq!(verify.status(), StatusCode::OK);
    let verify = json_of(verify).await;
    assert_eq!(verify["hash_valid"], true);
    assert_eq!(verify["snapshot_hash"], evaluated["snapshot_hash"]);

    let foreign = gateway
        .client
        .get(gateway.url(&format!("/v1/snapshots/{}", snapshot_id)))
        .header("authorization", bearer("owner-2", "county-b", "applicant_owner"))
        .send()
        .await
        .expect("cross-tenant snapshot read should complete");
    assert_eq!(foreign.status(), StatusCode::FORBIDDEN);

    let snapshots = gateway
        .client
        .get(gateway.url(&format!("/v1/applications/{}/snapshots", application_id)))
        .header("authorization", &auth)
        .send()
        .await
        .expect("snapshot list should complete");
    let snapshots = json_of(snapshots).await;
    assert_eq!(snapshots["total"], 2);
    assert_eq!(snapshots["snapshots"][0]["snapshot_version"], 1);

    let application = gateway
        .client
        .get(gateway.url(&format!("/v1/applications/{}", application_id)))
        .header("authorization", &auth)
        .send()
        .await
        .expect("get application should complete");
    assert_eq!(json_of(application).await["latest_snapshot_id"], snapshot_id);

    let skip_review = gateway
        .client
        .patch(gateway.url(&format!("/v1/applications/{}/status", application_id)))
        .header("authorization", &auth)
        .json(&serde_json::json!({"status": "approved"}))
        .send()
        .await
        .expect("status change should complete");
    assert_eq!(skip_review.status(), StatusCode::CONFLICT);
    assert_eq!(json_of(skip_review).await["code"], "INVALID_STATUS_TRANSITION");

    for status in ["submitted", "under_review", "approved"] {
        let response = gateway
            .client
            .patch(gateway.url(&format!("/v1/applications/{}/status", application_id)))
            .header("authorization", &auth)
            .json(&serde_json::json!({"status": status}))
            .send()
            .await
            .expect("status change should complete");
        assert_eq!(response.status(), StatusCode::OK, "transition to {}", status);
        assert_eq!(json_of(response).await["status"], status);
    }

    let removed = gateway
        .client
        .delete(gateway.url(&format!(
            "/v1/applications/{}/facts/seating_capacity",
            application_id
        )))
        .header("authorization", &auth)
        .send()
        .await
        .expect("fact delete should complete");
    assert_eq!(removed.status(), StatusCode::NO_CONTENT);

    let listed = gateway
        .client
        .get(gateway.url("/v1/applications?status=approved&limit=10"))
        .header("authorization", &auth)
        .send()
        .await
        .expect("application list should complete");
    let listed = json_of(listed).await;
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["items"][0]["application_id"], application_id);

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_export_packages_application_evidence() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping e2e smoke test; set EVINTAKE_TEST_DB_URL to enable");
        return;
    };
    let gateway = Gateway::start(&db_url).await;
    let auth = bearer("supervisor-1", "county-a", "supervisor");
    let application_id = create_application(&gateway, &auth).await;

    let bytes = pdf_bytes("export");
    let uploaded = gateway
        .client
        .post(gateway.url("/v1/evidence"))
        .header("authorization", &auth)
        .multipart(upload_form("ev-export-1", &application_id, &bytes))
        .send()
        .await
        .expect("upload should complete");
    assert_eq!(uploaded.status(), StatusCode::CREATED);

    let accepted = gateway
        .client
        .post(gateway.url("/v1/exports"))
        .header("authorization", &auth)
        .json(&serde_json::json!({"application_id": application_id, "sign_package": false}))
        .send()
        .await
        .expect("export create should complete");
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let accepted = json_of(accepted).await;
    assert_eq!(accepted["status"], "pending");
    let export_id = accepted["export_id"]
        .as_str()
        .expect("export_id should exist")
        .to_string();

    let mut export = serde_json::Value::Null;
    for _ in 0..100 {
        let response = gateway
            .client
            .get(gateway.url(&format!("/v1/exports/{}", export_id)))
            .header("authorization", &auth)
            .send()
            .await
            .expect("export get should complete");
        export = json_of(response).await;
        if export["status"] == "completed" || export["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(export["status"], "completed", "export: {}", export);
    assert_eq!(export["file_count"], 1);

    let link = gateway
        .client
        .get(gateway.url(&format!("/v1/exports/{}/download", export_id)))
        .header("authorization", &auth)
        .send()
        .await
        .expect("export download should complete");
    assert_eq!(link.status(), StatusCode::OK);
    let link = json_of(link).await;
    let download_url = link["download_url"]
        .as_str()
        .expect("download_url should exist")
        .to_string();

    let package = gateway
        .client
        .get(&download_url)
        .send()
        .await
        .expect("package download should complete");
    assert_eq!(package.status(), StatusCode::OK);
    assert_eq!(
        package
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/zip")
    );
    let package = package.bytes().await.expect("package body should read");

    let mut archive =
        zip::ZipArchive::new(Cursor::new(package.to_vec())).expect("zip should open");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry should exist")
        .read_to_string(&mut manifest)
        .expect("manifest should read");
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest).expect("manifest should be JSON");
    assert_eq!(manifest["evidence_count"], 1);
    assert!(archive.by_name("evidence/001_ev-export-1.pdf").is_ok());

    let listed = gateway
        .client
        .get(gateway.url(&format!("/v1/exports?application_id={}", application_id)))
        .header("authorization", &auth)
        .send()
        .await
        .expect("export list should complete");
    let listed = json_of(listed).await;
    assert_eq!(listed["items"][0]["export_id"], export_id);

    let other_tenant = gateway
        .client
        .get(gateway.url(&format!("/v1/exports/{}/download", export_id)))
        .header("authorization", bearer("supervisor-9", "county-b", "supervisor"))
        .send()
        .await
        .expect("cross-tenant download should complete");
    assert_eq!(other_tenant.status(), StatusCode::NOT_FOUND);

    gateway.stop().await;
}
