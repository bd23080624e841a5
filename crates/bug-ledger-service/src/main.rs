use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bug_ledger_api::{
    is_not_found, load_config, CanonicalBug, CrashInput, CreateBugRequest, LedgerApi,
    MarkDuplicateRequest, API_CONTRACT_VERSION,
};
use bug_ledger_core::{CrashRecord, LedgerConfig, TextId, TextKind};
use clap::Parser;
use http::header;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: LedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct BugQuery {
    namespace: String,
    title: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TextQuery {
    namespace: String,
    tag: String,
    id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct PutTextRequest {
    namespace: String,
    kind: TextKind,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct PutTextResponse {
    text: bug_ledger_api::TextRef,
    link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AddCrashRequest {
    namespace: String,
    title: String,
    manager: String,
    build_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    time: Option<OffsetDateTime>,
    #[serde(default)]
    maintainers: Vec<String>,
    #[serde(default)]
    log: String,
    #[serde(default)]
    report: String,
    #[serde(default)]
    repro_opts: String,
    #[serde(default)]
    repro_syz: String,
    #[serde(default)]
    repro_c: String,
}

#[derive(Debug, Parser)]
#[command(name = "bug-ledger-service")]
#[command(about = "Local HTTP service for the bug ledger")]
struct Args {
    #[arg(long, default_value = "./bug_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn api_error(err: &anyhow::Error) -> ServiceError {
        let mut error = Self::error(format!("{err:#}"));
        if is_not_found(err) {
            error.status = StatusCode::NOT_FOUND;
        } else {
            warn!(error = %error.error, "request failed");
        }
        error
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/bug", get(bug_show).post(bug_create))
        .route("/v1/bug/canonical", get(bug_canonical))
        .route("/v1/bug/dup", post(bug_dup))
        .route("/v1/bug/crashes", get(crash_list))
        .route("/v1/crash", post(crash_add))
        .route("/v1/text", post(text_put))
        .route("/text", get(text_get))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = match args.config.as_deref() {
        Some(path) => load_config(path)?,
        None => LedgerConfig::default(),
    };
    let state = ServiceState { api: LedgerApi::new(args.db, config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "bug ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<bug_ledger_api::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<bug_ledger_api::MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn bug_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateBugRequest>,
) -> Result<Json<ServiceEnvelope<bug_ledger_api::StoredBug>>, ServiceError> {
    let bug = state.api.create_bug(request).map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(bug)))
}

async fn bug_show(
    State(state): State<ServiceState>,
    Query(query): Query<BugQuery>,
) -> Result<Json<ServiceEnvelope<bug_ledger_api::StoredBug>>, ServiceError> {
    let bug = state
        .api
        .show_bug(&query.namespace, &query.title)
        .map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(bug)))
}

async fn bug_canonical(
    State(state): State<ServiceState>,
    Query(query): Query<BugQuery>,
) -> Result<Json<ServiceEnvelope<CanonicalBug>>, ServiceError> {
    let canonical = state
        .api
        .canonical_bug(&query.namespace, &query.title)
        .map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(canonical)))
}

async fn bug_dup(
    State(state): State<ServiceState>,
    Json(request): Json<MarkDuplicateRequest>,
) -> Result<Json<ServiceEnvelope<bug_ledger_api::StoredBug>>, ServiceError> {
    let bug = state.api.mark_duplicate(&request).map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(bug)))
}

async fn crash_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddCrashRequest>,
) -> Result<Json<ServiceEnvelope<CrashRecord>>, ServiceError> {
    let input = CrashInput {
        manager: request.manager,
        build_id: request.build_id,
        time: request.time.unwrap_or_else(OffsetDateTime::now_utc),
        maintainers: request.maintainers,
        log: request.log.into_bytes(),
        report: request.report.into_bytes(),
        repro_opts: request.repro_opts.into_bytes(),
        repro_syz: request.repro_syz.into_bytes(),
        repro_c: request.repro_c.into_bytes(),
    };
    let crash = state
        .api
        .add_crash(&request.namespace, &request.title, &input)
        .map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(crash)))
}

async fn crash_list(
    State(state): State<ServiceState>,
    Query(query): Query<BugQuery>,
) -> Result<Json<ServiceEnvelope<Vec<CrashRecord>>>, ServiceError> {
    let crashes = state
        .api
        .list_crashes(&query.namespace, &query.title)
        .map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(crashes)))
}

async fn text_put(
    State(state): State<ServiceState>,
    Json(request): Json<PutTextRequest>,
) -> Result<Json<ServiceEnvelope<PutTextResponse>>, ServiceError> {
    let text = state
        .api
        .put_text(&request.namespace, request.kind, request.content.as_bytes())
        .map_err(|err| ServiceState::api_error(&err))?;
    let link = text.link();
    Ok(Json(envelope(PutTextResponse { text, link })))
}

/// Serves the locator produced by `text_link` as raw text.
async fn text_get(
    State(state): State<ServiceState>,
    Query(query): Query<TextQuery>,
) -> Result<Response, ServiceError> {
    let kind = TextKind::parse(&query.tag)
        .ok_or_else(|| ServiceState::error(format!("unknown text tag `{}`", query.tag)))?;
    let content = state
        .api
        .get_text(&query.namespace, Some(kind), TextId(query.id))
        .map_err(|err| ServiceState::api_error(&err))?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], content)
        .into_response())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use axum::body::{to_bytes, Body};
    use bug_ledger_core::NamespaceConfig;
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("bug-ledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_router(db_path: PathBuf) -> Router {
        let config = LedgerConfig {
            namespaces: BTreeMap::from([(
                "upstream".to_string(),
                NamespaceConfig { key: "service-secret".to_string() },
            )]),
            ..LedgerConfig::default()
        };
        app(ServiceState { api: LedgerApi::new(db_path, config) })
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<&Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn data_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("missing `{pointer}` in response: {value}"))
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = fixture_router(unique_temp_db_path());

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(data_str(&value, "/service_contract_version"), SERVICE_CONTRACT_VERSION);
        assert_eq!(data_str(&value, "/api_contract_version"), API_CONTRACT_VERSION);
        assert_eq!(data_str(&value, "/data/status"), "ok");
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = fixture_router(unique_temp_db_path());

        let response = send(&router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_text(response).await;
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/bug/canonical"));
        assert!(body.contains("/text:"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn duplicate_bug_resolves_to_canonical_over_http() {
        let db_path = unique_temp_db_path();
        let router = fixture_router(db_path.clone());
        let create = serde_json::json!({ "namespace": "upstream", "title": "WARNING in bar" });

        let first = response_json(send(&router, "POST", "/v1/bug", Some(&create)).await).await;
        let second = response_json(send(&router, "POST", "/v1/bug", Some(&create)).await).await;
        assert_eq!(data_str(&second, "/data/display_title"), "WARNING in bar (2)");

        let dup = serde_json::json!({
            "namespace": "upstream",
            "title": "WARNING in bar (2)",
            "dup_of": "WARNING in bar"
        });
        let response = send(&router, "POST", "/v1/bug/dup", Some(&dup)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let marked = response_json(response).await;
        assert_eq!(data_str(&marked, "/data/bug/status"), "duplicate");
        assert_eq!(data_str(&marked, "/data/bug/dup_of"), data_str(&first, "/data/key"));

        let response = send(
            &router,
            "GET",
            "/v1/bug/canonical?namespace=upstream&title=WARNING%20in%20bar%20(2)",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let canonical = response_json(response).await;
        assert_eq!(data_str(&canonical, "/data/canonical/key"), data_str(&first, "/data/key"));
        assert_eq!(data_str(&canonical, "/data/requested_key"), data_str(&second, "/data/key"));
        assert_eq!(canonical.pointer("/data/hops").and_then(Value::as_u64), Some(1));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn text_locator_serves_stored_blob() {
        let db_path = unique_temp_db_path();
        let router = fixture_router(db_path.clone());

        let put = serde_json::json!({
            "namespace": "upstream",
            "kind": "ReproSyz",
            "content": "r0 = socket(0x2, 0x1, 0x0)"
        });
        let stored = response_json(send(&router, "POST", "/v1/text", Some(&put)).await).await;
        let link = data_str(&stored, "/data/link").to_string();
        assert!(link.starts_with("/text?tag=ReproSyz&id="));

        let response = send(&router, "GET", &format!("{link}&namespace=upstream"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "r0 = socket(0x2, 0x1, 0x0)");

        let wrong_kind = link.replace("ReproSyz", "ReproC");
        let response =
            send(&router, "GET", &format!("{wrong_kind}&namespace=upstream"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response =
            send(&router, "GET", "/text?tag=Bogus&id=1&namespace=upstream", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let db_path = unique_temp_db_path();
        let router = fixture_router(db_path.clone());

        let response =
            send(&router, "GET", "/v1/bug/canonical?namespace=upstream&title=missing", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(data_str(&value, "/service_contract_version"), SERVICE_CONTRACT_VERSION);
        assert!(data_str(&value, "/error").contains("bug not found"));

        let unknown = serde_json::json!({ "namespace": "android", "title": "BUG: bad" });
        let response = send(&router, "POST", "/v1/bug", Some(&unknown)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(data_str(&response_json(response).await, "/error")
            .contains("has no configured key"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn crash_add_updates_bug_and_lists() {
        let db_path = unique_temp_db_path();
        let router = fixture_router(db_path.clone());
        let create =
            serde_json::json!({ "namespace": "upstream", "title": "KASAN: slab-out-of-bounds" });
        let response = send(&router, "POST", "/v1/bug", Some(&create)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let crash = serde_json::json!({
            "namespace": "upstream",
            "title": "KASAN: slab-out-of-bounds",
            "manager": "ci-upstream",
            "build_id": "b1",
            "time": "2024-05-01T08:00:00Z",
            "log": "console output",
            "report": "BUG: KASAN: slab-out-of-bounds",
            "repro_c": "int main(void) { return 0; }"
        });
        let response = send(&router, "POST", "/v1/crash", Some(&crash)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &router,
            "GET",
            "/v1/bug?namespace=upstream&title=KASAN:%20slab-out-of-bounds",
            None,
        )
        .await;
        let bug = response_json(response).await;
        assert_eq!(data_str(&bug, "/data/bug/repro_level"), "c");
        assert_eq!(bug.pointer("/data/bug/num_crashes").and_then(Value::as_u64), Some(1));

        let response = send(
            &router,
            "GET",
            "/v1/bug/crashes?namespace=upstream&title=KASAN:%20slab-out-of-bounds",
            None,
        )
        .await;
        let listed = response_json(response).await;
        let crashes = listed
            .pointer("/data")
            .and_then(Value::as_array)
            .unwrap_or_else(|| panic!("missing crash list in response: {listed}"));
        assert_eq!(crashes.len(), 1);
        assert_eq!(data_str(&crashes[0], "/manager"), "ci-upstream");

        let _ = std::fs::remove_file(&db_path);
    }
}
