use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use revision_kernel_core::{decode_snapshot, AttributeMap, ItemId, Revision, RevisionId};
use revision_kernel_store_sqlite::{RevisionStore, SchemaStatus};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct MigrateResponse {
    dry_run: bool,
    before_version: i64,
    after_version: Option<i64>,
    target_version: i64,
    would_apply_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct StateAtQuery {
    at: String,
}

#[derive(Debug, Clone, Serialize)]
struct StateAtResponse {
    status: &'static str,
    source_revision_id: Option<RevisionId>,
    attributes: Option<AttributeMap>,
}

#[derive(Debug, Clone, Serialize)]
struct ChangesetResponse {
    supported: bool,
    changeset: Option<revision_kernel_core::ChangeSet>,
}

#[derive(Debug, Parser)]
#[command(name = "revision-kernel-service")]
#[command(about = "Local HTTP service for Revision Kernel trail inspection")]
struct Args {
    #[arg(long, default_value = "./revision_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn open_store(&self) -> Result<RevisionStore> {
        let mut store = RevisionStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/items/:item_type/:item_id/revisions", get(item_revisions))
        .route("/v1/items/:item_type/:item_id/state-at", get(item_state_at))
        .route("/v1/revisions/:id", get(revision_show))
        .route("/v1/revisions/:id/changeset", get(revision_changeset))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args = Args::parse();
    let state = ServiceState { db_path: args.db };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let store = RevisionStore::open(&state.db_path)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    let status = store.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResponse>>, ServiceError> {
    let mut store = RevisionStore::open(&state.db_path)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    let before = store.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;

    if request.dry_run {
        return Ok(Json(envelope(MigrateResponse {
            dry_run: true,
            before_version: before.current_version,
            after_version: None,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
        })));
    }

    store.migrate().map_err(|err| ServiceState::error(err.to_string()))?;
    let after = store.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(MigrateResponse {
        dry_run: false,
        before_version: before.current_version,
        after_version: Some(after.current_version),
        target_version: after.target_version,
        would_apply_versions: before.pending_versions,
    })))
}

async fn item_revisions(
    State(state): State<ServiceState>,
    Path((item_type, item_id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<Vec<Revision>>>, ServiceError> {
    let store = state.open_store().map_err(|err| ServiceState::error(err.to_string()))?;
    let revisions = store
        .for_item(&item_type, &ItemId::new(item_id))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(revisions)))
}

async fn item_state_at(
    State(state): State<ServiceState>,
    Path((item_type, item_id)): Path<(String, String)>,
    Query(query): Query<StateAtQuery>,
) -> Result<Json<ServiceEnvelope<StateAtResponse>>, ServiceError> {
    let at = OffsetDateTime::parse(&query.at, &Rfc3339)
        .map_err(|err| ServiceState::error(format!("invalid `at` timestamp: {err}")))?;

    let store = state.open_store().map_err(|err| ServiceState::error(err.to_string()))?;
    let following = store
        .following(&item_type, &ItemId::new(item_id), at)
        .map_err(|err| ServiceState::error(err.to_string()))?;

    let response = match following.first() {
        None => StateAtResponse { status: "live", source_revision_id: None, attributes: None },
        Some(revision) => match revision.object.as_deref() {
            None => StateAtResponse {
                status: "absent",
                source_revision_id: Some(revision.id),
                attributes: None,
            },
            Some(raw) => {
                let attributes = decode_snapshot(raw)
                    .map_err(|err| ServiceState::error(err.to_string()))?;
                StateAtResponse {
                    status: "historical",
                    source_revision_id: Some(revision.id),
                    attributes: Some(attributes),
                }
            }
        },
    };
    Ok(Json(envelope(response)))
}

async fn revision_show(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceEnvelope<Revision>>, ServiceError> {
    let store = state.open_store().map_err(|err| ServiceState::error(err.to_string()))?;
    let revision = store
        .get(RevisionId(id))
        .map_err(|err| ServiceState::error(err.to_string()))?
        .ok_or_else(|| ServiceState::error(format!("revision not found: {id}")))?;
    Ok(Json(envelope(revision)))
}

async fn revision_changeset(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceEnvelope<ChangesetResponse>>, ServiceError> {
    let store = state.open_store().map_err(|err| ServiceState::error(err.to_string()))?;
    let revision = store
        .get(RevisionId(id))
        .map_err(|err| ServiceState::error(err.to_string()))?
        .ok_or_else(|| ServiceState::error(format!("revision not found: {id}")))?;
    let changeset =
        store.changeset(&revision).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(ChangesetResponse { supported: changeset.is_some(), changeset })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use revision_kernel_core::{AttributeMap, NewRevision, RevisionEvent};
    use time::Duration;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("revisionkernel-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn seed_trail(db_path: &std::path::Path) -> OffsetDateTime {
        let mut store = match RevisionStore::open(db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open seed store: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate seed store: {err}");
        }

        let base = OffsetDateTime::UNIX_EPOCH + Duration::days(19_000);
        let revisions = [
            NewRevision {
                item_type: "Widget".to_string(),
                item_id: ItemId::from("7"),
                event: RevisionEvent::Create,
                recorded_at: base,
                object: None,
                object_changes: None,
                whodunnit: Some("Alice".to_string()),
                metadata: AttributeMap::new(),
            },
            NewRevision {
                item_type: "Widget".to_string(),
                item_id: ItemId::from("7"),
                event: RevisionEvent::Update,
                recorded_at: base + Duration::seconds(60),
                object: Some(r#"{"name":{"type":"text","value":"A"}}"#.to_string()),
                object_changes: None,
                whodunnit: Some("Bob".to_string()),
                metadata: AttributeMap::new(),
            },
        ];
        for revision in &revisions {
            if let Err(err) = store.append(revision) {
                panic!("failed to seed revision: {err}");
            }
        }
        base
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState { db_path: unique_temp_db_path() };
        let router = app(state);

        let (status, value) = get_json(router, "/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.pointer("/data/status").and_then(serde_json::Value::as_str), Some("ok"));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = ServiceState { db_path: unique_temp_db_path() };
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/items/{item_type}/{item_id}/state-at"));
        assert!(body.contains("/v1/revisions/{id}/changeset"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn trail_inspection_flow_round_trips() {
        let db_path = unique_temp_db_path();
        let base = seed_trail(&db_path);
        let state = ServiceState { db_path: db_path.clone() };
        let router = app(state);

        let (status, listed) = get_json(router.clone(), "/v1/items/Widget/7/revisions").await;
        assert_eq!(status, StatusCode::OK);
        let revisions = listed
            .pointer("/data")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing data array: {listed}"));
        assert_eq!(revisions.len(), 2);

        let update_id = revisions[1]
            .get("id")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_else(|| panic!("missing revision id: {listed}"));

        let (status, shown) = get_json(router.clone(), &format!("/v1/revisions/{update_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            shown.pointer("/data/event").and_then(serde_json::Value::as_str),
            Some("update")
        );

        let (status, changeset) =
            get_json(router.clone(), &format!("/v1/revisions/{update_id}/changeset")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            changeset.pointer("/data/supported").and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let mid = base + Duration::seconds(30);
        let mid_raw = match mid.format(&Rfc3339) {
            Ok(raw) => raw,
            Err(err) => panic!("failed to format fixture timestamp: {err}"),
        };
        let encoded_at = mid_raw.replace('+', "%2B");
        let (status, state_at) =
            get_json(router, &format!("/v1/items/Widget/7/state-at?at={encoded_at}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            state_at.pointer("/data/status").and_then(serde_json::Value::as_str),
            Some("historical")
        );
        assert_eq!(
            state_at.pointer("/data/attributes/name/value").and_then(serde_json::Value::as_str),
            Some("A")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn unknown_revisions_return_an_error_envelope() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { db_path: db_path.clone() };
        let router = app(state);

        let (status, value) = get_json(router, "/v1/revisions/9999").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|message| message.contains("not found")));

        let _ = std::fs::remove_file(&db_path);
    }
}
