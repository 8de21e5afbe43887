use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use movement_xref_api::{
    BackendConfig, CacheSettings, ConsultationRequest, ExportFormat, MovementXrefApi,
    API_CONTRACT_VERSION,
};
use movement_xref_core::{ConsultationReport, XrefError};
use movement_xref_store_postgrest::{PostgrestConfig, DEFAULT_TABLE, DEFAULT_UNITS_RELATION};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: MovementXrefApi,
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

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct UnitsResponse {
    units: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Sqlite,
    Postgrest,
}

#[derive(Debug, Parser)]
#[command(name = "movement-xref-service")]
#[command(about = "Local HTTP service for movement cross-reference lookups")]
struct Args {
    #[arg(long, env = "MOVEMENT_XREF_BACKEND", value_enum, default_value_t = Backend::Sqlite)]
    backend: Backend,
    #[arg(long, env = "MOVEMENT_XREF_DB", default_value = "./movement_xref.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "SUPABASE_URL")]
    supabase_url: Option<String>,
    #[arg(long, env = "SUPABASE_ANON_KEY", hide_env_values = true)]
    supabase_anon_key: Option<String>,
    #[arg(long, env = "SUPABASE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    #[arg(long, default_value = DEFAULT_TABLE)]
    table: String,
    /// Relation listing distinct units.
    #[arg(long, default_value = DEFAULT_UNITS_RELATION)]
    units_relation: String,
    /// The remote table predates the `ano` column.
    #[arg(long)]
    without_year_column: bool,
    #[arg(long, default_value_t = 20)]
    http_timeout_secs: u64,
    #[arg(long, env = "MOVEMENT_XREF_CACHE_TTL_SECS", default_value_t = 120)]
    cache_ttl_secs: u64,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl Args {
    fn backend_config(&self) -> Result<BackendConfig> {
        match self.backend {
            Backend::Sqlite => Ok(BackendConfig::Sqlite { db_path: self.db.clone() }),
            Backend::Postgrest => {
                let (Some(url), Some(key)) =
                    (self.supabase_url.as_deref(), self.supabase_anon_key.as_deref())
                else {
                    return Err(anyhow!(
                        "postgrest backend requires SUPABASE_URL and SUPABASE_ANON_KEY"
                    ));
                };
                let config = PostgrestConfig::new(url, key)?
                    .with_access_token(self.access_token.clone())
                    .with_table(&self.table)
                    .with_units_relation(&self.units_relation)
                    .with_timeout(Duration::from_secs(self.http_timeout_secs))
                    .with_year_column(!self.without_year_column);
                Ok(BackendConfig::Postgrest(config))
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn from_api(err: &anyhow::Error) -> Self {
        let status = match err.downcast_ref::<XrefError>() {
            Some(XrefError::DataAccess(_)) => StatusCode::BAD_GATEWAY,
            Some(XrefError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status != StatusCode::BAD_REQUEST {
            tracing::error!(status = %status, error = %format!("{err:#}"), "request failed");
        }
        Self::new(status, format!("{err:#}"))
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

/// Data access is blocking (SQLite or HTTP), so every api call runs off the runtime threads.
async fn run_blocking<T, F>(work: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ServiceError::from_api(&err)),
        Err(err) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("worker task failed: {err}"),
        )),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/units", get(units))
        .route("/v1/consultation", post(consultation))
        .route("/v1/export/csv", post(export_csv))
        .route("/v1/export/xlsx", post(export_xlsx))
        .with_state(state)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("MOVEMENT_XREF_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let backend = args.backend_config()?;
    let state = ServiceState {
        api: MovementXrefApi::from_config(backend, CacheSettings::from_ttl_secs(args.cache_ttl_secs)),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, backend = ?args.backend, "movement-xref service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn units(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<UnitsResponse>>, ServiceError> {
    let units = run_blocking(move || state.api.list_units()).await?;
    Ok(Json(envelope(UnitsResponse { units })))
}

async fn consultation(
    State(state): State<ServiceState>,
    Json(request): Json<ConsultationRequest>,
) -> Result<Json<ServiceEnvelope<ConsultationReport>>, ServiceError> {
    let report = run_blocking(move || state.api.consult(&request.unit)).await?;
    Ok(Json(envelope(report)))
}

async fn export_csv(
    State(state): State<ServiceState>,
    Json(request): Json<ConsultationRequest>,
) -> Result<Response, ServiceError> {
    export(state, request, ExportFormat::Csv).await
}

async fn export_xlsx(
    State(state): State<ServiceState>,
    Json(request): Json<ConsultationRequest>,
) -> Result<Response, ServiceError> {
    export(state, request, ExportFormat::Xlsx).await
}

async fn export(
    state: ServiceState,
    request: ConsultationRequest,
    format: ExportFormat,
) -> Result<Response, ServiceError> {
    let artifact = run_blocking(move || state.api.export(&request.unit, format)).await?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, artifact.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use movement_xref_core::{CrossReferenceQuery, InMemorySource, MovementRecord, MovementSource};
    use tower::ServiceExt;

    struct UnreachableSource;

    impl MovementSource for UnreachableSource {
        fn list_units(&self) -> Result<Vec<String>, XrefError> {
            Err(XrefError::DataAccess("connection refused".to_string()))
        }

        fn query_by_unit(&self, _unit: &str) -> Result<Vec<MovementRecord>, XrefError> {
            Err(XrefError::DataAccess("connection refused".to_string()))
        }

        fn query_by_members_and_periods(
            &self,
            _query: &CrossReferenceQuery,
        ) -> Result<Vec<MovementRecord>, XrefError> {
            Err(XrefError::DataAccess("connection refused".to_string()))
        }
    }

    fn mk(unit: &str, period: &str, member: &str, category: &str) -> MovementRecord {
        MovementRecord {
            unit: Some(unit.to_string()),
            period: Some(period.to_string()),
            member: Some(member.to_string()),
            assignment_category: Some(category.to_string()),
            ..MovementRecord::default()
        }
    }

    fn fixture_router() -> Router {
        let source = InMemorySource::new(vec![
            mk("PJ 1", "JANEIRO", "Ana", "TITULAR"),
            mk("PJ 1", "JANEIRO", "VAGO", "TITULAR"),
            mk("PJ 2", "JANEIRO", "Ana", "AUXÍLIO"),
            mk("PJ 2", "FEVEREIRO", "Ana", "AUXÍLIO"),
        ]);
        app(ServiceState { api: MovementXrefApi::new(Arc::new(source)) })
    }

    fn get_request(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_request(uri: &str, payload: &serde_json::Value) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(payload.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: Router, request: Request<axum::body::Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => panic!("failed to read response body: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = body_bytes(response).await;
        let body = match String::from_utf8(bytes) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn header_value(response: &Response, name: header::HeaderName) -> String {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = send(fixture_router(), get_request("/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.pointer("/data/status").and_then(serde_json::Value::as_str),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn openapi_endpoint_serves_the_embedded_document() {
        let response = send(fixture_router(), get_request("/v1/openapi")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8_lossy(&body_bytes(response).await).to_string();
        assert!(body.contains("/v1/consultation"));
    }

    #[tokio::test]
    async fn units_endpoint_lists_distinct_units() {
        let response = send(fixture_router(), get_request("/v1/units")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.pointer("/data/units"), Some(&serde_json::json!(["PJ 1", "PJ 2"])));
    }

    #[tokio::test]
    async fn consultation_returns_both_tables() {
        let response = send(
            fixture_router(),
            post_request("/v1/consultation", &serde_json::json!({"unit": "PJ 1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/data/status").and_then(serde_json::Value::as_str),
            Some("records")
        );
        let others = value
            .pointer("/data/cross_reference/rows")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing cross_reference rows: {value}"));
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].get("mes").and_then(serde_json::Value::as_str), Some("JANEIRO"));
        assert_eq!(
            value.pointer("/data/vacancy/total").and_then(serde_json::Value::as_u64),
            Some(1)
        );
    }

    #[tokio::test]
    async fn blank_unit_is_a_bad_request() {
        let response = send(
            fixture_router(),
            post_request("/v1/consultation", &serde_json::json!({"unit": "  "})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value.get("error").and_then(serde_json::Value::as_str).is_some());
    }

    #[tokio::test]
    async fn data_access_failures_map_to_bad_gateway() {
        let router = app(ServiceState { api: MovementXrefApi::new(Arc::new(UnreachableSource)) });

        let response = send(router.clone(), get_request("/v1/units")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = send(
            router,
            post_request("/v1/consultation", &serde_json::json!({"unit": "PJ 1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let value = response_json(response).await;
        assert!(value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|error| error.contains("connection refused")));
    }

    #[tokio::test]
    async fn csv_export_is_an_attachment() {
        let response = send(
            fixture_router(),
            post_request("/v1/export/csv", &serde_json::json!({"unit": "PJ 1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_value(&response, header::CONTENT_TYPE), "text/csv; charset=utf-8");
        assert_eq!(
            header_value(&response, header::CONTENT_DISPOSITION),
            "attachment; filename=\"consolidado_PJ_1.csv\""
        );

        let body = String::from_utf8_lossy(&body_bytes(response).await).to_string();
        assert!(body.lines().next().is_some_and(|header| header.ends_with("_tabela")));
        assert_eq!(body.lines().count(), 4);
    }

    #[tokio::test]
    async fn xlsx_export_is_a_workbook() {
        let response = send(
            fixture_router(),
            post_request("/v1/export/xlsx", &serde_json::json!({"unit": "PJ 1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_value(&response, header::CONTENT_DISPOSITION),
            "attachment; filename=\"consolidado_PJ_1.xlsx\""
        );
        assert!(body_bytes(response).await.starts_with(b"PK"));
    }

    #[test]
    fn postgrest_backend_requires_credentials() {
        let mut args = match Args::try_parse_from([
            "movement-xref-service",
            "--backend",
            "postgrest",
            "--table",
            "movimentacao",
        ]) {
            Ok(args) => args,
            Err(err) => panic!("args should parse: {err}"),
        };
        // Ignore any SUPABASE_* values inherited from the environment.
        args.supabase_url = None;
        args.supabase_anon_key = None;
        let err = match args.backend_config() {
            Ok(_) => panic!("postgrest backend without credentials should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("SUPABASE_URL"));

        args.supabase_url = Some("https://example.supabase.co".to_string());
        assert!(args.backend_config().is_err());

        let args = Args::parse_from([
            "movement-xref-service",
            "--backend",
            "postgrest",
            "--supabase-url",
            "https://example.supabase.co",
            "--supabase-anon-key",
            "anon",
        ]);
        match args.backend_config() {
            Ok(BackendConfig::Postgrest(config)) => {
                assert_eq!(config.units_url(), "https://example.supabase.co/rest/v1/orgaos_distintos");
            }
            other => panic!("expected a postgrest backend, got {other:?}"),
        }
    }
}
