//! # Registry Report Server
//!
//! A small HTTP service that validates report designs and streams exports of one
//! registry. Registry metadata and the patient snapshot are loaded once at
//! startup; every request posts a report design as its JSON body.
//!
//! ## API Endpoints
//!
//! ```text
//! GET /health
//!   Returns: service status
//!
//! POST /report/$validate
//!   Body: report design
//!   Query Parameters:
//!     _format: csv | ndjson (or a MIME type); CSV also checks label collisions
//!     pageSize: patients per page (1-1000)
//!   Returns: the compiled fetch request and the targeted population size
//!
//! POST /report/$export
//!   Body: report design
//!   Query Parameters: as for $validate
//!   Returns: the export, streamed with chunked transfer encoding
//! ```
//!
//! Errors are JSON bodies `{ "error": code, "message": text, "details": ... }`:
//! configuration and label collision problems are 422, fetch failures 502,
//! unsupported formats 415 and malformed requests 400.
//!
//! ## Configuration
//!
//! - `REPORT_SERVER_PORT` / `--port`: Server port (default: 8080)
//! - `REPORT_SERVER_HOST` / `--host`: Server host (default: 127.0.0.1)
//! - `REPORT_LOG_LEVEL` / `--log-level`: Log level (default: info)
//! - `REPORT_MAX_BODY_SIZE` / `--max-body-size`: Max request size in bytes (default: 10MB)
//! - `REPORT_REQUEST_TIMEOUT` / `--request-timeout`: Request timeout in seconds (default: 300)
//! - `REPORT_ENABLE_CORS` / `--enable-cors`: Enable CORS (default: true)
//! - `REPORT_CORS_ORIGINS` / `--cors-origins`: Allowed origins, comma-separated (default: *)
//! - `REPORT_METADATA` / `--metadata`: Registry metadata path or URL (required)
//! - `REPORT_SOURCE` / `--source`: Registry snapshot path or URL (required)
//! - `REPORT_PAGE_SIZE` / `--page-size`: Default patients per page (default: 20)

use atrius_registry_report::ExportOptions;
use atrius_registry_report::data_source::{DataSource, UniversalDataSource, normalize_source};
use atrius_registry_report::metadata::RegistryMetadata;
use atrius_registry_report::store::{InMemoryStore, RegistryStore};
use axum::{
    Router,
    routing::{get, post},
};
use http::{HeaderValue, Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod error;
mod handlers;
mod models;
mod streaming;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host address to bind to
    pub host: String,
    /// Log level for the server
    pub log_level: String,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Request timeout in seconds
    pub request_timeout: u64,
    /// Whether to enable CORS
    pub enable_cors: bool,
    /// Allowed CORS origins (comma-separated list, "*" for any)
    pub cors_origins: String,
    /// Registry metadata source
    pub metadata: String,
    /// Registry snapshot source
    pub source: String,
    /// Default patients per page
    pub page_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            log_level: "info".to_string(),
            max_body_size: 10 * 1024 * 1024, // 10MB
            request_timeout: 300,
            enable_cors: true,
            cors_origins: "*".to_string(),
            metadata: String::new(),
            source: String::new(),
            page_size: ExportOptions::default().page_size,
        }
    }
}

/// Shared, read-only state of every request
#[derive(Clone)]
pub struct AppState {
    pub metadata: Arc<RegistryMetadata>,
    pub store: Arc<dyn RegistryStore>,
    pub options: ExportOptions,
}

/// Main server entry point
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_args();

    let filter = format!(
        "atrius_report_server={},atrius_registry_report={},tower_http={}",
        config.log_level, config.log_level, config.log_level
    );
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .init();

    info!("Starting registry report server...");
    info!("Configuration: {:?}", config);

    let state = load_state(&config).await?;
    let app = create_app_with_config(&config, state);

    let host: std::net::IpAddr = config.host.parse().unwrap_or_else(|_| {
        warn!("Invalid host address '{}', using 127.0.0.1", config.host);
        std::net::IpAddr::from([127, 0, 0, 1])
    });

    let addr = SocketAddr::from((host, config.port));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Parse command line arguments for server configuration
fn parse_args() -> ServerConfig {
    use clap::Parser;

    #[derive(Parser, Debug)]
    #[command(
        author,
        version,
        about = "Registry report HTTP server",
        long_about = "HTTP server validating report designs and streaming CSV or NDJSON exports of one registry\n\nEnvironment variables:\n  REPORT_SERVER_PORT - Server port (default: 8080)\n  REPORT_SERVER_HOST - Server host (default: 127.0.0.1)\n  REPORT_LOG_LEVEL - Log level: error, warn, info, debug, trace (default: info)\n  REPORT_MAX_BODY_SIZE - Maximum request body size in bytes (default: 10485760)\n  REPORT_REQUEST_TIMEOUT - Request timeout in seconds (default: 300)\n  REPORT_ENABLE_CORS - Enable CORS: true/false (default: true)\n  REPORT_CORS_ORIGINS - Allowed origins (comma-separated, * for any) (default: *)\n  REPORT_METADATA - Registry metadata path or URL\n  REPORT_SOURCE - Registry snapshot path or URL\n  REPORT_PAGE_SIZE - Default patients per page (default: 20)"
    )]
    struct Args {
        /// Port to bind the server to
        #[arg(short, long, env = "REPORT_SERVER_PORT", default_value_t = 8080)]
        port: u16,

        /// Host address to bind to
        #[arg(
            short = 'H',
            long,
            env = "REPORT_SERVER_HOST",
            default_value = "127.0.0.1"
        )]
        host: String,

        /// Log level (error, warn, info, debug, trace)
        #[arg(short, long, env = "REPORT_LOG_LEVEL", default_value = "info")]
        log_level: String,

        /// Maximum request body size in bytes
        #[arg(
            short = 'm',
            long,
            env = "REPORT_MAX_BODY_SIZE",
            default_value_t = 10_485_760
        )]
        max_body_size: usize,

        /// Request timeout in seconds
        #[arg(short = 't', long, env = "REPORT_REQUEST_TIMEOUT", default_value_t = 300)]
        request_timeout: u64,

        /// Enable CORS
        #[arg(short = 'c', long, env = "REPORT_ENABLE_CORS", default_value_t = true)]
        enable_cors: bool,

        /// Allowed CORS origins (comma-separated list, "*" for any)
        #[arg(long, env = "REPORT_CORS_ORIGINS", default_value = "*")]
        cors_origins: String,

        /// Registry metadata (path or URL)
        #[arg(long, env = "REPORT_METADATA")]
        metadata: String,

        /// Registry snapshot (path or URL)
        #[arg(short, long, env = "REPORT_SOURCE")]
        source: String,

        /// Default patients per page
        #[arg(long, env = "REPORT_PAGE_SIZE", default_value_t = 20)]
        page_size: usize,
    }

    let args = Args::parse();

    ServerConfig {
        port: args.port,
        host: args.host,
        log_level: args.log_level,
        max_body_size: args.max_body_size,
        request_timeout: args.request_timeout,
        enable_cors: args.enable_cors,
        cors_origins: args.cors_origins,
        metadata: args.metadata,
        source: args.source,
        page_size: args.page_size,
    }
}

/// Load registry metadata and the patient snapshot named in the configuration
async fn load_state(config: &ServerConfig) -> Result<AppState, Box<dyn std::error::Error>> {
    let data_source = UniversalDataSource::new();
    let metadata = Arc::new(
        data_source
            .load_metadata(&normalize_source(&config.metadata)?)
            .await?,
    );
    let snapshot = data_source.load(&normalize_source(&config.source)?).await?;
    if snapshot.registry != metadata.registry() {
        return Err(format!(
            "snapshot is for registry '{}' but metadata describes '{}'",
            snapshot.registry,
            metadata.registry()
        )
        .into());
    }

    let options = ExportOptions {
        page_size: config.page_size,
        ..ExportOptions::default()
    };
    options.validate()?;

    Ok(AppState {
        store: Arc::new(InMemoryStore::new(metadata.clone(), snapshot)),
        metadata,
        options,
    })
}

fn create_app_with_config(config: &ServerConfig, state: AppState) -> Router {
    use axum::extract::DefaultBodyLimit;
    use std::time::Duration;
    use tower::ServiceBuilder;
    use tower_http::timeout::TimeoutLayer;

    let mut app = Router::new()
        .route("/report/$validate", post(handlers::validate_report_handler))
        .route("/report/$export", post(handlers::export_report_handler))
        .route("/health", get(handlers::health_check))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .layer(
            ServiceBuilder::new()
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(config.request_timeout),
                ))
                .into_inner(),
        );

    if config.enable_cors {
        app = app.layer(build_cors_layer(config));
    }

    app = app.layer(TraceLayer::new_for_http());

    app
}

/// Build CORS layer from configuration
///
/// Use "*" for any origin, or a comma-separated list of allowed origins. The
/// API only needs GET, POST and the content negotiation headers.
fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    use tower_http::cors::AllowOrigin;

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([http::header::ACCEPT, http::header::CONTENT_TYPE]);

    if config.cors_origins == "*" {
        info!("CORS: Using wildcard origin, credentials are disabled");
        return cors.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect();
    cors.allow_origin(origins).allow_credentials(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrius_registry_report::store::RegistrySnapshot;
    use axum_test::TestServer;
    use serde_json::{Value, json};

    fn test_state() -> AppState {
        let metadata: RegistryMetadata = serde_json::from_value(json!({
            "registry": "sleep",
            "formGroups": [
                {"code": "baseline", "name": "Baseline", "policy": "FIXED", "forms": ["Sleep"]}
            ],
            "forms": [{"code": "Sleep", "name": "Sleep", "sections": ["SleepDiary"]}],
            "sections": [
                {"code": "SleepDiary", "name": "Sleep Diary", "repeats": true, "elements": ["TimeToBed", "Bedtime"]}
            ],
            "dataElements": [
                {"code": "TimeToBed", "name": "Time to bed"},
                {"code": "Bedtime", "name": "Time to bed"}
            ],
            "demographicModels": {
                "patient": {"label": "Patient", "fields": {"familyName": "Family Name"}}
            }
        }))
        .unwrap();
        let snapshot: RegistrySnapshot = serde_json::from_value(json!({
            "registry": "sleep",
            "patients": [
                {"id": "1", "demographics": {"familyName": "Smith"}},
                {"id": "2", "demographics": {"familyName": "Jones"}}
            ],
            "clinicalRecords": [{
                "patientId": "1",
                "formGroup": "baseline",
                "forms": [{"name": "Sleep", "sections": [
                    {"code": "SleepDiary", "entries": [{"TimeToBed": "22:00"}, {"TimeToBed": "23:00"}]}
                ]}]
            }]
        }))
        .unwrap();

        let metadata = Arc::new(metadata);
        AppState {
            store: Arc::new(InMemoryStore::new(metadata.clone(), snapshot)),
            metadata,
            options: ExportOptions::default(),
        }
    }

    fn test_server() -> TestServer {
        let app = create_app_with_config(&ServerConfig::default(), test_state());
        TestServer::new(app).unwrap()
    }

    fn diary_design() -> Value {
        json!({
            "registry": "sleep",
            "title": "Sleep diary",
            "demographicFields": [{"model": "patient", "field": "familyName"}],
            "clinicalFields": ["Sleep____SleepDiary____TimeToBed"]
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = test_server();

        let response = server.get("/health").await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let json: Value = response.json();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "atrius-report-server");
        assert_eq!(json["registry"], "sleep");
    }

    #[tokio::test]
    async fn test_validate_returns_query() {
        let server = test_server();

        let response = server.post("/report/$validate").json(&diary_design()).await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let json: Value = response.json();
        assert_eq!(json["valid"], true);
        assert_eq!(json["format"], "csv");
        assert_eq!(json["population"], 2);
        assert!(
            json["query"]
                .as_str()
                .unwrap()
                .contains("SleepDiary { TimeToBed }")
        );
    }

    #[tokio::test]
    async fn test_validate_reports_every_unknown_key() {
        let server = test_server();

        let response = server
            .post("/report/$validate")
            .json(&json!({
                "registry": "sleep",
                "clinicalFields": ["Sleep____Nope____TimeToBed", "Nope____SleepDiary____TimeToBed"]
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        let json: Value = response.json();
        assert_eq!(json["error"], "configuration");
        assert_eq!(json["details"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_label_collision_blocks_csv_only() {
        let server = test_server();
        let design = json!({
            "registry": "sleep",
            "clinicalFields": ["Sleep____SleepDiary____TimeToBed", "Sleep____SleepDiary____Bedtime"]
        });

        let response = server.post("/report/$export").json(&design).await;
        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        let json: Value = response.json();
        assert_eq!(json["error"], "label-collision");
        assert_eq!(
            json["details"]["labels"]["Baseline_Sleep_Sleep Diary_Time to bed"]
                .as_array()
                .unwrap()
                .len(),
            2
        );

        let response = server
            .post("/report/$export")
            .add_query_param("_format", "ndjson")
            .json(&design)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_export_csv_stream() {
        let server = test_server();

        let response = server.post("/report/$export").json(&diary_design()).await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(
            response.header("content-type").to_str().unwrap(),
            "text/csv; charset=utf-8"
        );
        assert!(
            response
                .header("content-disposition")
                .to_str()
                .unwrap()
                .contains("Sleep_diary.csv")
        );
        let body = response.as_bytes();
        assert!(body.starts_with(b"\xEF\xBB\xBF"));
        let text = String::from_utf8(body[3..].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Family Name,Baseline_Sleep_Sleep Diary_1_Time to bed,Baseline_Sleep_Sleep Diary_2_Time to bed"
        );
        assert_eq!(lines[1], "Smith,22:00,23:00");
        assert_eq!(lines[2], "Jones,,");
    }

    #[tokio::test]
    async fn test_export_ndjson_via_accept_header() {
        let server = test_server();

        let response = server
            .post("/report/$export")
            .add_header(
                http::header::ACCEPT,
                HeaderValue::from_static("application/x-ndjson"),
            )
            .json(&diary_design())
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let text = response.text();
        let first: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["familyName"], "Smith");
        assert_eq!(first["clinicalData.baseline.Sleep.SleepDiary.1.TimeToBed"], "23:00");
    }

    #[tokio::test]
    async fn test_unsupported_format() {
        let server = test_server();

        let response = server
            .post("/report/$export")
            .add_query_param("_format", "application/parquet")
            .json(&diary_design())
            .await;

        assert_eq!(response.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_invalid_page_size() {
        let server = test_server();

        let response = server
            .post("/report/$export")
            .add_query_param("pageSize", "0")
            .json(&diary_design())
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }
}
