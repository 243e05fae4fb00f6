//! Request handlers for the report server

use atrius_registry_report::design::ReportDesign;
use atrius_registry_report::export::ReportExporter;
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, info};

use super::{
    AppState,
    error::{ServerError, ServerResult},
    models::{ReportQueryParams, ValidationResponse, export_options, parse_content_type},
    streaming::stream_export_response,
};

/// Resolve a posted design into an exporter using the server's registry.
fn build_exporter(
    state: &AppState,
    params: &ReportQueryParams,
    body: serde_json::Value,
) -> ServerResult<ReportExporter> {
    let design: ReportDesign = serde_json::from_value(body)?;
    let options = export_options(state.options, params).map_err(ServerError::BadRequest)?;
    Ok(ReportExporter::new(
        design,
        state.metadata.clone(),
        state.store.clone(),
        options,
    )?)
}

/// Handler for POST /report/$validate - pre-flight checks without exporting
///
/// Resolves the posted report design, compiles its fetch request, runs a
/// one-patient trial fetch and, for CSV, checks column labels for collisions.
pub async fn validate_report_handler(
    State(state): State<AppState>,
    Query(params): Query<ReportQueryParams>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ServerResult<Json<ValidationResponse>> {
    info!("Handling report validation request");
    debug!("Query params: {:?}", params);

    let accept_header = headers.get(header::ACCEPT).and_then(|h| h.to_str().ok());
    let content_type = parse_content_type(accept_header, params.format.as_deref())?;
    let exporter = build_exporter(&state, &params, body)?;
    let preflight = exporter.preflight(content_type).await?;
    Ok(Json(ValidationResponse::new(content_type, preflight)))
}

/// Handler for POST /report/$export - streams the export of the posted design
///
/// The format comes from `_format`, else the Accept header, else CSV.
pub async fn export_report_handler(
    State(state): State<AppState>,
    Query(params): Query<ReportQueryParams>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ServerResult<Response> {
    info!("Handling report export request");
    debug!("Query params: {:?}", params);

    let accept_header = headers.get(header::ACCEPT).and_then(|h| h.to_str().ok());
    let content_type = parse_content_type(accept_header, params.format.as_deref())?;
    let exporter = build_exporter(&state, &params, body)?;
    exporter.preflight(content_type).await?;
    stream_export_response(&exporter, content_type)
}

/// Handler for GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    info!("Handling Health Check request");
    Json(serde_json::json!({
        "status": "ok",
        "service": "atrius-report-server",
        "registry": state.metadata.registry(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
