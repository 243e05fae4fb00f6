//! Chunked streaming of export responses
//!
//! An export is served as it is produced: every chunk of the exporter's stream
//! becomes one chunk of the response body, so memory use stays bounded by one
//! page of patients regardless of population size.

use atrius_registry_report::ContentType;
use atrius_registry_report::export::ReportExporter;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::error::{ServerError, ServerResult};

/// Stream an export with chunked transfer encoding.
///
/// Errors raised after the first chunk abort the response body; callers run
/// pre-flight validation first so configuration problems still get a status.
pub fn stream_export_response(
    exporter: &ReportExporter,
    content_type: ContentType,
) -> ServerResult<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type.mime_type()),
    );
    let disposition = format!(
        "attachment; filename=\"{}.{}\"",
        download_name(exporter),
        content_type.extension()
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(|e| {
            ServerError::InternalError(format!("Invalid Content-Disposition header: {}", e))
        })?,
    );

    let body = Body::from_stream(exporter.export(content_type));
    Ok((StatusCode::OK, headers, body).into_response())
}

/// File name for a download: the design title, else the registry code.
fn download_name(exporter: &ReportExporter) -> String {
    let design = exporter.design();
    let raw = design.title.as_deref().unwrap_or(&design.registry);
    let name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "report".to_string()
    } else {
        name
    }
}
