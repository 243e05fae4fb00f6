//! Request and response models for the report server
//!
//! Query parameter parsing, content negotiation and the validation response body.

use atrius_registry_report::export::Preflight;
use atrius_registry_report::{ContentType, ExportOptions, ReportError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Largest page size a request may ask for.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Query parameters shared by `$validate` and `$export`
#[derive(Debug, Default, Deserialize)]
pub struct ReportQueryParams {
    /// Output format override (alternative to Accept header)
    #[serde(rename = "_format")]
    pub format: Option<String>,

    /// Patients fetched per page
    #[serde(rename = "pageSize")]
    pub page_size: Option<usize>,
}

/// Pick the output format: `_format` first, then the Accept header, then CSV.
///
/// Accept headers may list several media ranges; the first supported one wins
/// and wildcards select CSV.
pub fn parse_content_type(
    accept_header: Option<&str>,
    format_param: Option<&str>,
) -> Result<ContentType, ReportError> {
    if let Some(format) = format_param {
        return ContentType::from_string(format);
    }
    let Some(accept) = accept_header else {
        return Ok(ContentType::Csv);
    };

    for range in accept.split(',') {
        let Ok(media) = range.trim().parse::<mime::Mime>() else {
            continue;
        };
        if media.type_() == mime::STAR || media.subtype() == mime::STAR {
            return Ok(ContentType::Csv);
        }
        if let Ok(content_type) = ContentType::from_string(media.essence_str()) {
            return Ok(content_type);
        }
    }
    debug!("No supported media type in Accept header '{}'", accept);
    Err(ReportError::UnsupportedContentType(accept.to_string()))
}

/// Apply request overrides to the server's export options.
pub fn export_options(
    defaults: ExportOptions,
    params: &ReportQueryParams,
) -> Result<ExportOptions, String> {
    let mut options = defaults;
    if let Some(page_size) = params.page_size {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(format!(
                "pageSize must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, page_size
            ));
        }
        options.page_size = page_size;
    }
    Ok(options)
}

/// Body of a successful `$validate` response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub valid: bool,
    pub format: &'static str,
    pub population: usize,
    /// Fetch request in nested selection syntax
    pub query: String,
    pub request: atrius_registry_report::query::FetchRequest,
}

impl ValidationResponse {
    pub fn new(content_type: ContentType, preflight: Preflight) -> Self {
        Self {
            valid: true,
            format: content_type.extension(),
            population: preflight.population,
            query: preflight.request.to_string(),
            request: preflight.request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_param_wins() {
        assert_eq!(
            parse_content_type(Some("text/csv"), Some("ndjson")).unwrap(),
            ContentType::NdJson
        );
    }

    #[test]
    fn test_accept_header_negotiation() {
        assert_eq!(parse_content_type(None, None).unwrap(), ContentType::Csv);
        assert_eq!(
            parse_content_type(Some("application/x-ndjson"), None).unwrap(),
            ContentType::NdJson
        );
        assert_eq!(
            parse_content_type(Some("application/xml, text/csv;q=0.9"), None).unwrap(),
            ContentType::Csv
        );
        assert_eq!(parse_content_type(Some("*/*"), None).unwrap(), ContentType::Csv);
        assert!(matches!(
            parse_content_type(Some("application/xml"), None),
            Err(ReportError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_page_size_bounds() {
        let params = ReportQueryParams {
            page_size: Some(50),
            ..ReportQueryParams::default()
        };
        assert_eq!(
            export_options(ExportOptions::default(), &params)
                .unwrap()
                .page_size,
            50
        );

        let params = ReportQueryParams {
            page_size: Some(0),
            ..ReportQueryParams::default()
        };
        assert!(export_options(ExportOptions::default(), &params).is_err());
    }
}
