//! # Registry Report Compiler
//!
//! This crate compiles a declarative report design and a population of patient
//! records into a deterministic, flat tabular export. Clinical data in a patient
//! registry is stored as a variably-shaped nested tree (form groups, forms,
//! sections and data elements) described by runtime metadata, so the column
//! layout of a report cannot be known until the population has been scanned.
//!
//! There are two consumers of this crate:
//! - `atrius-report-cli` - A command-line tool that validates a report design and
//!   streams the export to a file or stdout.
//! - `atrius-report-server` - A small HTTP service exposing pre-flight validation
//!   and chunked streaming exports.
//!
//! ## Architecture
//!
//! The export pipeline is organized around these components:
//! - **Field selection** ([`selection::FieldSelection`]): resolves a
//!   [`design::ReportDesign`] against [`metadata::RegistryMetadata`]
//! - **Cardinality summary** ([`summary::CardinalitySummary`]): maximum repeat
//!   counts per nesting level across the population
//! - **Header generation** ([`header::Header`]): the ordered column contract
//! - **Fetch query compilation** ([`query::FetchRequest`]): the request sent to a
//!   [`store::RegistryStore`]
//! - **Flattening** ([`flatten::Flattener`]): nested page of records to flat rows
//! - **Streaming export** ([`export::ReportExporter`]): lazy, paged CSV or NDJSON
//!   output as a stream of byte chunks
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use atrius_registry_report::{ContentType, ExportOptions};
//! use atrius_registry_report::design::ReportDesign;
//! use atrius_registry_report::export::ReportExporter;
//! use atrius_registry_report::metadata::RegistryMetadata;
//! use atrius_registry_report::store::{InMemoryStore, RegistrySnapshot};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     metadata: RegistryMetadata,
//! #     snapshot: RegistrySnapshot,
//! #     design: ReportDesign,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let metadata = Arc::new(metadata);
//! let store = Arc::new(InMemoryStore::new(metadata.clone(), snapshot));
//! let exporter = ReportExporter::new(design, metadata, store, ExportOptions::default())?;
//!
//! exporter.preflight(ContentType::Csv).await?;
//! let mut output = Vec::new();
//! let stats = exporter.export_to_writer(ContentType::Csv, &mut output).await?;
//! println!("{} patients, {} columns", stats.patients_exported, stats.columns);
//! # Ok(())
//! # }
//! ```

pub mod data_source;
pub mod design;
pub mod export;
pub mod flatten;
pub mod header;
pub mod metadata;
pub mod query;
pub mod records;
pub mod selection;
pub mod store;
pub mod summary;

#[cfg(test)]
mod test_support;

use thiserror::Error;

pub use header::{FieldTuple, HeaderCollisions};

/// Identifier of a patient as used by the population filter and fetch interface.
pub type PatientId = String;

/// Comprehensive error type for report compilation and export.
///
/// Configuration and collision errors are raised before any patient data is
/// fetched. Fetch errors abort an export in progress; chunks already emitted are
/// not retracted. Encoding problems are recovered locally by the flattener
/// unless the export runs with [`ExportOptions::strict_encoding`].
#[derive(Debug, Error)]
pub enum ReportError {
    /// The report design does not resolve against the registry metadata.
    ///
    /// Every unresolved key is listed so a design can be fixed in one pass.
    #[error("Invalid report configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),

    /// Two or more distinct fields produce the same column label.
    #[error("Header label collision: {0}")]
    HeaderCollision(HeaderCollisions),

    /// The nested-data fetch interface rejected a request or failed.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// A value could not be represented in the output format or had no column.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Export options are out of range.
    #[error("Invalid export options: {0}")]
    InvalidOptions(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV encoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Writing to an output sink failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unsupported output content type requested.
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Invalid source parameter value.
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    /// Source not found.
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Failed to fetch data from a remote source.
    #[error("Failed to fetch source: {0}")]
    SourceFetchError(String),

    /// Failed to read source data.
    #[error("Failed to read source: {0}")]
    SourceReadError(String),

    /// The source content is not a valid registry snapshot.
    #[error("Invalid source content: {0}")]
    InvalidSourceContent(String),

    /// The source URL uses an unsupported protocol.
    #[error("Unsupported source protocol: {0}")]
    UnsupportedSourceProtocol(String),
}

impl ReportError {
    /// Shorthand for a configuration error with a single message.
    pub fn configuration(message: impl Into<String>) -> Self {
        ReportError::Configuration(vec![message.into()])
    }
}

/// Output formats supported by the streaming export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Delimited text: UTF-8 byte-order mark, a header row of labels, then rows.
    Csv,
    /// One JSON object per patient per line, keyed by column key.
    NdJson,
}

impl ContentType {
    /// Parse a content type from a short format name or MIME type.
    ///
    /// Accepts `csv`, `text/csv`, `ndjson`, `application/ndjson` and
    /// `application/x-ndjson`; MIME parameters such as `;charset=utf-8` are ignored.
    pub fn from_string(s: &str) -> Result<Self, ReportError> {
        let essence = s.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "csv" | "text/csv" => Ok(ContentType::Csv),
            "ndjson" | "application/ndjson" | "application/x-ndjson" => Ok(ContentType::NdJson),
            _ => Err(ReportError::UnsupportedContentType(s.to_string())),
        }
    }

    /// MIME type used when serving this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContentType::Csv => "text/csv; charset=utf-8",
            ContentType::NdJson => "application/x-ndjson",
        }
    }

    /// File extension for downloads.
    pub fn extension(&self) -> &'static str {
        match self {
            ContentType::Csv => "csv",
            ContentType::NdJson => "ndjson",
        }
    }
}

/// Tuning knobs for one export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    /// Number of patients fetched per page.
    pub page_size: usize,
    /// Number of patients whose records are scanned per summary batch.
    pub summary_batch_size: usize,
    /// Fail the export instead of leaving unencodable or unplaced values out.
    pub strict_encoding: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            page_size: 20,
            summary_batch_size: 500,
            strict_encoding: false,
        }
    }
}

impl ExportOptions {
    /// Reject zero-sized pages or batches.
    pub fn validate(&self) -> Result<(), ReportError> {
        if self.page_size == 0 {
            return Err(ReportError::InvalidOptions(
                "page size must be at least 1".to_string(),
            ));
        }
        if self.summary_batch_size == 0 {
            return Err(ReportError::InvalidOptions(
                "summary batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
