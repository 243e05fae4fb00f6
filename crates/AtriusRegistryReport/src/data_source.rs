//! # Data Source Loading
//!
//! Loads registry snapshots, registry metadata and report designs from local
//! files or HTTP endpoints.
//!
//! ## Supported Sources
//!
//! ```text
//! /path/to/snapshot.json            bare paths, see normalize_source
//! file:///path/to/snapshot.ndjson
//! https://example.org/registry/sleep/snapshot
//! ```
//!
//! ## Snapshot Formats
//!
//! A snapshot is either one JSON document:
//!
//! ```json
//! { "registry": "sleep", "patients": [ ... ], "clinicalRecords": [ ... ] }
//! ```
//!
//! or NDJSON with one tagged object per line, detected by the `.ndjson`
//! extension or when the content is not a single JSON document:
//!
//! ```text
//! {"kind": "registry", "registry": "sleep"}
//! {"kind": "patient", "id": "1", "demographics": {...}}
//! {"kind": "clinicalRecord", "patientId": "1", "formGroup": "baseline", ...}
//! ```
//!
//! Invalid NDJSON lines are skipped with a warning as long as at least the
//! registry line parses.

use crate::ReportError;
use crate::design::ReportDesign;
use crate::metadata::RegistryMetadata;
use crate::records::ClinicalRecord;
use crate::store::{PatientEntry, RegistrySnapshot};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};
use url::Url;

/// Loads export inputs from a source URL.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Raw text behind a source URL.
    async fn read(&self, source: &str) -> Result<String, ReportError>;

    /// Load a registry snapshot.
    async fn load(&self, source: &str) -> Result<RegistrySnapshot, ReportError> {
        let contents = self.read(source).await?;
        let snapshot = parse_snapshot_content(&contents, source)?;
        info!(
            "Loaded {} patients and {} clinical records from {}",
            snapshot.patients.len(),
            snapshot.clinical_records.len(),
            source
        );
        Ok(snapshot)
    }

    /// Load and validate registry metadata.
    async fn load_metadata(&self, source: &str) -> Result<RegistryMetadata, ReportError> {
        let contents = self.read(source).await?;
        parse_json_document(&contents, source, "registry metadata")
    }

    /// Load a report design.
    async fn load_design(&self, source: &str) -> Result<ReportDesign, ReportError> {
        let contents = self.read(source).await?;
        parse_json_document(&contents, source, "report design")
    }
}

/// Data source dispatching on the URL scheme.
pub struct UniversalDataSource {
    client: reqwest::Client,
}

impl UniversalDataSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for UniversalDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for UniversalDataSource {
    async fn read(&self, source: &str) -> Result<String, ReportError> {
        let url = Url::parse(source).map_err(|e| {
            ReportError::InvalidSource(format!("Invalid source URL '{}': {}", source, e))
        })?;

        match url.scheme() {
            "file" => read_file(&url).await,
            "http" | "https" => read_http(&self.client, &url).await,
            scheme => Err(ReportError::UnsupportedSourceProtocol(format!(
                "Unsupported source protocol: {}. Supported: file://, http(s)://",
                scheme
            ))),
        }
    }
}

async fn read_file(url: &Url) -> Result<String, ReportError> {
    let path = url
        .to_file_path()
        .map_err(|_| ReportError::InvalidSource(format!("Invalid file URL: {}", url)))?;

    if !path.exists() {
        return Err(ReportError::SourceNotFound(format!(
            "File not found: {}",
            path.display()
        )));
    }

    fs::read_to_string(&path)
        .await
        .map_err(|e| ReportError::SourceReadError(format!("Failed to read file: {}", e)))
}

async fn read_http(client: &reqwest::Client, url: &Url) -> Result<String, ReportError> {
    let response = client
        .get(url.as_str())
        .header("Accept", "application/json, application/x-ndjson")
        .send()
        .await
        .map_err(|e| {
            ReportError::SourceFetchError(format!("Failed to fetch from URL '{}': {}", url, e))
        })?;

    if !response.status().is_success() {
        return Err(ReportError::SourceFetchError(format!(
            "HTTP error {} when fetching '{}'",
            response.status(),
            url
        )));
    }

    response
        .text()
        .await
        .map_err(|e| ReportError::SourceReadError(format!("Failed to read response body: {}", e)))
}

/// Turn a bare file path into a `file://` URL; URLs pass through unchanged.
pub fn normalize_source(source: &str) -> Result<String, ReportError> {
    if source.contains("://") {
        return Ok(source.to_string());
    }

    let path = PathBuf::from(source);
    let absolute_path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    // The file need not exist yet; loading reports that.
    let canonical_path = absolute_path
        .canonicalize()
        .unwrap_or_else(|_| absolute_path.clone());

    Url::from_file_path(&canonical_path)
        .map(String::from)
        .map_err(|_| {
            ReportError::InvalidSource(format!(
                "Cannot turn '{}' into a file URL",
                canonical_path.display()
            ))
        })
}

fn parse_json_document<T: DeserializeOwned>(
    contents: &str,
    source_name: &str,
    what: &str,
) -> Result<T, ReportError> {
    serde_json::from_str(contents).map_err(|e| {
        ReportError::InvalidSourceContent(format!(
            "Invalid {} in '{}': {}",
            what, source_name, e
        ))
    })
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum SnapshotLine {
    Registry { registry: String },
    Patient(PatientEntry),
    ClinicalRecord(ClinicalRecord),
}

fn is_ndjson_extension(source_name: &str) -> bool {
    source_name.to_lowercase().ends_with(".ndjson")
}

fn parse_ndjson_content(contents: &str, source_name: &str) -> Result<RegistrySnapshot, ReportError> {
    let mut registry: Option<String> = None;
    let mut snapshot = RegistrySnapshot::default();
    let mut parse_errors = Vec::new();

    for (line_num, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SnapshotLine>(line) {
            Ok(SnapshotLine::Registry { registry: code }) => {
                if let Some(existing) = registry.as_ref().filter(|existing| **existing != code) {
                    return Err(ReportError::InvalidSourceContent(format!(
                        "'{}' names two registries: '{}' and '{}'",
                        source_name, existing, code
                    )));
                }
                registry = Some(code);
            }
            Ok(SnapshotLine::Patient(patient)) => snapshot.patients.push(patient),
            Ok(SnapshotLine::ClinicalRecord(record)) => snapshot.clinical_records.push(record),
            Err(e) => parse_errors.push(format!("Line {}: {}", line_num + 1, e)),
        }
    }

    let Some(registry) = registry else {
        return Err(ReportError::InvalidSourceContent(format!(
            "No registry line found in NDJSON from '{}'{}",
            source_name,
            if parse_errors.is_empty() {
                String::new()
            } else {
                format!(". Errors: {}", parse_errors.join("; "))
            }
        )));
    };
    snapshot.registry = registry;

    if !parse_errors.is_empty() {
        warn!(
            "{} line(s) in NDJSON from '{}' could not be parsed: {}",
            parse_errors.len(),
            source_name,
            parse_errors.join("; ")
        );
    }
    Ok(snapshot)
}

/// Parse snapshot content, as one JSON document or as tagged NDJSON lines.
pub fn parse_snapshot_content(
    contents: &str,
    source_name: &str,
) -> Result<RegistrySnapshot, ReportError> {
    if is_ndjson_extension(source_name) {
        return parse_ndjson_content(contents, source_name);
    }

    match serde_json::from_str::<RegistrySnapshot>(contents) {
        Ok(snapshot) => Ok(snapshot),
        Err(json_err) if contents.lines().count() > 1 => parse_ndjson_content(contents, source_name)
            .map_err(|ndjson_err| {
                ReportError::InvalidSourceContent(format!(
                    "Failed to parse content from '{}' as JSON: {}. Also tried NDJSON: {}",
                    source_name, json_err, ndjson_err
                ))
            }),
        Err(json_err) => Err(ReportError::InvalidSourceContent(format!(
            "Failed to parse JSON from '{}': {}",
            source_name, json_err
        ))),
    }
}
