//! Cardiology registry fixture shared by the integration tests.

#![allow(dead_code)]

use atrius_registry_report::design::{HeadingFormat, ReportDesign};
use atrius_registry_report::export::{ExportStats, ReportExporter, UTF8_BOM};
use atrius_registry_report::metadata::RegistryMetadata;
use atrius_registry_report::store::{InMemoryStore, RegistrySnapshot};
use atrius_registry_report::{ContentType, ExportOptions};
use serde_json::{Value, json};
use std::sync::Arc;

pub fn cardio_metadata_json() -> Value {
    json!({
        "registry": "cardio",
        "formGroups": [
            {"code": "enrolment", "name": "Enrolment", "abbreviatedName": "ENR", "policy": "FIXED", "forms": ["Assessment"]},
            {"code": "review", "name": "Review", "abbreviatedName": "REV", "policy": "REPEATING", "forms": ["ReviewVisit"]}
        ],
        "forms": [
            {"code": "Assessment", "name": "Assessment", "abbreviatedName": "ASMT", "sections": ["Vitals", "History"]},
            {"code": "ReviewVisit", "name": "Review Visit", "sections": ["Outcome"]}
        ],
        "sections": [
            {"code": "Vitals", "name": "Vitals", "abbreviatedName": "VIT", "repeats": true, "elements": ["HeartRate", "Medication"]},
            {"code": "History", "name": "History", "elements": ["Smoker"]},
            {"code": "Outcome", "name": "Outcome", "elements": ["Status"]}
        ],
        "dataElements": [
            {"code": "HeartRate", "name": "Heart rate", "abbreviatedName": "HR"},
            {"code": "Medication", "name": "Medication", "abbreviatedName": "MED", "multiValue": true},
            {"code": "Smoker", "name": "Smoker"},
            {"code": "Status", "name": "Status"}
        ],
        "demographicModels": {
            "patient": {
                "label": "Patient",
                "fields": {"familyName": "Family Name", "dateOfBirth": "Date of Birth"}
            }
        }
    })
}

pub fn cardio_metadata() -> RegistryMetadata {
    serde_json::from_value(cardio_metadata_json()).unwrap()
}

pub fn cardio_snapshot_json() -> Value {
    json!({
        "registry": "cardio",
        "patients": [
            {"id": "p3", "workingGroups": ["west"], "demographics": {"familyName": "Clark", "dateOfBirth": "1971-09-30"}},
            {"id": "p1", "workingGroups": ["east"], "demographics": {"familyName": "Adams", "dateOfBirth": "1950-02-11"}},
            {"id": "p2", "workingGroups": ["east"], "demographics": {"familyName": "Baker"}}
        ],
        "clinicalRecords": [
            {
                "patientId": "p1",
                "formGroup": "enrolment",
                "createdAt": "2024-01-10T08:00:00Z",
                "forms": [{
                    "name": "Assessment",
                    "sections": [
                        {"code": "Vitals", "entries": [
                            {"HeartRate": 70, "Medication": ["aspirin", "statin"]},
                            {"HeartRate": 72, "Medication": "aspirin"},
                            {"HeartRate": 75}
                        ]},
                        {"code": "History", "entries": {"Smoker": "No"}}
                    ]
                }]
            },
            {
                "patientId": "p2",
                "formGroup": "enrolment",
                "createdAt": "2024-01-12T08:00:00Z",
                "forms": [{
                    "name": "Assessment",
                    "sections": [
                        {"code": "Vitals", "entries": [
                            {"HeartRate": 88, "Medication": ["beta blocker", "statin", "aspirin"]}
                        ]}
                    ]
                }]
            },
            {
                "patientId": "p2",
                "formGroup": "review",
                "key": "Month 6",
                "createdAt": "2024-07-01T08:00:00Z",
                "lastUpdated": "2024-07-02T16:30:00Z",
                "forms": [{"name": "ReviewVisit", "sections": [{"code": "Outcome", "entries": {"Status": "Improved"}}]}]
            },
            {
                "patientId": "p2",
                "formGroup": "review",
                "key": "Month 3",
                "createdAt": "2024-04-01T08:00:00Z",
                "forms": [{"name": "ReviewVisit", "sections": [{"code": "Outcome", "entries": {"Status": "Stable"}}]}]
            }
        ]
    })
}

pub fn cardio_snapshot() -> RegistrySnapshot {
    serde_json::from_value(cardio_snapshot_json()).unwrap()
}

pub fn cardio_design(heading_format: HeadingFormat) -> ReportDesign {
    let mut design: ReportDesign = serde_json::from_value(json!({
        "registry": "cardio",
        "title": "Cardio review",
        "demographicFields": [{"model": "patient", "field": "familyName"}],
        "clinicalFields": [
            {"key": "Assessment____Vitals____HeartRate", "formGroup": "enrolment"},
            "Assessment____Vitals____Medication",
            "Assessment____History____Smoker",
            "ReviewVisit____Outcome____Status"
        ]
    }))
    .unwrap();
    design.heading_format = heading_format;
    design
}

pub fn exporter_for(
    design: ReportDesign,
    metadata: RegistryMetadata,
    snapshot: RegistrySnapshot,
    page_size: usize,
) -> ReportExporter {
    let metadata = Arc::new(metadata);
    let store = Arc::new(InMemoryStore::new(metadata.clone(), snapshot));
    let options = ExportOptions {
        page_size,
        ..ExportOptions::default()
    };
    ReportExporter::new(design, metadata, store, options).unwrap()
}

pub fn cardio_exporter(heading_format: HeadingFormat) -> ReportExporter {
    exporter_for(
        cardio_design(heading_format),
        cardio_metadata(),
        cardio_snapshot(),
        2,
    )
}

pub async fn export_bytes(
    exporter: &ReportExporter,
    content_type: ContentType,
) -> (Vec<u8>, ExportStats) {
    let mut out = Vec::new();
    let stats = exporter
        .export_to_writer(content_type, &mut out)
        .await
        .unwrap();
    (out, stats)
}

/// Header labels and data rows of a CSV export.
pub fn parse_csv(bytes: &[u8]) -> (Vec<String>, Vec<Vec<String>>) {
    assert!(bytes.starts_with(UTF8_BOM), "CSV export must start with a BOM");
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(&bytes[UTF8_BOM.len()..]);
    let labels = reader
        .headers()
        .unwrap()
        .iter()
        .map(String::from)
        .collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    (labels, rows)
}

/// Records of an NDJSON export, in output order.
pub fn parse_ndjson(bytes: &[u8]) -> Vec<serde_json::Map<String, Value>> {
    std::str::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
