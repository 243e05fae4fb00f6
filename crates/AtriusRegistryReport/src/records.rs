//! Clinical record trees and fetch results.
//!
//! Two shapes of patient data flow through an export:
//!
//! - [`ClinicalRecord`]: one stored form-group instance of one patient, as scanned
//!   by the cardinality summarizer.
//! - [`PatientRecord`]: one patient's projected result tree, as returned page by
//!   page from the fetch interface and consumed by the flattener.
//!
//! Both represent a section's entries either as a single entry or a list of
//! entries, and an element's value either as a scalar or a list of values;
//! [`SectionEntries::entries`] and [`values_of`] normalize the two shapes.

use crate::PatientId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Element code to value (scalar or list of values).
pub type Entry = Map<String, Value>;

/// The entries of one section within one form instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SectionEntries {
    Multiple(Vec<Entry>),
    Single(Entry),
}

impl SectionEntries {
    /// Entries in stored order.
    pub fn entries(&self) -> Vec<&Entry> {
        match self {
            SectionEntries::Multiple(entries) => entries.iter().collect(),
            SectionEntries::Single(entry) => vec![entry],
        }
    }

    /// Number of section repeats this instance holds.
    pub fn len(&self) -> usize {
        match self {
            SectionEntries::Multiple(entries) => entries.len(),
            SectionEntries::Single(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of element values held across all entries.
    pub fn value_count(&self) -> usize {
        self.entries().into_iter().map(entry_value_count).sum()
    }

    /// Keep only the given element codes in every entry.
    pub fn project(&self, elements: &[String]) -> SectionEntries {
        let keep = |entry: &Entry| -> Entry {
            entry
                .iter()
                .filter(|(code, _)| elements.iter().any(|e| e == *code))
                .map(|(code, value)| (code.clone(), value.clone()))
                .collect()
        };
        match self {
            SectionEntries::Multiple(entries) => {
                SectionEntries::Multiple(entries.iter().map(keep).collect())
            }
            SectionEntries::Single(entry) => SectionEntries::Single(keep(entry)),
        }
    }
}

/// Normalize an element value into its ordered list of values.
///
/// A list yields its items, `null` yields nothing and any other value yields itself.
pub fn values_of(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Records of a related demographic model: a list yields its items, a single
/// object yields itself.
pub fn related_records(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        object @ Value::Object(_) => vec![object],
        _ => Vec::new(),
    }
}

/// Text of a pivot value; only strings, numbers and booleans name a variant.
pub fn variant_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn entry_value_count(entry: &Entry) -> usize {
    entry.values().map(|value| values_of(value).len()).sum()
}

/// One stored form-group instance of a patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalRecord {
    pub patient_id: PatientId,
    pub form_group: String,
    /// Instance name of a repeating form-group instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub forms: Vec<FormData>,
}

impl ClinicalRecord {
    pub fn form(&self, name: &str) -> Option<&FormData> {
        self.forms.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormData {
    pub name: String,
    #[serde(default)]
    pub sections: Vec<SectionData>,
}

impl FormData {
    pub fn section(&self, code: &str) -> Option<&SectionData> {
        self.sections.iter().find(|s| s.code == code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionData {
    pub code: String,
    pub entries: SectionEntries,
}

/// One patient's result tree from the fetch interface.
///
/// `clinical` is keyed form group code, then form code; each form holds its
/// instances in creation order (exactly one for fixed form groups).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: PatientId,
    #[serde(default)]
    pub demographics: Map<String, Value>,
    #[serde(default)]
    pub clinical: BTreeMap<String, BTreeMap<String, Vec<FormInstance>>>,
}

/// One instance of a form inside a fetch result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sections: BTreeMap<String, SectionEntries>,
}

impl FormInstance {
    pub fn value_count(&self) -> usize {
        self.sections.values().map(SectionEntries::value_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_section_entries_shapes() {
        let single: SectionEntries = serde_json::from_value(json!({"TimeToBed": "22:00"})).unwrap();
        assert_eq!(single.len(), 1);
        assert!(matches!(single, SectionEntries::Single(_)));

        let multiple: SectionEntries = serde_json::from_value(json!([
            {"TimeToBed": "22:00"},
            {"TimeToBed": "23:00"}
        ]))
        .unwrap();
        assert_eq!(multiple.len(), 2);
        assert_eq!(multiple.entries()[1]["TimeToBed"], json!("23:00"));

        let empty: SectionEntries = serde_json::from_value(json!([])).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_values_of_normalizes() {
        assert_eq!(values_of(&json!([1, 2])), vec![&json!(1), &json!(2)]);
        assert_eq!(values_of(&json!("x")), vec![&json!("x")]);
        assert!(values_of(&Value::Null).is_empty());
    }

    #[test]
    fn test_variant_names() {
        assert_eq!(variant_name(&json!("Home")), Some("Home".to_string()));
        assert_eq!(variant_name(&json!(3)), Some("3".to_string()));
        assert_eq!(variant_name(&json!("")), None);
        assert_eq!(variant_name(&json!({"type": "Home"})), None);
        assert_eq!(related_records(&json!({"a": 1})).len(), 1);
        assert_eq!(related_records(&json!([{"a": 1}, {"a": 2}])).len(), 2);
        assert!(related_records(&json!("x")).is_empty());
    }

    #[test]
    fn test_value_count_spans_entries() {
        let instance: FormInstance = serde_json::from_value(json!({
            "sections": {
                "SleepDiary": [{"TimeToBed": "22:00", "TimesAwoke": [1, 2]}, {"TimesAwoke": null}],
                "SleepHistory": {"Snoring": "Yes"}
            }
        }))
        .unwrap();
        assert_eq!(instance.value_count(), 4);
    }

    #[test]
    fn test_project_keeps_requested_elements() {
        let entries: SectionEntries = serde_json::from_value(json!([
            {"TimeToBed": "22:00", "TimesAwoke": [1, 2], "Notes": "x"}
        ]))
        .unwrap();
        let projected = entries.project(&["TimesAwoke".to_string()]);
        let entry = projected.entries()[0];
        assert_eq!(entry.len(), 1);
        assert_eq!(entry["TimesAwoke"], json!([1, 2]));
    }

    #[test]
    fn test_clinical_record_lookup() {
        let record: ClinicalRecord = serde_json::from_value(json!({
            "patientId": "1",
            "formGroup": "baseline",
            "createdAt": "2024-01-01T00:00:00Z",
            "forms": [{"name": "Sleep", "sections": [{"code": "SleepHistory", "entries": {"Snoring": "Yes"}}]}]
        }))
        .unwrap();
        let form = record.form("Sleep").unwrap();
        assert!(form.section("SleepHistory").is_some());
        assert!(record.form("Visit").is_none());
        assert!(record.created_at.is_some());
    }
}
