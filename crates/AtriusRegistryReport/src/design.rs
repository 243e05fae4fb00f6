//! Report design model.
//!
//! A [`ReportDesign`] is the declarative input of an export: which registry to
//! report on, how column labels are rendered, which demographic and clinical
//! fields to include and which patients to target. Designs are immutable for the
//! duration of an export.

use crate::selection::is_schema_identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delimiter between form, section and data element codes in a clinical field key.
pub const CLINICAL_KEY_DELIMITER: &str = "____";

/// Which display text is used for column labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeadingFormat {
    /// Definition codes.
    Code,
    /// Human-readable names.
    #[default]
    Label,
    /// Abbreviated names, falling back to the human-readable name.
    #[serde(alias = "ABBR_NAME")]
    Abbreviated,
}

impl fmt::Display for HeadingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeadingFormat::Code => "CODE",
            HeadingFormat::Label => "LABEL",
            HeadingFormat::Abbreviated => "ABBREVIATED",
        };
        f.write_str(name)
    }
}

/// A declarative report design.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDesign {
    #[serde(default)]
    pub title: Option<String>,
    /// Registry the report targets; must match the metadata's registry.
    pub registry: String,
    #[serde(default)]
    pub heading_format: HeadingFormat,
    /// Adds a last-updated column to every form instance.
    #[serde(default)]
    pub include_form_timestamp: bool,
    #[serde(default)]
    pub demographic_fields: Vec<DemographicFieldSelection>,
    #[serde(default)]
    pub clinical_fields: Vec<ClinicalFieldSelection>,
    #[serde(default)]
    pub filter: PatientFilter,
}

impl ReportDesign {
    /// Demographic selections in output order: by `sortOrder` where given,
    /// otherwise in design order.
    pub fn ordered_demographic_fields(&self) -> Vec<&DemographicFieldSelection> {
        let mut fields: Vec<&DemographicFieldSelection> = self.demographic_fields.iter().collect();
        fields.sort_by_key(|f| f.sort_order.unwrap_or(u32::MAX));
        fields
    }
}

/// One demographic column selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemographicFieldSelection {
    /// Demographic model name, `patient` for the patient's own fields.
    pub model: String,
    /// Field path, either `parent { child }` or `parent.child`.
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<u32>,
}

/// One clinical column selection: `Form____Section____Element`, optionally
/// pinned to a single form group.
///
/// Deserializes from either a bare key string or `{ "key": ..., "formGroup": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ClinicalFieldRepr", rename_all = "camelCase")]
pub struct ClinicalFieldSelection {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_group: Option<String>,
}

impl ClinicalFieldSelection {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            form_group: None,
        }
    }

    /// Split the key into (form, section, element) codes.
    pub fn parts(&self) -> Option<(&str, &str, &str)> {
        let mut parts = self.key.split(CLINICAL_KEY_DELIMITER);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(form), Some(section), Some(element), None)
                if !form.is_empty() && !section.is_empty() && !element.is_empty() =>
            {
                Some((form, section, element))
            }
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClinicalFieldRepr {
    Key(String),
    Detailed {
        key: String,
        #[serde(default, rename = "formGroup")]
        form_group: Option<String>,
    },
}

impl From<ClinicalFieldRepr> for ClinicalFieldSelection {
    fn from(repr: ClinicalFieldRepr) -> Self {
        match repr {
            ClinicalFieldRepr::Key(key) => ClinicalFieldSelection {
                key,
                form_group: None,
            },
            ClinicalFieldRepr::Detailed { key, form_group } => {
                ClinicalFieldSelection { key, form_group }
            }
        }
    }
}

/// Build a clinical field key from its parts.
pub fn clinical_key(form: &str, section: &str, element: &str) -> String {
    [form, section, element].join(CLINICAL_KEY_DELIMITER)
}

/// Population predicates handed to the registry store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientFilter {
    /// Patients in any of these working groups; empty means no restriction.
    #[serde(default)]
    pub working_groups: Vec<String>,
    /// Consent questions every targeted patient must have answered yes to.
    #[serde(default)]
    pub consent_questions: Vec<String>,
}

impl PatientFilter {
    pub fn is_empty(&self) -> bool {
        self.working_groups.is_empty() && self.consent_questions.is_empty()
    }
}

/// A parsed demographic field path such as `addressType { type }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse a field path written as nested braces or dotted segments.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let spaced = raw.replace('{', " { ").replace('}', " } ");
        let mut segments = Vec::new();
        let mut open = 0usize;
        let mut closed = 0usize;
        let mut expect_segment = true;

        for token in spaced.split_whitespace() {
            match token {
                "{" => {
                    if expect_segment || closed > 0 {
                        return Err(format!("unexpected '{{' in field path '{}'", raw));
                    }
                    open += 1;
                    expect_segment = true;
                }
                "}" => {
                    if expect_segment || closed >= open {
                        return Err(format!("unbalanced '}}' in field path '{}'", raw));
                    }
                    closed += 1;
                }
                name => {
                    if !expect_segment {
                        return Err(format!(
                            "field path '{}' selects more than one field",
                            raw
                        ));
                    }
                    for part in name.split('.') {
                        if !is_schema_identifier(part) {
                            return Err(format!(
                                "invalid segment '{}' in field path '{}'",
                                part, raw
                            ));
                        }
                        segments.push(part.to_string());
                    }
                    expect_segment = false;
                }
            }
        }

        if segments.is_empty() || expect_segment || open != closed {
            return Err(format!("incomplete field path '{}'", raw));
        }
        Ok(FieldPath(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// First segment, the field read from the model record.
    pub fn root(&self) -> &str {
        &self.0[0]
    }

    /// Column key fragment for this path.
    pub fn key(&self) -> String {
        self.0.join(".")
    }

    /// Nested selection syntax, e.g. `addressType { type }`.
    pub fn selection(&self) -> String {
        let mut out = self.0.join(" { ");
        for _ in 1..self.0.len() {
            out.push_str(" }");
        }
        out
    }

    /// Look up the value this path points to inside a JSON object.
    pub fn resolve<'a>(&self, value: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        self.0
            .iter()
            .try_fold(value, |current, segment| current.get(segment))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
