//! # Registry Metadata
//!
//! Runtime definitions of the registry's clinical schema: form groups, forms,
//! sections and data elements, plus the configuration of the demographic models
//! that can be reported on. Definitions are loaded once per export and shared
//! read-only.
//!
//! ## JSON Layout
//!
//! ```text
//! {
//!   "registry": "sleep",
//!   "formGroups": [{"code": "baseline", "name": "Baseline", "policy": "FIXED", "forms": ["Sleep"]}],
//!   "forms": [{"code": "Sleep", "name": "Sleep", "sections": ["SleepDiary"]}],
//!   "sections": [{"code": "SleepDiary", "name": "Sleep Diary", "repeats": true, "elements": ["TimeToBed"]}],
//!   "dataElements": [{"code": "TimeToBed", "name": "Time to bed"}],
//!   "demographicModels": {
//!     "patient": {"label": "Patient", "fields": {"familyName": "Family Name"}},
//!     "patientaddressSet": {"label": "Patient Address", "multiField": true, "fields": {"suburb": "Suburb"}},
//!     "patientconsentSet": {"label": "Consent", "pivotField": "consentQuestion { code }", "fields": {"answer": "Answer"}}
//!   }
//! }
//! ```
//!
//! Sections and data elements live in one registry-wide namespace and are
//! referenced by code from forms and sections respectively.

use crate::ReportError;
use crate::design::{FieldPath, HeadingFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Name of the demographic model holding the patient's own fields.
pub const PATIENT_MODEL: &str = "patient";

/// Repetition policy of a form group relative to a patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormGroupPolicy {
    /// One instance per patient.
    Fixed,
    /// Any number of instances per patient, ordered by creation time.
    Repeating,
}

/// Common display texts of every definition kind.
pub trait Heading {
    fn code(&self) -> &str;
    fn name(&self) -> &str;
    fn abbreviated_name(&self) -> Option<&str>;

    /// Display text for a column label in the given heading format.
    fn heading(&self, format: HeadingFormat) -> &str {
        match format {
            HeadingFormat::Code => self.code(),
            HeadingFormat::Label => self.name(),
            HeadingFormat::Abbreviated => self
                .abbreviated_name()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.name()),
        }
    }
}

macro_rules! impl_heading {
    ($($ty:ty),*) => {
        $(impl Heading for $ty {
            fn code(&self) -> &str {
                &self.code
            }
            fn name(&self) -> &str {
                &self.name
            }
            fn abbreviated_name(&self) -> Option<&str> {
                self.abbreviated_name.as_deref()
            }
        })*
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormGroup {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub abbreviated_name: Option<String>,
    pub policy: FormGroupPolicy,
    pub forms: Vec<String>,
}

impl FormGroup {
    pub fn is_repeating(&self) -> bool {
        self.policy == FormGroupPolicy::Repeating
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub abbreviated_name: Option<String>,
    pub sections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub abbreviated_name: Option<String>,
    /// Whether the section may occur more than once in one form instance.
    #[serde(default)]
    pub repeats: bool,
    pub elements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataElement {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub abbreviated_name: Option<String>,
    /// Whether one entry may hold several values.
    #[serde(default)]
    pub multi_value: bool,
}

impl_heading!(FormGroup, Form, Section, DataElement);

/// Configuration of one demographic model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemographicModel {
    pub label: String,
    /// The model is a list of related records per patient.
    #[serde(default)]
    pub multi_field: bool,
    /// Selectable field paths and their display labels.
    pub fields: BTreeMap<String, String>,
    /// Field of each related record whose value names the column group the
    /// record is reported under, e.g. `addressType { type }`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_field: Option<String>,
}

impl DemographicModel {
    /// Label configured for a field path, matching either path syntax.
    pub fn field_label(&self, path: &FieldPath) -> Option<&str> {
        self.fields
            .iter()
            .find(|(raw, _)| FieldPath::parse(raw).is_ok_and(|p| &p == path))
            .map(|(_, label)| label.as_str())
    }

    /// Parsed pivot field, when the model is reported one column group per
    /// pivot value.
    pub fn pivot_path(&self) -> Option<FieldPath> {
        self.pivot_field
            .as_deref()
            .and_then(|raw| FieldPath::parse(raw).ok())
    }
}

/// Serialized form of [`RegistryMetadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDefinition {
    pub registry: String,
    #[serde(default)]
    pub form_groups: Vec<FormGroup>,
    #[serde(default)]
    pub forms: Vec<Form>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub data_elements: Vec<DataElement>,
    #[serde(default)]
    pub demographic_models: BTreeMap<String, DemographicModel>,
}

/// Validated, indexed registry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RegistryDefinition", into = "RegistryDefinition")]
pub struct RegistryMetadata {
    definition: RegistryDefinition,
    group_index: HashMap<String, usize>,
    form_index: HashMap<String, usize>,
    section_index: HashMap<String, usize>,
    element_index: HashMap<String, usize>,
}

impl RegistryMetadata {
    /// Validate a definition and build the lookup indexes.
    ///
    /// Duplicate codes and dangling references are reported together as one
    /// configuration error.
    pub fn new(definition: RegistryDefinition) -> Result<Self, ReportError> {
        let mut problems = Vec::new();

        let group_index = index_by_code(
            definition.form_groups.iter().map(|g| g.code.as_str()),
            "form group",
            &mut problems,
        );
        let form_index = index_by_code(
            definition.forms.iter().map(|f| f.code.as_str()),
            "form",
            &mut problems,
        );
        let section_index = index_by_code(
            definition.sections.iter().map(|s| s.code.as_str()),
            "section",
            &mut problems,
        );
        let element_index = index_by_code(
            definition.data_elements.iter().map(|e| e.code.as_str()),
            "data element",
            &mut problems,
        );

        for group in &definition.form_groups {
            for form in &group.forms {
                if !form_index.contains_key(form) {
                    problems.push(format!(
                        "form group '{}' references unknown form '{}'",
                        group.code, form
                    ));
                }
            }
        }
        for form in &definition.forms {
            for section in &form.sections {
                if !section_index.contains_key(section) {
                    problems.push(format!(
                        "form '{}' references unknown section '{}'",
                        form.code, section
                    ));
                }
            }
        }
        for section in &definition.sections {
            for element in &section.elements {
                if !element_index.contains_key(element) {
                    problems.push(format!(
                        "section '{}' references unknown data element '{}'",
                        section.code, element
                    ));
                }
            }
        }
        for (name, model) in &definition.demographic_models {
            for raw in model.fields.keys() {
                if let Err(reason) = FieldPath::parse(raw) {
                    problems.push(format!("demographic model '{}': {}", name, reason));
                }
            }
            if let Some(raw) = &model.pivot_field {
                if name == PATIENT_MODEL {
                    problems.push(format!("demographic model '{}' cannot be pivoted", name));
                } else if let Err(reason) = FieldPath::parse(raw) {
                    problems.push(format!("demographic model '{}' pivot: {}", name, reason));
                }
            }
        }

        if !problems.is_empty() {
            return Err(ReportError::Configuration(problems));
        }

        Ok(Self {
            definition,
            group_index,
            form_index,
            section_index,
            element_index,
        })
    }

    pub fn registry(&self) -> &str {
        &self.definition.registry
    }

    /// Form groups in definition order.
    pub fn form_groups(&self) -> &[FormGroup] {
        &self.definition.form_groups
    }

    pub fn form_group(&self, code: &str) -> Option<&FormGroup> {
        self.group_index
            .get(code)
            .map(|&i| &self.definition.form_groups[i])
    }

    pub fn form(&self, code: &str) -> Option<&Form> {
        self.form_index.get(code).map(|&i| &self.definition.forms[i])
    }

    pub fn section(&self, code: &str) -> Option<&Section> {
        self.section_index
            .get(code)
            .map(|&i| &self.definition.sections[i])
    }

    pub fn data_element(&self, code: &str) -> Option<&DataElement> {
        self.element_index
            .get(code)
            .map(|&i| &self.definition.data_elements[i])
    }

    pub fn demographic_model(&self, name: &str) -> Option<&DemographicModel> {
        self.definition.demographic_models.get(name)
    }

    /// Form groups containing a form, in definition order.
    pub fn groups_containing(&self, form: &str) -> Vec<&FormGroup> {
        self.definition
            .form_groups
            .iter()
            .filter(|g| g.forms.iter().any(|f| f == form))
            .collect()
    }

    /// Sections of a form in definition order.
    pub fn sections_of<'a>(&'a self, form: &'a Form) -> impl Iterator<Item = &'a Section> + 'a {
        form.sections.iter().filter_map(|code| self.section(code))
    }

    /// Data elements of a section in definition order.
    pub fn elements_of<'a>(
        &'a self,
        section: &'a Section,
    ) -> impl Iterator<Item = &'a DataElement> + 'a {
        section.elements.iter().filter_map(|code| self.data_element(code))
    }

    /// Whether the (form, section, element) triple exists in the current definitions.
    pub fn contains_field(&self, form: &str, section: &str, element: &str) -> bool {
        self.form(form).is_some_and(|f| f.sections.iter().any(|s| s == section))
            && self
                .section(section)
                .is_some_and(|s| s.elements.iter().any(|e| e == element))
    }
}

impl TryFrom<RegistryDefinition> for RegistryMetadata {
    type Error = ReportError;

    fn try_from(definition: RegistryDefinition) -> Result<Self, Self::Error> {
        RegistryMetadata::new(definition)
    }
}

impl From<RegistryMetadata> for RegistryDefinition {
    fn from(metadata: RegistryMetadata) -> Self {
        metadata.definition
    }
}

fn index_by_code<'a>(
    codes: impl Iterator<Item = &'a str>,
    kind: &str,
    problems: &mut Vec<String>,
) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    let mut seen = HashSet::new();
    for (i, code) in codes.enumerate() {
        if !seen.insert(code) {
            problems.push(format!("duplicate {} code '{}'", kind, code));
            continue;
        }
        index.insert(code.to_string(), i);
    }
    index
}
