//! # Fetch Query Compiler
//!
//! Translates a [`FieldSelection`] into the [`FetchRequest`] handed to the
//! nested-data fetch interface. The request asks for exactly the fields the
//! header has columns for: patient fields, related-model fields, and clinical
//! elements grouped form group, then form, then section.
//!
//! Compilation re-resolves every clinical reference against the metadata, so a
//! definition that disappeared after header generation fails here instead of
//! producing a misaligned export.

use crate::ReportError;
use crate::design::FieldPath;
use crate::metadata::{FormGroupPolicy, RegistryMetadata};
use crate::selection::{DemographicKind, FieldSelection};
use serde::Serialize;
use std::fmt;

/// A compiled request for the nested-data fetch interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub registry: String,
    pub patient_fields: Vec<FieldPath>,
    pub related: Vec<RelatedModelRequest>,
    pub form_groups: Vec<FormGroupRequest>,
}

/// Fields requested from one related demographic model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedModelRequest {
    pub model: String,
    /// The model holds a list of records per patient.
    pub list: bool,
    pub fields: Vec<FieldPath>,
    /// Field read from every record to pick its column group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pivot: Option<FieldPath>,
}

impl RelatedModelRequest {
    /// Selected fields plus the pivot field, each once.
    pub fn projected_fields(&self) -> Vec<&FieldPath> {
        let mut fields: Vec<&FieldPath> = self.fields.iter().collect();
        if let Some(pivot) = &self.pivot {
            if !fields.contains(&pivot) {
                fields.push(pivot);
            }
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormGroupRequest {
    pub code: String,
    pub policy: FormGroupPolicy,
    pub include_timestamp: bool,
    pub forms: Vec<FormRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormRequest {
    pub code: String,
    pub sections: Vec<SectionRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionRequest {
    pub code: String,
    pub elements: Vec<String>,
}

impl FetchRequest {
    /// Compile a request from resolved selections.
    pub fn compile(
        selection: &FieldSelection,
        metadata: &RegistryMetadata,
    ) -> Result<Self, ReportError> {
        let mut request = FetchRequest {
            registry: selection.registry().to_string(),
            patient_fields: Vec::new(),
            related: Vec::new(),
            form_groups: Vec::new(),
        };

        for field in selection.demographics() {
            match field.kind {
                DemographicKind::Patient => {
                    if !request.patient_fields.contains(&field.path) {
                        request.patient_fields.push(field.path.clone());
                    }
                }
                DemographicKind::Related
                | DemographicKind::RelatedList
                | DemographicKind::Pivot => {
                    let position = match request.related.iter().position(|r| r.model == field.model)
                    {
                        Some(position) => position,
                        None => {
                            request.related.push(RelatedModelRequest {
                                model: field.model.clone(),
                                list: field.kind != DemographicKind::Related,
                                fields: Vec::new(),
                                pivot: field.pivot.clone(),
                            });
                            request.related.len() - 1
                        }
                    };
                    let related = &mut request.related[position];
                    if !related.fields.contains(&field.path) {
                        related.fields.push(field.path.clone());
                    }
                }
            }
        }

        let mut problems = Vec::new();
        for field in selection.clinical() {
            if !metadata.contains_field(&field.form, &field.section, &field.element) {
                problems.push(format!(
                    "field '{}' no longer exists in the registry definitions",
                    field.key()
                ));
                continue;
            }
            for group_code in &field.form_groups {
                let Some(group) = metadata
                    .form_group(group_code)
                    .filter(|g| g.forms.iter().any(|f| f == &field.form))
                else {
                    problems.push(format!(
                        "form group '{}' no longer contains form '{}'",
                        group_code, field.form
                    ));
                    continue;
                };

                let group_request = find_or_insert(
                    &mut request.form_groups,
                    |g| g.code == group.code,
                    || FormGroupRequest {
                        code: group.code.clone(),
                        policy: group.policy,
                        include_timestamp: selection.include_form_timestamp(),
                        forms: Vec::new(),
                    },
                );
                let form_request = find_or_insert(
                    &mut group_request.forms,
                    |f| f.code == field.form,
                    || FormRequest {
                        code: field.form.clone(),
                        sections: Vec::new(),
                    },
                );
                let section_request = find_or_insert(
                    &mut form_request.sections,
                    |s| s.code == field.section,
                    || SectionRequest {
                        code: field.section.clone(),
                        elements: Vec::new(),
                    },
                );
                if !section_request.elements.contains(&field.element) {
                    section_request.elements.push(field.element.clone());
                }
            }
        }

        if !problems.is_empty() {
            return Err(ReportError::Configuration(problems));
        }
        Ok(request)
    }

    pub fn form_group(&self, code: &str) -> Option<&FormGroupRequest> {
        self.form_groups.iter().find(|g| g.code == code)
    }

    pub fn related_model(&self, model: &str) -> Option<&RelatedModelRequest> {
        self.related.iter().find(|r| r.model == model)
    }
}

impl FormGroupRequest {
    pub fn form(&self, code: &str) -> Option<&FormRequest> {
        self.forms.iter().find(|f| f.code == code)
    }
}

fn find_or_insert<'a, T>(
    items: &'a mut Vec<T>,
    matches: impl Fn(&T) -> bool,
    create: impl FnOnce() -> T,
) -> &'a mut T {
    let position = match items.iter().position(matches) {
        Some(position) => position,
        None => {
            items.push(create());
            items.len() - 1
        }
    };
    &mut items[position]
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "patients(registry: \"{}\") {{", self.registry)?;
        writeln!(f, "  id")?;
        for path in &self.patient_fields {
            writeln!(f, "  {}", path.selection())?;
        }
        for related in &self.related {
            let fields: Vec<String> = related
                .projected_fields()
                .into_iter()
                .map(FieldPath::selection)
                .collect();
            writeln!(f, "  {} {{ {} }}", related.model, fields.join(" "))?;
        }
        if !self.form_groups.is_empty() {
            writeln!(f, "  clinicalData {{")?;
            for group in &self.form_groups {
                let policy = match group.policy {
                    FormGroupPolicy::Fixed => "FIXED",
                    FormGroupPolicy::Repeating => "REPEATING",
                };
                writeln!(f, "    {}(policy: {}) {{", group.code, policy)?;
                for form in &group.forms {
                    let sections: Vec<String> = form
                        .sections
                        .iter()
                        .map(|s| format!("{} {{ {} }}", s.code, s.elements.join(" ")))
                        .collect();
                    let mut parts = Vec::new();
                    if group.policy == FormGroupPolicy::Repeating {
                        parts.push("key".to_string());
                    }
                    if group.include_timestamp {
                        parts.push("meta { lastUpdated }".to_string());
                    }
                    if group.policy == FormGroupPolicy::Repeating {
                        parts.push(format!("data {{ {} }}", sections.join(" ")));
                    } else {
                        parts.extend(sections);
                    }
                    writeln!(f, "      {} {{ {} }}", form.code, parts.join(" "))?;
                }
                writeln!(f, "    }}")?;
            }
            writeln!(f, "  }}")?;
        }
        write!(f, "}}")
    }
}
