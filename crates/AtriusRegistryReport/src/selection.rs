//! # Field Selection Model
//!
//! Resolves a [`ReportDesign`] against [`RegistryMetadata`] into ordered,
//! validated demographic and clinical selections. Every clinical selection is
//! annotated with the form groups it is reported under: the pinned group when the
//! design names one, otherwise every group that contains the form.
//!
//! Resolution collects every problem in the design before failing, so one
//! [`ReportError::Configuration`] names all bad keys at once. Nothing is fetched
//! until resolution succeeds.

use crate::ReportError;
use crate::design::{
    CLINICAL_KEY_DELIMITER, FieldPath, HeadingFormat, PatientFilter, ReportDesign, clinical_key,
};
use crate::metadata::{PATIENT_MODEL, RegistryMetadata};
use std::borrow::Cow;
use std::collections::HashSet;

/// Whether a string matches `^[_a-zA-Z][_a-zA-Z0-9]*$`.
pub fn is_schema_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {
            chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        _ => false,
    }
}

/// Map a definition code to the identifier used in column keys.
///
/// Codes that are not identifiers (for example codes starting with a digit) are
/// prefixed with `field`. Returns `None` when even the prefixed form is invalid.
pub fn schema_field_name(code: &str) -> Option<Cow<'_, str>> {
    if is_schema_identifier(code) {
        return Some(Cow::Borrowed(code));
    }
    let prefixed = format!("field{}", code);
    is_schema_identifier(&prefixed).then_some(Cow::Owned(prefixed))
}

/// How a demographic model relates to the patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemographicKind {
    /// The patient's own fields.
    Patient,
    /// A single related record.
    Related,
    /// Zero or more related records per patient.
    RelatedList,
    /// Related records reported one column group per value of a pivot field.
    Pivot,
}

/// A resolved demographic column selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemographicSelection {
    pub model: String,
    pub model_label: String,
    pub kind: DemographicKind,
    pub path: FieldPath,
    pub label: String,
    /// Pivot field of a [`DemographicKind::Pivot`] model.
    pub pivot: Option<FieldPath>,
}

/// A resolved clinical field selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClinicalSelection {
    pub form: String,
    pub section: String,
    pub element: String,
    /// Owning form groups in metadata order.
    pub form_groups: Vec<String>,
}

impl ClinicalSelection {
    /// The `Form____Section____Element` key of this selection.
    pub fn key(&self) -> String {
        clinical_key(&self.form, &self.section, &self.element)
    }
}

/// A selected form and the form groups it is reported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPlan {
    pub form: String,
    pub form_groups: Vec<String>,
}

/// The resolved, ordered selections of one report design.
#[derive(Debug, Clone)]
pub struct FieldSelection {
    registry: String,
    heading_format: HeadingFormat,
    include_form_timestamp: bool,
    filter: PatientFilter,
    demographics: Vec<DemographicSelection>,
    clinical: Vec<ClinicalSelection>,
    forms: Vec<FormPlan>,
    selected: HashSet<String>,
    repeating_groups: HashSet<String>,
}

impl FieldSelection {
    /// Resolve a design, failing with every unresolved key.
    pub fn resolve(design: &ReportDesign, metadata: &RegistryMetadata) -> Result<Self, ReportError> {
        let mut problems = Vec::new();

        if design.registry != metadata.registry() {
            problems.push(format!(
                "design targets registry '{}' but metadata describes '{}'",
                design.registry,
                metadata.registry()
            ));
        }

        let demographics = resolve_demographics(design, metadata, &mut problems);
        let clinical = resolve_clinical(design, metadata, &mut problems);

        if demographics.is_empty() && clinical.is_empty() && problems.is_empty() {
            problems.push("report design selects no fields".to_string());
        }
        if !problems.is_empty() {
            return Err(ReportError::Configuration(problems));
        }

        let mut forms: Vec<FormPlan> = Vec::new();
        let mut selected = HashSet::new();
        for field in &clinical {
            for group in &field.form_groups {
                selected.insert(group_field_key(
                    group,
                    &field.form,
                    &field.section,
                    &field.element,
                ));
            }
            match forms.iter_mut().find(|plan| plan.form == field.form) {
                Some(plan) => {
                    for group in &field.form_groups {
                        if !plan.form_groups.contains(group) {
                            plan.form_groups.push(group.clone());
                        }
                    }
                }
                None => forms.push(FormPlan {
                    form: field.form.clone(),
                    form_groups: field.form_groups.clone(),
                }),
            }
        }
        for plan in &mut forms {
            plan.form_groups = metadata
                .form_groups()
                .iter()
                .filter(|g| plan.form_groups.contains(&g.code))
                .map(|g| g.code.clone())
                .collect();
        }
        let repeating_groups = metadata
            .form_groups()
            .iter()
            .filter(|g| g.is_repeating())
            .filter(|g| forms.iter().any(|plan| plan.form_groups.contains(&g.code)))
            .map(|g| g.code.clone())
            .collect();

        Ok(Self {
            registry: design.registry.clone(),
            heading_format: design.heading_format,
            include_form_timestamp: design.include_form_timestamp,
            filter: design.filter.clone(),
            demographics,
            clinical,
            forms,
            selected,
            repeating_groups,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn heading_format(&self) -> HeadingFormat {
        self.heading_format
    }

    pub fn include_form_timestamp(&self) -> bool {
        self.include_form_timestamp
    }

    pub fn filter(&self) -> &PatientFilter {
        &self.filter
    }

    /// Demographic selections in output order.
    pub fn demographics(&self) -> &[DemographicSelection] {
        &self.demographics
    }

    /// Clinical selections in design order, without duplicates.
    pub fn clinical(&self) -> &[ClinicalSelection] {
        &self.clinical
    }

    /// Selected forms in order of first selection.
    pub fn forms(&self) -> &[FormPlan] {
        &self.forms
    }

    /// Whether an element is reported under a form group.
    pub fn is_selected(&self, group: &str, form: &str, section: &str, element: &str) -> bool {
        self.selected
            .contains(&group_field_key(group, form, section, element))
    }

    /// Whether a form group a selected form is reported under is repeating.
    pub fn is_repeating_group(&self, group: &str) -> bool {
        self.repeating_groups.contains(group)
    }

    /// Multi-record demographic models with at least one selected field.
    pub fn related_list_models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = Vec::new();
        for selection in &self.demographics {
            if selection.kind == DemographicKind::RelatedList
                && !models.contains(&selection.model.as_str())
            {
                models.push(&selection.model);
            }
        }
        models
    }

    /// Pivoted demographic models with at least one selected field, with their
    /// pivot fields.
    pub fn pivot_models(&self) -> Vec<(&str, &FieldPath)> {
        let mut models: Vec<(&str, &FieldPath)> = Vec::new();
        for selection in &self.demographics {
            if let Some(pivot) = &selection.pivot {
                if !models.iter().any(|(model, _)| *model == selection.model) {
                    models.push((&selection.model, pivot));
                }
            }
        }
        models
    }
}

fn group_field_key(group: &str, form: &str, section: &str, element: &str) -> String {
    [group, form, section, element].join(CLINICAL_KEY_DELIMITER)
}

fn resolve_demographics(
    design: &ReportDesign,
    metadata: &RegistryMetadata,
    problems: &mut Vec<String>,
) -> Vec<DemographicSelection> {
    let mut resolved: Vec<DemographicSelection> = Vec::new();

    for field in design.ordered_demographic_fields() {
        let Some(model) = metadata.demographic_model(&field.model) else {
            problems.push(format!("unknown demographic model '{}'", field.model));
            continue;
        };
        if !is_schema_identifier(&field.model) {
            problems.push(format!(
                "demographic model name '{}' is not a valid identifier",
                field.model
            ));
            continue;
        }
        let path = match FieldPath::parse(&field.field) {
            Ok(path) => path,
            Err(reason) => {
                problems.push(reason);
                continue;
            }
        };
        let Some(label) = model.field_label(&path) else {
            problems.push(format!(
                "unknown field '{}' in demographic model '{}'",
                field.field, field.model
            ));
            continue;
        };

        let pivot = model.pivot_path();
        let kind = if field.model == PATIENT_MODEL {
            DemographicKind::Patient
        } else if pivot.is_some() {
            DemographicKind::Pivot
        } else if model.multi_field {
            DemographicKind::RelatedList
        } else {
            DemographicKind::Related
        };

        let selection = DemographicSelection {
            model: field.model.clone(),
            model_label: model.label.clone(),
            kind,
            path,
            label: label.to_string(),
            pivot,
        };
        if !resolved.contains(&selection) {
            resolved.push(selection);
        }
    }

    resolved
}

fn resolve_clinical(
    design: &ReportDesign,
    metadata: &RegistryMetadata,
    problems: &mut Vec<String>,
) -> Vec<ClinicalSelection> {
    let mut resolved: Vec<ClinicalSelection> = Vec::new();

    for field in &design.clinical_fields {
        let Some((form_code, section_code, element_code)) = field.parts() else {
            problems.push(format!(
                "malformed clinical field key '{}', expected Form{d}Section{d}Element",
                field.key,
                d = CLINICAL_KEY_DELIMITER
            ));
            continue;
        };

        let Some(form) = metadata.form(form_code) else {
            problems.push(format!(
                "unknown form '{}' in key '{}'",
                form_code, field.key
            ));
            continue;
        };
        if !form.sections.iter().any(|s| s == section_code) || metadata.section(section_code).is_none()
        {
            problems.push(format!(
                "unknown section '{}' in key '{}'",
                section_code, field.key
            ));
            continue;
        }
        if !metadata.contains_field(form_code, section_code, element_code) {
            problems.push(format!(
                "unknown data element '{}' in key '{}'",
                element_code, field.key
            ));
            continue;
        }

        let groups: Vec<String> = match &field.form_group {
            Some(pinned) => match metadata.form_group(pinned) {
                Some(group) if group.forms.iter().any(|f| f == form_code) => {
                    vec![group.code.clone()]
                }
                Some(_) => {
                    problems.push(format!(
                        "form group '{}' does not contain form '{}' (key '{}')",
                        pinned, form_code, field.key
                    ));
                    continue;
                }
                None => {
                    problems.push(format!(
                        "unknown form group '{}' for key '{}'",
                        pinned, field.key
                    ));
                    continue;
                }
            },
            None => metadata
                .groups_containing(form_code)
                .into_iter()
                .map(|g| g.code.clone())
                .collect(),
        };
        if groups.is_empty() {
            problems.push(format!(
                "form '{}' of key '{}' is not in any form group",
                form_code, field.key
            ));
            continue;
        }

        let mut invalid_code = false;
        for code in groups
            .iter()
            .map(String::as_str)
            .chain([form_code, section_code, element_code])
        {
            if schema_field_name(code).is_none() {
                problems.push(format!(
                    "code '{}' in key '{}' cannot be used as a column identifier",
                    code, field.key
                ));
                invalid_code = true;
            }
        }
        if invalid_code {
            continue;
        }

        match resolved.iter_mut().find(|s| {
            s.form == form_code && s.section == section_code && s.element == element_code
        }) {
            Some(existing) => {
                for group in groups {
                    if !existing.form_groups.contains(&group) {
                        existing.form_groups.push(group);
                    }
                }
                existing.form_groups = metadata
                    .form_groups()
                    .iter()
                    .filter(|g| existing.form_groups.contains(&g.code))
                    .map(|g| g.code.clone())
                    .collect();
            }
            None => resolved.push(ClinicalSelection {
                form: form_code.to_string(),
                section: section_code.to_string(),
                element: element_code.to_string(),
                form_groups: groups,
            }),
        }
    }

    resolved
}
