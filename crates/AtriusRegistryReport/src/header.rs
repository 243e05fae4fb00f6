//! # Header Generation
//!
//! Produces the ordered column contract of an export: one [`HeaderEntry`] (stable
//! key, human label) per output column. The flattener builds every leaf key with
//! the same key builders used here, which keeps rows and header in lockstep.
//!
//! ## Column Keys
//!
//! Keys join schema identifiers with `.`, so no component can contain the
//! separator and keys never collide:
//!
//! ```text
//! familyName                                         patient field
//! patientaddressSet.0.suburb                         related record, instance 0
//! patientconsentSet.1.answer                         pivoted record, second pivot value
//! clinicalData.baseline.Sleep.SleepDiary.1.TimesAwoke.0
//! clinicalData.followup.Visit.0.key                  repeating instance name
//! clinicalData.followup.Visit.0.data.VisitDetails.Weight
//! clinicalData.followup.Visit.0.meta.lastUpdated     with form timestamps
//! ```
//!
//! Indices are 0-based in keys and 1-based in labels. Labels join display texts
//! with `_` according to the design's [`HeadingFormat`].

use crate::ReportError;
use crate::design::{FieldPath, HeadingFormat, clinical_key};
use crate::metadata::{Heading, RegistryMetadata};
use crate::selection::{DemographicKind, FieldSelection, schema_field_name};
use crate::summary::CardinalitySummary;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Separator between key components.
pub const KEY_SEPARATOR: &str = ".";
/// Separator between label components.
pub const LABEL_SEPARATOR: &str = "_";
/// Root component of every clinical column key.
pub const CLINICAL_ROOT: &str = "clinicalData";

/// One output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderEntry {
    pub key: String,
    pub label: String,
}

/// Where a demographic column's value is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemographicLocator {
    pub model: String,
    pub kind: DemographicKind,
    /// Related-record index for multi-record models.
    pub instance: Option<usize>,
    pub path: FieldPath,
    /// Pivot field and the value a pivoted record must carry in it.
    pub variant: Option<(FieldPath, String)>,
}

/// Which nesting levels of the clinical tree carry an index in their keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnLayout {
    repeating_groups: HashSet<String>,
    repeating_sections: HashSet<String>,
    indexed_elements: HashSet<String>,
}

impl ColumnLayout {
    pub fn is_repeating_group(&self, group: &str) -> bool {
        self.repeating_groups.contains(group)
    }

    pub fn is_repeating_section(&self, section: &str) -> bool {
        self.repeating_sections.contains(section)
    }

    pub fn is_indexed_element(&self, form: &str, section: &str, element: &str) -> bool {
        self.indexed_elements
            .contains(&clinical_key(form, section, element))
    }
}

/// The frozen column contract of one export.
#[derive(Debug, Clone, Default)]
pub struct Header {
    entries: Vec<HeaderEntry>,
    index: HashMap<String, usize>,
    demographic_locators: Vec<(usize, DemographicLocator)>,
    layout: ColumnLayout,
}

impl Header {
    /// Generate the header for a resolved selection and its population summary.
    pub fn generate(
        selection: &FieldSelection,
        metadata: &RegistryMetadata,
        summary: &CardinalitySummary,
    ) -> Result<Self, ReportError> {
        let mut header = Header::default();
        header.push_demographics(selection, summary)?;
        header.push_clinical(selection, metadata, summary)?;
        debug!("Generated header with {} columns", header.entries.len());
        Ok(header)
    }

    pub fn entries(&self) -> &[HeaderEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    /// Column position of a key.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn demographic_locators(&self) -> &[(usize, DemographicLocator)] {
        &self.demographic_locators
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    /// Check that every generated column label is distinct.
    ///
    /// Catches collisions that only appear once repeat indices are joined in,
    /// such as a repeating section `Diary` next to a section named `Diary_1`.
    pub fn validate_unique_labels(&self, heading_format: HeadingFormat) -> Result<(), ReportError> {
        let mut by_label: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for entry in &self.entries {
            by_label
                .entry(entry.label.as_str())
                .or_default()
                .push(entry.key.clone());
        }
        let columns: BTreeMap<String, Vec<String>> = by_label
            .into_iter()
            .filter(|(_, keys)| keys.len() > 1)
            .map(|(label, keys)| (label.to_string(), keys))
            .collect();
        if columns.is_empty() {
            return Ok(());
        }
        Err(ReportError::HeaderCollision(HeaderCollisions {
            heading_format,
            labels: BTreeMap::new(),
            columns,
        }))
    }

    fn push(&mut self, key: String, label: String) -> Result<usize, ReportError> {
        if self.index.contains_key(&key) {
            return Err(ReportError::configuration(format!(
                "two selections produce the same column key '{}'",
                key
            )));
        }
        let position = self.entries.len();
        self.index.insert(key.clone(), position);
        self.entries.push(HeaderEntry { key, label });
        Ok(position)
    }

    fn push_demographics(
        &mut self,
        selection: &FieldSelection,
        summary: &CardinalitySummary,
    ) -> Result<(), ReportError> {
        let mut emitted_lists: HashSet<&str> = HashSet::new();

        for field in selection.demographics() {
            match field.kind {
                DemographicKind::Patient => {
                    let position = self.push(field.path.key(), field.label.clone())?;
                    self.demographic_locators.push((
                        position,
                        DemographicLocator {
                            model: field.model.clone(),
                            kind: field.kind,
                            instance: None,
                            path: field.path.clone(),
                            variant: None,
                        },
                    ));
                }
                DemographicKind::Related => {
                    let key = join_key([field.model.as_str(), &field.path.key()]);
                    let label = join_label([field.model_label.as_str(), &field.label]);
                    let position = self.push(key, label)?;
                    self.demographic_locators.push((
                        position,
                        DemographicLocator {
                            model: field.model.clone(),
                            kind: field.kind,
                            instance: None,
                            path: field.path.clone(),
                            variant: None,
                        },
                    ));
                }
                DemographicKind::RelatedList => {
                    if !emitted_lists.insert(field.model.as_str()) {
                        continue;
                    }
                    let fields: Vec<_> = selection
                        .demographics()
                        .iter()
                        .filter(|f| f.model == field.model)
                        .collect();
                    for instance in 0..summary.max_related_instances(&field.model) {
                        let index = instance.to_string();
                        let ordinal = (instance + 1).to_string();
                        for f in &fields {
                            let key = join_key([f.model.as_str(), &index, &f.path.key()]);
                            let label = join_label([f.model_label.as_str(), &ordinal, &f.label]);
                            let position = self.push(key, label)?;
                            self.demographic_locators.push((
                                position,
                                DemographicLocator {
                                    model: f.model.clone(),
                                    kind: f.kind,
                                    instance: Some(instance),
                                    path: f.path.clone(),
                                    variant: None,
                                },
                            ));
                        }
                    }
                }
                DemographicKind::Pivot => {
                    if !emitted_lists.insert(field.model.as_str()) {
                        continue;
                    }
                    let fields: Vec<_> = selection
                        .demographics()
                        .iter()
                        .filter(|f| f.model == field.model)
                        .collect();
                    let variants = summary.variants(&field.model);
                    if variants.is_empty() {
                        for f in &fields {
                            self.push(
                                join_key([f.model.as_str(), &f.path.key()]),
                                join_label([f.model_label.as_str(), &f.label]),
                            )?;
                        }
                        continue;
                    }
                    for (i, variant) in variants.iter().enumerate() {
                        let index = i.to_string();
                        for f in &fields {
                            let key = join_key([f.model.as_str(), &index, &f.path.key()]);
                            let label = join_label([f.model_label.as_str(), variant, &f.label]);
                            let position = self.push(key, label)?;
                            self.demographic_locators.push((
                                position,
                                DemographicLocator {
                                    model: f.model.clone(),
                                    kind: f.kind,
                                    instance: None,
                                    path: f.path.clone(),
                                    variant: f.pivot.clone().map(|pivot| (pivot, variant.clone())),
                                },
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn push_clinical(
        &mut self,
        selection: &FieldSelection,
        metadata: &RegistryMetadata,
        summary: &CardinalitySummary,
    ) -> Result<(), ReportError> {
        let format = selection.heading_format();

        for plan in selection.forms() {
            let form = metadata.form(&plan.form).ok_or_else(|| {
                ReportError::configuration(format!("form '{}' no longer exists", plan.form))
            })?;

            for group_code in &plan.form_groups {
                let group = metadata.form_group(group_code).ok_or_else(|| {
                    ReportError::configuration(format!(
                        "form group '{}' no longer exists",
                        group_code
                    ))
                })?;
                let repeating = group.is_repeating();
                if repeating {
                    self.layout.repeating_groups.insert(group.code.clone());
                }
                let instances: Vec<Option<usize>> = if repeating {
                    (0..summary.max_form_group_instances(&group.code))
                        .map(Some)
                        .collect()
                } else {
                    vec![None]
                };

                for instance in instances {
                    let form_key = form_instance_key(&group.code, &form.code, instance);
                    let form_label = indexed_label(
                        &join_label([group.heading(format), form.heading(format)]),
                        None,
                        instance,
                    );
                    if instance.is_some() {
                        self.push(
                            instance_name_key(&form_key),
                            join_label([form_label.as_str(), "Name"]),
                        )?;
                    }
                    if selection.include_form_timestamp() {
                        self.push(
                            timestamp_key(&form_key),
                            join_label([form_label.as_str(), "Last Updated"]),
                        )?;
                    }
                    let root = form_data_root(&form_key, repeating);

                    for section in metadata.sections_of(form) {
                        let elements: Vec<_> = metadata
                            .elements_of(section)
                            .filter(|e| {
                                selection.is_selected(&group.code, &form.code, &section.code, &e.code)
                            })
                            .collect();
                        if elements.is_empty() {
                            continue;
                        }
                        let section_repeats: Vec<Option<usize>> = if section.repeats {
                            self.layout
                                .repeating_sections
                                .insert(section.code.clone());
                            (0..summary.max_section_repeats(&form.code, &section.code))
                                .map(Some)
                                .collect()
                        } else {
                            vec![None]
                        };

                        for repeat in section_repeats {
                            let section_key = indexed_key(&root, &section.code, repeat);
                            let section_label =
                                indexed_label(&form_label, Some(section.heading(format)), repeat);

                            for element in &elements {
                                let count = summary.max_value_repeats(
                                    &form.code,
                                    &section.code,
                                    &element.code,
                                );
                                let values: Vec<Option<usize>> = if element.multi_value || count > 1
                                {
                                    self.layout.indexed_elements.insert(clinical_key(
                                        &form.code,
                                        &section.code,
                                        &element.code,
                                    ));
                                    (0..count).map(Some).collect()
                                } else {
                                    vec![None]
                                };
                                for value in values {
                                    self.push(
                                        indexed_key(&section_key, &element.code, value),
                                        indexed_label(
                                            &section_label,
                                            Some(element.heading(format)),
                                            value,
                                        ),
                                    )?;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Identifier used for a code in keys; codes that cannot be mapped are used
/// verbatim and therefore never match a generated column.
pub(crate) fn ident(code: &str) -> Cow<'_, str> {
    schema_field_name(code).unwrap_or(Cow::Borrowed(code))
}

fn join_key<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().collect::<Vec<_>>().join(KEY_SEPARATOR)
}

fn join_label<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().collect::<Vec<_>>().join(LABEL_SEPARATOR)
}

/// `clinicalData.{group}.{form}[.{instance}]`
pub(crate) fn form_instance_key(group: &str, form: &str, instance: Option<usize>) -> String {
    let base = join_key([CLINICAL_ROOT, &ident(group), &ident(form)]);
    match instance {
        Some(i) => join_key([base.as_str(), &i.to_string()]),
        None => base,
    }
}

/// Root under which section keys of a form instance live.
pub(crate) fn form_data_root(form_key: &str, repeating: bool) -> String {
    if repeating {
        join_key([form_key, "data"])
    } else {
        form_key.to_string()
    }
}

pub(crate) fn instance_name_key(form_key: &str) -> String {
    join_key([form_key, "key"])
}

pub(crate) fn timestamp_key(form_key: &str) -> String {
    join_key([form_key, "meta", "lastUpdated"])
}

/// `{base}.{code}[.{index}]`
pub(crate) fn indexed_key(base: &str, code: &str, index: Option<usize>) -> String {
    let key = join_key([base, &ident(code)]);
    match index {
        Some(i) => join_key([key.as_str(), &i.to_string()]),
        None => key,
    }
}

/// `{base}[_{text}][_{index + 1}]`
fn indexed_label(base: &str, text: Option<&str>, index: Option<usize>) -> String {
    let mut label = base.to_string();
    if let Some(text) = text {
        label.push_str(LABEL_SEPARATOR);
        label.push_str(text);
    }
    if let Some(i) = index {
        label.push_str(LABEL_SEPARATOR);
        label.push_str(&(i + 1).to_string());
    }
    label
}

/// One selected field under one form group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldTuple {
    pub form_group: String,
    pub form: String,
    pub section: String,
    pub element: String,
}

impl fmt::Display for FieldTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.form_group, self.form, self.section, self.element
        )
    }
}

/// Labels shared by more than one distinct field or column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderCollisions {
    pub heading_format: HeadingFormat,
    /// Field tuples per shared label, found before the population is scanned.
    pub labels: BTreeMap<String, Vec<FieldTuple>>,
    /// Column keys per shared label of a generated header.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, Vec<String>>,
}

impl fmt::Display for HeaderCollisions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} label(s) shared by more than one field in {} mode",
            self.labels.len() + self.columns.len(),
            self.heading_format
        )?;
        for (label, fields) in &self.labels {
            let fields: Vec<String> = fields.iter().map(ToString::to_string).collect();
            write!(f, "; '{}': {}", label, fields.join(", "))?;
        }
        for (label, keys) in &self.columns {
            write!(f, "; '{}': {}", label, keys.join(", "))?;
        }
        Ok(())
    }
}

/// Check that no two selected fields share a column label.
///
/// Labels are compared without repeat indices, one per (form group, form,
/// section, element) tuple. `CODE` headings are unique by construction.
pub fn validate_labels(
    selection: &FieldSelection,
    metadata: &RegistryMetadata,
) -> Result<(), ReportError> {
    let format = selection.heading_format();
    if format == HeadingFormat::Code {
        return Ok(());
    }

    let mut by_label: BTreeMap<String, BTreeSet<FieldTuple>> = BTreeMap::new();
    for plan in selection.forms() {
        let Some(form) = metadata.form(&plan.form) else {
            continue;
        };
        for group in plan
            .form_groups
            .iter()
            .filter_map(|code| metadata.form_group(code))
        {
            for section in metadata.sections_of(form) {
                for element in metadata.elements_of(section) {
                    if !selection.is_selected(&group.code, &form.code, &section.code, &element.code)
                    {
                        continue;
                    }
                    let label = join_label([
                        group.heading(format),
                        form.heading(format),
                        section.heading(format),
                        element.heading(format),
                    ]);
                    by_label.entry(label).or_default().insert(FieldTuple {
                        form_group: group.code.clone(),
                        form: form.code.clone(),
                        section: section.code.clone(),
                        element: element.code.clone(),
                    });
                }
            }
        }
    }

    let labels: BTreeMap<String, Vec<FieldTuple>> = by_label
        .into_iter()
        .filter(|(_, fields)| fields.len() > 1)
        .map(|(label, fields)| (label, fields.into_iter().collect()))
        .collect();

    if labels.is_empty() {
        Ok(())
    } else {
        Err(ReportError::HeaderCollision(HeaderCollisions {
            heading_format: format,
            labels,
            columns: BTreeMap::new(),
        }))
    }
}
