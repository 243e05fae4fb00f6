//! # Registry Store
//!
//! The export consumes patient data through the [`RegistryStore`] trait, which
//! bundles the population filter, the population scans used by the cardinality
//! summarizer, and the paged nested-data fetch interface.
//!
//! [`InMemoryStore`] implements the trait over a [`RegistrySnapshot`] loaded with
//! the [`data_source`](crate::data_source) module. It validates every fetch
//! request against the registry metadata and returns result trees shaped exactly
//! as requested.

use crate::design::{FieldPath, PatientFilter};
use crate::metadata::{FormGroupPolicy, RegistryMetadata};
use crate::query::FetchRequest;
use crate::records::{ClinicalRecord, FormInstance, PatientRecord, related_records, variant_name};
use crate::{PatientId, ReportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Source of patient data for an export.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Ids of the patients of a registry matching a filter, in a stable order.
    async fn population(
        &self,
        registry: &str,
        filter: &PatientFilter,
    ) -> Result<Vec<PatientId>, ReportError>;

    /// Every stored clinical record of the given patients, grouped by patient
    /// and in creation order within a patient.
    async fn clinical_records(
        &self,
        patients: &[PatientId],
    ) -> Result<Vec<ClinicalRecord>, ReportError>;

    /// Largest number of records of a related demographic model held by any of
    /// the given patients.
    async fn max_related_instances(
        &self,
        model: &str,
        patients: &[PatientId],
    ) -> Result<usize, ReportError>;

    /// Distinct values of `pivot` across the records of a related demographic
    /// model held by the given patients, sorted.
    async fn demographic_variants(
        &self,
        model: &str,
        pivot: &FieldPath,
        patients: &[PatientId],
    ) -> Result<Vec<String>, ReportError>;

    /// Result trees for `patients[offset..offset + limit]`, shaped by `request`.
    async fn fetch(
        &self,
        request: &FetchRequest,
        patients: &[PatientId],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PatientRecord>, ReportError>;
}

/// A registry's patients and clinical records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub registry: String,
    #[serde(default)]
    pub patients: Vec<PatientEntry>,
    #[serde(default)]
    pub clinical_records: Vec<ClinicalRecord>,
}

/// One patient of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientEntry {
    pub id: PatientId,
    #[serde(default)]
    pub working_groups: Vec<String>,
    /// Consent question code to answer.
    #[serde(default)]
    pub consents: BTreeMap<String, bool>,
    #[serde(default)]
    pub demographics: Map<String, Value>,
}

impl PatientEntry {
    fn matches(&self, filter: &PatientFilter) -> bool {
        let in_group = filter.working_groups.is_empty()
            || self
                .working_groups
                .iter()
                .any(|g| filter.working_groups.contains(g));
        let consented = filter
            .consent_questions
            .iter()
            .all(|q| self.consents.get(q).copied().unwrap_or(false));
        in_group && consented
    }
}

/// Registry store over an in-memory snapshot.
pub struct InMemoryStore {
    metadata: Arc<RegistryMetadata>,
    snapshot: RegistrySnapshot,
    patient_index: HashMap<PatientId, usize>,
    records_by_patient: HashMap<PatientId, Vec<usize>>,
}

impl InMemoryStore {
    pub fn new(metadata: Arc<RegistryMetadata>, snapshot: RegistrySnapshot) -> Self {
        let patient_index = snapshot
            .patients
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();

        let mut records_by_patient: HashMap<PatientId, Vec<usize>> = HashMap::new();
        for (i, record) in snapshot.clinical_records.iter().enumerate() {
            records_by_patient
                .entry(record.patient_id.clone())
                .or_default()
                .push(i);
        }
        for indices in records_by_patient.values_mut() {
            indices.sort_by_key(|&i| (snapshot.clinical_records[i].created_at, i));
        }

        Self {
            metadata,
            snapshot,
            patient_index,
            records_by_patient,
        }
    }

    pub fn snapshot(&self) -> &RegistrySnapshot {
        &self.snapshot
    }

    fn patient(&self, id: &str) -> Option<&PatientEntry> {
        self.patient_index
            .get(id)
            .map(|&i| &self.snapshot.patients[i])
    }

    /// Records of a patient in creation order.
    fn records_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a ClinicalRecord> + 'a {
        self.records_by_patient
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| &self.snapshot.clinical_records[i])
    }

    fn check_registry(&self, registry: &str) -> Result<(), ReportError> {
        if registry != self.snapshot.registry {
            return Err(ReportError::Fetch(format!(
                "store holds registry '{}', not '{}'",
                self.snapshot.registry, registry
            )));
        }
        Ok(())
    }

    fn check_pivot(&self, model: &str, pivot: &FieldPath) -> Result<(), ReportError> {
        let configured = self
            .metadata
            .demographic_model(model)
            .and_then(|m| m.pivot_path());
        if configured.as_ref() != Some(pivot) {
            return Err(ReportError::Fetch(format!(
                "model '{}' cannot be pivoted on '{}'",
                model, pivot
            )));
        }
        Ok(())
    }

    fn validate_request(&self, request: &FetchRequest) -> Result<(), ReportError> {
        self.check_registry(&request.registry)?;

        let known_field = |model: &str, path: &FieldPath| {
            self.metadata
                .demographic_model(model)
                .is_some_and(|m| m.field_label(path).is_some())
        };
        for path in &request.patient_fields {
            if !known_field(crate::metadata::PATIENT_MODEL, path) {
                return Err(ReportError::Fetch(format!(
                    "unknown patient field '{}'",
                    path
                )));
            }
        }
        for related in &request.related {
            for path in &related.fields {
                if !known_field(&related.model, path) {
                    return Err(ReportError::Fetch(format!(
                        "unknown field '{}' of model '{}'",
                        path, related.model
                    )));
                }
            }
            if let Some(pivot) = &related.pivot {
                self.check_pivot(&related.model, pivot)?;
            }
        }
        for group in &request.form_groups {
            let Some(definition) = self.metadata.form_group(&group.code) else {
                return Err(ReportError::Fetch(format!(
                    "unknown form group '{}'",
                    group.code
                )));
            };
            for form in &group.forms {
                if !definition.forms.contains(&form.code) {
                    return Err(ReportError::Fetch(format!(
                        "form group '{}' has no form '{}'",
                        group.code, form.code
                    )));
                }
                for section in &form.sections {
                    for element in &section.elements {
                        if !self
                            .metadata
                            .contains_field(&form.code, &section.code, element)
                        {
                            return Err(ReportError::Fetch(format!(
                                "unknown field '{}' in section '{}' of form '{}'",
                                element, section.code, form.code
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn project_patient(&self, request: &FetchRequest, patient: &PatientEntry) -> PatientRecord {
        let mut demographics = Map::new();
        for path in &request.patient_fields {
            copy_path(&patient.demographics, path.segments(), &mut demographics);
        }
        for related in &request.related {
            let fields = related.projected_fields();
            let projected = match patient.demographics.get(&related.model) {
                Some(Value::Array(items)) => Value::Array(
                    items
                        .iter()
                        .map(|item| project_object(item, &fields))
                        .collect(),
                ),
                Some(item @ Value::Object(_)) => project_object(item, &fields),
                _ => continue,
            };
            demographics.insert(related.model.clone(), projected);
        }

        let mut clinical: BTreeMap<String, BTreeMap<String, Vec<FormInstance>>> = BTreeMap::new();
        for group in &request.form_groups {
            let records: Vec<&ClinicalRecord> = self
                .records_of(&patient.id)
                .filter(|r| r.form_group == group.code)
                .collect();
            let records = match group.policy {
                FormGroupPolicy::Fixed => &records[..records.len().min(1)],
                FormGroupPolicy::Repeating => &records[..],
            };
            if records.is_empty() {
                continue;
            }

            let forms = clinical.entry(group.code.clone()).or_default();
            for form in &group.forms {
                let mut instances = Vec::new();
                for record in records {
                    let form_data = record.form(&form.code);
                    if form_data.is_none() && group.policy == FormGroupPolicy::Fixed {
                        continue;
                    }
                    let mut instance = FormInstance {
                        key: match group.policy {
                            FormGroupPolicy::Repeating => record.key.clone(),
                            FormGroupPolicy::Fixed => None,
                        },
                        last_updated: if group.include_timestamp {
                            record.last_updated
                        } else {
                            None
                        },
                        sections: BTreeMap::new(),
                    };
                    if let Some(form_data) = form_data {
                        for section in &form.sections {
                            if let Some(data) = form_data.section(&section.code) {
                                instance
                                    .sections
                                    .insert(section.code.clone(), data.entries.project(&section.elements));
                            }
                        }
                    }
                    instances.push(instance);
                }
                if !instances.is_empty() {
                    forms.insert(form.code.clone(), instances);
                }
            }
        }

        PatientRecord {
            id: patient.id.clone(),
            demographics,
            clinical,
        }
    }
}

/// Copy the value at `path` from `source` into `target`, creating parents.
fn copy_path(source: &Map<String, Value>, path: &[String], target: &mut Map<String, Value>) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    let Some(value) = source.get(first) else {
        return;
    };
    if rest.is_empty() {
        target.insert(first.clone(), value.clone());
        return;
    }
    let Value::Object(child_source) = value else {
        return;
    };
    let child_target = target
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(child_target) = child_target {
        copy_path(child_source, rest, child_target);
    }
}

fn project_object(item: &Value, fields: &[&FieldPath]) -> Value {
    let mut projected = Map::new();
    if let Value::Object(source) = item {
        for path in fields {
            copy_path(source, path.segments(), &mut projected);
        }
    }
    Value::Object(projected)
}

#[async_trait]
impl RegistryStore for InMemoryStore {
    async fn population(
        &self,
        registry: &str,
        filter: &PatientFilter,
    ) -> Result<Vec<PatientId>, ReportError> {
        self.check_registry(registry)?;
        let mut ids: Vec<PatientId> = self
            .snapshot
            .patients
            .iter()
            .filter(|p| p.matches(filter))
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn clinical_records(
        &self,
        patients: &[PatientId],
    ) -> Result<Vec<ClinicalRecord>, ReportError> {
        Ok(patients
            .iter()
            .flat_map(|id| self.records_of(id))
            .cloned()
            .collect())
    }

    async fn max_related_instances(
        &self,
        model: &str,
        patients: &[PatientId],
    ) -> Result<usize, ReportError> {
        if self.metadata.demographic_model(model).is_none() {
            return Err(ReportError::Fetch(format!(
                "unknown demographic model '{}'",
                model
            )));
        }
        Ok(patients
            .iter()
            .filter_map(|id| self.patient(id))
            .map(|p| match p.demographics.get(model) {
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(_)) => 1,
                _ => 0,
            })
            .max()
            .unwrap_or(0))
    }

    async fn demographic_variants(
        &self,
        model: &str,
        pivot: &FieldPath,
        patients: &[PatientId],
    ) -> Result<Vec<String>, ReportError> {
        self.check_pivot(model, pivot)?;
        let variants: BTreeSet<String> = patients
            .iter()
            .filter_map(|id| self.patient(id))
            .filter_map(|p| p.demographics.get(model))
            .flat_map(related_records)
            .filter_map(|record| pivot.resolve(record).and_then(variant_name))
            .collect();
        Ok(variants.into_iter().collect())
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        patients: &[PatientId],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PatientRecord>, ReportError> {
        self.validate_request(request)?;
        let mut page = Vec::new();
        for id in patients.iter().skip(offset).take(limit) {
            match self.patient(id) {
                Some(patient) => page.push(self.project_patient(request, patient)),
                None => debug!("Patient {} left the registry, skipping", id),
            }
        }
        Ok(page)
    }
}
