//! # Cardinality Summarizer
//!
//! Computes, for one targeted population, the maximum repeat count at every
//! nesting level the header has to be sized for:
//!
//! - section repeats per (form, section),
//! - values per (form, section, element),
//! - instances per patient of each repeating form group,
//! - related records per patient of each multi-record demographic model,
//!
//! and, for every pivoted demographic model, the distinct pivot values found in
//! the population.
//!
//! Every selected field defaults to 1, so a field nobody has data for still gets
//! exactly one column. The summary is computed once per export, before any row is
//! produced, and is frozen afterwards.

use crate::records::{ClinicalRecord, values_of};
use crate::selection::FieldSelection;
use crate::store::RegistryStore;
use crate::{PatientId, ReportError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Frozen maximum repeat counts for one export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardinalitySummary {
    section_repeats: BTreeMap<(String, String), usize>,
    value_repeats: BTreeMap<(String, String, String), usize>,
    form_group_instances: BTreeMap<String, usize>,
    related_instances: BTreeMap<String, usize>,
    variants: BTreeMap<String, Vec<String>>,
}

impl CardinalitySummary {
    pub fn max_section_repeats(&self, form: &str, section: &str) -> usize {
        self.section_repeats
            .get(&(form.to_string(), section.to_string()))
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    pub fn max_value_repeats(&self, form: &str, section: &str, element: &str) -> usize {
        self.value_repeats
            .get(&(form.to_string(), section.to_string(), element.to_string()))
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    pub fn max_form_group_instances(&self, group: &str) -> usize {
        self.form_group_instances
            .get(group)
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    pub fn max_related_instances(&self, model: &str) -> usize {
        self.related_instances
            .get(model)
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    /// Sorted pivot values of a pivoted model; empty when none were found.
    pub fn variants(&self, model: &str) -> &[String] {
        self.variants.get(model).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Incremental aggregation over clinical records.
///
/// Only selected fields are tracked, and per-patient instance counts live only
/// for the duration of one batch.
pub struct CardinalityAccumulator<'a> {
    selection: &'a FieldSelection,
    section_repeats: BTreeMap<(String, String), usize>,
    value_repeats: BTreeMap<(String, String, String), usize>,
    form_group_instances: BTreeMap<String, usize>,
    related_instances: BTreeMap<String, usize>,
    variants: BTreeMap<String, BTreeSet<String>>,
    records_seen: usize,
}

impl<'a> CardinalityAccumulator<'a> {
    pub fn new(selection: &'a FieldSelection) -> Self {
        Self {
            selection,
            section_repeats: BTreeMap::new(),
            value_repeats: BTreeMap::new(),
            form_group_instances: BTreeMap::new(),
            related_instances: BTreeMap::new(),
            variants: BTreeMap::new(),
            records_seen: 0,
        }
    }

    /// Fold a batch of records into the running maxima.
    ///
    /// A batch must hold every record of the patients it covers, in creation
    /// order per patient, since form-group instances are counted per patient
    /// within the batch. Only the first record of a fixed form group counts,
    /// matching the single instance the fetch interface returns for it.
    pub fn observe_batch(&mut self, records: &[ClinicalRecord]) {
        let mut per_patient: HashMap<(&str, &str), usize> = HashMap::new();
        for record in records {
            let instances = per_patient
                .entry((record.form_group.as_str(), record.patient_id.as_str()))
                .or_insert(0);
            if *instances > 0 && !self.selection.is_repeating_group(&record.form_group) {
                debug!(
                    "Ignoring extra record of fixed form group {} for patient {}",
                    record.form_group, record.patient_id
                );
                continue;
            }
            *instances += 1;
            self.observe(record);
        }
        for ((group, _), count) in per_patient {
            let current = self
                .form_group_instances
                .entry(group.to_string())
                .or_insert(0);
            *current = (*current).max(count);
        }
    }

    fn observe(&mut self, record: &ClinicalRecord) {
        self.records_seen += 1;
        let selection = self.selection;
        for selected in selection.clinical() {
            if !selected.form_groups.contains(&record.form_group) {
                continue;
            }
            let Some(section) = record
                .form(&selected.form)
                .and_then(|form| form.section(&selected.section))
            else {
                continue;
            };

            let repeats = self
                .section_repeats
                .entry((selected.form.clone(), selected.section.clone()))
                .or_insert(0);
            *repeats = (*repeats).max(section.entries.len());

            let most_values = section
                .entries
                .entries()
                .iter()
                .filter_map(|entry| entry.get(&selected.element))
                .map(|value| values_of(value).len())
                .max()
                .unwrap_or(0);
            let values = self
                .value_repeats
                .entry((
                    selected.form.clone(),
                    selected.section.clone(),
                    selected.element.clone(),
                ))
                .or_insert(0);
            *values = (*values).max(most_values);
        }
    }

    /// Record the maximum related records of a demographic model seen in a batch.
    pub fn observe_related(&mut self, model: &str, count: usize) {
        let current = self.related_instances.entry(model.to_string()).or_insert(0);
        *current = (*current).max(count);
    }

    /// Record pivot values of a pivoted model seen in a batch.
    pub fn observe_variants(&mut self, model: &str, values: impl IntoIterator<Item = String>) {
        self.variants
            .entry(model.to_string())
            .or_default()
            .extend(values);
    }

    pub fn records_seen(&self) -> usize {
        self.records_seen
    }

    pub fn finish(self) -> CardinalitySummary {
        CardinalitySummary {
            section_repeats: self.section_repeats,
            value_repeats: self.value_repeats,
            form_group_instances: self.form_group_instances,
            related_instances: self.related_instances,
            variants: self
                .variants
                .into_iter()
                .map(|(model, values)| (model, values.into_iter().collect()))
                .collect(),
        }
    }
}

/// Scan the population once and compute its cardinality summary.
///
/// Records are requested in batches of `batch_size` patients; related-record
/// maxima and pivot values are asked of the store per batch.
pub async fn summarize_population(
    store: &dyn RegistryStore,
    selection: &FieldSelection,
    population: &[PatientId],
    batch_size: usize,
) -> Result<CardinalitySummary, ReportError> {
    let mut accumulator = CardinalityAccumulator::new(selection);
    let related_models = selection.related_list_models();
    let pivot_models = selection.pivot_models();

    for batch in population.chunks(batch_size.max(1)) {
        let records = store.clinical_records(batch).await?;
        debug!(
            "Summarizing {} records for {} patients",
            records.len(),
            batch.len()
        );
        accumulator.observe_batch(&records);
        for model in &related_models {
            let count = store.max_related_instances(model, batch).await?;
            accumulator.observe_related(model, count);
        }
        for (model, pivot) in &pivot_models {
            let values = store.demographic_variants(model, pivot, batch).await?;
            accumulator.observe_variants(model, values);
        }
    }

    info!(
        "Cardinality summary computed over {} patients ({} records)",
        population.len(),
        accumulator.records_seen()
    );
    Ok(accumulator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::test_support::{consent_design, sleep_design, sleep_metadata, sleep_snapshot};
    use std::sync::Arc;

    fn sleep_selection() -> FieldSelection {
        FieldSelection::resolve(&sleep_design(), &sleep_metadata()).unwrap()
    }

    #[test]
    fn test_defaults_are_one() {
        let summary = CardinalitySummary::default();
        assert_eq!(summary.max_section_repeats("Sleep", "SleepDiary"), 1);
        assert_eq!(summary.max_value_repeats("Sleep", "SleepDiary", "TimesAwoke"), 1);
        assert_eq!(summary.max_form_group_instances("followup"), 1);
        assert_eq!(summary.max_related_instances("patientaddressSet"), 1);
        assert!(summary.variants("patientconsentSet").is_empty());
    }

    #[test]
    fn test_accumulator_takes_maxima() {
        let selection = sleep_selection();
        let snapshot = sleep_snapshot();
        let mut accumulator = CardinalityAccumulator::new(&selection);
        accumulator.observe_batch(&snapshot.clinical_records);
        let summary = accumulator.finish();

        assert_eq!(summary.max_section_repeats("Sleep", "SleepDiary"), 2);
        assert_eq!(summary.max_value_repeats("Sleep", "SleepDiary", "TimeToBed"), 1);
        assert_eq!(summary.max_value_repeats("Sleep", "SleepDiary", "TimesAwoke"), 4);
        assert_eq!(summary.max_form_group_instances("followup"), 2);
        assert_eq!(summary.max_form_group_instances("baseline"), 1);
    }

    #[test]
    fn test_empty_population_defaults() {
        let selection = sleep_selection();
        let summary = CardinalityAccumulator::new(&selection).finish();
        assert_eq!(summary.max_section_repeats("Sleep", "SleepDiary"), 1);
        assert_eq!(summary.max_value_repeats("Visit", "VisitDetails", "Weight"), 1);
    }

    #[test]
    fn test_extra_fixed_group_records_are_ignored() {
        let selection = sleep_selection();
        let mut snapshot = sleep_snapshot();
        let mut later = snapshot.clinical_records[1].clone();
        let diary: crate::records::SectionEntries = serde_json::from_value(serde_json::json!([
            {"TimeToBed": "20:00"},
            {"TimeToBed": "21:00"},
            {"TimeToBed": "22:00", "TimesAwoke": [1, 2, 3, 4, 5, 6]}
        ]))
        .unwrap();
        later.forms[0].sections[0].entries = diary;
        let records = vec![snapshot.clinical_records.remove(1), later];

        let mut accumulator = CardinalityAccumulator::new(&selection);
        accumulator.observe_batch(&records);
        assert_eq!(accumulator.records_seen(), 1);
        let summary = accumulator.finish();
        assert_eq!(summary.max_section_repeats("Sleep", "SleepDiary"), 1);
        assert_eq!(summary.max_value_repeats("Sleep", "SleepDiary", "TimesAwoke"), 4);
        assert_eq!(summary.max_form_group_instances("baseline"), 1);
    }

    #[tokio::test]
    async fn test_summarize_population_in_batches() {
        let metadata = Arc::new(sleep_metadata());
        let store = InMemoryStore::new(metadata.clone(), sleep_snapshot());
        let selection = FieldSelection::resolve(&sleep_design(), &metadata).unwrap();
        let population = vec!["1".to_string(), "2".to_string(), "3".to_string()];

        let summary = summarize_population(&store, &selection, &population, 1)
            .await
            .unwrap();
        assert_eq!(summary.max_section_repeats("Sleep", "SleepDiary"), 2);
        assert_eq!(summary.max_value_repeats("Sleep", "SleepDiary", "TimesAwoke"), 4);
        assert_eq!(summary.max_form_group_instances("followup"), 2);
        assert_eq!(summary.max_related_instances("patientaddressSet"), 2);
    }

    #[tokio::test]
    async fn test_pivot_values_are_merged_across_batches() {
        let metadata = Arc::new(sleep_metadata());
        let store = InMemoryStore::new(metadata.clone(), sleep_snapshot());
        let selection = FieldSelection::resolve(&consent_design(), &metadata).unwrap();
        let population = vec!["2".to_string(), "1".to_string(), "3".to_string()];

        let summary = summarize_population(&store, &selection, &population, 1)
            .await
            .unwrap();
        assert_eq!(summary.variants("patientconsentSet"), ["c1", "c3"]);
    }

    #[tokio::test]
    async fn test_summary_restricted_to_population() {
        let metadata = Arc::new(sleep_metadata());
        let store = InMemoryStore::new(metadata.clone(), sleep_snapshot());
        let selection = FieldSelection::resolve(&sleep_design(), &metadata).unwrap();

        let summary = summarize_population(&store, &selection, &["2".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(summary.max_section_repeats("Sleep", "SleepDiary"), 1);
        assert_eq!(summary.max_form_group_instances("followup"), 1);
        assert_eq!(summary.max_related_instances("patientaddressSet"), 1);
    }
}
