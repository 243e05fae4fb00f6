//! # Row Flattening
//!
//! Converts one patient's nested result tree into a row aligned with the
//! header. Every leaf gets its key from the same builders the header uses, so a
//! value lands in its column by key lookup. Values the header has no column
//! for are dropped with a warning and counted on the row.

use crate::PatientId;
use crate::design::FieldPath;
use crate::header::{
    DemographicLocator, Header, form_data_root, form_instance_key, indexed_key,
    instance_name_key, timestamp_key,
};
use crate::records::{PatientRecord, entry_value_count, related_records, values_of, variant_name};
use crate::selection::DemographicKind;
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// One output row.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow {
    pub patient_id: PatientId,
    /// One cell per header column; `None` is an empty cell.
    pub values: Vec<Option<Value>>,
    /// Cells left empty because their value could not be encoded.
    pub null_filled: usize,
    /// Source values that had no column to land in.
    pub dropped_values: usize,
}

impl FlatRow {
    pub fn get(&self, header: &Header, key: &str) -> Option<&Value> {
        header
            .position(key)
            .and_then(|position| self.values.get(position))
            .and_then(Option::as_ref)
    }

    /// The row as a JSON object keyed by column key, in header order.
    pub fn to_json_object(&self, header: &Header) -> Map<String, Value> {
        header
            .keys()
            .zip(&self.values)
            .map(|(key, value)| (key.to_string(), value.clone().unwrap_or(Value::Null)))
            .collect()
    }
}

/// Flattens result trees against a fixed header.
pub struct Flattener<'h> {
    header: &'h Header,
}

impl<'h> Flattener<'h> {
    pub fn new(header: &'h Header) -> Self {
        Self { header }
    }

    pub fn flatten(&self, record: &PatientRecord) -> FlatRow {
        let mut row = FlatRow {
            patient_id: record.id.clone(),
            values: vec![None; self.header.len()],
            null_filled: 0,
            dropped_values: 0,
        };
        self.flatten_demographics(record, &mut row);
        self.flatten_clinical(record, &mut row);
        row
    }

    fn flatten_demographics(&self, record: &PatientRecord, row: &mut FlatRow) {
        for (position, locator) in self.header.demographic_locators() {
            if let Some((pivot, variant)) = &locator.variant {
                let matching = pivoted_records(&record.demographics, &locator.model, pivot, variant);
                let mut values = matching.iter().map(|item| locator.path.resolve(item));
                if let Some(value) = values.next().flatten() {
                    self.fill(row, *position, value);
                }
                let extra = values.flatten().filter(|value| !value.is_null()).count();
                if extra > 0 {
                    warn!(
                        "Patient {} has {} more '{}' record(s) of {}, value(s) dropped",
                        record.id, extra, variant, locator.model
                    );
                    row.dropped_values += extra;
                }
                continue;
            }
            if let Some(value) = locate_demographic(&record.demographics, locator) {
                self.fill(row, *position, value);
            }
        }
        self.count_unknown_variants(record, row);
    }

    /// Count values of pivoted records whose pivot value has no column group.
    fn count_unknown_variants(&self, record: &PatientRecord, row: &mut FlatRow) {
        let mut models: BTreeMap<&str, (&FieldPath, HashSet<&str>, Vec<&FieldPath>)> =
            BTreeMap::new();
        for (_, locator) in self.header.demographic_locators() {
            let Some((pivot, variant)) = &locator.variant else {
                continue;
            };
            let (_, variants, paths) = models
                .entry(locator.model.as_str())
                .or_insert_with(|| (pivot, HashSet::new(), Vec::new()));
            variants.insert(variant.as_str());
            if !paths.contains(&&locator.path) {
                paths.push(&locator.path);
            }
        }

        for (model, (pivot, variants, paths)) in models {
            let Some(related) = record.demographics.get(model) else {
                continue;
            };
            for item in related_records(related) {
                let Some(name) = pivot.resolve(item).and_then(variant_name) else {
                    continue;
                };
                if variants.contains(name.as_str()) {
                    continue;
                }
                let dropped = paths
                    .iter()
                    .filter_map(|path| path.resolve(item))
                    .filter(|value| !value.is_null())
                    .count();
                if dropped > 0 {
                    warn!(
                        "No column group for '{}' of {} for patient {}, {} value(s) dropped",
                        name, model, record.id, dropped
                    );
                    row.dropped_values += dropped;
                }
            }
        }
    }

    fn flatten_clinical(&self, record: &PatientRecord, row: &mut FlatRow) {
        let layout = self.header.layout();

        for (group, forms) in &record.clinical {
            let repeating = layout.is_repeating_group(group);
            for (form, instances) in forms {
                for (i, instance) in instances.iter().enumerate() {
                    if !repeating && i > 0 {
                        let dropped = instance.value_count();
                        warn!(
                            "Patient {} has more than one instance of fixed form {} in {}, {} value(s) dropped",
                            record.id, form, group, dropped
                        );
                        row.dropped_values += dropped;
                        continue;
                    }
                    let form_key = form_instance_key(group, form, repeating.then_some(i));
                    if repeating {
                        if let Some(name) = &instance.key {
                            self.place(row, &instance_name_key(&form_key), &Value::String(name.clone()));
                        }
                    }
                    if let Some(updated) = instance.last_updated {
                        let stamp = updated.to_rfc3339_opts(SecondsFormat::Secs, true);
                        self.place(row, &timestamp_key(&form_key), &Value::String(stamp));
                    }

                    let root = form_data_root(&form_key, repeating);
                    for (section, entries) in &instance.sections {
                        let section_repeats = layout.is_repeating_section(section);
                        for (r, entry) in entries.entries().into_iter().enumerate() {
                            if !section_repeats && r > 0 {
                                let dropped = entry_value_count(entry);
                                warn!(
                                    "Section {} of patient {} does not repeat but has entry {}, {} value(s) dropped",
                                    section, record.id, r + 1, dropped
                                );
                                row.dropped_values += dropped;
                                continue;
                            }
                            let section_key =
                                indexed_key(&root, section, section_repeats.then_some(r));
                            for (element, value) in entry {
                                let values = values_of(value);
                                if layout.is_indexed_element(form, section, element) {
                                    for (v, item) in values.into_iter().enumerate() {
                                        self.place(
                                            row,
                                            &indexed_key(&section_key, element, Some(v)),
                                            item,
                                        );
                                    }
                                    continue;
                                }
                                match values.as_slice() {
                                    [] => {}
                                    [single] => self.place(
                                        row,
                                        &indexed_key(&section_key, element, None),
                                        single,
                                    ),
                                    many => {
                                        warn!(
                                            "Single-valued element {} of patient {} holds {} values, leaving it empty",
                                            indexed_key(&section_key, element, None),
                                            record.id,
                                            many.len()
                                        );
                                        row.dropped_values += many.len();
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn place(&self, row: &mut FlatRow, key: &str, value: &Value) {
        match self.header.position(key) {
            Some(position) => self.fill(row, position, value),
            None if value.is_null() => {}
            None => {
                row.dropped_values += 1;
                warn!("No column for '{}' of patient {}, value dropped", key, row.patient_id);
            }
        }
    }

    fn fill(&self, row: &mut FlatRow, position: usize, value: &Value) {
        match value {
            Value::Null => {}
            Value::Array(_) | Value::Object(_) => {
                row.null_filled += 1;
                warn!(
                    "Cannot encode value of column '{}' for patient {}, leaving it empty",
                    self.header.entries()[position].key,
                    row.patient_id
                );
            }
            scalar => row.values[position] = Some(scalar.clone()),
        }
    }
}

fn locate_demographic<'a>(
    demographics: &'a Map<String, Value>,
    locator: &DemographicLocator,
) -> Option<&'a Value> {
    match locator.kind {
        DemographicKind::Patient => resolve_in(demographics, &locator.path),
        DemographicKind::Related => locator.path.resolve(demographics.get(&locator.model)?),
        DemographicKind::Pivot => None,
        DemographicKind::RelatedList => {
            let instance = locator.instance.unwrap_or(0);
            let item = match demographics.get(&locator.model)? {
                Value::Array(items) => items.get(instance)?,
                single @ Value::Object(_) if instance == 0 => single,
                _ => return None,
            };
            locator.path.resolve(item)
        }
    }
}

/// Records of a related model whose pivot field holds `variant`, in stored order.
fn pivoted_records<'a>(
    demographics: &'a Map<String, Value>,
    model: &str,
    pivot: &FieldPath,
    variant: &str,
) -> Vec<&'a Value> {
    demographics
        .get(model)
        .map(related_records)
        .unwrap_or_default()
        .into_iter()
        .filter(|item| {
            pivot
                .resolve(item)
                .and_then(variant_name)
                .is_some_and(|name| name == variant)
        })
        .collect()
}

fn resolve_in<'a>(map: &'a Map<String, Value>, path: &FieldPath) -> Option<&'a Value> {
    let (first, rest) = path.segments().split_first()?;
    rest.iter()
        .try_fold(map.get(first)?, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::ReportDesign;
    use crate::query::FetchRequest;
    use crate::selection::FieldSelection;
    use crate::store::{InMemoryStore, RegistryStore};
    use crate::summary::{CardinalitySummary, summarize_population};
    use crate::test_support::{consent_design, sleep_design, sleep_metadata, sleep_snapshot};
    use serde_json::json;
    use std::sync::Arc;

    async fn sleep_rows(design: ReportDesign) -> (Header, Vec<FlatRow>) {
        let metadata = Arc::new(sleep_metadata());
        let store = InMemoryStore::new(metadata.clone(), sleep_snapshot());
        let selection = FieldSelection::resolve(&design, &metadata).unwrap();
        let population = store
            .population("sleep", selection.filter())
            .await
            .unwrap();
        let summary = summarize_population(&store, &selection, &population, 10)
            .await
            .unwrap();
        let header = Header::generate(&selection, &metadata, &summary).unwrap();
        let request = FetchRequest::compile(&selection, &metadata).unwrap();
        let records = store.fetch(&request, &population, 0, 10).await.unwrap();

        let flattener = Flattener::new(&header);
        let rows = records.iter().map(|r| flattener.flatten(r)).collect();
        (header, rows)
    }

    #[tokio::test]
    async fn test_rows_align_with_header() {
        let (header, rows) = sleep_rows(sleep_design()).await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.values.len() == header.len()));

        let first = &rows[0];
        assert_eq!(first.get(&header, "familyName"), Some(&json!("Smith")));
        assert_eq!(
            first.get(&header, "patientaddressSet.1.suburb"),
            Some(&json!("There"))
        );
        assert_eq!(
            first.get(&header, "clinicalData.baseline.Sleep.SleepDiary.0.TimesAwoke.1"),
            Some(&json!(2))
        );
        assert_eq!(
            first.get(&header, "clinicalData.baseline.Sleep.SleepDiary.0.TimesAwoke.2"),
            None
        );
        assert_eq!(
            first.get(&header, "clinicalData.baseline.Sleep.SleepDiary.1.TimeToBed"),
            Some(&json!("23:00"))
        );
        assert_eq!(
            first.get(&header, "clinicalData.baseline.Sleep.SleepDiary.1.TimesAwoke.0"),
            Some(&json!(3))
        );
        assert_eq!(
            first.get(&header, "clinicalData.followup.Visit.0.key"),
            Some(&json!("Visit 1"))
        );
        assert_eq!(
            first.get(&header, "clinicalData.followup.Visit.1.data.VisitDetails.Weight"),
            Some(&json!(71))
        );
        assert_eq!(first.null_filled, 0);
    }

    #[tokio::test]
    async fn test_pivoted_records_land_under_their_value() {
        let (header, rows) = sleep_rows(consent_design()).await;
        let keys: Vec<&str> = header.keys().collect();
        assert_eq!(
            keys,
            vec!["familyName", "patientconsentSet.0.answer", "patientconsentSet.1.answer"]
        );
        assert_eq!(header.entries()[2].label, "Consent_c3_Answer");

        assert_eq!(rows[0].values[1..], [Some(json!(true)), Some(json!(false))]);
        assert_eq!(rows[1].values[1..], [None, Some(json!(true))]);
        assert_eq!(rows[2].values[1..], [None, None]);
        assert!(rows.iter().all(|r| r.dropped_values == 0));
    }

    #[tokio::test]
    async fn test_repeated_pivot_value_keeps_first_record() {
        let (header, _) = sleep_rows(consent_design()).await;
        let record: PatientRecord = serde_json::from_value(json!({
            "id": "7",
            "demographics": {"patientconsentSet": [
                {"consentQuestion": {"code": "c3"}, "answer": false},
                {"consentQuestion": {"code": "c3"}, "answer": true},
                {"consentQuestion": {"code": "c9"}, "answer": true}
            ]}
        }))
        .unwrap();
        let row = Flattener::new(&header).flatten(&record);
        assert_eq!(row.get(&header, "patientconsentSet.1.answer"), Some(&json!(false)));
        assert_eq!(row.get(&header, "patientconsentSet.0.answer"), None);
        // The second c3 record and the c9 record have no column.
        assert_eq!(row.dropped_values, 2);
    }

    #[tokio::test]
    async fn test_patient_without_data_gets_empty_cells() {
        let (header, rows) = sleep_rows(sleep_design()).await;
        let last = &rows[2];
        assert_eq!(last.patient_id, "3");
        assert_eq!(last.values[0], Some(json!("Brown")));
        assert!(last.values[1..].iter().all(Option::is_none));
        assert_eq!(last.to_json_object(&header).len(), header.len());
    }

    #[tokio::test]
    async fn test_form_timestamps_are_rendered() {
        let mut design = sleep_design();
        design.include_form_timestamp = true;
        let (header, rows) = sleep_rows(design).await;
        assert_eq!(
            rows[0].get(&header, "clinicalData.followup.Visit.1.meta.lastUpdated"),
            Some(&json!("2024-02-03T10:00:00Z"))
        );
        assert_eq!(
            rows[0].get(&header, "clinicalData.followup.Visit.0.meta.lastUpdated"),
            None
        );
    }

    #[tokio::test]
    async fn test_unencodable_value_is_null_filled() {
        let (header, _) = sleep_rows(sleep_design()).await;
        let record: PatientRecord = serde_json::from_value(json!({
            "id": "9",
            "demographics": {"familyName": {"first": "A"}},
            "clinical": {
                "baseline": {"Sleep": [{"sections": {
                    "SleepDiary": [{"TimeToBed": ["22:00", "22:30", "23:00"], "TimesAwoke": [[1]]}]
                }}]}
            }
        }))
        .unwrap();
        let row = Flattener::new(&header).flatten(&record);

        assert_eq!(row.values[0], None);
        assert_eq!(row.null_filled, 2);
        assert_eq!(
            row.get(&header, "clinicalData.baseline.Sleep.SleepDiary.0.TimeToBed"),
            None
        );
        assert_eq!(row.dropped_values, 3);
    }

    #[test]
    fn test_single_item_list_fills_scalar_column() {
        let metadata = sleep_metadata();
        let selection = FieldSelection::resolve(&sleep_design(), &metadata).unwrap();
        let header =
            Header::generate(&selection, &metadata, &CardinalitySummary::default()).unwrap();
        let record: PatientRecord = serde_json::from_value(json!({
            "id": "9",
            "clinical": {"baseline": {"Sleep": [{"sections": {
                "SleepDiary": [{"TimeToBed": ["22:00"]}]
            }}]}}
        }))
        .unwrap();
        let row = Flattener::new(&header).flatten(&record);
        assert_eq!(
            row.get(&header, "clinicalData.baseline.Sleep.SleepDiary.0.TimeToBed"),
            Some(&json!("22:00"))
        );
        assert_eq!(row.dropped_values, 0);
    }

    #[test]
    fn test_extra_fixed_entries_are_counted_as_dropped() {
        let metadata = sleep_metadata();
        let design: ReportDesign = serde_json::from_value(json!({
            "registry": "sleep",
            "clinicalFields": [{"key": "Sleep____SleepHistory____Snoring", "formGroup": "baseline"}]
        }))
        .unwrap();
        let selection = FieldSelection::resolve(&design, &metadata).unwrap();
        let header =
            Header::generate(&selection, &metadata, &CardinalitySummary::default()).unwrap();
        let record: PatientRecord = serde_json::from_value(json!({
            "id": "4",
            "clinical": {"baseline": {"Sleep": [
                {"sections": {"SleepHistory": [{"Snoring": "Yes"}, {"Snoring": "No"}]}},
                {"sections": {"SleepHistory": {"Snoring": "Sometimes"}}}
            ]}}
        }))
        .unwrap();
        let row = Flattener::new(&header).flatten(&record);

        assert_eq!(
            row.get(&header, "clinicalData.baseline.Sleep.SleepHistory.Snoring"),
            Some(&json!("Yes"))
        );
        assert_eq!(row.dropped_values, 2);
        assert_eq!(row.null_filled, 0);
    }

    #[test]
    fn test_values_beyond_header_are_dropped() {
        let header = Header::default();
        let record: PatientRecord = serde_json::from_value(json!({
            "id": "1",
            "clinical": {"baseline": {"Sleep": [{"sections": {"SleepHistory": {"Snoring": "Yes"}}}]}}
        }))
        .unwrap();
        let row = Flattener::new(&header).flatten(&record);
        assert!(row.values.is_empty());
        assert_eq!(row.null_filled, 0);
        assert_eq!(row.dropped_values, 1);
    }
}
