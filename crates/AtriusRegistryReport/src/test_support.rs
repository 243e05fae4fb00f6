//! Shared fixtures for unit tests: a small sleep-study registry.

use crate::design::ReportDesign;
use crate::metadata::RegistryMetadata;
use crate::store::RegistrySnapshot;
use serde_json::{Value, json};

pub fn sleep_metadata_json() -> Value {
    json!({
        "registry": "sleep",
        "formGroups": [
            {"code": "baseline", "name": "Baseline", "abbreviatedName": "BL", "policy": "FIXED", "forms": ["Sleep"]},
            {"code": "followup", "name": "Follow Up", "abbreviatedName": "FU", "policy": "REPEATING", "forms": ["Visit", "Sleep"]}
        ],
        "forms": [
            {"code": "Sleep", "name": "Sleep", "abbreviatedName": "SLP", "sections": ["SleepDiary", "SleepHistory"]},
            {"code": "Visit", "name": "Visit", "sections": ["VisitDetails"]}
        ],
        "sections": [
            {"code": "SleepDiary", "name": "Sleep Diary", "abbreviatedName": "SD", "repeats": true, "elements": ["TimeToBed", "TimesAwoke"]},
            {"code": "SleepHistory", "name": "Sleep History", "elements": ["Snoring"]},
            {"code": "VisitDetails", "name": "Visit Details", "elements": ["VisitDate", "Weight"]}
        ],
        "dataElements": [
            {"code": "TimeToBed", "name": "Time to bed", "abbreviatedName": "TTB"},
            {"code": "TimesAwoke", "name": "Times awoke", "abbreviatedName": "TA", "multiValue": true},
            {"code": "Snoring", "name": "Snoring"},
            {"code": "VisitDate", "name": "Visit date"},
            {"code": "Weight", "name": "Weight"}
        ],
        "demographicModels": {
            "patient": {
                "label": "Patient",
                "fields": {
                    "familyName": "Family Name",
                    "givenNames": "Given Names",
                    "sex": "Sex",
                    "nextOfKinRelationship { relationship }": "Next Of Kin Relationship"
                }
            },
            "patientaddressSet": {
                "label": "Patient Address",
                "multiField": true,
                "fields": {
                    "address": "Address",
                    "suburb": "Suburb",
                    "addressType { type }": "Address Type"
                }
            },
            "patientconsentSet": {
                "label": "Consent",
                "pivotField": "consentQuestion { code }",
                "fields": {
                    "answer": "Answer",
                    "firstSaveDate": "First Saved"
                }
            }
        }
    })
}

pub fn sleep_metadata() -> RegistryMetadata {
    serde_json::from_value(sleep_metadata_json()).unwrap()
}

pub fn sleep_snapshot() -> RegistrySnapshot {
    serde_json::from_value(json!({
        "registry": "sleep",
        "patients": [
            {
                "id": "1",
                "workingGroups": ["south"],
                "consents": {"c1": true},
                "demographics": {
                    "familyName": "Smith",
                    "givenNames": "Ann",
                    "sex": "F",
                    "nextOfKinRelationship": {"relationship": "Parent"},
                    "patientaddressSet": [
                        {"address": "1 Road", "suburb": "Here", "addressType": {"type": "Home"}},
                        {"address": "2 Street", "suburb": "There", "addressType": {"type": "Postal"}}
                    ],
                    "patientconsentSet": [
                        {"consentQuestion": {"code": "c1"}, "answer": true, "firstSaveDate": "2024-01-01"},
                        {"consentQuestion": {"code": "c3"}, "answer": false}
                    ]
                }
            },
            {
                "id": "2",
                "workingGroups": ["south", "north"],
                "consents": {"c1": true},
                "demographics": {
                    "familyName": "Jones",
                    "patientaddressSet": [
                        {"address": "3 Lane", "suburb": "Far", "addressType": {"type": "Home"}}
                    ],
                    "patientconsentSet": {"consentQuestion": {"code": "c3"}, "answer": true}
                }
            },
            {
                "id": "3",
                "workingGroups": ["north"],
                "consents": {"c1": false},
                "demographics": {"familyName": "Brown"}
            }
        ],
        "clinicalRecords": [
            {
                "patientId": "1",
                "formGroup": "baseline",
                "createdAt": "2024-01-01T09:00:00Z",
                "forms": [{
                    "name": "Sleep",
                    "sections": [
                        {"code": "SleepDiary", "entries": [
                            {"TimeToBed": "22:00", "TimesAwoke": [1, 2]},
                            {"TimeToBed": "23:00", "TimesAwoke": 3}
                        ]},
                        {"code": "SleepHistory", "entries": {"Snoring": "Yes"}}
                    ]
                }]
            },
            {
                "patientId": "2",
                "formGroup": "baseline",
                "createdAt": "2024-01-02T09:00:00Z",
                "forms": [{
                    "name": "Sleep",
                    "sections": [
                        {"code": "SleepDiary", "entries": [
                            {"TimeToBed": "21:30", "TimesAwoke": [1, 1, 2, 5]}
                        ]}
                    ]
                }]
            },
            {
                "patientId": "1",
                "formGroup": "followup",
                "key": "Visit 2",
                "createdAt": "2024-02-01T09:00:00Z",
                "lastUpdated": "2024-02-03T10:00:00Z",
                "forms": [{
                    "name": "Visit",
                    "sections": [{"code": "VisitDetails", "entries": {"VisitDate": "2024-02-01", "Weight": 71}}]
                }]
            },
            {
                "patientId": "1",
                "formGroup": "followup",
                "key": "Visit 1",
                "createdAt": "2024-01-15T09:00:00Z",
                "forms": [{
                    "name": "Visit",
                    "sections": [{"code": "VisitDetails", "entries": {"VisitDate": "2024-01-15", "Weight": 70}}]
                }]
            },
            {
                "patientId": "2",
                "formGroup": "followup",
                "key": "Visit 1",
                "createdAt": "2024-03-01T09:00:00Z",
                "forms": [{
                    "name": "Visit",
                    "sections": [{"code": "VisitDetails", "entries": {"VisitDate": "2024-03-01", "Weight": 80}}]
                }]
            }
        ]
    }))
    .unwrap()
}

/// Design reporting consent answers, one column group per consent question.
pub fn consent_design() -> ReportDesign {
    serde_json::from_value(json!({
        "registry": "sleep",
        "demographicFields": [
            {"model": "patient", "field": "familyName"},
            {"model": "patientconsentSet", "field": "answer"}
        ]
    }))
    .unwrap()
}

/// Design covering the diary scenario, a repeating form group and addresses.
pub fn sleep_design() -> ReportDesign {
    serde_json::from_value(json!({
        "registry": "sleep",
        "headingFormat": "LABEL",
        "demographicFields": [
            {"model": "patient", "field": "familyName"},
            {"model": "patientaddressSet", "field": "suburb"}
        ],
        "clinicalFields": [
            {"key": "Sleep____SleepDiary____TimeToBed", "formGroup": "baseline"},
            {"key": "Sleep____SleepDiary____TimesAwoke", "formGroup": "baseline"},
            "Visit____VisitDetails____Weight"
        ]
    }))
    .unwrap()
}
