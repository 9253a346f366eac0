//! Patient payload wire models and translation helpers.
//!
//! This module provides both domain-level types and wire models for the patient snapshot that a
//! caller submits for evaluation.
//!
//! Responsibilities:
//! - Define public domain-level types with explicit optional fields
//! - Define a strict wire model for JSON and YAML payloads
//! - Translate wire payloads into domain types, reporting every structural problem with its
//!   field path (for example `labs[1].loinc`)
//!
//! Notes:
//! - Codes may be supplied bare (`E11.9`) or as CURIEs (`MONDO:0005148`); the coding system is
//!   implied by the field they appear in
//! - Clinical plausibility (age range, positive weights) is checked by the engine, not here

use crate::{from_json, from_yaml, Issues, WireError, WireResult};
use cds_types::{CodingSystem, NonEmptyText, SourceCode};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const DOCUMENT: &str = "patient record";

// ============================================================================
// Public domain-level types
// ============================================================================

/// Administrative sex as recorded on the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
    Other,
    Unknown,
}

impl Sex {
    pub fn as_str(self) -> &'static str {
        match self {
            Sex::Female => "female",
            Sex::Male => "male",
            Sex::Other => "other",
            Sex::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f" | "female" => Ok(Sex::Female),
            "m" | "male" => Ok(Sex::Male),
            "o" | "other" => Ok(Sex::Other),
            "u" | "unknown" => Ok(Sex::Unknown),
            other => Err(format!("unrecognised sex '{other}' (expected M, F, O or U)")),
        }
    }
}

/// Recurring screening examinations tracked on the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScreeningKind {
    EyeExam,
    FootExam,
    DentalExam,
}

impl ScreeningKind {
    pub const ALL: [ScreeningKind; 3] = [
        ScreeningKind::EyeExam,
        ScreeningKind::FootExam,
        ScreeningKind::DentalExam,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScreeningKind::EyeExam => "eye_exam",
            ScreeningKind::FootExam => "foot_exam",
            ScreeningKind::DentalExam => "dental_exam",
        }
    }
}

impl fmt::Display for ScreeningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScreeningKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScreeningKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unknown screening kind '{}'", s.trim()))
    }
}

/// Demographic attributes used for applicability checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Demographics {
    /// Age in whole years.
    pub age: u32,
    pub sex: Sex,
    pub pregnant: bool,
    pub breastfeeding: bool,
}

/// A recorded diagnosis. At least one of `icd10` and `mondo` is present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnosis {
    pub name: String,
    pub icd10: Option<SourceCode>,
    pub mondo: Option<SourceCode>,
    pub onset_date: Option<NaiveDate>,
}

impl Diagnosis {
    /// Codes recorded for this diagnosis, ICD-10 first.
    pub fn codes(&self) -> impl Iterator<Item = &SourceCode> {
        self.icd10.iter().chain(self.mondo.iter())
    }
}

/// A single laboratory observation.
#[derive(Clone, Debug, PartialEq)]
pub struct LabResult {
    /// LOINC code of the observation.
    pub code: SourceCode,
    pub value: f64,
    pub unit: String,
    pub date: NaiveDate,
    pub source: String,
}

/// A medication exposure, open-ended when `end_date` is `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Medication {
    /// RxNorm code of the medication.
    pub code: SourceCode,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    /// Therapy was tried and judged to have failed.
    pub failed: bool,
    /// Recorded as contraindicated for this patient.
    pub contraindicated: bool,
}

/// Most recent vital signs. Every measurement is optional.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VitalSigns {
    pub systolic: Option<f64>,
    pub diastolic: Option<f64>,
    pub weight_kg: Option<f64>,
    pub height_cm: Option<f64>,
    pub date: Option<NaiveDate>,
}

/// Immutable patient snapshot submitted for a single evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct PatientRecord {
    pub patient_id: NonEmptyText,
    pub mrn: Option<String>,
    pub demographics: Demographics,
    pub diagnoses: Vec<Diagnosis>,
    pub labs: Vec<LabResult>,
    pub medications: Vec<Medication>,
    pub vital_signs: Option<VitalSigns>,
    /// Lower-cased payer name (e.g. `medicare`).
    pub payer: Option<String>,
    /// Date each screening was last performed.
    pub screenings: BTreeMap<ScreeningKind, NaiveDate>,
}

// ============================================================================
// Public PatientPayload operations
// ============================================================================

/// Patient payload operations.
///
/// This is a zero-sized type used for namespacing payload parsing. All methods are associated
/// functions.
pub struct PatientPayload;

impl PatientPayload {
    /// Parse a patient payload from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Schema`] when the JSON does not match the wire schema (missing
    /// required lists, wrong types, unknown keys) and [`WireError::InvalidFields`] listing every
    /// code, identifier or enumerated value that cannot be translated.
    pub fn parse_json(json_text: &str) -> WireResult<PatientRecord> {
        let wire: PatientWire = from_json(DOCUMENT, json_text)?;
        wire_to_domain(wire)
    }

    /// Parse a patient payload from YAML text. Same rules as [`PatientPayload::parse_json`].
    pub fn parse_yaml(yaml_text: &str) -> WireResult<PatientRecord> {
        let wire: PatientWire = from_yaml(DOCUMENT, yaml_text)?;
        wire_to_domain(wire)
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatientWire {
    patient_id: String,
    #[serde(default)]
    mrn: Option<String>,
    age: i64,
    sex: String,
    diagnoses: Vec<DiagnosisWire>,
    labs: Vec<LabWire>,
    medications: Vec<MedicationWire>,
    #[serde(default)]
    vital_signs: Option<VitalSignsWire>,
    #[serde(default)]
    pregnant: Option<bool>,
    #[serde(default)]
    breastfeeding: Option<bool>,
    #[serde(default)]
    payer: Option<String>,
    #[serde(default)]
    last_eye_exam: Option<NaiveDate>,
    #[serde(default)]
    last_foot_exam: Option<NaiveDate>,
    #[serde(default)]
    last_dental_exam: Option<NaiveDate>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiagnosisWire {
    #[serde(default)]
    icd10: Option<String>,
    #[serde(default)]
    mondo: Option<String>,
    name: String,
    #[serde(default)]
    onset_date: Option<NaiveDate>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LabWire {
    loinc: String,
    value: f64,
    unit: String,
    date: NaiveDate,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MedicationWire {
    rxnorm_code: String,
    name: String,
    start_date: NaiveDate,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default)]
    failed: bool,
    #[serde(default)]
    contraindicated: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VitalSignsWire {
    #[serde(default)]
    systolic: Option<f64>,
    #[serde(default)]
    diastolic: Option<f64>,
    #[serde(default)]
    weight_kg: Option<f64>,
    #[serde(default)]
    height_cm: Option<f64>,
    #[serde(default)]
    date: Option<NaiveDate>,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

/// Treats blank optional strings as absent.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn translate_diagnosis(
    index: usize,
    wire: DiagnosisWire,
    issues: &mut Issues,
) -> Option<Diagnosis> {
    let base = format!("diagnoses[{index}]");
    let icd10 = non_blank(wire.icd10).and_then(|raw| {
        issues.check(
            format!("{base}.icd10"),
            SourceCode::new(CodingSystem::Icd10, &raw),
        )
    });
    let mondo = non_blank(wire.mondo).and_then(|raw| {
        issues.check(
            format!("{base}.mondo"),
            SourceCode::new(CodingSystem::Mondo, &raw),
        )
    });

    if icd10.is_none() && mondo.is_none() {
        issues.push(base, "diagnosis requires an icd10 or mondo code");
        return None;
    }

    Some(Diagnosis {
        name: wire.name.trim().to_string(),
        icd10,
        mondo,
        onset_date: wire.onset_date,
    })
}

fn translate_lab(index: usize, wire: LabWire, issues: &mut Issues) -> Option<LabResult> {
    let base = format!("labs[{index}]");
    let code = issues.check(
        format!("{base}.loinc"),
        SourceCode::new(CodingSystem::Loinc, &wire.loinc),
    );
    if !wire.value.is_finite() {
        issues.push(format!("{base}.value"), "value must be a finite number");
    }
    let unit = wire.unit.trim().to_string();
    if unit.is_empty() {
        issues.push(format!("{base}.unit"), "unit cannot be empty");
    }

    Some(LabResult {
        code: code?,
        value: wire.value,
        unit,
        date: wire.date,
        source: non_blank(wire.source).unwrap_or_else(|| "EHR".to_string()),
    })
}

fn translate_medication(
    index: usize,
    wire: MedicationWire,
    issues: &mut Issues,
) -> Option<Medication> {
    let base = format!("medications[{index}]");
    let code = issues.check(
        format!("{base}.rxnorm_code"),
        SourceCode::new(CodingSystem::RxNorm, &wire.rxnorm_code),
    );
    if let Some(end) = wire.end_date {
        if end < wire.start_date {
            issues.push(
                format!("{base}.end_date"),
                "end_date cannot precede start_date",
            );
        }
    }

    Some(Medication {
        code: code?,
        name: wire.name.trim().to_string(),
        start_date: wire.start_date,
        end_date: wire.end_date,
        failed: wire.failed,
        contraindicated: wire.contraindicated,
    })
}

fn translate_vitals(wire: VitalSignsWire, issues: &mut Issues) -> VitalSigns {
    let fields = [
        ("systolic", wire.systolic),
        ("diastolic", wire.diastolic),
        ("weight_kg", wire.weight_kg),
        ("height_cm", wire.height_cm),
    ];
    for (name, value) in fields {
        if value.is_some_and(|v| !v.is_finite()) {
            issues.push(
                format!("vital_signs.{name}"),
                "value must be a finite number",
            );
        }
    }

    VitalSigns {
        systolic: wire.systolic,
        diastolic: wire.diastolic,
        weight_kg: wire.weight_kg,
        height_cm: wire.height_cm,
        date: wire.date,
    }
}

/// Convert a wire payload to the domain record, collecting every issue before failing.
fn wire_to_domain(wire: PatientWire) -> WireResult<PatientRecord> {
    let mut issues = Issues::default();

    let patient_id = issues.check("patient_id", NonEmptyText::new(&wire.patient_id));
    let age = issues.check(
        "age",
        u32::try_from(wire.age).map_err(|_| format!("age {} is not a valid age", wire.age)),
    );
    let sex = issues.check("sex", wire.sex.parse::<Sex>());

    let diagnoses: Vec<Diagnosis> = wire
        .diagnoses
        .into_iter()
        .enumerate()
        .filter_map(|(i, d)| translate_diagnosis(i, d, &mut issues))
        .collect();
    let labs: Vec<LabResult> = wire
        .labs
        .into_iter()
        .enumerate()
        .filter_map(|(i, l)| translate_lab(i, l, &mut issues))
        .collect();
    let medications: Vec<Medication> = wire
        .medications
        .into_iter()
        .enumerate()
        .filter_map(|(i, m)| translate_medication(i, m, &mut issues))
        .collect();
    let vital_signs = wire.vital_signs.map(|v| translate_vitals(v, &mut issues));

    let screenings: BTreeMap<ScreeningKind, NaiveDate> = [
        (ScreeningKind::EyeExam, wire.last_eye_exam),
        (ScreeningKind::FootExam, wire.last_foot_exam),
        (ScreeningKind::DentalExam, wire.last_dental_exam),
    ]
    .into_iter()
    .filter_map(|(kind, date)| date.map(|d| (kind, d)))
    .collect();

    issues.finish(DOCUMENT)?;

    let (Some(patient_id), Some(age), Some(sex)) = (patient_id, age, sex) else {
        return Err(WireError::InvalidInput(
            "patient payload could not be translated".into(),
        ));
    };

    Ok(PatientRecord {
        patient_id,
        mrn: non_blank(wire.mrn),
        demographics: Demographics {
            age,
            sex,
            pregnant: wire.pregnant.unwrap_or(false),
            breastfeeding: wire.breastfeeding.unwrap_or(false),
        },
        diagnoses,
        labs,
        medications,
        vital_signs,
        payer: non_blank(wire.payer).map(|p| p.to_ascii_lowercase()),
        screenings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_JSON: &str = r#"{
        "patient_id": "T001",
        "age": 58,
        "sex": "f",
        "diagnoses": [
            {"icd10": "E11.9", "mondo": "MONDO:0005148", "name": "Type 2 Diabetes"}
        ],
        "labs": [
            {"loinc": "LOINC:4548-4", "value": 9.6, "unit": "%", "date": "2023-12-01"}
        ],
        "medications": [
            {"rxnorm_code": "rxnorm:6809", "name": "Metformin", "start_date": "2023-01-01"}
        ],
        "vital_signs": {"weight_kg": 95, "height_cm": 175},
        "pregnant": false,
        "payer": " Medicare ",
        "last_eye_exam": "2023-03-15"
    }"#;

    #[test]
    fn test_parse_json_translates_codes_and_defaults() {
        let record = PatientPayload::parse_json(SAMPLE_JSON).expect("parse should succeed");

        assert_eq!(record.patient_id.as_str(), "T001");
        assert_eq!(record.demographics.age, 58);
        assert_eq!(record.demographics.sex, Sex::Female);
        assert!(!record.demographics.breastfeeding);
        assert_eq!(record.payer.as_deref(), Some("medicare"));

        let diagnosis = &record.diagnoses[0];
        assert_eq!(diagnosis.icd10.as_ref().map(|c| c.code()), Some("E11.9"));
        assert_eq!(diagnosis.mondo.as_ref().map(|c| c.code()), Some("0005148"));
        assert_eq!(diagnosis.codes().count(), 2);

        assert_eq!(record.labs[0].code.to_string(), "LOINC:4548-4");
        assert_eq!(record.labs[0].source, "EHR");
        assert_eq!(record.medications[0].code.code(), "6809");
        assert_eq!(
            record.screenings.get(&ScreeningKind::EyeExam),
            NaiveDate::from_ymd_opt(2023, 3, 15).as_ref()
        );
        assert!(!record.screenings.contains_key(&ScreeningKind::FootExam));
    }

    #[test]
    fn test_parse_yaml_accepts_same_shape() {
        let yaml = r#"
patient_id: T002
age: 40
sex: M
diagnoses: []
labs: []
medications: []
"#;
        let record = PatientPayload::parse_yaml(yaml).expect("parse should succeed");
        assert_eq!(record.demographics.sex, Sex::Male);
        assert!(record.vital_signs.is_none());
        assert!(record.payer.is_none());
    }

    #[test]
    fn test_missing_required_list_reports_schema_error() {
        let json = r#"{"patient_id": "T003", "age": 40, "sex": "M", "diagnoses": [], "labs": []}"#;
        let err = PatientPayload::parse_json(json).expect_err("should reject missing medications");
        assert!(
            matches!(&err, WireError::Schema { message, .. } if message.contains("medications")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_wrong_type_reports_field_path() {
        let json = r#"{"patient_id": "T004", "age": 40, "sex": "M", "diagnoses": [],
            "labs": [{"loinc": "4548-4", "value": "high", "unit": "%", "date": "2024-01-01"}],
            "medications": []}"#;
        let err = PatientPayload::parse_json(json).expect_err("should reject string value");
        let WireError::Schema { path, .. } = err else {
            panic!("expected schema error");
        };
        assert!(path.contains("labs"), "path was {path}");
        assert!(path.contains("value"), "path was {path}");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let json = r#"{"patient_id": "T005", "age": 40, "sex": "M", "diagnoses": [],
            "labs": [], "medications": [], "favourite_colour": "blue"}"#;
        assert!(matches!(
            PatientPayload::parse_json(json),
            Err(WireError::Schema { .. })
        ));
    }

    #[test]
    fn test_translation_collects_every_issue() {
        let json = r#"{
            "patient_id": "  ",
            "age": -3,
            "sex": "x",
            "diagnoses": [{"name": "Unknown"}],
            "labs": [{"loinc": "LOINC:", "value": 1.0, "unit": " ", "date": "2024-01-01"}],
            "medications": [{"rxnorm_code": "6809", "name": "Metformin",
                             "start_date": "2024-02-01", "end_date": "2024-01-01"}]
        }"#;
        let err = PatientPayload::parse_json(json).expect_err("should reject invalid fields");
        let paths: Vec<String> = err.issues().into_iter().map(|i| i.path).collect();

        for expected in [
            "patient_id",
            "age",
            "sex",
            "diagnoses[0]",
            "labs[0].loinc",
            "labs[0].unit",
            "medications[0].end_date",
        ] {
            assert!(
                paths.iter().any(|p| p == expected),
                "missing issue for {expected}: {paths:?}"
            );
        }
    }

    #[test]
    fn test_mismatched_code_prefix_is_an_issue() {
        let json = r#"{"patient_id": "T006", "age": 40, "sex": "M",
            "diagnoses": [{"icd10": "MONDO:0005148", "name": "T2DM"}],
            "labs": [], "medications": []}"#;
        let err = PatientPayload::parse_json(json).expect_err("should reject prefix mismatch");
        let paths: Vec<String> = err.issues().into_iter().map(|i| i.path).collect();
        assert!(paths.contains(&"diagnoses[0].icd10".to_string()));
    }
}
