//! Patient record validation.
//!
//! The wire crate guarantees that a [`PatientRecord`] is structurally complete. This module
//! applies the clinical plausibility checks that must pass before any fact is built, and
//! collects the softer data-quality findings that are reported as advisories.

use crate::constants::{MAX_PATIENT_AGE, PREGNANCY_ADVISORY_AGE};
use crate::{CdsError, CdsResult};
use cds_types::FieldIssue;
use cds_wire::{PatientRecord, Sex};
use chrono::NaiveDate;

/// Rejects records whose values cannot describe a real patient.
///
/// Every offending field is reported, not just the first.
///
/// # Errors
///
/// Returns [`CdsError::InvalidRecord`] listing the field paths that failed.
pub fn validate_record(record: &PatientRecord) -> CdsResult<()> {
    let mut issues = Vec::new();

    if record.demographics.age > MAX_PATIENT_AGE {
        issues.push(FieldIssue::new(
            "age",
            format!("age must be at most {MAX_PATIENT_AGE}"),
        ));
    }

    for (i, lab) in record.labs.iter().enumerate() {
        if lab.value < 0.0 {
            issues.push(FieldIssue::new(
                format!("labs[{i}].value"),
                "lab value cannot be negative",
            ));
        }
    }

    if let Some(vitals) = &record.vital_signs {
        let positive = [
            ("systolic", vitals.systolic),
            ("diastolic", vitals.diastolic),
            ("weight_kg", vitals.weight_kg),
            ("height_cm", vitals.height_cm),
        ];
        for (name, value) in positive {
            if value.is_some_and(|v| v <= 0.0) {
                issues.push(FieldIssue::new(
                    format!("vital_signs.{name}"),
                    "value must be greater than zero",
                ));
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(CdsError::InvalidRecord { issues })
    }
}

/// Plausible-but-suspicious values worth flagging to the clinician.
pub fn data_quality_findings(record: &PatientRecord, as_of: NaiveDate) -> Vec<FieldIssue> {
    let mut findings = Vec::new();
    let demographics = &record.demographics;

    if demographics.pregnant && demographics.age > PREGNANCY_ADVISORY_AGE {
        findings.push(FieldIssue::new(
            "pregnant",
            format!(
                "pregnancy recorded for a patient aged {} (over {PREGNANCY_ADVISORY_AGE})",
                demographics.age
            ),
        ));
    }
    if demographics.pregnant && demographics.sex == Sex::Male {
        findings.push(FieldIssue::new(
            "pregnant",
            "pregnancy recorded for a male patient",
        ));
    }

    for (i, lab) in record.labs.iter().enumerate() {
        if lab.date > as_of {
            findings.push(FieldIssue::new(
                format!("labs[{i}].date"),
                format!("result dated {} is after the evaluation date and was ignored", lab.date),
            ));
        }
    }

    for (i, med) in record.medications.iter().enumerate() {
        let active = med.start_date <= as_of && med.end_date.map_or(true, |end| end >= as_of);
        if med.contraindicated && active {
            findings.push(FieldIssue::new(
                format!("medications[{i}]"),
                format!("{} is recorded as contraindicated but is active", med.name),
            ));
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use cds_wire::PatientPayload;

    fn record(json: &str) -> PatientRecord {
        PatientPayload::parse_json(json).expect("parse should succeed")
    }

    #[test]
    fn test_validate_record_accepts_plausible_record() {
        let r = record(
            r#"{"patient_id":"p1","age":58,"sex":"F","diagnoses":[],"labs":[],"medications":[],
                "vital_signs":{"weight_kg":80,"height_cm":165}}"#,
        );
        validate_record(&r).expect("validation should succeed");
    }

    #[test]
    fn test_validate_record_reports_every_issue() {
        let r = record(
            r#"{"patient_id":"p1","age":140,"sex":"F","diagnoses":[],
                "labs":[{"loinc":"4548-4","value":-1,"unit":"%","date":"2023-12-01"}],
                "medications":[],
                "vital_signs":{"weight_kg":0,"height_cm":165}}"#,
        );
        let err = validate_record(&r).expect_err("validation should fail");
        let paths: Vec<String> = err.issues().into_iter().map(|i| i.path).collect();
        assert_eq!(
            paths,
            vec![
                "age".to_string(),
                "labs[0].value".to_string(),
                "vital_signs.weight_kg".to_string(),
            ]
        );
    }

    #[test]
    fn test_data_quality_flags_implausible_pregnancy() {
        let r = record(
            r#"{"patient_id":"p1","age":61,"sex":"M","pregnant":true,
                "diagnoses":[],"labs":[],"medications":[]}"#,
        );
        let as_of = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date should succeed");
        let findings = data_quality_findings(&r, as_of);
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.path == "pregnant"));
    }

    #[test]
    fn test_data_quality_flags_future_labs_and_active_contraindications() {
        let r = record(
            r#"{"patient_id":"p1","age":40,"sex":"F","diagnoses":[],
                "labs":[{"loinc":"4548-4","value":7.1,"unit":"%","date":"2024-02-01"}],
                "medications":[
                  {"rxnorm_code":"6809","name":"Metformin","start_date":"2023-01-01","contraindicated":true},
                  {"rxnorm_code":"6809","name":"Metformin","start_date":"2022-01-01","end_date":"2022-06-01","contraindicated":true}
                ]}"#,
        );
        let as_of = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date should succeed");
        let paths: Vec<String> = data_quality_findings(&r, as_of)
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(
            paths,
            vec!["labs[0].date".to_string(), "medications[0]".to_string()]
        );
    }
}
