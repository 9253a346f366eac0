//! Fixtures shared by unit tests, built from the bundled `config/` pack.

use crate::facts::FactBase;
use crate::ontology::MappingTable;
use crate::overlay::TenantOverlay;
use crate::rule::CompiledGuideline;
use cds_wire::{
    GuidelineDocument, GuidelinePack, MappingFile, OverlayDocument, PatientPayload,
    TenantOverlayFile,
};
use chrono::NaiveDate;
use std::sync::Arc;

pub(crate) const MAPPINGS_YAML: &str = include_str!("../../../config/ontology/mappings.yaml");
pub(crate) const GUIDELINE_YAML: &str = include_str!("../../../config/guidelines/ada-2024.yaml");
pub(crate) const OVERLAY_YAML: &str = include_str!("../../../config/tenants/clinic_001.yaml");

/// Age 58, HbA1c 9.6% on 2023-12-01, metformin since 2023-01-01, Medicare.
pub(crate) const PATIENT_JSON: &str = r#"{
    "patient_id": "scenario-1",
    "age": 58,
    "sex": "F",
    "pregnant": false,
    "payer": "medicare",
    "diagnoses": [{"icd10": "E11.9", "name": "Type 2 diabetes mellitus"}],
    "labs": [{"loinc": "4548-4", "value": 9.6, "unit": "%", "date": "2023-12-01"}],
    "medications": [{"rxnorm_code": "6809", "name": "Metformin", "start_date": "2023-01-01"}],
    "vital_signs": {"systolic": 138, "diastolic": 84, "weight_kg": 88, "height_cm": 165}
}"#;

pub(crate) fn mapping_table() -> MappingTable {
    let doc = MappingFile::parse_yaml(MAPPINGS_YAML).expect("bundled mappings should parse");
    MappingTable::compile(doc).expect("bundled mappings should compile")
}

pub(crate) fn guideline_document() -> GuidelineDocument {
    GuidelinePack::parse_yaml(GUIDELINE_YAML).expect("bundled guideline should parse")
}

pub(crate) fn guideline() -> Arc<CompiledGuideline> {
    Arc::new(
        CompiledGuideline::compile(guideline_document()).expect("bundled guideline should compile"),
    )
}

pub(crate) fn overlay_document() -> OverlayDocument {
    TenantOverlayFile::parse_yaml(OVERLAY_YAML).expect("bundled overlay should parse")
}

pub(crate) fn overlay() -> TenantOverlay {
    TenantOverlay::from_document(overlay_document())
}

pub(crate) fn facts(json: &str, as_of: NaiveDate) -> FactBase {
    let record = PatientPayload::parse_json(json).expect("patient should parse");
    let concepts = mapping_table().normalize_record(&record);
    FactBase::build(&record, &concepts, as_of)
}
