//! Ontology mapping table wire models.
//!
//! ```yaml
//! version: "2024.1"
//! concepts:
//!   - id: t2dm
//!     label: Type 2 diabetes mellitus
//!     parents: [diabetes]
//!     codes: ["ICD10:E11.9", "MONDO:0005148"]
//!   - id: hba1c
//!     label: Hemoglobin A1c
//!     unit: "%"
//!     conversions:
//!       - { from: mmol/mol, factor: 0.09148, offset: 2.152 }
//!     codes: ["LOINC:4548-4"]
//! ```
//!
//! Codes must be CURIEs so that the coding system is explicit. Observation concepts may declare a
//! canonical `unit`; rule thresholds over their values are written in that unit, and
//! `conversions` list the other units a result may arrive in. Consistency across entries
//! (duplicate codes, unknown parents, hierarchy cycles) is checked when the engine compiles the
//! table.

use crate::{from_yaml, Issues, WireError, WireResult};
use cds_types::{ConceptId, NonEmptyText, SourceCode};
use serde::Deserialize;

const DOCUMENT: &str = "mapping table";

/// Linear conversion into a concept's canonical unit: `canonical = value * factor + offset`.
#[derive(Clone, Debug, PartialEq)]
pub struct UnitConversion {
    pub from: NonEmptyText,
    pub factor: f64,
    pub offset: f64,
}

/// One canonical concept and the source codes that map to it.
#[derive(Clone, Debug, PartialEq)]
pub struct ConceptEntry {
    pub id: ConceptId,
    pub label: NonEmptyText,
    /// Direct is-a parents.
    pub parents: Vec<ConceptId>,
    pub codes: Vec<SourceCode>,
    /// Canonical unit of observations of this concept.
    pub unit: Option<NonEmptyText>,
    pub conversions: Vec<UnitConversion>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MappingDocument {
    pub version: NonEmptyText,
    pub concepts: Vec<ConceptEntry>,
}

/// Mapping table file operations.
pub struct MappingFile;

impl MappingFile {
    /// Parse a mapping table from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Schema`] for structural mismatches and [`WireError::InvalidFields`]
    /// for invalid concept ids, labels or codes.
    pub fn parse_yaml(yaml_text: &str) -> WireResult<MappingDocument> {
        let wire: MappingWire = from_yaml(DOCUMENT, yaml_text)?;
        wire_to_domain(wire)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MappingWire {
    version: String,
    concepts: Vec<ConceptWire>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConceptWire {
    id: String,
    label: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    codes: Vec<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    conversions: Vec<ConversionWire>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConversionWire {
    from: String,
    factor: f64,
    #[serde(default)]
    offset: f64,
}

fn translate_conversions(
    base: &str,
    unit: Option<&NonEmptyText>,
    wire: Vec<ConversionWire>,
    issues: &mut Issues,
) -> Option<Vec<UnitConversion>> {
    let mut out = Vec::new();
    let mut complete = true;
    for (i, raw) in wire.into_iter().enumerate() {
        let path = format!("{base}.conversions[{i}]");
        let Some(canonical) = unit else {
            issues.push(format!("{path}.from"), "conversions require a canonical unit");
            complete = false;
            continue;
        };
        let Some(from) = issues.check(format!("{path}.from"), NonEmptyText::new(&raw.from)) else {
            complete = false;
            continue;
        };
        let repeated = from.as_str().eq_ignore_ascii_case(canonical.as_str())
            || out
                .iter()
                .any(|c: &UnitConversion| c.from.as_str().eq_ignore_ascii_case(from.as_str()));
        if repeated {
            issues.push(format!("{path}.from"), format!("unit '{from}' is already covered"));
            complete = false;
        }
        if !raw.factor.is_finite() || raw.factor == 0.0 {
            issues.push(format!("{path}.factor"), "factor must be a finite, non-zero number");
            complete = false;
        }
        if !raw.offset.is_finite() {
            issues.push(format!("{path}.offset"), "offset must be a finite number");
            complete = false;
        }
        out.push(UnitConversion {
            from,
            factor: raw.factor,
            offset: raw.offset,
        });
    }
    complete.then_some(out)
}

fn translate_concept(index: usize, wire: ConceptWire, issues: &mut Issues) -> Option<ConceptEntry> {
    let base = format!("concepts[{index}]");
    let id = issues.check(format!("{base}.id"), ConceptId::new(&wire.id));
    let label = issues.check(format!("{base}.label"), NonEmptyText::new(&wire.label));

    let parents: Vec<Option<ConceptId>> = wire
        .parents
        .iter()
        .enumerate()
        .map(|(i, raw)| issues.check(format!("{base}.parents[{i}]"), ConceptId::new(raw)))
        .collect();
    let codes: Vec<Option<SourceCode>> = wire
        .codes
        .iter()
        .enumerate()
        .map(|(i, raw)| issues.check(format!("{base}.codes[{i}]"), SourceCode::parse_curie(raw)))
        .collect();
    let unit = match wire.unit.as_deref() {
        Some(raw) => Some(issues.check(format!("{base}.unit"), NonEmptyText::new(raw))?),
        None => None,
    };
    let conversions = translate_conversions(&base, unit.as_ref(), wire.conversions, issues);

    Some(ConceptEntry {
        id: id?,
        label: label?,
        parents: parents.into_iter().collect::<Option<Vec<_>>>()?,
        codes: codes.into_iter().collect::<Option<Vec<_>>>()?,
        unit,
        conversions: conversions?,
    })
}

fn wire_to_domain(wire: MappingWire) -> WireResult<MappingDocument> {
    let mut issues = Issues::default();
    let version = issues.check("version", NonEmptyText::new(&wire.version));
    let concepts: Vec<ConceptEntry> = wire
        .concepts
        .into_iter()
        .enumerate()
        .filter_map(|(i, concept)| translate_concept(i, concept, &mut issues))
        .collect();

    issues.finish(DOCUMENT)?;

    let Some(version) = version else {
        return Err(WireError::InvalidInput(
            "mapping table could not be translated".into(),
        ));
    };
    Ok(MappingDocument { version, concepts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cds_types::CodingSystem;

    #[test]
    fn test_parse_mapping_table() {
        let yaml = r#"
version: "2024.1"
concepts:
  - id: diabetes
    label: Diabetes mellitus
    codes: ["MONDO:0005015"]
  - id: t2dm
    label: Type 2 diabetes mellitus
    parents: [diabetes]
    codes: ["ICD10:e11.9", "mondo:0005148"]
"#;
        let doc = MappingFile::parse_yaml(yaml).expect("parse should succeed");
        assert_eq!(doc.concepts.len(), 2);
        let t2dm = &doc.concepts[1];
        assert_eq!(t2dm.parents[0].as_str(), "diabetes");
        assert_eq!(t2dm.codes[0].system(), CodingSystem::Icd10);
        assert_eq!(t2dm.codes[0].code(), "E11.9");
        assert_eq!(t2dm.codes[1].to_string(), "MONDO:0005148");
        assert!(t2dm.unit.is_none());
    }

    #[test]
    fn test_parse_canonical_unit_and_conversions() {
        let yaml = r#"
version: "1"
concepts:
  - id: hba1c
    label: Hemoglobin A1c
    unit: "%"
    conversions:
      - { from: mmol/mol, factor: 0.09148, offset: 2.152 }
    codes: ["LOINC:4548-4"]
"#;
        let doc = MappingFile::parse_yaml(yaml).expect("parse should succeed");
        let hba1c = &doc.concepts[0];
        assert_eq!(hba1c.unit.as_ref().map(NonEmptyText::as_str), Some("%"));
        assert_eq!(hba1c.conversions[0].from.as_str(), "mmol/mol");
        assert_eq!(hba1c.conversions[0].offset, 2.152);
    }

    #[test]
    fn test_invalid_conversions_are_reported_with_paths() {
        let yaml = r#"
version: "1"
concepts:
  - id: ldl
    label: LDL cholesterol
    conversions:
      - { from: mmol/L, factor: 38.67 }
  - id: egfr
    label: eGFR
    unit: mL/min/1.73m2
    conversions:
      - { from: ML/MIN/1.73M2, factor: 1 }
      - { from: mL/s, factor: 0 }
"#;
        let err = MappingFile::parse_yaml(yaml).expect_err("conversions should be rejected");
        let paths: Vec<String> = err.issues().into_iter().map(|i| i.path).collect();
        assert_eq!(
            paths,
            vec![
                "concepts[0].conversions[0].from",
                "concepts[1].conversions[0].from",
                "concepts[1].conversions[1].factor",
            ]
        );
    }

    #[test]
    fn test_bare_code_is_rejected_with_path() {
        let yaml = "version: '1'\nconcepts:\n  - id: t2dm\n    label: T2DM\n    codes: [E11.9]\n";
        let err = MappingFile::parse_yaml(yaml).expect_err("bare code should be rejected");
        let issues = err.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "concepts[0].codes[0]");
    }
}
