//! Ontology normalization.
//!
//! A [`MappingTable`] maps (coding system, code) pairs onto canonical [`ConceptId`]s and knows
//! the is-a hierarchy between concepts. Tables are immutable once compiled; the
//! [`OntologyNormalizer`] swaps whole tables so an evaluation always sees exactly one of them.
//!
//! Unknown codes never fail normalization. They come back as [`UnmappedCode`] and surface as
//! advisories.
//!
//! Lab values are expressed in the canonical unit of their concept when it declares one. A result
//! whose unit is neither canonical nor convertible keeps its date but loses its value, and is
//! reported as a [`UnitMismatch`].

use crate::provider::MappingTableProvider;
use crate::{CdsError, CdsResult};
use cds_types::{ConceptId, NonEmptyText, SourceCode};
use cds_wire::{MappingDocument, PatientRecord, UnitConversion};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// A source code with no entry in the mapping table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnmappedCode {
    /// Field path the code was read from, e.g. `labs[2].loinc`.
    pub field: String,
    pub code: SourceCode,
}

/// A lab result whose unit cannot be expressed in its concept's canonical unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitMismatch {
    /// Field path of the offending unit, e.g. `labs[0].unit`.
    pub field: String,
    pub concept: ConceptId,
    pub unit: String,
    pub expected_unit: String,
}

/// A lab value in the unit rules are written against.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub value: f64,
    pub unit: String,
}

/// Outcome of normalizing one source code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Normalized {
    Concept { code: SourceCode, concept: ConceptId },
    Unmapped(SourceCode),
}

/// Concepts resolved for each coded element of a record, ancestors included.
///
/// Each entry lists the mapped concept first and then its ancestors in id order. An empty
/// entry means the element's codes were not mapped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordConcepts {
    pub diagnoses: Vec<Vec<ConceptId>>,
    pub labs: Vec<Vec<ConceptId>>,
    /// Canonical value of each lab result; `None` when unmapped or in an unusable unit.
    pub lab_values: Vec<Option<Measurement>>,
    pub medications: Vec<Vec<ConceptId>>,
    pub unmapped: Vec<UnmappedCode>,
    pub unit_mismatches: Vec<UnitMismatch>,
}

#[derive(Debug)]
struct CanonicalUnit {
    unit: NonEmptyText,
    conversions: Vec<UnitConversion>,
}

/// Compiled, read-only mapping table.
#[derive(Debug)]
pub struct MappingTable {
    version: NonEmptyText,
    by_code: HashMap<SourceCode, ConceptId>,
    labels: BTreeMap<ConceptId, NonEmptyText>,
    /// Strict ancestors of each concept.
    ancestors: BTreeMap<ConceptId, BTreeSet<ConceptId>>,
    units: BTreeMap<ConceptId, CanonicalUnit>,
}

impl MappingTable {
    /// Compiles a mapping document.
    ///
    /// # Errors
    ///
    /// Returns [`CdsError::InvalidMapping`] if a concept is declared twice, a code maps to two
    /// different concepts, a parent is unknown, or the hierarchy contains a cycle.
    pub fn compile(doc: MappingDocument) -> CdsResult<Self> {
        let mut labels = BTreeMap::new();
        let mut parents: BTreeMap<ConceptId, Vec<ConceptId>> = BTreeMap::new();
        let mut by_code: HashMap<SourceCode, ConceptId> = HashMap::new();
        let mut units = BTreeMap::new();

        for entry in doc.concepts {
            if labels.contains_key(&entry.id) {
                return Err(CdsError::InvalidMapping(format!(
                    "concept '{}' is declared more than once",
                    entry.id
                )));
            }
            for code in entry.codes {
                if let Some(existing) = by_code.get(&code) {
                    if existing != &entry.id {
                        return Err(CdsError::InvalidMapping(format!(
                            "code {code} maps to both '{existing}' and '{}'",
                            entry.id
                        )));
                    }
                }
                by_code.insert(code, entry.id.clone());
            }
            if let Some(unit) = entry.unit {
                units.insert(
                    entry.id.clone(),
                    CanonicalUnit {
                        unit,
                        conversions: entry.conversions,
                    },
                );
            }
            parents.insert(entry.id.clone(), entry.parents);
            labels.insert(entry.id, entry.label);
        }

        for (concept, direct) in &parents {
            if let Some(unknown) = direct.iter().find(|p| !labels.contains_key(*p)) {
                return Err(CdsError::InvalidMapping(format!(
                    "concept '{concept}' names unknown parent '{unknown}'"
                )));
            }
        }

        let mut ancestors = BTreeMap::new();
        for concept in labels.keys() {
            let closure = ancestor_closure(concept, &parents)?;
            ancestors.insert(concept.clone(), closure);
        }

        Ok(Self {
            version: doc.version,
            by_code,
            labels,
            ancestors,
            units,
        })
    }

    pub fn version(&self) -> &str {
        self.version.as_str()
    }

    pub fn concept_count(&self) -> usize {
        self.labels.len()
    }

    pub fn code_count(&self) -> usize {
        self.by_code.len()
    }

    pub fn contains_concept(&self, concept: &ConceptId) -> bool {
        self.labels.contains_key(concept)
    }

    pub fn label(&self, concept: &ConceptId) -> Option<&str> {
        self.labels.get(concept).map(NonEmptyText::as_str)
    }

    pub fn lookup(&self, code: &SourceCode) -> Option<&ConceptId> {
        self.by_code.get(code)
    }

    /// True when `concept` is `ancestor` or lies beneath it.
    pub fn is_a(&self, concept: &ConceptId, ancestor: &ConceptId) -> bool {
        concept == ancestor
            || self
                .ancestors
                .get(concept)
                .is_some_and(|set| set.contains(ancestor))
    }

    /// The concept followed by its ancestors in id order.
    pub fn with_ancestors(&self, concept: &ConceptId) -> Vec<ConceptId> {
        let mut out = vec![concept.clone()];
        if let Some(set) = self.ancestors.get(concept) {
            out.extend(set.iter().cloned());
        }
        out
    }

    /// Canonical unit of `concept`: its own, else that of the first ancestor (in id order) that
    /// declares one.
    pub fn canonical_unit(&self, concept: &ConceptId) -> Option<&str> {
        self.canonical(concept).map(|target| target.unit.as_str())
    }

    fn canonical(&self, concept: &ConceptId) -> Option<&CanonicalUnit> {
        self.with_ancestors(concept)
            .iter()
            .find_map(|c| self.units.get(c))
    }

    /// Expresses `value` in `unit` in the canonical unit of `concept`.
    ///
    /// Units compare case-insensitively. Values of concepts without a canonical unit pass
    /// through unchanged. Returns `None` when the unit is neither canonical nor convertible.
    pub fn to_canonical(&self, concept: &ConceptId, value: f64, unit: &str) -> Option<Measurement> {
        let unit = unit.trim();
        let Some(target) = self.canonical(concept) else {
            return Some(Measurement {
                value,
                unit: unit.to_string(),
            });
        };
        if unit.eq_ignore_ascii_case(target.unit.as_str()) {
            return Some(Measurement {
                value,
                unit: target.unit.to_string(),
            });
        }
        target.conversions
            .iter()
            .find(|conversion| conversion.from.as_str().eq_ignore_ascii_case(unit))
            .map(|conversion| Measurement {
                value: ((value * conversion.factor + conversion.offset) * 100.0).round() / 100.0,
                unit: target.unit.to_string(),
            })
    }

    /// Maps each code to its concept, preserving input order.
    pub fn normalize(&self, codes: &[SourceCode]) -> Vec<Normalized> {
        codes
            .iter()
            .map(|code| match self.lookup(code) {
                Some(concept) => Normalized::Concept {
                    code: code.clone(),
                    concept: concept.clone(),
                },
                None => Normalized::Unmapped(code.clone()),
            })
            .collect()
    }

    /// Normalizes every coded element of a record.
    pub fn normalize_record(&self, record: &PatientRecord) -> RecordConcepts {
        let mut out = RecordConcepts::default();

        for (i, diagnosis) in record.diagnoses.iter().enumerate() {
            let mut concepts = BTreeSet::new();
            let mut first = None;
            for code in diagnosis.codes() {
                match self.lookup(code) {
                    Some(concept) => {
                        first.get_or_insert_with(|| concept.clone());
                        concepts.extend(self.with_ancestors(concept));
                    }
                    None => out.unmapped.push(UnmappedCode {
                        field: format!("diagnoses[{i}].{}", diagnosis_field(code)),
                        code: code.clone(),
                    }),
                }
            }
            out.diagnoses.push(match first {
                Some(primary) => {
                    concepts.remove(&primary);
                    std::iter::once(primary).chain(concepts).collect()
                }
                None => Vec::new(),
            });
        }

        for (i, lab) in record.labs.iter().enumerate() {
            let concepts =
                self.element_concepts(&lab.code, format!("labs[{i}].loinc"), &mut out.unmapped);
            let value = concepts.first().and_then(|concept| {
                let measurement = self.to_canonical(concept, lab.value, &lab.unit);
                if measurement.is_none() {
                    if let Some(expected) = self.canonical_unit(concept) {
                        out.unit_mismatches.push(UnitMismatch {
                            field: format!("labs[{i}].unit"),
                            concept: concept.clone(),
                            unit: lab.unit.clone(),
                            expected_unit: expected.to_string(),
                        });
                    }
                }
                measurement
            });
            out.labs.push(concepts);
            out.lab_values.push(value);
        }

        for (i, med) in record.medications.iter().enumerate() {
            out.medications.push(self.element_concepts(
                &med.code,
                format!("medications[{i}].rxnorm_code"),
                &mut out.unmapped,
            ));
        }

        out
    }

    fn element_concepts(
        &self,
        code: &SourceCode,
        field: String,
        unmapped: &mut Vec<UnmappedCode>,
    ) -> Vec<ConceptId> {
        match self.lookup(code) {
            Some(concept) => self.with_ancestors(concept),
            None => {
                unmapped.push(UnmappedCode {
                    field,
                    code: code.clone(),
                });
                Vec::new()
            }
        }
    }
}

fn diagnosis_field(code: &SourceCode) -> &'static str {
    match code.system() {
        cds_types::CodingSystem::Mondo => "mondo",
        _ => "icd10",
    }
}

fn ancestor_closure(
    concept: &ConceptId,
    parents: &BTreeMap<ConceptId, Vec<ConceptId>>,
) -> CdsResult<BTreeSet<ConceptId>> {
    let mut closure = BTreeSet::new();
    let mut stack: Vec<&ConceptId> = parents.get(concept).into_iter().flatten().collect();

    while let Some(next) = stack.pop() {
        if next == concept {
            return Err(CdsError::InvalidMapping(format!(
                "concept hierarchy contains a cycle through '{concept}'"
            )));
        }
        if closure.insert(next.clone()) {
            stack.extend(parents.get(next).into_iter().flatten());
        }
    }
    Ok(closure)
}

/// Holds the current mapping table and replaces it atomically.
///
/// Readers take an `Arc` snapshot; a publish never disturbs evaluations already holding the
/// previous table.
#[derive(Debug)]
pub struct OntologyNormalizer {
    current: RwLock<Arc<MappingTable>>,
}

impl OntologyNormalizer {
    pub fn new(table: MappingTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    pub fn snapshot(&self) -> Arc<MappingTable> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the current table.
    pub fn publish(&self, table: MappingTable) {
        let table = Arc::new(table);
        tracing::info!(
            version = table.version(),
            concepts = table.concept_count(),
            codes = table.code_count(),
            "publishing ontology mapping table"
        );
        *self.current.write() = table;
    }

    /// Loads and compiles a table from `provider`, then publishes it.
    ///
    /// On failure the current table stays in place.
    pub fn refresh(&self, provider: &dyn MappingTableProvider) -> CdsResult<()> {
        let table = provider.load().and_then(MappingTable::compile);
        match table {
            Ok(table) => {
                self.publish(table);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "mapping table refresh rejected; keeping current table");
                Err(err)
            }
        }
    }
}
