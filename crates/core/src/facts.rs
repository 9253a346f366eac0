//! Typed fact base.
//!
//! [`FactBase::build`] turns a validated record and its normalized concepts into indexed facts as
//! of a reference date. Everything here is a pure function of `(record, concepts, as_of)`:
//! rebuilding yields identical facts.
//!
//! Fact references use a small textual syntax shared with rule packs:
//!
//! | reference | type | value when data is missing |
//! |---|---|---|
//! | `age`, `bmi`, `systolic_bp`, `diastolic_bp`, `weight_kg` | numeric | unknown (`age` is always known) |
//! | `sex`, `payer` | category | unknown payer |
//! | `pregnant`, `breastfeeding` | flag | false |
//! | `present(c)`, `failed_therapy(c)` | flag | false |
//! | `latest(c)` | numeric, canonical unit | unknown |
//! | `active_count(c)` | numeric | 0 |
//! | `trend(c)` | trend | unknown |
//! | `days_since(c)`, `days_since_screening(kind)` | duration | unknown |
//! | `therapy_days(c)` | duration | 0 |
//!
//! Lab values are read in the canonical unit resolved during normalization. A latest result in a
//! unit that could not be converted makes `latest` and `trend` unknown; `days_since` still counts
//! from its date.

use crate::ontology::{Measurement, RecordConcepts, UnitMismatch, UnmappedCode};
use cds_types::ConceptId;
use cds_wire::{PatientRecord, ScreeningKind, Sex};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Declared type of a fact. Leaves are type-checked against it when rules compile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FactType {
    Flag,
    Numeric,
    Duration,
    Trend,
    Category,
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FactType::Flag => "flag",
            FactType::Numeric => "numeric",
            FactType::Duration => "duration",
            FactType::Trend => "trend",
            FactType::Category => "category",
        })
    }
}

/// A reference to one fact of the fact base.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FactRef {
    Age,
    Bmi,
    SystolicBp,
    DiastolicBp,
    WeightKg,
    Sex,
    Payer,
    Pregnant,
    Breastfeeding,
    Present(ConceptId),
    FailedTherapy(ConceptId),
    Latest(ConceptId),
    ActiveCount(ConceptId),
    Trend(ConceptId),
    DaysSince(ConceptId),
    TherapyDays(ConceptId),
    DaysSinceScreening(ScreeningKind),
}

impl FactRef {
    /// The concept argument of a concept-valued fact.
    pub fn concept(&self) -> Option<&ConceptId> {
        match self {
            FactRef::Present(c)
            | FactRef::FailedTherapy(c)
            | FactRef::Latest(c)
            | FactRef::ActiveCount(c)
            | FactRef::Trend(c)
            | FactRef::DaysSince(c)
            | FactRef::TherapyDays(c) => Some(c),
            _ => None,
        }
    }

    pub fn fact_type(&self) -> FactType {
        match self {
            FactRef::Age
            | FactRef::Bmi
            | FactRef::SystolicBp
            | FactRef::DiastolicBp
            | FactRef::WeightKg
            | FactRef::Latest(_)
            | FactRef::ActiveCount(_) => FactType::Numeric,
            FactRef::Sex | FactRef::Payer => FactType::Category,
            FactRef::Pregnant
            | FactRef::Breastfeeding
            | FactRef::Present(_)
            | FactRef::FailedTherapy(_) => FactType::Flag,
            FactRef::Trend(_) => FactType::Trend,
            FactRef::DaysSince(_) | FactRef::TherapyDays(_) | FactRef::DaysSinceScreening(_) => {
                FactType::Duration
            }
        }
    }
}

impl FromStr for FactRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let simple = match s {
            "age" => Some(FactRef::Age),
            "bmi" => Some(FactRef::Bmi),
            "systolic_bp" => Some(FactRef::SystolicBp),
            "diastolic_bp" => Some(FactRef::DiastolicBp),
            "weight_kg" => Some(FactRef::WeightKg),
            "sex" => Some(FactRef::Sex),
            "payer" => Some(FactRef::Payer),
            "pregnant" => Some(FactRef::Pregnant),
            "breastfeeding" => Some(FactRef::Breastfeeding),
            _ => None,
        };
        if let Some(fact) = simple {
            return Ok(fact);
        }

        let (name, arg) = s
            .strip_suffix(')')
            .and_then(|inner| inner.split_once('('))
            .ok_or_else(|| format!("unknown fact '{s}'"))?;
        let arg = arg.trim();

        if name == "days_since_screening" {
            return arg.parse::<ScreeningKind>().map(FactRef::DaysSinceScreening);
        }

        let concept = ConceptId::new(arg).map_err(|e| format!("fact '{s}': {e}"))?;
        match name {
            "present" => Ok(FactRef::Present(concept)),
            "failed_therapy" => Ok(FactRef::FailedTherapy(concept)),
            "latest" => Ok(FactRef::Latest(concept)),
            "active_count" => Ok(FactRef::ActiveCount(concept)),
            "trend" => Ok(FactRef::Trend(concept)),
            "days_since" => Ok(FactRef::DaysSince(concept)),
            "therapy_days" => Ok(FactRef::TherapyDays(concept)),
            _ => Err(format!("unknown fact function '{name}'")),
        }
    }
}

impl fmt::Display for FactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactRef::Age => f.write_str("age"),
            FactRef::Bmi => f.write_str("bmi"),
            FactRef::SystolicBp => f.write_str("systolic_bp"),
            FactRef::DiastolicBp => f.write_str("diastolic_bp"),
            FactRef::WeightKg => f.write_str("weight_kg"),
            FactRef::Sex => f.write_str("sex"),
            FactRef::Payer => f.write_str("payer"),
            FactRef::Pregnant => f.write_str("pregnant"),
            FactRef::Breastfeeding => f.write_str("breastfeeding"),
            FactRef::Present(c) => write!(f, "present({c})"),
            FactRef::FailedTherapy(c) => write!(f, "failed_therapy({c})"),
            FactRef::Latest(c) => write!(f, "latest({c})"),
            FactRef::ActiveCount(c) => write!(f, "active_count({c})"),
            FactRef::Trend(c) => write!(f, "trend({c})"),
            FactRef::DaysSince(c) => write!(f, "days_since({c})"),
            FactRef::TherapyDays(c) => write!(f, "therapy_days({c})"),
            FactRef::DaysSinceScreening(kind) => write!(f, "days_since_screening({kind})"),
        }
    }
}

/// The value of a fact. `Unknown` is distinct from every real value.
#[derive(Clone, Debug, PartialEq)]
pub enum FactValue {
    Flag(bool),
    Numeric { value: f64, unit: Option<String> },
    Duration(i64),
    Trend { delta: f64, unit: String },
    Category(String),
    Unknown,
}

impl FactValue {
    fn number(value: f64) -> Self {
        FactValue::Numeric { value, unit: None }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, FactValue::Unknown)
    }

    /// Type of the value, `None` for `Unknown`.
    pub fn fact_type(&self) -> Option<FactType> {
        match self {
            FactValue::Flag(_) => Some(FactType::Flag),
            FactValue::Numeric { .. } => Some(FactType::Numeric),
            FactValue::Duration(_) => Some(FactType::Duration),
            FactValue::Trend { .. } => Some(FactType::Trend),
            FactValue::Category(_) => Some(FactType::Category),
            FactValue::Unknown => None,
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn with_unit(f: &mut fmt::Formatter<'_>, value: f64, unit: Option<&str>) -> fmt::Result {
            match unit {
                Some("%") => write!(f, "{value}%"),
                Some(unit) => write!(f, "{value} {unit}"),
                None => write!(f, "{value}"),
            }
        }

        match self {
            FactValue::Flag(b) => write!(f, "{}", if *b { "yes" } else { "no" }),
            FactValue::Numeric { value, unit } => with_unit(f, *value, unit.as_deref()),
            FactValue::Duration(days) => write!(f, "{days} days"),
            FactValue::Trend { delta, unit } => {
                if *delta >= 0.0 {
                    f.write_str("+")?;
                }
                with_unit(f, *delta, Some(unit))
            }
            FactValue::Category(c) => f.write_str(c),
            FactValue::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct LabPoint {
    date: NaiveDate,
    /// `None` when the reported unit is unusable.
    measurement: Option<Measurement>,
}

/// Immutable facts about one patient as of one date.
#[derive(Clone, Debug, PartialEq)]
pub struct FactBase {
    as_of: NaiveDate,
    age: u32,
    sex: Sex,
    pregnant: bool,
    breastfeeding: bool,
    payer: Option<String>,
    bmi: Option<f64>,
    systolic: Option<f64>,
    diastolic: Option<f64>,
    weight_kg: Option<f64>,
    present: BTreeSet<ConceptId>,
    failed: BTreeSet<ConceptId>,
    /// Results per concept in date order, limited to results on or before `as_of`.
    labs: BTreeMap<ConceptId, Vec<LabPoint>>,
    therapy_days: BTreeMap<ConceptId, i64>,
    /// Distinct active medication concepts beneath each concept.
    active: BTreeMap<ConceptId, BTreeSet<ConceptId>>,
    screenings: BTreeMap<ScreeningKind, NaiveDate>,
    unmapped: Vec<UnmappedCode>,
    unit_mismatches: Vec<UnitMismatch>,
}

impl FactBase {
    /// Builds the fact base.
    ///
    /// `concepts` must come from normalizing the same `record`. Data dated after `as_of` is
    /// ignored. A medication is active on `as_of` when `start_date <= as_of <= end_date`; its
    /// therapy duration counts both boundary days.
    pub fn build(record: &PatientRecord, concepts: &RecordConcepts, as_of: NaiveDate) -> Self {
        let demographics = &record.demographics;
        let mut present = BTreeSet::new();
        let mut failed = BTreeSet::new();
        let mut labs: BTreeMap<ConceptId, Vec<LabPoint>> = BTreeMap::new();
        let mut therapy_days: BTreeMap<ConceptId, i64> = BTreeMap::new();
        let mut active: BTreeMap<ConceptId, BTreeSet<ConceptId>> = BTreeMap::new();

        for (diagnosis, ids) in record.diagnoses.iter().zip(&concepts.diagnoses) {
            if diagnosis.onset_date.map_or(true, |onset| onset <= as_of) {
                present.extend(ids.iter().cloned());
            }
        }

        for (i, (lab, ids)) in record.labs.iter().zip(&concepts.labs).enumerate() {
            if lab.date > as_of {
                continue;
            }
            let measurement = concepts.lab_values.get(i).cloned().flatten();
            for id in ids {
                labs.entry(id.clone()).or_default().push(LabPoint {
                    date: lab.date,
                    measurement: measurement.clone(),
                });
            }
        }
        // Stable sort keeps input order for results sharing a date.
        for series in labs.values_mut() {
            series.sort_by_key(|point| point.date);
        }

        for (med, ids) in record.medications.iter().zip(&concepts.medications) {
            let Some(leaf) = ids.first() else {
                continue;
            };
            if med.failed && med.start_date <= as_of {
                failed.extend(ids.iter().cloned());
            }
            let is_active = med.start_date <= as_of && med.end_date.map_or(true, |end| end >= as_of);
            if !is_active {
                continue;
            }
            let days = (as_of - med.start_date).num_days() + 1;
            for id in ids {
                present.insert(id.clone());
                let entry = therapy_days.entry(id.clone()).or_insert(0);
                *entry = (*entry).max(days);
                active.entry(id.clone()).or_default().insert(leaf.clone());
            }
        }

        let vitals = record.vital_signs.clone().unwrap_or_default();
        let bmi = match (vitals.weight_kg, vitals.height_cm) {
            (Some(weight), Some(height)) if weight > 0.0 && height > 0.0 => {
                let metres = height / 100.0;
                Some(round_to(weight / (metres * metres), 1))
            }
            _ => None,
        };

        let screenings = record
            .screenings
            .iter()
            .filter(|(_, date)| **date <= as_of)
            .map(|(kind, date)| (*kind, *date))
            .collect();

        Self {
            as_of,
            age: demographics.age,
            sex: demographics.sex,
            pregnant: demographics.pregnant,
            breastfeeding: demographics.breastfeeding,
            payer: record.payer.clone(),
            bmi,
            systolic: vitals.systolic,
            diastolic: vitals.diastolic,
            weight_kg: vitals.weight_kg,
            present,
            failed,
            labs,
            therapy_days,
            active,
            screenings,
            unmapped: concepts.unmapped.clone(),
            unit_mismatches: concepts.unit_mismatches.clone(),
        }
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn sex(&self) -> Sex {
        self.sex
    }

    pub fn pregnant(&self) -> bool {
        self.pregnant
    }

    pub fn payer(&self) -> Option<&str> {
        self.payer.as_deref()
    }

    /// Codes that could not be mapped, kept as facts of their own.
    pub fn unmapped(&self) -> &[UnmappedCode] {
        &self.unmapped
    }

    pub fn unit_mismatches(&self) -> &[UnitMismatch] {
        &self.unit_mismatches
    }

    /// Looks up the value of `fact`.
    pub fn value(&self, fact: &FactRef) -> FactValue {
        let optional = |v: Option<f64>| v.map_or(FactValue::Unknown, FactValue::number);

        match fact {
            FactRef::Age => FactValue::number(f64::from(self.age)),
            FactRef::Bmi => optional(self.bmi),
            FactRef::SystolicBp => optional(self.systolic),
            FactRef::DiastolicBp => optional(self.diastolic),
            FactRef::WeightKg => optional(self.weight_kg),
            FactRef::Sex => FactValue::Category(self.sex.as_str().to_string()),
            FactRef::Payer => self
                .payer
                .clone()
                .map_or(FactValue::Unknown, FactValue::Category),
            FactRef::Pregnant => FactValue::Flag(self.pregnant),
            FactRef::Breastfeeding => FactValue::Flag(self.breastfeeding),
            FactRef::Present(c) => FactValue::Flag(self.present.contains(c)),
            FactRef::FailedTherapy(c) => FactValue::Flag(self.failed.contains(c)),
            FactRef::Latest(c) => match self.latest(c).and_then(|p| p.measurement.as_ref()) {
                Some(m) => FactValue::Numeric {
                    value: m.value,
                    unit: Some(m.unit.clone()),
                },
                None => FactValue::Unknown,
            },
            FactRef::ActiveCount(c) => {
                let count = self.active.get(c).map_or(0, BTreeSet::len);
                FactValue::number(count as f64)
            }
            FactRef::Trend(c) => self.trend(c),
            FactRef::DaysSince(c) => match self.latest(c) {
                Some(point) => FactValue::Duration((self.as_of - point.date).num_days()),
                None => FactValue::Unknown,
            },
            FactRef::TherapyDays(c) => {
                FactValue::Duration(self.therapy_days.get(c).copied().unwrap_or(0))
            }
            FactRef::DaysSinceScreening(kind) => match self.screenings.get(kind) {
                Some(date) => FactValue::Duration((self.as_of - *date).num_days()),
                None => FactValue::Unknown,
            },
        }
    }

    fn latest(&self, concept: &ConceptId) -> Option<&LabPoint> {
        self.labs.get(concept).and_then(|series| series.last())
    }

    /// Latest minus previous result; unknown with fewer than two results, an unusable unit, or
    /// results in different units.
    fn trend(&self, concept: &ConceptId) -> FactValue {
        let Some(series) = self.labs.get(concept) else {
            return FactValue::Unknown;
        };
        let [.., previous, latest] = series.as_slice() else {
            return FactValue::Unknown;
        };
        let (Some(previous), Some(latest)) = (&previous.measurement, &latest.measurement) else {
            return FactValue::Unknown;
        };
        if !previous.unit.eq_ignore_ascii_case(&latest.unit) {
            return FactValue::Unknown;
        }
        FactValue::Trend {
            delta: round_to(latest.value - previous.value, 4),
            unit: latest.unit.clone(),
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
