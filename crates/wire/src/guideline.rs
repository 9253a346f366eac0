//! Guideline rule pack wire models and translation helpers.
//!
//! A rule pack is a YAML document publishing one immutable guideline version:
//!
//! ```yaml
//! version: ada-2024
//! title: ADA Standards of Care 2024
//! published: 2024-01-01
//! rules:
//!   - id: ADA-9.INTENSIFY-MONO
//!     title: Intensify after monotherapy
//!     tier: 2
//!     severity: high
//!     topic: glycemic_therapy
//!     intervention: therapy_intensification
//!     message: "HbA1c {latest(hba1c)} above target"
//!     citation: ADA Standards of Care 2024, Section 9
//!     effective_from: 2023-01-01
//!     condition:
//!       all:
//!         - present: t2dm
//!         - compare: { fact: latest(hba1c), op: ">=", value: 7.0, param: hba1c_target }
//! ```
//!
//! Each condition node is a mapping with exactly one operator key. Fact references inside
//! leaves (for example `latest(hba1c)`) are carried as text; the engine resolves and type-checks
//! them when it compiles the pack.

use crate::patient::Sex;
use crate::{from_yaml, Issues, WireError, WireResult};
use cds_types::{ConceptId, GuidelineVersionId, NonEmptyText, RuleId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

const DOCUMENT: &str = "guideline pack";

// ============================================================================
// Public domain-level types
// ============================================================================

/// How urgently a recommendation should be surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Grade of the evidence supporting a rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EvidenceLevel {
    A,
    B,
    C,
    E,
}

/// Who authored a rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    #[default]
    Guideline,
    Payer,
    Clinic,
}

/// Pregnancy branch a rule applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PregnancyApplicability {
    #[default]
    Any,
    Required,
    Excluded,
}

/// Numeric comparison operators usable in leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
}

impl Comparator {
    pub fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Comparator::Lt => left < right,
            Comparator::Le => left <= right,
            Comparator::Eq => left == right,
            Comparator::Ge => left >= right,
            Comparator::Gt => left > right,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
            Comparator::Ge => ">=",
            Comparator::Gt => ">",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Literal compared by an equality leaf.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(t) => write!(f, "'{t}'"),
        }
    }
}

/// Population and payer constraints on a rule.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Applicability {
    /// Payers the rule is restricted to; `None` means every payer, including none recorded.
    pub payers: Option<BTreeSet<String>>,
    pub pregnancy: PregnancyApplicability,
    pub min_age: Option<u32>,
    pub max_age: Option<u32>,
    pub sex: Option<Sex>,
}

/// Untyped condition tree as authored. Fact references are unresolved text.
#[derive(Clone, Debug, PartialEq)]
pub enum ConditionNode {
    All(Vec<ConditionNode>),
    Any(Vec<ConditionNode>),
    Not(Box<ConditionNode>),
    Present(ConceptId),
    Known {
        fact: String,
    },
    Equals {
        fact: String,
        value: Scalar,
    },
    Compare {
        fact: String,
        op: Comparator,
        value: f64,
        param: Option<String>,
    },
    Range {
        fact: String,
        min: Option<f64>,
        max: Option<f64>,
        min_param: Option<String>,
        max_param: Option<String>,
    },
    Duration {
        fact: String,
        op: Comparator,
        days: i64,
        param: Option<String>,
    },
    Trend {
        fact: String,
        op: Comparator,
        delta: f64,
        param: Option<String>,
    },
}

/// One authored rule, structurally valid but not yet compiled.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleDefinition {
    pub id: RuleId,
    pub title: NonEmptyText,
    /// Priority tier; 1 is the highest priority.
    pub tier: u8,
    pub severity: Severity,
    /// Clinical topic used for cross-tier exclusivity.
    pub topic: NonEmptyText,
    pub intervention: NonEmptyText,
    /// Message template, may contain `{fact}` and `{threshold(param)}` placeholders.
    pub message: NonEmptyText,
    pub citation: NonEmptyText,
    pub evidence_level: Option<EvidenceLevel>,
    pub source: RuleSource,
    pub applicability: Applicability,
    pub supersedes: Option<RuleId>,
    pub mutually_exclusive_with: BTreeSet<RuleId>,
    /// Firing suppresses every lower tier with the same topic.
    pub exclusive: bool,
    pub mandatory_safety: bool,
    pub effective_from: NaiveDate,
    /// Last day the rule is in force (inclusive).
    pub effective_until: Option<NaiveDate>,
    pub condition: ConditionNode,
}

/// A published guideline version.
#[derive(Clone, Debug, PartialEq)]
pub struct GuidelineDocument {
    pub version: GuidelineVersionId,
    pub title: NonEmptyText,
    pub published: NaiveDate,
    pub rules: Vec<RuleDefinition>,
}

// ============================================================================
// Public GuidelinePack operations
// ============================================================================

/// Guideline pack operations.
///
/// This is a zero-sized type used for namespacing pack parsing. All methods are associated
/// functions.
pub struct GuidelinePack;

impl GuidelinePack {
    /// Parse a guideline pack from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Schema`] if the YAML does not match the wire schema and
    /// [`WireError::InvalidFields`] listing every identifier, text field or condition node that
    /// cannot be translated (for example a node with two operator keys).
    pub fn parse_yaml(yaml_text: &str) -> WireResult<GuidelineDocument> {
        let wire: GuidelineWire = from_yaml(DOCUMENT, yaml_text)?;
        wire_to_domain(wire)
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GuidelineWire {
    version: String,
    title: String,
    published: NaiveDate,
    rules: Vec<RuleWire>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleWire {
    id: String,
    title: String,
    tier: u8,
    severity: Severity,
    topic: String,
    intervention: String,
    message: String,
    citation: String,
    #[serde(default)]
    evidence_level: Option<EvidenceLevel>,
    #[serde(default)]
    source: RuleSource,
    #[serde(default)]
    applicability: ApplicabilityWire,
    #[serde(default)]
    supersedes: Option<String>,
    #[serde(default)]
    mutually_exclusive_with: Vec<String>,
    #[serde(default)]
    exclusive: bool,
    #[serde(default)]
    mandatory_safety: bool,
    effective_from: NaiveDate,
    #[serde(default)]
    effective_until: Option<NaiveDate>,
    condition: ConditionWire,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApplicabilityWire {
    #[serde(default)]
    payers: Option<Vec<String>>,
    #[serde(default)]
    pregnancy: PregnancyApplicability,
    #[serde(default)]
    min_age: Option<u32>,
    #[serde(default)]
    max_age: Option<u32>,
    #[serde(default)]
    sex: Option<Sex>,
}

/// A condition node: exactly one of the fields must be set.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionWire {
    #[serde(default)]
    all: Option<Vec<ConditionWire>>,
    #[serde(default)]
    any: Option<Vec<ConditionWire>>,
    #[serde(default)]
    not: Option<Box<ConditionWire>>,
    #[serde(default)]
    present: Option<String>,
    #[serde(default)]
    known: Option<String>,
    #[serde(default)]
    equals: Option<EqualsWire>,
    #[serde(default)]
    compare: Option<CompareWire>,
    #[serde(default)]
    range: Option<RangeWire>,
    #[serde(default)]
    duration: Option<DurationWire>,
    #[serde(default)]
    trend: Option<TrendWire>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EqualsWire {
    fact: String,
    value: Scalar,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompareWire {
    fact: String,
    op: Comparator,
    value: f64,
    #[serde(default)]
    param: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RangeWire {
    fact: String,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    min_param: Option<String>,
    #[serde(default)]
    max_param: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DurationWire {
    fact: String,
    op: Comparator,
    days: i64,
    #[serde(default)]
    param: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrendWire {
    fact: String,
    op: Comparator,
    delta: f64,
    #[serde(default)]
    param: Option<String>,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn translate_condition(
    path: &str,
    wire: ConditionWire,
    issues: &mut Issues,
) -> Option<ConditionNode> {
    let mut nodes: Vec<ConditionNode> = Vec::new();
    let mut keys = 0usize;

    if let Some(children) = wire.all {
        keys += 1;
        let children = translate_children(&format!("{path}.all"), children, issues)?;
        nodes.push(ConditionNode::All(children));
    }
    if let Some(children) = wire.any {
        keys += 1;
        let children = translate_children(&format!("{path}.any"), children, issues)?;
        nodes.push(ConditionNode::Any(children));
    }
    if let Some(child) = wire.not {
        keys += 1;
        let child = translate_condition(&format!("{path}.not"), *child, issues)?;
        nodes.push(ConditionNode::Not(Box::new(child)));
    }
    if let Some(concept) = wire.present {
        keys += 1;
        let concept = issues.check(format!("{path}.present"), ConceptId::new(&concept))?;
        nodes.push(ConditionNode::Present(concept));
    }
    if let Some(fact) = wire.known {
        keys += 1;
        nodes.push(ConditionNode::Known { fact });
    }
    if let Some(leaf) = wire.equals {
        keys += 1;
        nodes.push(ConditionNode::Equals {
            fact: leaf.fact,
            value: leaf.value,
        });
    }
    if let Some(leaf) = wire.compare {
        keys += 1;
        nodes.push(ConditionNode::Compare {
            fact: leaf.fact,
            op: leaf.op,
            value: leaf.value,
            param: leaf.param,
        });
    }
    if let Some(leaf) = wire.range {
        keys += 1;
        nodes.push(ConditionNode::Range {
            fact: leaf.fact,
            min: leaf.min,
            max: leaf.max,
            min_param: leaf.min_param,
            max_param: leaf.max_param,
        });
    }
    if let Some(leaf) = wire.duration {
        keys += 1;
        nodes.push(ConditionNode::Duration {
            fact: leaf.fact,
            op: leaf.op,
            days: leaf.days,
            param: leaf.param,
        });
    }
    if let Some(leaf) = wire.trend {
        keys += 1;
        nodes.push(ConditionNode::Trend {
            fact: leaf.fact,
            op: leaf.op,
            delta: leaf.delta,
            param: leaf.param,
        });
    }

    if keys != 1 {
        issues.push(
            path,
            format!("condition node must have exactly one operator key, found {keys}"),
        );
        return None;
    }
    nodes.pop()
}

fn translate_children(
    path: &str,
    children: Vec<ConditionWire>,
    issues: &mut Issues,
) -> Option<Vec<ConditionNode>> {
    if children.is_empty() {
        issues.push(path, "combinator requires at least one child");
        return None;
    }
    let count = children.len();
    let translated: Vec<ConditionNode> = children
        .into_iter()
        .enumerate()
        .filter_map(|(i, child)| translate_condition(&format!("{path}[{i}]"), child, issues))
        .collect();
    (translated.len() == count).then_some(translated)
}

fn translate_applicability(
    path: &str,
    wire: ApplicabilityWire,
    issues: &mut Issues,
) -> Applicability {
    let payers = wire.payers.map(|payers| {
        payers
            .into_iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect::<BTreeSet<_>>()
    });
    if payers.as_ref().is_some_and(BTreeSet::is_empty) {
        issues.push(
            format!("{path}.payers"),
            "payer list cannot be empty (omit it to apply to every payer)",
        );
    }
    if let (Some(min), Some(max)) = (wire.min_age, wire.max_age) {
        if min > max {
            issues.push(path, format!("min_age {min} exceeds max_age {max}"));
        }
    }

    Applicability {
        payers,
        pregnancy: wire.pregnancy,
        min_age: wire.min_age,
        max_age: wire.max_age,
        sex: wire.sex,
    }
}

fn translate_rule(index: usize, wire: RuleWire, issues: &mut Issues) -> Option<RuleDefinition> {
    let base = format!("rules[{index}]");

    let id = issues.check(format!("{base}.id"), RuleId::new(&wire.id));
    let title = issues.check(format!("{base}.title"), NonEmptyText::new(&wire.title));
    let topic = issues.check(format!("{base}.topic"), NonEmptyText::new(&wire.topic));
    let intervention = issues.check(
        format!("{base}.intervention"),
        NonEmptyText::new(&wire.intervention),
    );
    let message = issues.check(format!("{base}.message"), NonEmptyText::new(&wire.message));
    let citation = issues.check(format!("{base}.citation"), NonEmptyText::new(&wire.citation));

    if wire.tier == 0 {
        issues.push(format!("{base}.tier"), "tier must be at least 1");
    }
    if let Some(until) = wire.effective_until {
        if until < wire.effective_from {
            issues.push(
                format!("{base}.effective_until"),
                "effective_until cannot precede effective_from",
            );
        }
    }

    let supersedes = match wire.supersedes {
        Some(raw) => Some(issues.check(format!("{base}.supersedes"), RuleId::new(&raw))?),
        None => None,
    };
    let exclusive_ids: Vec<Option<RuleId>> = wire
        .mutually_exclusive_with
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            issues.check(
                format!("{base}.mutually_exclusive_with[{i}]"),
                RuleId::new(raw),
            )
        })
        .collect();
    let applicability =
        translate_applicability(&format!("{base}.applicability"), wire.applicability, issues);
    let condition = translate_condition(&format!("{base}.condition"), wire.condition, issues);

    Some(RuleDefinition {
        id: id?,
        title: title?,
        tier: wire.tier,
        severity: wire.severity,
        topic: topic?,
        intervention: intervention?,
        message: message?,
        citation: citation?,
        evidence_level: wire.evidence_level,
        source: wire.source,
        applicability,
        supersedes,
        mutually_exclusive_with: exclusive_ids.into_iter().collect::<Option<BTreeSet<_>>>()?,
        exclusive: wire.exclusive,
        mandatory_safety: wire.mandatory_safety,
        effective_from: wire.effective_from,
        effective_until: wire.effective_until,
        condition: condition?,
    })
}

fn wire_to_domain(wire: GuidelineWire) -> WireResult<GuidelineDocument> {
    let mut issues = Issues::default();

    let version = issues.check("version", GuidelineVersionId::new(&wire.version));
    let title = issues.check("title", NonEmptyText::new(&wire.title));
    let rules: Vec<RuleDefinition> = wire
        .rules
        .into_iter()
        .enumerate()
        .filter_map(|(i, rule)| translate_rule(i, rule, &mut issues))
        .collect();

    issues.finish(DOCUMENT)?;

    let (Some(version), Some(title)) = (version, title) else {
        return Err(WireError::InvalidInput(
            "guideline pack could not be translated".into(),
        ));
    };

    Ok(GuidelineDocument {
        version,
        title,
        published: wire.published,
        rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACK: &str = r#"
version: test-2024
title: Test pack
published: 2024-01-01
rules:
  - id: R-1
    title: First rule
    tier: 2
    severity: high
    topic: glycemic_therapy
    intervention: intensify
    message: "HbA1c {latest(hba1c)}"
    citation: Test citation
    evidence_level: A
    mutually_exclusive_with: [R-2]
    applicability:
      payers: [Medicare, " commercial "]
      pregnancy: excluded
      min_age: 18
    effective_from: 2023-01-01
    condition:
      all:
        - present: t2dm
        - compare: { fact: latest(hba1c), op: ">=", value: 7.0, param: hba1c_target }
        - not:
            equals: { fact: pregnant, value: true }
        - any:
            - duration: { fact: therapy_days(biguanide), op: ">=", days: 90 }
            - trend: { fact: trend(hba1c), op: ">", delta: 0.5 }
            - range: { fact: bmi, min: 25, max_param: bmi_ceiling, max: 40 }
            - known: days_since(hba1c)
"#;

    #[test]
    fn test_parse_translates_rule_and_condition_tree() {
        let doc = GuidelinePack::parse_yaml(PACK).expect("parse should succeed");
        assert_eq!(doc.version.as_str(), "test-2024");
        assert_eq!(doc.rules.len(), 1);

        let rule = &doc.rules[0];
        assert_eq!(rule.id.as_str(), "R-1");
        assert_eq!(rule.source, RuleSource::Guideline);
        assert_eq!(rule.evidence_level, Some(EvidenceLevel::A));
        assert_eq!(rule.applicability.pregnancy, PregnancyApplicability::Excluded);
        let payers: Vec<&str> = rule
            .applicability
            .payers
            .as_ref()
            .expect("payers should be set")
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(payers, vec!["commercial", "medicare"]);
        assert!(rule
            .mutually_exclusive_with
            .contains(&RuleId::new("R-2").unwrap()));

        let ConditionNode::All(children) = &rule.condition else {
            panic!("expected all node");
        };
        assert_eq!(children.len(), 4);
        assert_eq!(
            children[1],
            ConditionNode::Compare {
                fact: "latest(hba1c)".into(),
                op: Comparator::Ge,
                value: 7.0,
                param: Some("hba1c_target".into()),
            }
        );
        assert!(matches!(
            &children[2],
            ConditionNode::Not(inner) if matches!(
                inner.as_ref(),
                ConditionNode::Equals { value: Scalar::Bool(true), .. }
            )
        ));
    }

    #[test]
    fn test_node_with_two_operators_is_rejected_with_path() {
        let pack = r#"
version: v1
title: Bad pack
published: 2024-01-01
rules:
  - id: R-1
    title: Two keys
    tier: 1
    severity: info
    topic: t
    intervention: i
    message: m
    citation: c
    effective_from: 2024-01-01
    condition:
      all:
        - present: t2dm
          known: age
"#;
        let err = GuidelinePack::parse_yaml(pack).expect_err("should reject ambiguous node");
        let paths: Vec<String> = err.issues().into_iter().map(|i| i.path).collect();
        assert_eq!(paths, vec!["rules[0].condition.all[0]".to_string()]);
    }

    #[test]
    fn test_empty_combinator_and_zero_tier_are_rejected() {
        let pack = r#"
version: v1
title: Bad pack
published: 2024-01-01
rules:
  - id: R-1
    title: Empty
    tier: 0
    severity: info
    topic: t
    intervention: i
    message: m
    citation: c
    effective_from: 2024-01-01
    effective_until: 2023-01-01
    condition:
      any: []
"#;
        let err = GuidelinePack::parse_yaml(pack).expect_err("should reject");
        let paths: Vec<String> = err.issues().into_iter().map(|i| i.path).collect();
        assert!(paths.contains(&"rules[0].tier".to_string()));
        assert!(paths.contains(&"rules[0].effective_until".to_string()));
        assert!(paths.contains(&"rules[0].condition.any".to_string()));
    }

    #[test]
    fn test_unknown_rule_key_is_schema_error() {
        let pack = r#"
version: v1
title: Bad pack
published: 2024-01-01
rules:
  - id: R-1
    title: Extra
    tier: 1
    severity: info
    topic: t
    intervention: i
    message: m
    citation: c
    effective_from: 2024-01-01
    priority: 3
    condition:
      present: t2dm
"#;
        assert!(matches!(
            GuidelinePack::parse_yaml(pack),
            Err(WireError::Schema { .. })
        ));
    }

    #[test]
    fn test_comparator_apply() {
        assert!(Comparator::Ge.apply(7.0, 7.0));
        assert!(!Comparator::Gt.apply(7.0, 7.0));
        assert!(Comparator::Lt.apply(6.9, 7.0));
        assert!(Comparator::Eq.apply(1.0, 1.0));
        assert_eq!(Comparator::Le.to_string(), "<=");
    }
}
