//! Rule condition compilation and evaluation.
//!
//! [`Condition::compile`] turns an authored [`ConditionNode`] into a closed, typed expression
//! tree. Every leaf is checked against the declared [`FactType`] of the fact it references, so a
//! compiled condition can only fail at evaluation time if the fact base itself is inconsistent.
//!
//! Evaluation uses three-valued logic. A leaf over an `Unknown` fact is unknown, `NOT unknown`
//! stays unknown, and a rule fires only when its whole condition is definitely true. Every child
//! of a combinator is evaluated, so the outcome never depends on child order.

use crate::facts::{FactBase, FactRef, FactType, FactValue};
use cds_types::ConceptId;
use cds_wire::{Comparator, ConditionNode, Scalar, Sex};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A numeric bound that tenant overlays may override by parameter name.
#[derive(Clone, Debug, PartialEq)]
pub struct Threshold {
    pub value: f64,
    pub param: Option<String>,
}

impl Threshold {
    fn new(value: f64, param: Option<String>) -> Result<Self, String> {
        if !value.is_finite() {
            return Err(format!("threshold {value} is not a finite number"));
        }
        if let Some(name) = &param {
            let valid = !name.is_empty()
                && name
                    .bytes()
                    .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_'));
            if !valid {
                return Err(format!(
                    "parameter name '{name}' must be lower-case alphanumeric or '_'"
                ));
            }
        }
        Ok(Self { value, param })
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Some(param) => write!(f, "{}[{param}]", self.value),
            None => write!(f, "{}", self.value),
        }
    }
}

/// Literal compared by an equality leaf, matching the fact's type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Literal {
    Flag(bool),
    Category(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Flag(b) => write!(f, "{b}"),
            Literal::Category(c) => write!(f, "'{c}'"),
        }
    }
}

/// A type-checked condition tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Present(ConceptId),
    Known(FactRef),
    Equals {
        fact: FactRef,
        value: Literal,
    },
    Compare {
        fact: FactRef,
        op: Comparator,
        threshold: Threshold,
    },
    Range {
        fact: FactRef,
        min: Option<Threshold>,
        max: Option<Threshold>,
    },
    Duration {
        fact: FactRef,
        op: Comparator,
        days: Threshold,
    },
    Trend {
        fact: FactRef,
        op: Comparator,
        delta: Threshold,
    },
}

/// Which way a threshold may move while only widening the set of patients the rule fires for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Widening {
    Lower,
    Higher,
    /// Equality bounds: any change is neither a superset nor a subset.
    Neither,
}

impl Widening {
    fn for_comparator(op: Comparator) -> Self {
        match op {
            Comparator::Gt | Comparator::Ge => Widening::Lower,
            Comparator::Lt | Comparator::Le => Widening::Higher,
            Comparator::Eq => Widening::Neither,
        }
    }

    fn negated(self) -> Self {
        match self {
            Widening::Lower => Widening::Higher,
            Widening::Higher => Widening::Lower,
            Widening::Neither => Widening::Neither,
        }
    }

    /// True when moving from `base` to `candidate` only widens the firing population.
    pub fn allows(self, base: f64, candidate: f64) -> bool {
        match self {
            Widening::Lower => candidate <= base,
            Widening::Higher => candidate >= base,
            Widening::Neither => candidate == base,
        }
    }
}

/// A named, overridable threshold as it appears in a compiled condition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdSite {
    pub value: f64,
    pub widening: Widening,
}

/// Raised when a compiled condition meets a fact of the wrong type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{detail}")]
pub struct EvaluationDefect {
    pub detail: String,
}

impl EvaluationDefect {
    fn mismatch(fact: &FactRef, expected: FactType, found: &FactValue) -> Self {
        let found = found
            .fact_type()
            .map_or_else(|| "unknown".to_string(), |t| t.to_string());
        Self {
            detail: format!("fact {fact} expected {expected} but was {found}"),
        }
    }
}

/// Kleene truth value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }
}

fn parse_fact(fact: &str, expected: &[FactType]) -> Result<FactRef, String> {
    let fact_ref: FactRef = fact.parse()?;
    let actual = fact_ref.fact_type();
    if !expected.contains(&actual) {
        let wanted: Vec<String> = expected.iter().map(ToString::to_string).collect();
        return Err(format!(
            "fact {fact_ref} is {actual} but this leaf requires {}",
            wanted.join(" or ")
        ));
    }
    Ok(fact_ref)
}

impl Condition {
    /// Type-checks an authored condition.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending leaf: an unknown fact, a leaf whose operator
    /// does not accept the fact's type, a malformed threshold, or a parameter name used twice.
    pub fn compile(node: &ConditionNode) -> Result<Condition, String> {
        let condition = Self::compile_node(node)?;
        let mut seen = BTreeSet::new();
        for threshold in condition.thresholds() {
            if let Some(param) = &threshold.param {
                if !seen.insert(param.clone()) {
                    return Err(format!("parameter '{param}' is used more than once"));
                }
            }
        }
        Ok(condition)
    }

    fn compile_node(node: &ConditionNode) -> Result<Condition, String> {
        Ok(match node {
            ConditionNode::All(children) => Condition::All(Self::compile_children(children)?),
            ConditionNode::Any(children) => Condition::Any(Self::compile_children(children)?),
            ConditionNode::Not(child) => Condition::Not(Box::new(Self::compile_node(child)?)),
            ConditionNode::Present(concept) => Condition::Present(concept.clone()),
            ConditionNode::Known { fact } => Condition::Known(fact.parse()?),
            ConditionNode::Equals { fact, value } => {
                let fact = parse_fact(fact, &[FactType::Flag, FactType::Category])?;
                let literal = match (fact.fact_type(), value) {
                    (FactType::Flag, Scalar::Bool(b)) => Literal::Flag(*b),
                    (FactType::Category, Scalar::Text(text)) => {
                        Literal::Category(category_literal(&fact, text)?)
                    }
                    (ty, other) => {
                        return Err(format!("fact {fact} is {ty} and cannot equal {other}"))
                    }
                };
                Condition::Equals {
                    fact,
                    value: literal,
                }
            }
            ConditionNode::Compare {
                fact,
                op,
                value,
                param,
            } => Condition::Compare {
                fact: parse_fact(fact, &[FactType::Numeric])?,
                op: *op,
                threshold: Threshold::new(*value, param.clone())?,
            },
            ConditionNode::Range {
                fact,
                min,
                max,
                min_param,
                max_param,
            } => {
                let fact = parse_fact(fact, &[FactType::Numeric])?;
                let min = bound(*min, min_param, "min")?;
                let max = bound(*max, max_param, "max")?;
                match (&min, &max) {
                    (None, None) => return Err(format!("range over {fact} has no bounds")),
                    (Some(lo), Some(hi)) if lo.value > hi.value => {
                        return Err(format!(
                            "range over {fact} has min {} above max {}",
                            lo.value, hi.value
                        ))
                    }
                    _ => {}
                }
                Condition::Range { fact, min, max }
            }
            ConditionNode::Duration {
                fact,
                op,
                days,
                param,
            } => Condition::Duration {
                fact: parse_fact(fact, &[FactType::Duration])?,
                op: *op,
                days: Threshold::new(*days as f64, param.clone())?,
            },
            ConditionNode::Trend {
                fact,
                op,
                delta,
                param,
            } => Condition::Trend {
                fact: parse_fact(fact, &[FactType::Trend])?,
                op: *op,
                delta: Threshold::new(*delta, param.clone())?,
            },
        })
    }

    fn compile_children(children: &[ConditionNode]) -> Result<Vec<Condition>, String> {
        if children.is_empty() {
            return Err("combinator requires at least one child".into());
        }
        children.iter().map(Self::compile_node).collect()
    }

    /// Every threshold in the tree, depth first.
    pub fn thresholds(&self) -> Vec<&Threshold> {
        let mut out = Vec::new();
        self.visit_thresholds(false, &mut |threshold, _| out.push(threshold));
        out
    }

    /// Named thresholds with the direction in which each may move without narrowing the rule.
    pub fn parameters(&self) -> BTreeMap<String, ThresholdSite> {
        let mut out = BTreeMap::new();
        self.visit_thresholds(false, &mut |threshold, widening| {
            if let Some(param) = &threshold.param {
                out.insert(
                    param.clone(),
                    ThresholdSite {
                        value: threshold.value,
                        widening,
                    },
                );
            }
        });
        out
    }

    fn visit_thresholds<'a>(
        &'a self,
        negated: bool,
        visit: &mut dyn FnMut(&'a Threshold, Widening),
    ) {
        let orient = |w: Widening| if negated { w.negated() } else { w };
        match self {
            Condition::All(children) | Condition::Any(children) => {
                for child in children {
                    child.visit_thresholds(negated, visit);
                }
            }
            Condition::Not(child) => child.visit_thresholds(!negated, visit),
            Condition::Present(_) | Condition::Known(_) | Condition::Equals { .. } => {}
            Condition::Compare { op, threshold, .. } => {
                visit(threshold, orient(Widening::for_comparator(*op)))
            }
            Condition::Duration { op, days, .. } => {
                visit(days, orient(Widening::for_comparator(*op)))
            }
            Condition::Trend { op, delta, .. } => {
                visit(delta, orient(Widening::for_comparator(*op)))
            }
            Condition::Range { min, max, .. } => {
                if let Some(min) = min {
                    visit(min, orient(Widening::Lower));
                }
                if let Some(max) = max {
                    visit(max, orient(Widening::Higher));
                }
            }
        }
    }

    /// A copy of this condition with named thresholds replaced by `overrides`.
    pub fn with_thresholds(&self, overrides: &BTreeMap<String, f64>) -> Condition {
        let mut copy = self.clone();
        copy.substitute(overrides);
        copy
    }

    fn substitute(&mut self, overrides: &BTreeMap<String, f64>) {
        let apply = |threshold: &mut Threshold| {
            if let Some(value) = threshold.param.as_ref().and_then(|p| overrides.get(p)) {
                threshold.value = *value;
            }
        };
        match self {
            Condition::All(children) | Condition::Any(children) => {
                for child in children {
                    child.substitute(overrides);
                }
            }
            Condition::Not(child) => child.substitute(overrides),
            Condition::Present(_) | Condition::Known(_) | Condition::Equals { .. } => {}
            Condition::Compare { threshold, .. } => apply(threshold),
            Condition::Duration { days, .. } => apply(days),
            Condition::Trend { delta, .. } => apply(delta),
            Condition::Range { min, max, .. } => {
                if let Some(min) = min {
                    apply(min);
                }
                if let Some(max) = max {
                    apply(max);
                }
            }
        }
    }

    /// Every fact the condition reads.
    pub fn facts(&self) -> BTreeSet<FactRef> {
        let mut out = BTreeSet::new();
        self.collect_facts(&mut out);
        out
    }

    /// Every concept the condition names, through `present` leaves or fact arguments.
    pub fn concepts(&self) -> BTreeSet<ConceptId> {
        self.facts()
            .iter()
            .filter_map(FactRef::concept)
            .cloned()
            .collect()
    }

    fn collect_facts(&self, out: &mut BTreeSet<FactRef>) {
        match self {
            Condition::All(children) | Condition::Any(children) => {
                for child in children {
                    child.collect_facts(out);
                }
            }
            Condition::Not(child) => child.collect_facts(out),
            Condition::Present(concept) => {
                out.insert(FactRef::Present(concept.clone()));
            }
            Condition::Known(fact)
            | Condition::Equals { fact, .. }
            | Condition::Compare { fact, .. }
            | Condition::Range { fact, .. }
            | Condition::Duration { fact, .. }
            | Condition::Trend { fact, .. } => {
                out.insert(fact.clone());
            }
        }
    }
}

fn bound(value: Option<f64>, param: &Option<String>, side: &str) -> Result<Option<Threshold>, String> {
    match (value, param) {
        (Some(v), param) => Threshold::new(v, param.clone()).map(Some),
        (None, Some(p)) => Err(format!("{side}_param '{p}' given without a {side} value")),
        (None, None) => Ok(None),
    }
}

fn category_literal(fact: &FactRef, text: &str) -> Result<String, String> {
    match fact {
        FactRef::Sex => text.parse::<Sex>().map(|s| s.as_str().to_string()),
        _ => {
            let value = text.trim().to_ascii_lowercase();
            if value.is_empty() {
                Err(format!("fact {fact} cannot equal an empty value"))
            } else {
                Ok(value)
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, name: &str, children: &[Condition]) -> fmt::Result {
            write!(f, "{name}(")?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{child}")?;
            }
            f.write_str(")")
        }

        match self {
            Condition::All(children) => list(f, "all", children),
            Condition::Any(children) => list(f, "any", children),
            Condition::Not(child) => write!(f, "not({child})"),
            Condition::Present(concept) => write!(f, "present({concept})"),
            Condition::Known(fact) => write!(f, "known({fact})"),
            Condition::Equals { fact, value } => write!(f, "{fact} == {value}"),
            Condition::Compare {
                fact,
                op,
                threshold,
            } => write!(f, "{fact} {op} {threshold}"),
            Condition::Range { fact, min, max } => {
                f.write_str("range(")?;
                write!(f, "{fact}")?;
                if let Some(min) = min {
                    write!(f, ", min {min}")?;
                }
                if let Some(max) = max {
                    write!(f, ", max {max}")?;
                }
                f.write_str(")")
            }
            Condition::Duration { fact, op, days } => write!(f, "{fact} {op} {days}d"),
            Condition::Trend { fact, op, delta } => write!(f, "{fact} {op} {delta}"),
        }
    }
}

/// Evaluates `condition`; true only when the condition is definitely satisfied.
///
/// # Errors
///
/// Returns an [`EvaluationDefect`] if a fact has a different type than its leaf was compiled
/// for. Compilation rules this out for facts built by [`FactBase::build`].
pub fn evaluate(condition: &Condition, facts: &FactBase) -> Result<bool, EvaluationDefect> {
    Ok(eval(condition, facts)? == Truth::True)
}

fn eval(condition: &Condition, facts: &FactBase) -> Result<Truth, EvaluationDefect> {
    match condition {
        Condition::All(children) => {
            let values = children
                .iter()
                .map(|c| eval(c, facts))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if values.contains(&Truth::False) {
                Truth::False
            } else if values.contains(&Truth::Unknown) {
                Truth::Unknown
            } else {
                Truth::True
            })
        }
        Condition::Any(children) => {
            let values = children
                .iter()
                .map(|c| eval(c, facts))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if values.contains(&Truth::True) {
                Truth::True
            } else if values.contains(&Truth::Unknown) {
                Truth::Unknown
            } else {
                Truth::False
            })
        }
        Condition::Not(child) => Ok(match eval(child, facts)? {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }),
        Condition::Present(concept) => {
            let fact = FactRef::Present(concept.clone());
            match facts.value(&fact) {
                FactValue::Flag(b) => Ok(Truth::from_bool(b)),
                other => Err(EvaluationDefect::mismatch(&fact, FactType::Flag, &other)),
            }
        }
        Condition::Known(fact) => Ok(Truth::from_bool(facts.value(fact).is_known())),
        Condition::Equals { fact, value } => match (facts.value(fact), value) {
            (FactValue::Unknown, _) => Ok(Truth::Unknown),
            (FactValue::Flag(actual), Literal::Flag(expected)) => {
                Ok(Truth::from_bool(actual == *expected))
            }
            (FactValue::Category(actual), Literal::Category(expected)) => {
                Ok(Truth::from_bool(actual.eq_ignore_ascii_case(expected)))
            }
            (other, Literal::Flag(_)) => {
                Err(EvaluationDefect::mismatch(fact, FactType::Flag, &other))
            }
            (other, Literal::Category(_)) => {
                Err(EvaluationDefect::mismatch(fact, FactType::Category, &other))
            }
        },
        Condition::Compare {
            fact,
            op,
            threshold,
        } => numeric(fact, facts).map(|v| match v {
            Some(v) => Truth::from_bool(op.apply(v, threshold.value)),
            None => Truth::Unknown,
        }),
        Condition::Range { fact, min, max } => numeric(fact, facts).map(|v| match v {
            Some(v) => Truth::from_bool(
                min.as_ref().map_or(true, |lo| v >= lo.value)
                    && max.as_ref().map_or(true, |hi| v <= hi.value),
            ),
            None => Truth::Unknown,
        }),
        Condition::Duration { fact, op, days } => match facts.value(fact) {
            FactValue::Unknown => Ok(Truth::Unknown),
            FactValue::Duration(d) => Ok(Truth::from_bool(op.apply(d as f64, days.value))),
            other => Err(EvaluationDefect::mismatch(fact, FactType::Duration, &other)),
        },
        Condition::Trend { fact, op, delta } => match facts.value(fact) {
            FactValue::Unknown => Ok(Truth::Unknown),
            FactValue::Trend { delta: actual, .. } => {
                Ok(Truth::from_bool(op.apply(actual, delta.value)))
            }
            other => Err(EvaluationDefect::mismatch(fact, FactType::Trend, &other)),
        },
    }
}

fn numeric(fact: &FactRef, facts: &FactBase) -> Result<Option<f64>, EvaluationDefect> {
    match facts.value(fact) {
        FactValue::Unknown => Ok(None),
        FactValue::Numeric { value, .. } => Ok(Some(value)),
        other => Err(EvaluationDefect::mismatch(fact, FactType::Numeric, &other)),
    }
}
