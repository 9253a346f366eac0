//! Guideline rules and compiled guideline versions.
//!
//! [`CompiledGuideline::compile`] is the single gate through which an authored guideline
//! version enters the engine. It rejects anything that could fail later: duplicate ids, leaf
//! type mismatches, bad message placeholders, dangling or cyclic supersession links and
//! inconsistent mutual-exclusion metadata. A compiled guideline is immutable and shared by
//! `Arc`. Concept references are checked separately against a mapping table with
//! [`CompiledGuideline::check_concepts`] before the version is published.

use crate::facts::FactRef;
use crate::ontology::MappingTable;
use crate::predicate::{Condition, ThresholdSite};
use crate::template::MessageTemplate;
use crate::{CdsError, CdsResult};
use cds_types::{GuidelineVersionId, NonEmptyText, RuleId};
use cds_wire::{
    Applicability, EvidenceLevel, GuidelineDocument, PregnancyApplicability, RuleDefinition,
    RuleSource, Severity,
};
use chrono::{Days, NaiveDate};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

/// A compiled, immutable guideline rule.
#[derive(Clone, Debug)]
pub struct GuidelineRule {
    pub id: RuleId,
    pub version: GuidelineVersionId,
    pub title: NonEmptyText,
    pub tier: u8,
    pub severity: Severity,
    pub topic: NonEmptyText,
    pub intervention: NonEmptyText,
    pub message: MessageTemplate,
    pub citation: NonEmptyText,
    pub evidence_level: Option<EvidenceLevel>,
    pub source: RuleSource,
    pub applicability: Applicability,
    pub supersedes: Option<RuleId>,
    pub mutually_exclusive_with: BTreeSet<RuleId>,
    pub exclusive: bool,
    pub mandatory_safety: bool,
    pub effective_from: NaiveDate,
    pub effective_until: Option<NaiveDate>,
    pub condition: Condition,
    /// Named thresholds of `condition` with their base values.
    pub parameters: BTreeMap<String, ThresholdSite>,
}

impl GuidelineRule {
    fn compile(version: &GuidelineVersionId, def: RuleDefinition) -> CdsResult<Self> {
        let invalid = |reason: String| CdsError::InvalidRule {
            rule: def.id.clone(),
            reason,
        };

        let condition = Condition::compile(&def.condition).map_err(&invalid)?;
        let parameters = condition.parameters();
        let message = MessageTemplate::parse(def.message.as_str()).map_err(&invalid)?;
        if let Some(param) = message
            .threshold_params()
            .find(|param| !parameters.contains_key(*param))
        {
            return Err(invalid(format!(
                "message refers to unknown threshold '{param}'"
            )));
        }
        if def.mutually_exclusive_with.contains(&def.id) {
            return Err(invalid("rule cannot be mutually exclusive with itself".into()));
        }

        Ok(Self {
            id: def.id.clone(),
            version: version.clone(),
            title: def.title,
            tier: def.tier,
            severity: def.severity,
            topic: def.topic,
            intervention: def.intervention,
            message,
            citation: def.citation,
            evidence_level: def.evidence_level,
            source: def.source,
            applicability: def.applicability,
            supersedes: def.supersedes,
            mutually_exclusive_with: def.mutually_exclusive_with,
            exclusive: def.exclusive,
            mandatory_safety: def.mandatory_safety,
            effective_from: def.effective_from,
            effective_until: def.effective_until,
            condition,
            parameters,
        })
    }

    /// True when the rule is in force on `date` (both window ends inclusive).
    pub fn in_force_on(&self, date: NaiveDate) -> bool {
        self.effective_from <= date && self.effective_until.map_or(true, |until| date <= until)
    }

    /// Canonical single-line rendering of everything that affects evaluation.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "{}|tier={}|severity={}|topic={}|intervention={}|exclusive={}|safety={}|from={}|until={}",
            self.id,
            self.tier,
            self.severity.as_str(),
            self.topic,
            self.intervention,
            self.exclusive,
            self.mandatory_safety,
            self.effective_from,
            self.effective_until
                .map_or_else(|| "-".to_string(), |d| d.to_string()),
        );
        let _ = write!(
            out,
            "|supersedes={}|mutex={}|applicability={}|message={}|citation={}|when={}",
            self.supersedes.as_ref().map_or("-", RuleId::as_str),
            self.mutually_exclusive_with
                .iter()
                .map(RuleId::as_str)
                .collect::<Vec<_>>()
                .join(","),
            render_applicability(&self.applicability),
            self.message.as_str(),
            self.citation,
            self.condition,
        );
        out
    }
}

pub(crate) fn render_applicability(applicability: &Applicability) -> String {
    let payers = applicability.payers.as_ref().map_or_else(
        || "*".to_string(),
        |set| set.iter().cloned().collect::<Vec<_>>().join(","),
    );
    let pregnancy = match applicability.pregnancy {
        PregnancyApplicability::Any => "any",
        PregnancyApplicability::Required => "required",
        PregnancyApplicability::Excluded => "excluded",
    };
    format!(
        "payers={payers};pregnancy={pregnancy};age={}..{};sex={}",
        applicability
            .min_age
            .map_or_else(String::new, |a| a.to_string()),
        applicability
            .max_age
            .map_or_else(String::new, |a| a.to_string()),
        applicability.sex.map_or("*", |s| s.as_str()),
    )
}

pub(crate) fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// A published guideline version, compiled and validated.
#[derive(Debug)]
pub struct CompiledGuideline {
    version: GuidelineVersionId,
    title: NonEmptyText,
    published: NaiveDate,
    rules: BTreeMap<RuleId, Arc<GuidelineRule>>,
    /// All rules each rule supersedes, directly or transitively.
    superseded: BTreeMap<RuleId, BTreeSet<RuleId>>,
    exclusions: BTreeSet<(RuleId, RuleId)>,
    /// Sorted dates on which the set of rules in force can change.
    boundaries: Vec<NaiveDate>,
    digest: String,
}

impl CompiledGuideline {
    /// Compiles and validates a guideline version.
    ///
    /// # Errors
    ///
    /// - [`CdsError::InvalidGuideline`] for an empty version or duplicate rule ids
    /// - [`CdsError::InvalidRule`] for a rule whose condition, message or links are invalid
    /// - [`CdsError::SupersessionCycle`] when supersession links form a cycle
    pub fn compile(doc: GuidelineDocument) -> CdsResult<Self> {
        let version = doc.version;
        if doc.rules.is_empty() {
            return Err(CdsError::InvalidGuideline {
                version,
                reason: "guideline version contains no rules".into(),
            });
        }

        let mut rules = BTreeMap::new();
        for def in doc.rules {
            if rules.contains_key(&def.id) {
                return Err(CdsError::InvalidGuideline {
                    version,
                    reason: format!("rule id {} is declared more than once", def.id),
                });
            }
            let rule = GuidelineRule::compile(&version, def)?;
            rules.insert(rule.id.clone(), Arc::new(rule));
        }

        let exclusions = mutual_exclusions(&rules)?;
        let superseded = supersession_closure(&version, &rules)?;

        let mut boundaries: Vec<NaiveDate> = rules
            .values()
            .flat_map(|rule| {
                let after_until = rule
                    .effective_until
                    .and_then(|until| until.checked_add_days(Days::new(1)));
                std::iter::once(rule.effective_from).chain(after_until)
            })
            .collect();
        boundaries.sort();
        boundaries.dedup();

        let mut canonical = format!("{version}\n");
        for rule in rules.values() {
            canonical.push_str(&rule.canonical());
            canonical.push('\n');
        }
        let digest = sha256_hex(&canonical);

        tracing::debug!(
            version = %version,
            rules = rules.len(),
            digest = %digest,
            "compiled guideline version"
        );

        Ok(Self {
            version,
            title: doc.title,
            published: doc.published,
            rules,
            superseded,
            exclusions,
            boundaries,
            digest,
        })
    }

    pub fn version(&self) -> &GuidelineVersionId {
        &self.version
    }

    pub fn title(&self) -> &str {
        self.title.as_str()
    }

    pub fn published(&self) -> NaiveDate {
        self.published
    }

    /// SHA-256 over the canonical rendering of every rule.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn rule(&self, id: &RuleId) -> Option<&Arc<GuidelineRule>> {
        self.rules.get(id)
    }

    /// Rules in id order.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<GuidelineRule>> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True when `winner` supersedes `loser` directly or through a chain.
    pub fn supersedes(&self, winner: &RuleId, loser: &RuleId) -> bool {
        self.superseded
            .get(winner)
            .is_some_and(|set| set.contains(loser))
    }

    /// Symmetric mutual-exclusion relation.
    pub fn mutually_exclusive(&self, a: &RuleId, b: &RuleId) -> bool {
        self.exclusions.contains(&(a.clone(), b.clone()))
    }

    /// Checks that every concept named by a condition or message exists in `table`.
    ///
    /// # Errors
    ///
    /// [`CdsError::InvalidRule`] naming the first rule, in id order, that refers to an unknown
    /// concept.
    pub fn check_concepts(&self, table: &MappingTable) -> CdsResult<()> {
        for rule in self.rules.values() {
            let mut concepts = rule.condition.concepts();
            concepts.extend(rule.message.facts().filter_map(FactRef::concept).cloned());
            if let Some(unknown) = concepts.iter().find(|c| !table.contains_concept(c)) {
                return Err(CdsError::InvalidRule {
                    rule: rule.id.clone(),
                    reason: format!(
                        "unknown concept '{unknown}' (mapping table {})",
                        table.version()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Index of the window containing `as_of`. Dates sharing a bucket see the same rules.
    pub fn as_of_bucket(&self, as_of: NaiveDate) -> usize {
        self.boundaries.partition_point(|boundary| *boundary <= as_of)
    }
}

fn mutual_exclusions(
    rules: &BTreeMap<RuleId, Arc<GuidelineRule>>,
) -> CdsResult<BTreeSet<(RuleId, RuleId)>> {
    let mut pairs = BTreeSet::new();
    for rule in rules.values() {
        for other_id in &rule.mutually_exclusive_with {
            let Some(other) = rules.get(other_id) else {
                return Err(CdsError::InvalidRule {
                    rule: rule.id.clone(),
                    reason: format!("mutually exclusive with unknown rule {other_id}"),
                });
            };
            if other.tier != rule.tier {
                return Err(CdsError::InvalidRule {
                    rule: rule.id.clone(),
                    reason: format!(
                        "mutually exclusive rule {other_id} is in tier {} but this rule is in tier {}",
                        other.tier, rule.tier
                    ),
                });
            }
            pairs.insert((rule.id.clone(), other_id.clone()));
            pairs.insert((other_id.clone(), rule.id.clone()));
        }
    }
    Ok(pairs)
}

fn supersession_closure(
    version: &GuidelineVersionId,
    rules: &BTreeMap<RuleId, Arc<GuidelineRule>>,
) -> CdsResult<BTreeMap<RuleId, BTreeSet<RuleId>>> {
    for rule in rules.values() {
        if let Some(target) = &rule.supersedes {
            if !rules.contains_key(target) {
                return Err(CdsError::InvalidRule {
                    rule: rule.id.clone(),
                    reason: format!("supersedes unknown rule {target}"),
                });
            }
        }
    }

    let mut closure = BTreeMap::new();
    for start in rules.keys() {
        let mut chain = vec![start.clone()];
        let mut reached = BTreeSet::new();
        let mut current = start;
        while let Some(next) = rules.get(current).and_then(|r| r.supersedes.as_ref()) {
            if next == start || chain.contains(next) {
                chain.push(next.clone());
                return Err(CdsError::SupersessionCycle {
                    version: version.clone(),
                    cycle: chain,
                });
            }
            chain.push(next.clone());
            reached.insert(next.clone());
            current = next;
        }
        closure.insert(start.clone(), reached);
    }
    Ok(closure)
}
