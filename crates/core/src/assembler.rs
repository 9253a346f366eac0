//! Recommendation assembly.
//!
//! Turns the accepted rules of a [`Resolution`] into the output contract: one
//! [`Recommendation`] per accepted rule, message rendered against the patient's facts and the
//! effective thresholds, and a separate advisory list of [`Warning`]s.

use crate::conflict::Resolution;
use crate::facts::FactBase;
use crate::resolver::EffectiveRuleSet;
use cds_types::{ConceptId, GuidelineVersionId, RuleId, SourceCode, TenantId};
use cds_wire::{EvidenceLevel, RuleSource, Severity};
use serde::Serialize;

/// A non-fatal advisory. Never a recommendation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A clinical code with no mapping; evaluation continued without it.
    UnmappedCode { field: String, code: SourceCode },
    /// A lab result whose unit cannot be converted; its value was not used.
    UnitMismatch {
        field: String,
        concept: ConceptId,
        unit: String,
        expected_unit: String,
    },
    /// The tenant has no overlay; the base guideline version was used.
    OverlayMissing {
        tenant: TenantId,
        guideline_version: GuidelineVersionId,
    },
    /// Valid but implausible data.
    DataQuality { path: String, message: String },
}

/// One emitted recommendation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recommendation {
    pub rule_id: RuleId,
    pub severity: Severity,
    pub tier: u8,
    pub title: String,
    pub topic: String,
    pub intervention: String,
    pub message: String,
    pub citation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_level: Option<EvidenceLevel>,
    pub source: RuleSource,
    pub suppressed_rule_ids: Vec<RuleId>,
}

/// Renders accepted rules and collects warnings.
///
/// Recommendations follow the resolution order, (tier, id). Warnings are `fallback_warnings`
/// followed by one [`Warning::UnmappedCode`] per unmapped code and one [`Warning::UnitMismatch`]
/// per unusable lab unit in the fact base.
pub fn assemble(
    resolution: &Resolution,
    rules: &EffectiveRuleSet,
    facts: &FactBase,
    fallback_warnings: Vec<Warning>,
) -> (Vec<Recommendation>, Vec<Warning>) {
    let recommendations = resolution
        .accepted
        .iter()
        .filter_map(|accepted| {
            let effective = rules.get(&accepted.rule_id)?;
            let rule = &effective.rule;
            Some(Recommendation {
                rule_id: rule.id.clone(),
                severity: rule.severity,
                tier: rule.tier,
                title: rule.title.to_string(),
                topic: rule.topic.to_string(),
                intervention: rule.intervention.to_string(),
                message: rule.message.render(facts, &effective.thresholds),
                citation: rule.citation.to_string(),
                evidence_level: rule.evidence_level,
                source: rule.source,
                suppressed_rule_ids: accepted.suppressed.clone(),
            })
        })
        .collect();

    let mut warnings = fallback_warnings;
    warnings.extend(facts.unmapped().iter().map(|unmapped| Warning::UnmappedCode {
        field: unmapped.field.clone(),
        code: unmapped.code.clone(),
    }));
    warnings.extend(
        facts
            .unit_mismatches()
            .iter()
            .map(|mismatch| Warning::UnitMismatch {
                field: mismatch.field.clone(),
                concept: mismatch.concept.clone(),
                unit: mismatch.unit.clone(),
                expected_unit: mismatch.expected_unit.clone(),
            }),
    );

    (recommendations, warnings)
}
