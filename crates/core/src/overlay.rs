//! Tenant overlays.
//!
//! An overlay may narrow where a rule applies and may move thresholds only in the direction
//! that widens the population a rule fires for. Anything else (disabling a rule flagged
//! `mandatory_safety`, restricting such a rule to certain payers, or moving a threshold the
//! other way) needs a signed safety override on the overlay.

use crate::rule::{sha256_hex, CompiledGuideline};
use crate::{CdsError, CdsResult};
use cds_types::{GuidelineVersionId, RuleId, TenantId};
use cds_wire::{OverlayDocument, SafetyOverride};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// A tenant overlay as held by the rule repository.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantOverlay {
    doc: OverlayDocument,
    digest: String,
}

impl TenantOverlay {
    pub fn from_document(doc: OverlayDocument) -> Self {
        let digest = sha256_hex(&canonical(&doc));
        Self { doc, digest }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.doc.tenant_id
    }

    pub fn version(&self) -> &str {
        self.doc.version.as_str()
    }

    pub fn guideline_version(&self) -> &GuidelineVersionId {
        &self.doc.guideline_version
    }

    /// SHA-256 over the canonical rendering of the overlay.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn safety_override(&self) -> Option<&SafetyOverride> {
        self.doc.safety_override.as_ref()
    }

    pub fn is_disabled(&self, rule: &RuleId) -> bool {
        self.doc.disabled_rules.contains(rule)
    }

    pub fn threshold_overrides(&self, rule: &RuleId) -> Option<&BTreeMap<String, f64>> {
        self.doc.threshold_overrides.get(rule)
    }

    pub fn payer_restriction(&self, rule: &RuleId) -> Option<&BTreeSet<String>> {
        self.doc.payer_restrictions.get(rule)
    }

    /// Checks the overlay against the guideline version it is applied to.
    ///
    /// # Errors
    ///
    /// - [`CdsError::MandatorySafetyRuleDisabled`] when a `mandatory_safety` rule is disabled
    ///   without a safety override
    /// - [`CdsError::InvalidOverlay`] when the overlay targets another guideline version, names
    ///   an unknown rule or parameter, or narrows a rule in a way that needs a safety override
    pub fn validate_against(&self, guideline: &CompiledGuideline) -> CdsResult<()> {
        let tenant = self.tenant();
        let invalid = |reason: String| CdsError::InvalidOverlay {
            tenant: tenant.clone(),
            reason,
        };
        let authorised = self.doc.safety_override.is_some();

        if self.guideline_version() != guideline.version() {
            return Err(invalid(format!(
                "overlay targets guideline version {} but was applied to {}",
                self.guideline_version(),
                guideline.version()
            )));
        }

        for rule_id in &self.doc.disabled_rules {
            let rule = guideline
                .rule(rule_id)
                .ok_or_else(|| invalid(format!("disables unknown rule {rule_id}")))?;
            if rule.mandatory_safety && !authorised {
                return Err(CdsError::MandatorySafetyRuleDisabled {
                    tenant: tenant.clone(),
                    rule: rule_id.clone(),
                });
            }
        }

        for (rule_id, overrides) in &self.doc.threshold_overrides {
            let rule = guideline
                .rule(rule_id)
                .ok_or_else(|| invalid(format!("overrides thresholds of unknown rule {rule_id}")))?;
            for (param, value) in overrides {
                let site = rule.parameters.get(param).ok_or_else(|| {
                    invalid(format!("rule {rule_id} has no threshold parameter '{param}'"))
                })?;
                if !site.widening.allows(site.value, *value) && !authorised {
                    return Err(invalid(format!(
                        "threshold '{param}' of rule {rule_id} moves from {} to {value}, narrowing the rule, without a safety override",
                        site.value
                    )));
                }
            }
        }

        for rule_id in self.doc.payer_restrictions.keys() {
            let rule = guideline
                .rule(rule_id)
                .ok_or_else(|| invalid(format!("restricts payers of unknown rule {rule_id}")))?;
            if rule.mandatory_safety && !authorised {
                return Err(invalid(format!(
                    "payer restriction on mandatory safety rule {rule_id} requires a safety override"
                )));
            }
        }

        Ok(())
    }
}

fn canonical(doc: &OverlayDocument) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}|{}|{}",
        doc.tenant_id, doc.version, doc.guideline_version
    );
    for rule in &doc.disabled_rules {
        let _ = writeln!(out, "disable|{rule}");
    }
    for (rule, params) in &doc.threshold_overrides {
        for (param, value) in params {
            let _ = writeln!(out, "threshold|{rule}|{param}={value}");
        }
    }
    for (rule, payers) in &doc.payer_restrictions {
        let payers: Vec<&str> = payers.iter().map(String::as_str).collect();
        let _ = writeln!(out, "payers|{rule}|{}", payers.join(","));
    }
    if let Some(signed) = &doc.safety_override {
        let _ = writeln!(
            out,
            "override|{}|{}|{}",
            signed.signed_by, signed.reason, signed.signed_on
        );
    }
    out
}
