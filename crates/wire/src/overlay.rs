//! Tenant overlay wire models and translation helpers.
//!
//! An overlay narrows a guideline version for one tenant:
//!
//! ```yaml
//! tenant_id: clinic_001
//! version: "3"
//! guideline_version: ada-2024
//! disabled_rules: [ADA-12.EYE-EXAM]
//! threshold_overrides:
//!   ADA-6.HBA1C-MONITORING:
//!     hba1c_recency_days: 60
//! payer_restrictions:
//!   ADA-7.CGM-INSULIN: [medicare, commercial]
//! safety_override:
//!   signed_by: Dr A. Example
//!   reason: Local protocol approved by committee
//!   signed_on: 2024-01-05
//! ```
//!
//! Structural validity is checked here. Whether the overlay is allowed against a given guideline
//! version (unknown rules, loosened thresholds, mandatory safety rules) is decided by the engine.

use crate::{from_yaml, Issues, WireError, WireResult};
use cds_types::{GuidelineVersionId, NonEmptyText, RuleId, TenantId};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

const DOCUMENT: &str = "tenant overlay";

/// Signed authorisation allowing an overlay to loosen or disable safety-relevant rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SafetyOverride {
    pub signed_by: NonEmptyText,
    pub reason: NonEmptyText,
    pub signed_on: NaiveDate,
}

/// A tenant overlay as authored.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayDocument {
    pub tenant_id: TenantId,
    /// Overlay revision; part of the effective rule-set cache key.
    pub version: NonEmptyText,
    /// Guideline version the overlay was written against.
    pub guideline_version: GuidelineVersionId,
    pub disabled_rules: BTreeSet<RuleId>,
    pub threshold_overrides: BTreeMap<RuleId, BTreeMap<String, f64>>,
    /// Lower-cased payer names each rule is additionally restricted to.
    pub payer_restrictions: BTreeMap<RuleId, BTreeSet<String>>,
    pub safety_override: Option<SafetyOverride>,
}

/// Tenant overlay file operations.
///
/// This is a zero-sized type used for namespacing overlay parsing. All methods are associated
/// functions.
pub struct TenantOverlayFile;

impl TenantOverlayFile {
    /// Parse a tenant overlay from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Schema`] for structural mismatches and [`WireError::InvalidFields`]
    /// listing every invalid identifier, non-finite threshold or empty payer restriction.
    pub fn parse_yaml(yaml_text: &str) -> WireResult<OverlayDocument> {
        let wire: OverlayWire = from_yaml(DOCUMENT, yaml_text)?;
        wire_to_domain(wire)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverlayWire {
    tenant_id: String,
    version: String,
    guideline_version: String,
    #[serde(default)]
    disabled_rules: Vec<String>,
    #[serde(default)]
    threshold_overrides: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    payer_restrictions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    safety_override: Option<SafetyOverrideWire>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SafetyOverrideWire {
    signed_by: String,
    reason: String,
    signed_on: NaiveDate,
}

fn wire_to_domain(wire: OverlayWire) -> WireResult<OverlayDocument> {
    let mut issues = Issues::default();

    let tenant_id = issues.check("tenant_id", TenantId::new(&wire.tenant_id));
    let version = issues.check("version", NonEmptyText::new(&wire.version));
    let guideline_version = issues.check(
        "guideline_version",
        GuidelineVersionId::new(&wire.guideline_version),
    );

    let mut disabled_rules = BTreeSet::new();
    for (i, raw) in wire.disabled_rules.iter().enumerate() {
        if let Some(id) = issues.check(format!("disabled_rules[{i}]"), RuleId::new(raw)) {
            disabled_rules.insert(id);
        }
    }

    let mut threshold_overrides = BTreeMap::new();
    for (raw_rule, params) in wire.threshold_overrides {
        let path = format!("threshold_overrides.{raw_rule}");
        let Some(rule) = issues.check(path.as_str(), RuleId::new(&raw_rule)) else {
            continue;
        };
        if params.is_empty() {
            issues.push(path.as_str(), "at least one parameter override is required");
        }
        for (param, value) in &params {
            if !value.is_finite() {
                issues.push(format!("{path}.{param}"), "threshold must be a finite number");
            }
        }
        threshold_overrides.insert(rule, params);
    }

    let mut payer_restrictions = BTreeMap::new();
    for (raw_rule, payers) in wire.payer_restrictions {
        let path = format!("payer_restrictions.{raw_rule}");
        let Some(rule) = issues.check(path.as_str(), RuleId::new(&raw_rule)) else {
            continue;
        };
        let payers: BTreeSet<String> = payers
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if payers.is_empty() {
            issues.push(path.as_str(), "payer restriction cannot be empty");
        }
        payer_restrictions.insert(rule, payers);
    }

    let safety_override = wire.safety_override.and_then(|raw| {
        let signed_by = issues.check(
            "safety_override.signed_by",
            NonEmptyText::new(&raw.signed_by),
        );
        let reason = issues.check("safety_override.reason", NonEmptyText::new(&raw.reason));
        Some(SafetyOverride {
            signed_by: signed_by?,
            reason: reason?,
            signed_on: raw.signed_on,
        })
    });

    issues.finish(DOCUMENT)?;

    let (Some(tenant_id), Some(version), Some(guideline_version)) =
        (tenant_id, version, guideline_version)
    else {
        return Err(WireError::InvalidInput(
            "tenant overlay could not be translated".into(),
        ));
    };

    Ok(OverlayDocument {
        tenant_id,
        version,
        guideline_version,
        disabled_rules,
        threshold_overrides,
        payer_restrictions,
        safety_override,
    })
}
