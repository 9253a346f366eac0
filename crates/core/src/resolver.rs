//! Effective rule-set resolution.
//!
//! [`resolve`] merges a guideline version with an optional tenant overlay as of a date:
//! rules outside their effective window are dropped, disabled rules are removed, threshold
//! overrides are substituted into a copy of the rule's condition, and overlay payer
//! restrictions are intersected with the rule's own payer set. Base rules are never modified.
//!
//! [`EffectiveRuleSetCache`] memoises results per (guideline, tenant, overlay revision, as-of
//! bucket). Cached sets are immutable and shared by `Arc`.

use crate::facts::FactBase;
use crate::overlay::TenantOverlay;
use crate::predicate::Condition;
use crate::rule::{render_applicability, sha256_hex, CompiledGuideline, GuidelineRule};
use crate::CdsResult;
use cds_types::{GuidelineVersionId, RuleId, TenantId};
use cds_wire::{Applicability, PregnancyApplicability};
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// A rule as it applies for one tenant.
#[derive(Clone, Debug)]
pub struct EffectiveRule {
    pub rule: Arc<GuidelineRule>,
    /// The rule's condition with overlay thresholds substituted.
    pub condition: Condition,
    /// Effective value of every named threshold.
    pub thresholds: BTreeMap<String, f64>,
    /// Applicability after overlay payer restrictions.
    pub applicability: Applicability,
}

impl EffectiveRule {
    pub fn id(&self) -> &RuleId {
        &self.rule.id
    }

    /// Checks the rule's population constraints against the patient.
    ///
    /// Returns the reason the rule does not apply, if any.
    pub fn not_applicable_reason(&self, facts: &FactBase) -> Option<String> {
        let constraints = &self.applicability;

        if let Some(payers) = &constraints.payers {
            match facts.payer() {
                None => return Some("no payer recorded".into()),
                Some(payer) if !payers.contains(payer) => {
                    return Some(format!("payer '{payer}' is not covered"))
                }
                Some(_) => {}
            }
        }
        match constraints.pregnancy {
            PregnancyApplicability::Required if !facts.pregnant() => {
                return Some("applies only during pregnancy".into())
            }
            PregnancyApplicability::Excluded if facts.pregnant() => {
                return Some("excluded during pregnancy".into())
            }
            _ => {}
        }
        if let Some(min) = constraints.min_age {
            if facts.age() < min {
                return Some(format!("age {} is below {min}", facts.age()));
            }
        }
        if let Some(max) = constraints.max_age {
            if facts.age() > max {
                return Some(format!("age {} is above {max}", facts.age()));
            }
        }
        if let Some(sex) = constraints.sex {
            if facts.sex() != sex {
                return Some(format!("applies only to {sex} patients"));
            }
        }
        None
    }

    fn canonical(&self) -> String {
        let thresholds: Vec<String> = self
            .thresholds
            .iter()
            .map(|(param, value)| format!("{param}={value}"))
            .collect();
        format!(
            "{}|effective_when={}|thresholds={}|effective_applicability={}",
            self.rule.canonical(),
            self.condition,
            thresholds.join(","),
            render_applicability(&self.applicability)
        )
    }
}

/// The materialized merge of a guideline version and a tenant overlay for one as-of bucket.
#[derive(Debug)]
pub struct EffectiveRuleSet {
    guideline: Arc<CompiledGuideline>,
    tenant: Option<TenantId>,
    overlay_version: Option<String>,
    as_of_bucket: usize,
    /// Ordered by (tier, rule id).
    rules: Vec<EffectiveRule>,
    index: BTreeMap<RuleId, usize>,
    digest: String,
}

impl EffectiveRuleSet {
    pub fn guideline(&self) -> &CompiledGuideline {
        &self.guideline
    }

    pub fn guideline_version(&self) -> &GuidelineVersionId {
        self.guideline.version()
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    pub fn overlay_version(&self) -> Option<&str> {
        self.overlay_version.as_deref()
    }

    pub fn as_of_bucket(&self) -> usize {
        self.as_of_bucket
    }

    /// SHA-256 over the canonical rendering of the effective rules.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Rules in (tier, id) order.
    pub fn rules(&self) -> &[EffectiveRule] {
        &self.rules
    }

    pub fn get(&self, id: &RuleId) -> Option<&EffectiveRule> {
        self.index.get(id).map(|i| &self.rules[*i])
    }

    pub fn contains(&self, id: &RuleId) -> bool {
        self.index.contains_key(id)
    }
}

/// Resolves the effective rule set for `guideline` and `overlay` as of `as_of`.
///
/// The overlay is validated again here, so a configuration that became invalid can never be
/// resolved.
///
/// # Errors
///
/// Returns the validation error of the overlay, see [`TenantOverlay::validate_against`].
pub fn resolve(
    guideline: &Arc<CompiledGuideline>,
    overlay: Option<&TenantOverlay>,
    as_of: NaiveDate,
) -> CdsResult<EffectiveRuleSet> {
    if let Some(overlay) = overlay {
        if let Err(err) = overlay.validate_against(guideline) {
            tracing::warn!(
                tenant = %overlay.tenant(),
                error = %err,
                "rejecting tenant overlay at resolution"
            );
            return Err(err);
        }
    }

    let mut rules: Vec<EffectiveRule> = Vec::new();
    for rule in guideline.rules() {
        if !rule.in_force_on(as_of) {
            continue;
        }
        if overlay.is_some_and(|o| o.is_disabled(&rule.id)) {
            continue;
        }

        let overrides = overlay.and_then(|o| o.threshold_overrides(&rule.id));
        let condition = match overrides {
            Some(overrides) => rule.condition.with_thresholds(overrides),
            None => rule.condition.clone(),
        };
        let thresholds = condition
            .parameters()
            .into_iter()
            .map(|(param, site)| (param, site.value))
            .collect();

        let mut applicability = rule.applicability.clone();
        if let Some(restriction) = overlay.and_then(|o| o.payer_restriction(&rule.id)) {
            applicability.payers = Some(match applicability.payers {
                Some(own) => own.intersection(restriction).cloned().collect(),
                None => restriction.clone(),
            });
        }

        rules.push(EffectiveRule {
            rule: Arc::clone(rule),
            condition,
            thresholds,
            applicability,
        });
    }
    rules.sort_by(|a, b| (a.rule.tier, &a.rule.id).cmp(&(b.rule.tier, &b.rule.id)));

    let index = rules
        .iter()
        .enumerate()
        .map(|(i, rule)| (rule.id().clone(), i))
        .collect();

    let mut canonical = format!(
        "{}|{}|{}\n",
        guideline.version(),
        overlay.map_or("-", |o| o.tenant().as_str()),
        overlay.map_or("-", |o| o.version()),
    );
    for rule in &rules {
        canonical.push_str(&rule.canonical());
        canonical.push('\n');
    }

    Ok(EffectiveRuleSet {
        guideline: Arc::clone(guideline),
        tenant: overlay.map(|o| o.tenant().clone()),
        overlay_version: overlay.map(|o| o.version().to_string()),
        as_of_bucket: guideline.as_of_bucket(as_of),
        rules,
        index,
        digest: sha256_hex(&canonical),
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    guideline_version: GuidelineVersionId,
    guideline_digest: String,
    overlay: Option<(TenantId, String, String)>,
    as_of_bucket: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<EffectiveRuleSet>>,
    order: VecDeque<CacheKey>,
}

/// Bounded cache of resolved rule sets, evicting the oldest entry first.
#[derive(Debug)]
pub struct EffectiveRuleSetCache {
    capacity: usize,
    state: RwLock<CacheState>,
}

impl EffectiveRuleSetCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached set for this configuration and date, resolving it on a miss.
    pub fn get_or_resolve(
        &self,
        guideline: &Arc<CompiledGuideline>,
        overlay: Option<&TenantOverlay>,
        as_of: NaiveDate,
    ) -> CdsResult<Arc<EffectiveRuleSet>> {
        let key = CacheKey {
            guideline_version: guideline.version().clone(),
            guideline_digest: guideline.digest().to_string(),
            overlay: overlay.map(|o| {
                (
                    o.tenant().clone(),
                    o.version().to_string(),
                    o.digest().to_string(),
                )
            }),
            as_of_bucket: guideline.as_of_bucket(as_of),
        };

        if let Some(hit) = self.state.read().entries.get(&key) {
            return Ok(Arc::clone(hit));
        }

        let resolved = Arc::new(resolve(guideline, overlay, as_of)?);

        let mut state = self.state.write();
        if let Some(raced) = state.entries.get(&key) {
            return Ok(Arc::clone(raced));
        }
        while state.entries.len() >= self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
        state.order.push_back(key.clone());
        state.entries.insert(key, Arc::clone(&resolved));
        tracing::debug!(
            version = %guideline.version(),
            tenant = overlay.map_or("-", |o| o.tenant().as_str()),
            rules = resolved.rules().len(),
            "cached effective rule set"
        );
        Ok(resolved)
    }
}
