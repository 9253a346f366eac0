//! Conflict resolution among firing rules.
//!
//! Resolution runs in two passes over the rules whose conditions held:
//!
//! 1. Supersession. A firing rule superseded (directly or through a chain) by another firing
//!    rule is suppressed. The suppressor recorded is the lowest (tier, id) superseding rule that
//!    is not itself superseded by a firing rule.
//! 2. Exclusivity. The remaining rules are visited in (tier, id) order. A rule is suppressed by
//!    an already accepted rule that is `exclusive` in a lower tier with the same topic, or that
//!    sits in the same tier and is declared mutually exclusive with it. Otherwise it is accepted.
//!
//! Only accepted rules suppress in the second pass, so the outcome depends on the set of firing
//! rules and never on the order they are supplied in.

use crate::resolver::{EffectiveRule, EffectiveRuleSet};
use cds_types::RuleId;
use std::collections::{BTreeMap, BTreeSet};

/// An accepted rule and the rules it suppressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accepted {
    pub rule_id: RuleId,
    /// Sorted, unique.
    pub suppressed: Vec<RuleId>,
}

/// Outcome of conflict resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Accepted rules in (tier, id) order.
    pub accepted: Vec<Accepted>,
    /// Suppressed rule to the rule that suppressed it.
    pub suppressed_by: BTreeMap<RuleId, RuleId>,
}

impl Resolution {
    pub fn is_accepted(&self, rule: &RuleId) -> bool {
        self.accepted.iter().any(|a| &a.rule_id == rule)
    }
}

/// Resolves conflicts among `firing`, all of which must belong to `rules`.
///
/// Ids not present in `rules` are ignored.
pub fn resolve_conflicts(firing: &[RuleId], rules: &EffectiveRuleSet) -> Resolution {
    let guideline = rules.guideline();

    let mut firing: Vec<&EffectiveRule> = firing
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter_map(|id| rules.get(id))
        .collect();
    firing.sort_by(|a, b| (a.rule.tier, a.id()).cmp(&(b.rule.tier, b.id())));

    let superseded_by_firing = |loser: &RuleId| {
        firing
            .iter()
            .any(|winner| guideline.supersedes(winner.id(), loser))
    };

    let mut suppressed_by: BTreeMap<RuleId, RuleId> = BTreeMap::new();
    let mut survivors: Vec<&EffectiveRule> = Vec::new();
    for candidate in &firing {
        if !superseded_by_firing(candidate.id()) {
            survivors.push(*candidate);
            continue;
        }
        // Supersession is acyclic, so a top-level superseder always exists.
        let winner = firing.iter().find(|winner| {
            guideline.supersedes(winner.id(), candidate.id()) && !superseded_by_firing(winner.id())
        });
        if let Some(winner) = winner {
            suppressed_by.insert(candidate.id().clone(), winner.id().clone());
        }
    }

    let mut accepted: Vec<&EffectiveRule> = Vec::new();
    for candidate in survivors {
        let blocker = accepted.iter().find(|winner| {
            let exclusive_above = winner.rule.exclusive
                && winner.rule.tier < candidate.rule.tier
                && winner.rule.topic == candidate.rule.topic;
            let mutual = winner.rule.tier == candidate.rule.tier
                && guideline.mutually_exclusive(winner.id(), candidate.id());
            exclusive_above || mutual
        });
        match blocker {
            Some(winner) => {
                suppressed_by.insert(candidate.id().clone(), winner.id().clone());
            }
            None => accepted.push(candidate),
        }
    }

    for (loser, winner) in &suppressed_by {
        tracing::debug!(rule = %loser, by = %winner, "rule suppressed");
    }

    let accepted = accepted
        .into_iter()
        .map(|rule| Accepted {
            rule_id: rule.id().clone(),
            suppressed: suppressed_by
                .iter()
                .filter(|(_, winner)| *winner == rule.id())
                .map(|(loser, _)| loser.clone())
                .collect(),
        })
        .collect();

    Resolution {
        accepted,
        suppressed_by,
    }
}
