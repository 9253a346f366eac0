//! # CDS Core
//!
//! Clinical guideline rule evaluation engine.
//!
//! This crate evaluates a structured patient record against a versioned set of guideline rules,
//! optionally narrowed by a tenant overlay, and produces a deterministic, cited list of
//! recommendations:
//! - Ontology normalization of source codes onto canonical concepts ([`ontology`])
//! - Typed, immutable facts derived from the record as of a date ([`facts`])
//! - Compiled predicate trees with three-valued evaluation ([`predicate`])
//! - Guideline compilation, tenant overlays and effective rule-set resolution ([`rule`],
//!   [`overlay`], [`resolver`], [`repository`])
//! - Conflict resolution and recommendation assembly ([`conflict`], [`assembler`])
//! - The evaluation service tying them together ([`engine`])
//!
//! **No transport or storage concerns**: configuration loading sits behind the traits in
//! [`provider`]; HTTP, authentication and persistence of results live outside this crate.

pub mod assembler;
pub mod config;
pub mod conflict;
pub mod constants;
pub mod engine;
pub mod error;
pub mod facts;
pub mod ontology;
pub mod overlay;
pub mod predicate;
pub mod provider;
pub mod repository;
pub mod resolver;
pub mod rule;
pub mod template;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use assembler::{Recommendation, Warning};
pub use config::CoreConfig;
pub use engine::{
    CancelSignal, CancellationToken, EvaluationResult, EvaluationService, RuleOutcome, RuleTrace,
};
pub use error::{CdsError, CdsResult};
pub use ontology::{MappingTable, Measurement, OntologyNormalizer, UnitMismatch};
pub use overlay::TenantOverlay;
pub use provider::{GuidelineConfigProvider, MappingTableProvider, TenantConfiguration};
pub use repository::{RepositorySnapshot, RuleRepository};
pub use resolver::{EffectiveRuleSet, EffectiveRuleSetCache};
pub use rule::CompiledGuideline;
