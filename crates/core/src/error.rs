use cds_types::{join_issues, FieldIssue, GuidelineVersionId, RuleId, TenantId};
use cds_wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum CdsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("patient record failed validation: {}", join_issues(.issues))]
    InvalidRecord { issues: Vec<FieldIssue> },

    #[error("rule {rule} is invalid: {reason}")]
    InvalidRule { rule: RuleId, reason: String },
    #[error("guideline version {version} is invalid: {reason}")]
    InvalidGuideline {
        version: GuidelineVersionId,
        reason: String,
    },
    #[error("guideline version {version} has a supersession cycle: {}", render_cycle(.cycle))]
    SupersessionCycle {
        version: GuidelineVersionId,
        cycle: Vec<RuleId>,
    },
    #[error("invalid mapping table: {0}")]
    InvalidMapping(String),

    #[error("overlay for tenant {tenant} is invalid: {reason}")]
    InvalidOverlay { tenant: TenantId, reason: String },
    #[error(
        "overlay for tenant {tenant} disables mandatory safety rule {rule} without a signed safety override"
    )]
    MandatorySafetyRuleDisabled { tenant: TenantId, rule: RuleId },

    #[error("guideline version {0} is already published with different content")]
    GuidelineVersionConflict(GuidelineVersionId),
    #[error("guideline version {0} has not been published")]
    UnknownGuidelineVersion(GuidelineVersionId),

    #[error("configuration provider failed: {0}")]
    Provider(String),

    #[error("evaluation cancelled")]
    Cancelled,
    #[error("evaluation defect in rule {rule}: {detail}")]
    EvaluationDefect { rule: RuleId, detail: String },

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl CdsError {
    /// Field issues carried by this error, if it locates any.
    pub fn issues(&self) -> Vec<FieldIssue> {
        match self {
            CdsError::InvalidRecord { issues } => issues.clone(),
            CdsError::Wire(err) => err.issues(),
            _ => Vec::new(),
        }
    }
}

fn render_cycle(cycle: &[RuleId]) -> String {
    cycle
        .iter()
        .map(RuleId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type CdsResult<T> = std::result::Result<T, CdsError>;
