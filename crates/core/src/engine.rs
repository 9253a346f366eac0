//! Evaluation service.
//!
//! [`EvaluationService::evaluate`] runs one patient record through the whole pipeline:
//! validation, ontology normalization, fact building, effective rule-set resolution, per-rule
//! predicate evaluation, conflict resolution and assembly.
//!
//! An evaluation writes no shared state apart from the rule-set cache. It takes one snapshot
//! of the mapping table and one of the rule repository up front and uses only those, so a
//! concurrent publish never produces a torn view.

use crate::assembler::{assemble, Recommendation, Warning};
use crate::config::CoreConfig;
use crate::conflict::resolve_conflicts;
use crate::facts::FactBase;
use crate::ontology::OntologyNormalizer;
use crate::predicate::evaluate;
use crate::repository::{ResolvedRules, RuleRepository};
use crate::resolver::EffectiveRuleSetCache;
use crate::validation::{data_quality_findings, validate_record};
use crate::{CdsError, CdsResult};
use cds_types::{GuidelineVersionId, RuleId, TenantId};
use cds_wire::PatientRecord;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Polled between rule evaluations, every `cancel_check_interval` rules and once more before
/// assembly.
pub trait CancelSignal {
    fn is_cancelled(&self) -> bool;
}

/// Caller-driven cancellation signal, shareable across threads.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl CancelSignal for CancellationToken {
    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

/// What happened to one rule of the effective set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RuleOutcome {
    NotApplicable { reason: String },
    NotSatisfied,
    Fired,
    Suppressed { by: RuleId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuleTrace {
    pub rule_id: RuleId,
    #[serde(flatten)]
    pub outcome: RuleOutcome,
}

/// Result of one evaluation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub as_of: NaiveDate,
    pub guideline_version: GuidelineVersionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_version: Option<String>,
    pub rule_set_digest: String,
    /// Ordered by (tier, rule id).
    pub recommendations: Vec<Recommendation>,
    pub warnings: Vec<Warning>,
    /// One entry per rule of the effective set, in (tier, rule id) order.
    pub trace: Vec<RuleTrace>,
}

/// Evaluates patient records against the published rules.
#[derive(Debug)]
pub struct EvaluationService {
    cfg: Arc<CoreConfig>,
    ontology: Arc<OntologyNormalizer>,
    rules: Arc<RuleRepository>,
    cache: EffectiveRuleSetCache,
}

impl EvaluationService {
    pub fn new(
        cfg: Arc<CoreConfig>,
        ontology: Arc<OntologyNormalizer>,
        rules: Arc<RuleRepository>,
    ) -> Self {
        let cache = EffectiveRuleSetCache::new(cfg.rule_set_cache_capacity());
        Self {
            cfg,
            ontology,
            rules,
            cache,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn ontology(&self) -> &OntologyNormalizer {
        &self.ontology
    }

    pub fn repository(&self) -> &RuleRepository {
        &self.rules
    }

    /// Evaluates `record` for `tenant` as of `as_of`.
    ///
    /// # Errors
    ///
    /// - [`CdsError::InvalidRecord`] when the record fails validation; nothing is evaluated
    /// - [`CdsError::UnknownGuidelineVersion`] or an overlay validation error when the tenant's
    ///   configuration cannot be resolved
    /// - [`CdsError::EvaluationDefect`] if a rule cannot be evaluated against the facts
    pub fn evaluate(
        &self,
        record: &PatientRecord,
        tenant: Option<&TenantId>,
        as_of: NaiveDate,
    ) -> CdsResult<EvaluationResult> {
        self.evaluate_with_cancellation(record, tenant, as_of, &CancellationToken::default())
    }

    /// As [`EvaluationService::evaluate`], stopping with [`CdsError::Cancelled`] once `cancel`
    /// is signalled. Partial results are discarded.
    pub fn evaluate_with_cancellation(
        &self,
        record: &PatientRecord,
        tenant: Option<&TenantId>,
        as_of: NaiveDate,
        cancel: &dyn CancelSignal,
    ) -> CdsResult<EvaluationResult> {
        validate_record(record)?;

        let table = self.ontology.snapshot();
        let repository = self.rules.snapshot();

        let concepts = table.normalize_record(record);
        for unmapped in &concepts.unmapped {
            tracing::warn!(
                patient = %record.patient_id,
                field = %unmapped.field,
                code = %unmapped.code,
                "unmapped clinical code"
            );
        }
        for mismatch in &concepts.unit_mismatches {
            tracing::warn!(
                patient = %record.patient_id,
                field = %mismatch.field,
                unit = %mismatch.unit,
                expected = %mismatch.expected_unit,
                "lab unit cannot be converted; value ignored"
            );
        }
        let facts = FactBase::build(record, &concepts, as_of);

        let ResolvedRules {
            rules,
            warnings: mut advisories,
        } = repository.effective_rule_set(tenant, as_of, &self.cache)?;
        advisories.extend(
            data_quality_findings(record, as_of)
                .into_iter()
                .map(|issue| Warning::DataQuality {
                    path: issue.path,
                    message: issue.message,
                }),
        );

        let interval = self.cfg.cancel_check_interval();
        let mut firing: Vec<RuleId> = Vec::new();
        let mut outcomes: BTreeMap<RuleId, RuleOutcome> = BTreeMap::new();
        for (i, rule) in rules.rules().iter().enumerate() {
            if i % interval == 0 && cancel.is_cancelled() {
                tracing::info!(patient = %record.patient_id, evaluated = i, "evaluation cancelled");
                return Err(CdsError::Cancelled);
            }

            if let Some(reason) = rule.not_applicable_reason(&facts) {
                tracing::debug!(rule = %rule.id(), %reason, "rule not applicable");
                outcomes.insert(rule.id().clone(), RuleOutcome::NotApplicable { reason });
                continue;
            }

            match evaluate(&rule.condition, &facts) {
                Ok(true) => {
                    tracing::debug!(rule = %rule.id(), "rule fired");
                    firing.push(rule.id().clone());
                    outcomes.insert(rule.id().clone(), RuleOutcome::Fired);
                }
                Ok(false) => {
                    tracing::debug!(rule = %rule.id(), "rule not satisfied");
                    outcomes.insert(rule.id().clone(), RuleOutcome::NotSatisfied);
                }
                Err(defect) => {
                    tracing::error!(
                        patient = %record.patient_id,
                        rule = %rule.id(),
                        detail = %defect,
                        "evaluation defect; aborting evaluation"
                    );
                    return Err(CdsError::EvaluationDefect {
                        rule: rule.id().clone(),
                        detail: defect.to_string(),
                    });
                }
            }
        }
        if cancel.is_cancelled() {
            tracing::info!(patient = %record.patient_id, "evaluation cancelled before assembly");
            return Err(CdsError::Cancelled);
        }

        let resolution = resolve_conflicts(&firing, &rules);
        for (loser, winner) in &resolution.suppressed_by {
            outcomes.insert(loser.clone(), RuleOutcome::Suppressed { by: winner.clone() });
        }

        let (recommendations, warnings) = assemble(&resolution, &rules, &facts, advisories);

        let trace = rules
            .rules()
            .iter()
            .filter_map(|rule| {
                outcomes.remove(rule.id()).map(|outcome| RuleTrace {
                    rule_id: rule.id().clone(),
                    outcome,
                })
            })
            .collect();

        tracing::info!(
            patient = %record.patient_id,
            tenant = tenant.map(TenantId::as_str),
            guideline = %rules.guideline_version(),
            recommendations = recommendations.len(),
            warnings = warnings.len(),
            "evaluation complete"
        );

        Ok(EvaluationResult {
            as_of,
            guideline_version: rules.guideline_version().clone(),
            tenant: rules.tenant().cloned(),
            overlay_version: rules.overlay_version().map(str::to_string),
            rule_set_digest: rules.digest().to_string(),
            recommendations,
            warnings,
            trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::MappingTable;
    use crate::test_support;
    use cds_wire::{MappingFile, PatientPayload, TenantOverlayFile};
    use proptest::prelude::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date should succeed")
    }

    fn id(raw: &str) -> RuleId {
        RuleId::new(raw).expect("rule id should succeed")
    }

    fn tenant(raw: &str) -> TenantId {
        TenantId::new(raw).expect("tenant should succeed")
    }

    fn service_with(cfg: CoreConfig) -> EvaluationService {
        let table = test_support::mapping_table();
        let rules = Arc::new(RuleRepository::new(cfg.default_guideline_version().clone()));
        rules
            .publish_guideline(test_support::guideline_document(), &table)
            .expect("publish should succeed");
        let ontology = Arc::new(OntologyNormalizer::new(table));
        rules
            .publish_overlay(test_support::overlay_document())
            .expect("publish should succeed");
        EvaluationService::new(Arc::new(cfg), ontology, rules)
    }

    fn service() -> EvaluationService {
        service_with(
            CoreConfig::with_defaults(PathBuf::from("config")).expect("config should succeed"),
        )
    }

    fn service_checking_every(interval: usize) -> EvaluationService {
        let version = GuidelineVersionId::new("ada-2024").expect("version should succeed");
        service_with(
            CoreConfig::new(PathBuf::from("config"), version, interval, 8)
                .expect("config should succeed"),
        )
    }

    /// Counts polls and reports cancellation from poll `cancel_at` onwards.
    struct CountingSignal {
        polls: AtomicUsize,
        cancel_at: usize,
    }

    impl CountingSignal {
        fn new(cancel_at: usize) -> Self {
            Self {
                polls: AtomicUsize::new(0),
                cancel_at,
            }
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    impl CancelSignal for CountingSignal {
        fn is_cancelled(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) + 1 >= self.cancel_at
        }
    }

    fn patient(json: &str) -> PatientRecord {
        PatientPayload::parse_json(json).expect("parse should succeed")
    }

    fn rule_ids(result: &EvaluationResult) -> Vec<&str> {
        result
            .recommendations
            .iter()
            .map(|r| r.rule_id.as_str())
            .collect()
    }

    fn outcome<'a>(result: &'a EvaluationResult, rule: &str) -> Option<&'a RuleOutcome> {
        result
            .trace
            .iter()
            .find(|t| t.rule_id.as_str() == rule)
            .map(|t| &t.outcome)
    }

    #[test]
    fn test_monotherapy_patient_gets_intensification() {
        let result = service()
            .evaluate(&patient(test_support::PATIENT_JSON), None, date(2024, 1, 1))
            .expect("evaluation should succeed");

        let intensify = result
            .recommendations
            .iter()
            .find(|r| r.rule_id.as_str() == "ADA-9.INTENSIFY-MONO")
            .expect("intensification should be recommended");
        assert!(intensify.citation.contains("Section 9"));
        assert!(intensify.message.contains("9.6%"));
        assert!(intensify.suppressed_rule_ids.is_empty());

        assert!(matches!(
            outcome(&result, "ADA-15.PREGNANCY-INSULIN"),
            Some(RuleOutcome::NotApplicable { .. })
        ));
        assert!(result
            .trace
            .iter()
            .all(|t| !matches!(t.outcome, RuleOutcome::Suppressed { .. })));
        assert!(result.warnings.is_empty());
        assert_eq!(result.trace.len(), test_support::guideline().len());
    }

    #[test]
    fn test_pregnancy_suppresses_standard_intensification() {
        let json = test_support::PATIENT_JSON.replace("\"pregnant\": false", "\"pregnant\": true");
        let result = service()
            .evaluate(&patient(&json), None, date(2024, 1, 1))
            .expect("evaluation should succeed");

        let ids = rule_ids(&result);
        assert!(ids.contains(&"ADA-15.PREGNANCY-INSULIN"));
        assert!(!ids.contains(&"ADA-9.INTENSIFY-MONO"));
        assert_eq!(
            outcome(&result, "ADA-9.INTENSIFY-MONO"),
            Some(&RuleOutcome::Suppressed {
                by: id("ADA-15.PREGNANCY-INSULIN")
            })
        );
        let pregnancy = &result.recommendations[0];
        assert_eq!(pregnancy.rule_id, id("ADA-15.PREGNANCY-INSULIN"));
        assert!(pregnancy
            .suppressed_rule_ids
            .contains(&id("ADA-9.INTENSIFY-MONO")));
        assert!(matches!(
            outcome(&result, "ADA-9.GLP1-HIGH-A1C"),
            Some(RuleOutcome::NotApplicable { .. })
        ));
        // Age 58 with pregnancy recorded is flagged, not rejected.
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::DataQuality { path, .. } if path == "pregnant")));
    }

    #[test]
    fn test_disabling_intensification_fails_configuration() {
        let svc = service();
        let doc = TenantOverlayFile::parse_yaml(
            "tenant_id: clinic_002\nversion: '1'\nguideline_version: ada-2024\ndisabled_rules: [ADA-9.INTENSIFY-MONO]\n",
        )
        .expect("parse should succeed");
        let err = svc
            .repository()
            .publish_overlay(doc)
            .expect_err("overlay should be rejected");
        assert!(matches!(err, CdsError::MandatorySafetyRuleDisabled { .. }));
    }

    #[test]
    fn test_tenant_overlay_thresholds_reach_the_message() {
        let result = service()
            .evaluate(
                &patient(test_support::PATIENT_JSON),
                Some(&tenant("clinic_001")),
                date(2024, 1, 1),
            )
            .expect("evaluation should succeed");
        assert_eq!(result.tenant, Some(tenant("clinic_001")));
        assert!(result.overlay_version.is_some());
        let intensify = result
            .recommendations
            .iter()
            .find(|r| r.rule_id.as_str() == "ADA-9.INTENSIFY-MONO")
            .expect("intensification should be recommended");
        assert!(intensify.message.contains("6.5%"), "message was {}", intensify.message);
    }

    #[test]
    fn test_unknown_tenant_falls_back_with_warning() {
        let result = service()
            .evaluate(
                &patient(test_support::PATIENT_JSON),
                Some(&tenant("clinic_404")),
                date(2024, 1, 1),
            )
            .expect("evaluation should succeed");
        assert!(result.overlay_version.is_none());
        assert!(matches!(
            result.warnings.as_slice(),
            [Warning::OverlayMissing { .. }]
        ));
        assert!(!result.recommendations.is_empty());
    }

    #[test]
    fn test_unmapped_codes_only_warn() {
        let json = test_support::PATIENT_JSON
            .replace("\"E11.9\"", "\"Z99.89\"")
            .replace("\"6809\"", "\"123456789\"");
        let result = service()
            .evaluate(&patient(&json), None, date(2024, 1, 1))
            .expect("evaluation should succeed");

        let unmapped: Vec<&str> = result
            .warnings
            .iter()
            .filter_map(|w| match w {
                Warning::UnmappedCode { field, .. } => Some(field.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(unmapped, vec!["diagnoses[0].icd10", "medications[0].rxnorm_code"]);
        assert!(!rule_ids(&result).contains(&"ADA-9.INTENSIFY-MONO"));
    }

    #[test]
    fn test_invalid_record_is_rejected_before_evaluation() {
        let json = test_support::PATIENT_JSON.replace("\"age\": 58", "\"age\": 158");
        let err = service()
            .evaluate(&patient(&json), None, date(2024, 1, 1))
            .expect_err("evaluation should fail");
        assert!(matches!(err, CdsError::InvalidRecord { .. }));
        assert_eq!(err.issues()[0].path, "age");
    }

    #[test]
    fn test_cancelled_evaluation_returns_no_result() {
        let token = CancellationToken::new();
        token.cancel();
        let err = service()
            .evaluate_with_cancellation(
                &patient(test_support::PATIENT_JSON),
                None,
                date(2024, 1, 1),
                &token,
            )
            .expect_err("evaluation should be cancelled");
        assert!(matches!(err, CdsError::Cancelled));
    }

    #[test]
    fn test_cancellation_between_rules_stops_the_loop() {
        let rules = test_support::guideline().len();
        let signal = CountingSignal::new(3);
        let err = service_checking_every(1)
            .evaluate_with_cancellation(
                &patient(test_support::PATIENT_JSON),
                None,
                date(2024, 1, 1),
                &signal,
            )
            .expect_err("evaluation should be cancelled");
        assert!(matches!(err, CdsError::Cancelled));
        assert_eq!(signal.polls(), 3);
        assert!(signal.polls() < rules);
    }

    #[test]
    fn test_cancellation_after_last_rule_discards_result() {
        let rules = test_support::guideline().len();
        let signal = CountingSignal::new(rules + 1);
        let err = service_checking_every(1)
            .evaluate_with_cancellation(
                &patient(test_support::PATIENT_JSON),
                None,
                date(2024, 1, 1),
                &signal,
            )
            .expect_err("evaluation should be cancelled");
        assert!(matches!(err, CdsError::Cancelled));
        assert_eq!(signal.polls(), rules + 1);
    }

    #[test]
    fn test_cancel_check_interval_sets_poll_frequency() {
        let rules = test_support::guideline().len();
        let signal = CountingSignal::new(usize::MAX);
        let result = service_checking_every(4)
            .evaluate_with_cancellation(
                &patient(test_support::PATIENT_JSON),
                None,
                date(2024, 1, 1),
                &signal,
            )
            .expect("evaluation should succeed");
        assert_eq!(result.trace.len(), rules);
        assert_eq!(signal.polls(), rules.div_ceil(4) + 1);
    }

    #[test]
    fn test_token_cancelled_from_another_thread() {
        let svc = service_checking_every(1);
        let record = patient(test_support::PATIENT_JSON);
        let token = CancellationToken::new();

        let canceller = token.clone();
        std::thread::spawn(move || canceller.cancel())
            .join()
            .expect("thread should succeed");

        let err = svc
            .evaluate_with_cancellation(&record, None, date(2024, 1, 1), &token)
            .expect_err("evaluation should be cancelled");
        assert!(matches!(err, CdsError::Cancelled));
    }

    #[test]
    fn test_hba1c_in_mmol_per_mol_is_converted_before_comparison() {
        let json = test_support::PATIENT_JSON
            .replace(r#""value": 9.6, "unit": "%""#, r#""value": 48.0, "unit": "mmol/mol""#);
        let result = service()
            .evaluate(&patient(&json), None, date(2024, 1, 1))
            .expect("evaluation should succeed");

        let ids = rule_ids(&result);
        assert!(!ids.contains(&"ADA-9.GLP1-HIGH-A1C"), "fired {ids:?}");
        assert!(!ids.contains(&"ADA-9.INTENSIFY-MONO"), "fired {ids:?}");
        assert_eq!(
            outcome(&result, "ADA-9.GLP1-HIGH-A1C"),
            Some(&RuleOutcome::NotSatisfied)
        );
        assert!(result.warnings.is_empty());

        let high = test_support::PATIENT_JSON
            .replace(r#""value": 9.6, "unit": "%""#, r#""value": 86.0, "unit": "mmol/mol""#);
        let result = service()
            .evaluate(&patient(&high), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        let glp1 = result
            .recommendations
            .iter()
            .find(|r| r.rule_id.as_str() == "ADA-9.GLP1-HIGH-A1C")
            .expect("GLP-1 should be recommended");
        assert!(glp1.message.contains("10.02%"), "message was {}", glp1.message);
    }

    #[test]
    fn test_unconvertible_lab_unit_warns_and_never_satisfies() {
        let json = test_support::PATIENT_JSON
            .replace(r#""value": 9.6, "unit": "%""#, r#""value": 160.0, "unit": "mg/dL""#);
        let result = service()
            .evaluate(&patient(&json), None, date(2024, 1, 1))
            .expect("evaluation should succeed");

        let ids = rule_ids(&result);
        assert!(!ids.contains(&"ADA-9.GLP1-HIGH-A1C"), "fired {ids:?}");
        assert!(!ids.contains(&"ADA-9.INTENSIFY-MONO"), "fired {ids:?}");
        assert!(matches!(
            result.warnings.as_slice(),
            [Warning::UnitMismatch { field, unit, expected_unit, .. }]
                if field == "labs[0].unit" && unit == "mg/dL" && expected_unit == "%"
        ));
    }

    #[test]
    fn test_overlay_narrowing_a_negated_threshold_is_rejected() {
        let svc = service();
        let doc = TenantOverlayFile::parse_yaml(
            "tenant_id: clinic_003
version: '1'
guideline_version: ada-2024
threshold_overrides:
  ADA-6.HBA1C-MONITORING:
    hba1c_recency_days: 120
",
        )
        .expect("parse should succeed");
        let err = svc
            .repository()
            .publish_overlay(doc)
            .expect_err("overlay should be rejected");
        assert!(
            matches!(&err, CdsError::InvalidOverlay { reason, .. } if reason.contains("hba1c_recency_days")),
            "unexpected error {err:?}"
        );
        assert!(svc.repository().snapshot().overlay(&tenant("clinic_003")).is_none());

        // clinic_001 lowers the same threshold to 60 days, which alerts more patients.
        let record = patient(test_support::PATIENT_JSON);
        let as_of = date(2024, 2, 14);
        let base = svc
            .evaluate(&record, None, as_of)
            .expect("evaluation should succeed");
        assert_eq!(
            outcome(&base, "ADA-6.HBA1C-MONITORING"),
            Some(&RuleOutcome::NotSatisfied)
        );
        let tenant_result = svc
            .evaluate(&record, Some(&tenant("clinic_001")), as_of)
            .expect("evaluation should succeed");
        let monitoring = tenant_result
            .recommendations
            .iter()
            .find(|r| r.rule_id.as_str() == "ADA-6.HBA1C-MONITORING")
            .expect("monitoring should be recommended");
        assert!(monitoring.message.contains("60 days"), "message was {}", monitoring.message);
    }

    #[test]
    fn test_foot_and_dental_exams_follow_screening_dates() {
        let svc = service();
        let overdue = svc
            .evaluate(&patient(test_support::PATIENT_JSON), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        let ids = rule_ids(&overdue);
        assert!(ids.contains(&"ADA-12.FOOT-EXAM"));
        assert!(ids.contains(&"ADA-4.DENTAL-EXAM"));

        let json = test_support::PATIENT_JSON.replace(
            r#""payer": "medicare","#,
            r#""payer": "medicare", "last_foot_exam": "2023-06-01", "last_dental_exam": "2022-11-01","#,
        );
        let result = svc
            .evaluate(&patient(&json), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert_eq!(
            outcome(&result, "ADA-12.FOOT-EXAM"),
            Some(&RuleOutcome::NotSatisfied)
        );
        let dental = result
            .recommendations
            .iter()
            .find(|r| r.rule_id.as_str() == "ADA-4.DENTAL-EXAM")
            .expect("dental exam should be overdue");
        assert!(dental.message.contains("365 days"), "message was {}", dental.message);
    }

    #[test]
    fn test_eye_complications_shorten_the_exam_interval() {
        let svc = service();
        let json = test_support::PATIENT_JSON.replace("\"E11.9\"", "\"E11.31\"");

        let never_examined = svc
            .evaluate(&patient(&json), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert!(rule_ids(&never_examined).contains(&"ADA-12.EYE-EXAM-COMPLICATED"));
        assert_eq!(
            outcome(&never_examined, "ADA-12.EYE-EXAM"),
            Some(&RuleOutcome::Suppressed {
                by: id("ADA-12.EYE-EXAM-COMPLICATED")
            })
        );
        // Complications still count as type 2 diabetes.
        assert!(rule_ids(&never_examined).contains(&"ADA-9.INTENSIFY-MONO"));

        let examined = json.replace(
            r#""payer": "medicare","#,
            r#""payer": "medicare", "last_eye_exam": "2023-06-01","#,
        );
        let result = svc
            .evaluate(&patient(&examined), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert!(rule_ids(&result).contains(&"ADA-12.EYE-EXAM-COMPLICATED"));
        assert_eq!(
            outcome(&result, "ADA-12.EYE-EXAM"),
            Some(&RuleOutcome::NotSatisfied)
        );

        let uncomplicated = test_support::PATIENT_JSON.replace(
            r#""payer": "medicare","#,
            r#""payer": "medicare", "last_eye_exam": "2023-06-01","#,
        );
        let result = svc
            .evaluate(&patient(&uncomplicated), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert_eq!(
            outcome(&result, "ADA-12.EYE-EXAM-COMPLICATED"),
            Some(&RuleOutcome::NotSatisfied)
        );
    }

    #[test]
    fn test_pancreatitis_blocks_glp1_recommendation() {
        let svc = service();
        let base = svc
            .evaluate(&patient(test_support::PATIENT_JSON), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert!(rule_ids(&base).contains(&"ADA-9.GLP1-HIGH-A1C"));

        let json = test_support::PATIENT_JSON.replace(
            r#"{"icd10": "E11.9", "name": "Type 2 diabetes mellitus"}"#,
            r#"{"icd10": "E11.9", "name": "Type 2 diabetes mellitus"},
               {"icd10": "K85.9", "name": "Acute pancreatitis"}"#,
        );
        let result = svc
            .evaluate(&patient(&json), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert_eq!(
            outcome(&result, "ADA-9.GLP1-HIGH-A1C"),
            Some(&RuleOutcome::NotSatisfied)
        );
        assert!(rule_ids(&result).contains(&"ADA-9.INTENSIFY-MONO"));
    }

    #[test]
    fn test_esrd_blocks_sglt2_recommendation() {
        let svc = service();
        let ckd = test_support::PATIENT_JSON.replace(
            r#""date": "2023-12-01"}]"#,
            r#""date": "2023-12-01"},
                {"loinc": "48643-1", "value": 40, "unit": "mL/min/1.73m2", "date": "2023-12-01"}]"#,
        );
        let result = svc
            .evaluate(&patient(&ckd), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert!(rule_ids(&result).contains(&"ADA-11.SGLT2-CKD"));

        let esrd = ckd.replace(
            r#"{"icd10": "E11.9", "name": "Type 2 diabetes mellitus"}"#,
            r#"{"icd10": "E11.9", "name": "Type 2 diabetes mellitus"},
               {"icd10": "N18.6", "name": "End stage renal disease"}"#,
        );
        let result = svc
            .evaluate(&patient(&esrd), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert_eq!(
            outcome(&result, "ADA-11.SGLT2-CKD"),
            Some(&RuleOutcome::NotSatisfied)
        );
    }

    #[test]
    fn test_in_flight_snapshot_survives_mapping_publish() {
        let svc = service();
        let before = svc.ontology().snapshot();
        let replacement = MappingTable::compile(
            MappingFile::parse_yaml("version: empty\nconcepts: []\n").expect("parse should succeed"),
        )
        .expect("compile should succeed");
        svc.ontology().publish(replacement);

        assert!(before.concept_count() > 0);
        assert_eq!(svc.ontology().snapshot().concept_count(), 0);

        let result = svc
            .evaluate(&patient(test_support::PATIENT_JSON), None, date(2024, 1, 1))
            .expect("evaluation should succeed");
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::UnmappedCode { .. })));
    }

    #[test]
    fn test_concurrent_evaluations_agree() {
        let svc = service();
        let record = patient(test_support::PATIENT_JSON);
        let expected = svc
            .evaluate(&record, Some(&tenant("clinic_001")), date(2024, 1, 1))
            .expect("evaluation should succeed");

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        svc.evaluate(&record, Some(&tenant("clinic_001")), date(2024, 1, 1))
                            .expect("evaluation should succeed")
                    })
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().expect("thread should succeed"), expected);
            }
        });
    }

    proptest! {
        #[test]
        fn prop_evaluation_output_is_byte_identical(
            hba1c in 5.0f64..12.0,
            age in 18u32..90,
            pregnant in any::<bool>(),
            day in 0u64..400,
        ) {
            let svc = service();
            let json = test_support::PATIENT_JSON
                .replace("9.6", &format!("{hba1c:.1}"))
                .replace("\"age\": 58", &format!("\"age\": {age}"))
                .replace("\"pregnant\": false", &format!("\"pregnant\": {pregnant}"));
            let record = patient(&json);
            let as_of = date(2024, 1, 1) + chrono::Days::new(day);

            let first = svc.evaluate(&record, Some(&tenant("clinic_001")), as_of)
                .expect("evaluation should succeed");
            let second = svc.evaluate(&record, Some(&tenant("clinic_001")), as_of)
                .expect("evaluation should succeed");
            prop_assert_eq!(
                serde_json::to_string(&first).expect("serialize should succeed"),
                serde_json::to_string(&second).expect("serialize should succeed")
            );

            // No two surviving recommendations in one tier are mutually exclusive.
            let guideline = test_support::guideline();
            for a in &first.recommendations {
                for b in &first.recommendations {
                    if a.rule_id != b.rule_id && a.tier == b.tier {
                        prop_assert!(!guideline.mutually_exclusive(&a.rule_id, &b.rule_id));
                    }
                }
            }
        }
    }
}
