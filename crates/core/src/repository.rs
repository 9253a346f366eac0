//! Rule repository.
//!
//! The repository owns every published guideline version and tenant overlay. Its state is an
//! immutable [`RepositorySnapshot`]; every change builds a new snapshot and swaps it in, so an
//! evaluation keeps a consistent view for its whole duration no matter what is published
//! meanwhile.
//!
//! Guideline versions are immutable once published: republishing identical content is a no-op,
//! different content under the same version is rejected. A version is only published once every
//! concept it names exists in the mapping table it was checked against.

use crate::assembler::Warning;
use crate::ontology::MappingTable;
use crate::overlay::TenantOverlay;
use crate::provider::GuidelineConfigProvider;
use crate::resolver::{EffectiveRuleSet, EffectiveRuleSetCache};
use crate::rule::CompiledGuideline;
use crate::{CdsError, CdsResult};
use cds_types::{GuidelineVersionId, TenantId};
use cds_wire::{GuidelineDocument, OverlayDocument};
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The rule set for one evaluation plus any fallback advisories.
#[derive(Debug)]
pub struct ResolvedRules {
    pub rules: Arc<EffectiveRuleSet>,
    pub warnings: Vec<Warning>,
}

/// An immutable view of the repository.
#[derive(Clone, Debug)]
pub struct RepositorySnapshot {
    generation: u64,
    default_version: GuidelineVersionId,
    guidelines: BTreeMap<GuidelineVersionId, Arc<CompiledGuideline>>,
    overlays: BTreeMap<TenantId, Arc<TenantOverlay>>,
}

impl RepositorySnapshot {
    /// Incremented by every published change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn default_version(&self) -> &GuidelineVersionId {
        &self.default_version
    }

    pub fn guideline(&self, version: &GuidelineVersionId) -> Option<&Arc<CompiledGuideline>> {
        self.guidelines.get(version)
    }

    pub fn guideline_versions(&self) -> impl Iterator<Item = &GuidelineVersionId> {
        self.guidelines.keys()
    }

    pub fn overlay(&self, tenant: &TenantId) -> Option<&Arc<TenantOverlay>> {
        self.overlays.get(tenant)
    }

    /// Resolves the effective rule set for `tenant` as of `as_of`.
    ///
    /// A tenant without an overlay is evaluated against the default guideline version and gets
    /// an [`Warning::OverlayMissing`] advisory. `None` evaluates the default version with no
    /// advisory.
    ///
    /// # Errors
    ///
    /// - [`CdsError::UnknownGuidelineVersion`] when the required guideline is not published
    /// - overlay validation errors, see [`TenantOverlay::validate_against`]
    pub fn effective_rule_set(
        &self,
        tenant: Option<&TenantId>,
        as_of: NaiveDate,
        cache: &EffectiveRuleSetCache,
    ) -> CdsResult<ResolvedRules> {
        let mut warnings = Vec::new();
        let overlay = tenant.and_then(|t| self.overlays.get(t));

        let version = match overlay {
            Some(overlay) => overlay.guideline_version(),
            None => {
                if let Some(tenant) = tenant {
                    tracing::warn!(
                        tenant = %tenant,
                        version = %self.default_version,
                        "no overlay configured for tenant; using base guideline"
                    );
                    warnings.push(Warning::OverlayMissing {
                        tenant: tenant.clone(),
                        guideline_version: self.default_version.clone(),
                    });
                }
                &self.default_version
            }
        };

        let guideline = self
            .guidelines
            .get(version)
            .ok_or_else(|| CdsError::UnknownGuidelineVersion(version.clone()))?;
        let rules = cache.get_or_resolve(guideline, overlay.map(Arc::as_ref), as_of)?;
        Ok(ResolvedRules { rules, warnings })
    }

    fn insert_guideline(&mut self, guideline: CompiledGuideline) -> CdsResult<Arc<CompiledGuideline>> {
        if let Some(existing) = self.guidelines.get(guideline.version()) {
            if existing.digest() == guideline.digest() {
                return Ok(Arc::clone(existing));
            }
            return Err(CdsError::GuidelineVersionConflict(
                guideline.version().clone(),
            ));
        }
        let guideline = Arc::new(guideline);
        self.guidelines
            .insert(guideline.version().clone(), Arc::clone(&guideline));
        Ok(guideline)
    }

    fn insert_overlay(&mut self, overlay: TenantOverlay) -> CdsResult<()> {
        let guideline = self
            .guidelines
            .get(overlay.guideline_version())
            .ok_or_else(|| CdsError::UnknownGuidelineVersion(overlay.guideline_version().clone()))?;
        overlay.validate_against(guideline)?;
        self.overlays
            .insert(overlay.tenant().clone(), Arc::new(overlay));
        Ok(())
    }
}

/// Holds the current [`RepositorySnapshot`] and publishes replacements.
#[derive(Debug)]
pub struct RuleRepository {
    current: RwLock<Arc<RepositorySnapshot>>,
    /// Serialises writers so no update is lost between read and swap.
    writer: Mutex<()>,
}

impl RuleRepository {
    pub fn new(default_version: GuidelineVersionId) -> Self {
        Self {
            current: RwLock::new(Arc::new(RepositorySnapshot {
                generation: 0,
                default_version,
                guidelines: BTreeMap::new(),
                overlays: BTreeMap::new(),
            })),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<RepositorySnapshot> {
        Arc::clone(&self.current.read())
    }

    fn update<T>(
        &self,
        change: impl FnOnce(&mut RepositorySnapshot) -> CdsResult<T>,
    ) -> CdsResult<T> {
        let _writer = self.writer.lock();
        let mut next = RepositorySnapshot::clone(&self.snapshot());
        let out = change(&mut next)?;
        self.install(next);
        Ok(out)
    }

    /// Swaps in `next`. Callers hold the writer lock.
    fn install(&self, mut next: RepositorySnapshot) {
        next.generation += 1;
        let generation = next.generation;
        *self.current.write() = Arc::new(next);
        tracing::info!(generation, "published rule repository snapshot");
    }

    /// Compiles, checks against `ontology` and publishes a guideline version.
    ///
    /// # Errors
    ///
    /// Compilation errors (see [`CompiledGuideline::compile`]), [`CdsError::InvalidRule`] for a
    /// rule naming a concept absent from `ontology`, or [`CdsError::GuidelineVersionConflict`] if
    /// the version exists with different content.
    pub fn publish_guideline(
        &self,
        doc: GuidelineDocument,
        ontology: &MappingTable,
    ) -> CdsResult<Arc<CompiledGuideline>> {
        let compiled = CompiledGuideline::compile(doc)?;
        compiled.check_concepts(ontology)?;
        tracing::info!(
            version = %compiled.version(),
            rules = compiled.len(),
            "publishing guideline version"
        );
        self.update(|snapshot| snapshot.insert_guideline(compiled))
    }

    /// Validates and publishes a tenant overlay, replacing any previous overlay of the tenant.
    ///
    /// # Errors
    ///
    /// [`CdsError::UnknownGuidelineVersion`] if the overlay's guideline is not published, or the
    /// overlay's validation error.
    pub fn publish_overlay(&self, doc: OverlayDocument) -> CdsResult<()> {
        let overlay = TenantOverlay::from_document(doc);
        let tenant = overlay.tenant().clone();
        let result = self.update(|snapshot| snapshot.insert_overlay(overlay));
        match &result {
            Ok(()) => tracing::info!(tenant = %tenant, "published tenant overlay"),
            Err(err) => tracing::warn!(tenant = %tenant, error = %err, "rejected tenant overlay"),
        }
        result
    }

    /// Removes a tenant's overlay and returns it. Nothing is published when the tenant has none.
    pub fn remove_overlay(&self, tenant: &TenantId) -> Option<Arc<TenantOverlay>> {
        let _writer = self.writer.lock();
        let mut next = RepositorySnapshot::clone(&self.snapshot());
        let removed = next.overlays.remove(tenant)?;
        self.install(next);
        tracing::info!(tenant = %tenant, version = removed.version(), "removed tenant overlay");
        Some(removed)
    }

    /// Reloads a tenant's guideline and overlay from `provider` and publishes both in one swap.
    ///
    /// The guideline is checked against `ontology` like [`RuleRepository::publish_guideline`].
    /// On any error the current snapshot stays in place.
    pub fn refresh_tenant(
        &self,
        provider: &dyn GuidelineConfigProvider,
        tenant: &TenantId,
        ontology: &MappingTable,
    ) -> CdsResult<()> {
        let config = provider.load(tenant)?;
        let compiled = CompiledGuideline::compile(config.guideline)?;
        compiled.check_concepts(ontology)?;
        let overlay = config.overlay.map(TenantOverlay::from_document);
        if let Some(overlay) = &overlay {
            if overlay.tenant() != tenant {
                return Err(CdsError::InvalidOverlay {
                    tenant: tenant.clone(),
                    reason: format!(
                        "provider returned an overlay for tenant {}",
                        overlay.tenant()
                    ),
                });
            }
        }

        self.update(|snapshot| {
            snapshot.insert_guideline(compiled)?;
            match overlay {
                Some(overlay) => snapshot.insert_overlay(overlay),
                None => {
                    snapshot.overlays.remove(tenant);
                    Ok(())
                }
            }
        })
        .inspect(|()| tracing::info!(tenant = %tenant, "refreshed tenant configuration"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TenantConfiguration;
    use crate::test_support;
    use cds_wire::{GuidelinePack, TenantOverlayFile};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date should succeed")
    }

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).expect("tenant should succeed")
    }

    fn empty_repository() -> RuleRepository {
        RuleRepository::new(GuidelineVersionId::new("ada-2024").expect("version should succeed"))
    }

    fn repository() -> RuleRepository {
        let repo = empty_repository();
        repo.publish_guideline(test_support::guideline_document(), &test_support::mapping_table())
            .expect("publish should succeed");
        repo
    }

    struct StaticProvider {
        config: TenantConfiguration,
    }

    impl GuidelineConfigProvider for StaticProvider {
        fn load(&self, _tenant: &TenantId) -> CdsResult<TenantConfiguration> {
            Ok(self.config.clone())
        }
    }

    #[test]
    fn test_publish_is_idempotent_and_immutable() {
        let repo = repository();
        let generation = repo.snapshot().generation();
        repo.publish_guideline(test_support::guideline_document(), &test_support::mapping_table())
            .expect("identical republish should succeed");
        assert_eq!(repo.snapshot().generation(), generation + 1);

        let changed = test_support::GUIDELINE_YAML.replace("tier: 3", "tier: 4");
        let doc = GuidelinePack::parse_yaml(&changed).expect("parse should succeed");
        assert!(matches!(
            repo.publish_guideline(doc, &test_support::mapping_table()),
            Err(CdsError::GuidelineVersionConflict(_))
        ));
    }

    #[test]
    fn test_guideline_naming_unknown_concept_is_not_published() {
        let repo = empty_repository();
        let typo = test_support::GUIDELINE_YAML.replace("present: diabetes", "present: diabetse");
        let doc = GuidelinePack::parse_yaml(&typo).expect("parse should succeed");

        let err = repo
            .publish_guideline(doc, &test_support::mapping_table())
            .expect_err("typo should be rejected");
        assert!(
            matches!(&err, CdsError::InvalidRule { reason, .. } if reason.contains("'diabetse'")),
            "unexpected error {err:?}"
        );
        assert_eq!(repo.snapshot().generation(), 0);
        assert_eq!(repo.snapshot().guideline_versions().count(), 0);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_publication() {
        let repo = repository();
        let before = repo.snapshot();
        repo.publish_overlay(test_support::overlay_document())
            .expect("publish should succeed");

        assert!(before.overlay(&tenant("clinic_001")).is_none());
        assert!(repo.snapshot().overlay(&tenant("clinic_001")).is_some());
        assert!(repo.snapshot().generation() > before.generation());
    }

    #[test]
    fn test_missing_overlay_falls_back_with_warning() {
        let repo = repository();
        let cache = EffectiveRuleSetCache::new(8);
        let resolved = repo
            .snapshot()
            .effective_rule_set(Some(&tenant("clinic_999")), date(2024, 1, 1), &cache)
            .expect("fallback should succeed");
        assert!(resolved.rules.overlay_version().is_none());
        assert!(matches!(
            resolved.warnings.as_slice(),
            [Warning::OverlayMissing { .. }]
        ));

        let anonymous = repo
            .snapshot()
            .effective_rule_set(None, date(2024, 1, 1), &cache)
            .expect("resolve should succeed");
        assert!(anonymous.warnings.is_empty());
    }

    #[test]
    fn test_invalid_overlay_is_rejected_and_not_published() {
        let repo = repository();
        let doc = TenantOverlayFile::parse_yaml(
            "tenant_id: clinic_002\nversion: '1'\nguideline_version: ada-2024\ndisabled_rules: [ADA-9.INTENSIFY-MONO]\n",
        )
        .expect("parse should succeed");
        let err = repo.publish_overlay(doc).expect_err("should be rejected");
        assert!(matches!(err, CdsError::MandatorySafetyRuleDisabled { .. }));
        assert!(repo.snapshot().overlay(&tenant("clinic_002")).is_none());
    }

    #[test]
    fn test_overlay_for_unpublished_guideline_is_rejected() {
        let repo = empty_repository();
        assert!(matches!(
            repo.publish_overlay(test_support::overlay_document()),
            Err(CdsError::UnknownGuidelineVersion(_))
        ));
    }

    #[test]
    fn test_refresh_tenant_publishes_and_removes_overlay() {
        let repo = empty_repository();
        let with_overlay = StaticProvider {
            config: TenantConfiguration {
                guideline: test_support::guideline_document(),
                overlay: Some(test_support::overlay_document()),
            },
        };
        repo.refresh_tenant(&with_overlay, &tenant("clinic_001"), &test_support::mapping_table())
            .expect("refresh should succeed");
        assert!(repo.snapshot().overlay(&tenant("clinic_001")).is_some());

        let without_overlay = StaticProvider {
            config: TenantConfiguration {
                guideline: test_support::guideline_document(),
                overlay: None,
            },
        };
        repo.refresh_tenant(&without_overlay, &tenant("clinic_001"), &test_support::mapping_table())
            .expect("refresh should succeed");
        assert!(repo.snapshot().overlay(&tenant("clinic_001")).is_none());
    }

    #[test]
    fn test_refresh_rejects_overlay_for_another_tenant() {
        let repo = empty_repository();
        let provider = StaticProvider {
            config: TenantConfiguration {
                guideline: test_support::guideline_document(),
                overlay: Some(test_support::overlay_document()),
            },
        };
        assert!(repo
            .refresh_tenant(&provider, &tenant("clinic_002"), &test_support::mapping_table())
            .is_err());
        assert_eq!(repo.snapshot().generation(), 0);
    }

    #[test]
    fn test_refresh_rejects_guideline_with_unknown_concept() {
        let repo = empty_repository();
        let typo = test_support::GUIDELINE_YAML
            .replace("therapy_days(biguanide)", "therapy_days(biguanid)");
        let provider = StaticProvider {
            config: TenantConfiguration {
                guideline: GuidelinePack::parse_yaml(&typo).expect("parse should succeed"),
                overlay: Some(test_support::overlay_document()),
            },
        };
        let err = repo
            .refresh_tenant(&provider, &tenant("clinic_001"), &test_support::mapping_table())
            .expect_err("refresh should fail");
        assert!(matches!(err, CdsError::InvalidRule { .. }));
        assert!(repo.snapshot().overlay(&tenant("clinic_001")).is_none());
    }

    #[test]
    fn test_remove_overlay() {
        let repo = repository();
        repo.publish_overlay(test_support::overlay_document())
            .expect("publish should succeed");
        let generation = repo.snapshot().generation();

        let removed = repo
            .remove_overlay(&tenant("clinic_001"))
            .expect("overlay should be removed");
        assert_eq!(removed.version(), "2024.03");
        assert!(repo.snapshot().overlay(&tenant("clinic_001")).is_none());
        assert_eq!(repo.snapshot().generation(), generation + 1);

        assert!(repo.remove_overlay(&tenant("clinic_001")).is_none());
        assert_eq!(repo.snapshot().generation(), generation + 1);
    }
}
