//! Directory-backed configuration providers.
//!
//! Layout under the configuration directory:
//!
//! ```text
//! ontology/mappings.yaml
//! guidelines/<version>.yaml
//! tenants/<tenant>.yaml
//! ```

use cds_core::provider::{GuidelineConfigProvider, MappingTableProvider, TenantConfiguration};
use cds_core::{CdsError, CdsResult, CoreConfig};
use cds_types::{GuidelineVersionId, TenantId};
use cds_wire::{GuidelineDocument, GuidelinePack, MappingDocument, MappingFile, TenantOverlayFile};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Reads mapping tables, guideline versions and tenant overlays from the configuration
/// directory of a [`CoreConfig`].
#[derive(Clone, Debug)]
pub struct DirectoryProvider {
    cfg: Arc<CoreConfig>,
}

impl DirectoryProvider {
    pub fn new(cfg: Arc<CoreConfig>) -> Self {
        Self { cfg }
    }

    /// Loads one guideline version by id.
    pub fn load_guideline(&self, version: &GuidelineVersionId) -> CdsResult<GuidelineDocument> {
        let path = self.cfg.guideline_file(version);
        let doc = GuidelinePack::parse_yaml(&read(&path)?)?;
        if &doc.version != version {
            return Err(CdsError::Provider(format!(
                "{} declares version {} but is named for {version}",
                path.display(),
                doc.version
            )));
        }
        Ok(doc)
    }

    /// Ids of every guideline version present on disk, sorted.
    pub fn guideline_versions(&self) -> CdsResult<Vec<GuidelineVersionId>> {
        yaml_stems(&self.cfg.guidelines_dir())?
            .into_iter()
            .map(|stem| {
                GuidelineVersionId::new(&stem)
                    .map_err(|e| CdsError::Provider(format!("guideline file '{stem}.yaml': {e}")))
            })
            .collect()
    }

    /// Ids of every tenant with an overlay on disk, sorted.
    pub fn tenants(&self) -> CdsResult<Vec<TenantId>> {
        let dir = self.cfg.tenants_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        yaml_stems(&dir)?
            .into_iter()
            .map(|stem| {
                TenantId::new(&stem)
                    .map_err(|e| CdsError::Provider(format!("tenant file '{stem}.yaml': {e}")))
            })
            .collect()
    }
}

impl MappingTableProvider for DirectoryProvider {
    fn load(&self) -> CdsResult<MappingDocument> {
        Ok(MappingFile::parse_yaml(&read(&self.cfg.mappings_file())?)?)
    }
}

impl GuidelineConfigProvider for DirectoryProvider {
    /// A tenant without an overlay file gets the default guideline version and no overlay.
    fn load(&self, tenant: &TenantId) -> CdsResult<TenantConfiguration> {
        let path = self.cfg.tenant_file(tenant);
        let overlay = if path.is_file() {
            let doc = TenantOverlayFile::parse_yaml(&read(&path)?)?;
            if &doc.tenant_id != tenant {
                return Err(CdsError::Provider(format!(
                    "{} declares tenant {} but is named for {tenant}",
                    path.display(),
                    doc.tenant_id
                )));
            }
            Some(doc)
        } else {
            None
        };

        let version = overlay
            .as_ref()
            .map_or(self.cfg.default_guideline_version(), |o| &o.guideline_version);
        let guideline = self.load_guideline(version)?;
        Ok(TenantConfiguration { guideline, overlay })
    }
}

fn read(path: &Path) -> CdsResult<String> {
    fs::read_to_string(path)
        .map_err(|e| CdsError::Provider(format!("failed to read {}: {e}", path.display())))
}

fn yaml_stems(dir: &Path) -> CdsResult<Vec<String>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| CdsError::Provider(format!("failed to list {}: {e}", dir.display())))?;

    let mut stems = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| CdsError::Provider(format!("failed to list {}: {e}", dir.display())))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}
