//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. Evaluation never reads process-wide environment variables, so
//! concurrent evaluations always agree on their settings.

use crate::constants::{
    DEFAULT_CANCEL_CHECK_INTERVAL, DEFAULT_CONFIG_DIR, DEFAULT_GUIDELINE_VERSION,
    DEFAULT_RULE_SET_CACHE_CAPACITY, GUIDELINES_DIR_NAME, MAPPINGS_FILENAME, ONTOLOGY_DIR_NAME,
    TENANTS_DIR_NAME,
};
use crate::{CdsError, CdsResult};
use cds_types::{GuidelineVersionId, TenantId};
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    config_dir: PathBuf,
    default_guideline_version: GuidelineVersionId,
    cancel_check_interval: usize,
    rule_set_cache_capacity: usize,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    pub fn new(
        config_dir: PathBuf,
        default_guideline_version: GuidelineVersionId,
        cancel_check_interval: usize,
        rule_set_cache_capacity: usize,
    ) -> CdsResult<Self> {
        if cancel_check_interval == 0 {
            return Err(CdsError::InvalidInput(
                "cancel_check_interval must be at least 1".into(),
            ));
        }
        if rule_set_cache_capacity == 0 {
            return Err(CdsError::InvalidInput(
                "rule_set_cache_capacity must be at least 1".into(),
            ));
        }

        Ok(Self {
            config_dir,
            default_guideline_version,
            cancel_check_interval,
            rule_set_cache_capacity,
        })
    }

    /// Configuration rooted at `config_dir` with every other setting at its default.
    pub fn with_defaults(config_dir: PathBuf) -> CdsResult<Self> {
        let version = guideline_version_from_env_value(None)?;
        Self::new(
            config_dir,
            version,
            DEFAULT_CANCEL_CHECK_INTERVAL,
            DEFAULT_RULE_SET_CACHE_CAPACITY,
        )
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn mappings_file(&self) -> PathBuf {
        self.config_dir
            .join(ONTOLOGY_DIR_NAME)
            .join(MAPPINGS_FILENAME)
    }

    pub fn guidelines_dir(&self) -> PathBuf {
        self.config_dir.join(GUIDELINES_DIR_NAME)
    }

    pub fn guideline_file(&self, version: &GuidelineVersionId) -> PathBuf {
        self.guidelines_dir().join(format!("{version}.yaml"))
    }

    pub fn tenants_dir(&self) -> PathBuf {
        self.config_dir.join(TENANTS_DIR_NAME)
    }

    pub fn tenant_file(&self, tenant: &TenantId) -> PathBuf {
        self.tenants_dir().join(format!("{tenant}.yaml"))
    }

    pub fn default_guideline_version(&self) -> &GuidelineVersionId {
        &self.default_guideline_version
    }

    pub fn cancel_check_interval(&self) -> usize {
        self.cancel_check_interval
    }

    pub fn rule_set_cache_capacity(&self) -> usize {
        self.rule_set_cache_capacity
    }
}

/// Resolve the configuration directory without reading environment variables.
///
/// If `override_dir` is provided, it must be a directory containing the ontology mapping table.
/// Otherwise this searches for `config/` relative to the current working directory and then
/// walks up from `CARGO_MANIFEST_DIR`.
pub fn resolve_config_dir(override_dir: Option<PathBuf>) -> CdsResult<PathBuf> {
    fn looks_like_config_dir(path: &Path) -> bool {
        path.join(ONTOLOGY_DIR_NAME)
            .join(MAPPINGS_FILENAME)
            .is_file()
    }

    if let Some(config_dir) = override_dir {
        if config_dir.is_dir() && looks_like_config_dir(&config_dir) {
            return Ok(config_dir);
        }
        return Err(CdsError::InvalidInput(format!(
            "CDS_CONFIG_DIR override is not a valid configuration directory (must contain {ONTOLOGY_DIR_NAME}/{MAPPINGS_FILENAME})"
        )));
    }

    let cwd_relative = PathBuf::from(DEFAULT_CONFIG_DIR);
    if looks_like_config_dir(&cwd_relative) {
        return Ok(cwd_relative);
    }

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for ancestor in manifest_dir.ancestors() {
        let candidate = ancestor.join(DEFAULT_CONFIG_DIR);
        if looks_like_config_dir(&candidate) {
            return Ok(candidate);
        }
    }

    Err(CdsError::InvalidInput(format!(
        "could not locate {DEFAULT_CONFIG_DIR}/ directory with {ONTOLOGY_DIR_NAME}/{MAPPINGS_FILENAME}"
    )))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive_usize(name: &str, value: Option<String>, default: usize) -> CdsResult<usize> {
    let Some(raw) = non_blank(value) else {
        return Ok(default);
    };
    match raw.parse::<usize>() {
        Ok(0) | Err(_) => Err(CdsError::InvalidInput(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
        Ok(parsed) => Ok(parsed),
    }
}

/// Parse the cancellation check interval from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns the default interval.
pub fn cancel_check_interval_from_env_value(value: Option<String>) -> CdsResult<usize> {
    positive_usize(
        "CDS_CANCEL_CHECK_INTERVAL",
        value,
        DEFAULT_CANCEL_CHECK_INTERVAL,
    )
}

/// Parse the effective rule-set cache capacity from an optional string value.
pub fn cache_capacity_from_env_value(value: Option<String>) -> CdsResult<usize> {
    positive_usize(
        "CDS_RULE_SET_CACHE_CAPACITY",
        value,
        DEFAULT_RULE_SET_CACHE_CAPACITY,
    )
}

/// Parse the default guideline version, falling back to the bundled version.
pub fn guideline_version_from_env_value(value: Option<String>) -> CdsResult<GuidelineVersionId> {
    let raw = non_blank(value).unwrap_or_else(|| DEFAULT_GUIDELINE_VERSION.to_string());
    GuidelineVersionId::new(&raw)
        .map_err(|e| CdsError::InvalidInput(format!("CDS_GUIDELINE_VERSION: {e}")))
}
