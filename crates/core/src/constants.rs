//! Constants used throughout the engine crate.
//!
//! Directory layout names for configuration packs and the defaults applied when the
//! environment does not override them.

/// Default directory holding ontology, guideline and tenant configuration.
pub const DEFAULT_CONFIG_DIR: &str = "config";

/// Directory name for ontology mapping tables.
pub const ONTOLOGY_DIR_NAME: &str = "ontology";

/// Filename of the ontology mapping table.
pub const MAPPINGS_FILENAME: &str = "mappings.yaml";

/// Directory name for guideline rule packs (`<version>.yaml`).
pub const GUIDELINES_DIR_NAME: &str = "guidelines";

/// Directory name for tenant overlays (`<tenant>.yaml`).
pub const TENANTS_DIR_NAME: &str = "tenants";

/// Guideline version evaluated for tenants without an overlay.
pub const DEFAULT_GUIDELINE_VERSION: &str = "ada-2024";

/// Rules evaluated between two cancellation checks.
pub const DEFAULT_CANCEL_CHECK_INTERVAL: usize = 32;

/// Effective rule sets kept in the resolution cache.
pub const DEFAULT_RULE_SET_CACHE_CAPACITY: usize = 256;

/// Oldest plausible patient age in years.
pub const MAX_PATIENT_AGE: u32 = 130;

/// Pregnancy recorded above this age is reported as a data-quality advisory.
pub const PREGNANCY_ADVISORY_AGE: u32 = 55;
