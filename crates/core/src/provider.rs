//! Collaborator interfaces for configuration loading.
//!
//! Loading happens out-of-band (at startup or on a refresh), never on the evaluation path.
//! Implementations may block on I/O.

use crate::CdsResult;
use cds_types::TenantId;
use cds_wire::{GuidelineDocument, MappingDocument, OverlayDocument};

/// Supplies the ontology mapping table.
pub trait MappingTableProvider: Send + Sync {
    fn load(&self) -> CdsResult<MappingDocument>;
}

/// Guideline version and optional overlay configured for a tenant.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantConfiguration {
    pub guideline: GuidelineDocument,
    /// `None` when the tenant has no overlay; the base guideline then applies.
    pub overlay: Option<OverlayDocument>,
}

/// Supplies guideline versions and tenant overlays.
pub trait GuidelineConfigProvider: Send + Sync {
    fn load(&self, tenant: &TenantId) -> CdsResult<TenantConfiguration>;
}
