//! Wire/boundary support for the clinical guideline engine.
//!
//! This crate provides **wire models** and **translation helpers** for the documents the engine
//! consumes from its collaborators:
//! - patient payloads (JSON or YAML)
//! - guideline rule packs (YAML)
//! - tenant overlays (YAML)
//! - ontology mapping tables (YAML)
//!
//! Wire structs are private and strict (`#[serde(deny_unknown_fields)]`). Each module exposes
//! domain-level carriers that the engine compiles and validates further. Structural failures
//! are reported with field paths so callers can point at the offending input.

pub mod guideline;
pub mod ontology;
pub mod overlay;
pub mod patient;

pub use guideline::{
    Applicability, Comparator, ConditionNode, EvidenceLevel, GuidelineDocument, GuidelinePack,
    PregnancyApplicability, RuleDefinition, RuleSource, Scalar, Severity,
};
pub use ontology::{ConceptEntry, MappingDocument, MappingFile, UnitConversion};
pub use overlay::{OverlayDocument, SafetyOverride, TenantOverlayFile};
pub use patient::{
    Demographics, Diagnosis, LabResult, Medication, PatientPayload, PatientRecord, ScreeningKind,
    Sex, VitalSigns,
};

use cds_types::{join_issues, FieldIssue};
use serde::de::DeserializeOwned;

/// Errors returned by the `cds-wire` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("{document} schema mismatch at {path}: {message}")]
    Schema {
        document: &'static str,
        path: String,
        message: String,
    },

    #[error("{document} failed validation: {}", join_issues(.issues))]
    InvalidFields {
        document: &'static str,
        issues: Vec<FieldIssue>,
    },
}

impl WireError {
    /// Field issues carried by this error, if it locates any.
    pub fn issues(&self) -> Vec<FieldIssue> {
        match self {
            WireError::Schema { path, message, .. } => vec![FieldIssue::new(path, message)],
            WireError::InvalidFields { issues, .. } => issues.clone(),
            _ => Vec::new(),
        }
    }
}

/// Type alias for Results that can fail with a [`WireError`].
pub type WireResult<T> = Result<T, WireError>;

fn schema_error<E: std::fmt::Display>(
    document: &'static str,
    err: serde_path_to_error::Error<E>,
) -> WireError {
    let path = err.path().to_string();
    let source = err.into_inner();
    let path = if path.is_empty() || path == "." {
        "<root>".to_string()
    } else {
        path
    };
    WireError::Schema {
        document,
        path,
        message: source.to_string(),
    }
}

/// Deserialize YAML into a wire struct, surfacing the failing field path.
pub(crate) fn from_yaml<T: DeserializeOwned>(document: &'static str, text: &str) -> WireResult<T> {
    let deserializer = serde_yaml::Deserializer::from_str(text);
    serde_path_to_error::deserialize(deserializer).map_err(|err| schema_error(document, err))
}

/// Deserialize JSON into a wire struct, surfacing the failing field path.
pub(crate) fn from_json<T: DeserializeOwned>(document: &'static str, text: &str) -> WireResult<T> {
    let mut deserializer = serde_json::Deserializer::from_str(text);
    let value = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| schema_error(document, err))?;
    deserializer.end()?;
    Ok(value)
}

/// Accumulates translation issues so that every offending field is reported at once.
#[derive(Debug, Default)]
pub(crate) struct Issues {
    issues: Vec<FieldIssue>,
}

impl Issues {
    pub(crate) fn push(&mut self, path: impl Into<String>, message: impl std::fmt::Display) {
        self.issues.push(FieldIssue::new(path, message.to_string()));
    }

    /// Records the error of `result` under `path` and returns the success value, if any.
    pub(crate) fn check<T, E: std::fmt::Display>(
        &mut self,
        path: impl Into<String>,
        result: Result<T, E>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(path, err);
                None
            }
        }
    }

    pub(crate) fn finish(self, document: &'static str) -> WireResult<()> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(WireError::InvalidFields {
                document,
                issues: self.issues,
            })
        }
    }
}
