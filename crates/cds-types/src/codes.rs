//! Coding systems and source codes.
//!
//! Patient payloads carry codes either bare (`E11.9`) or as CURIEs (`LOINC:4548-4`,
//! `rxnorm:6809`). A [`SourceCode`] always stores the bare code together with its system, so two
//! spellings of the same code compare equal.

use std::fmt;
use std::str::FromStr;

/// Errors raised while parsing coding systems or source codes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    #[error("unknown coding system '{0}'")]
    UnknownSystem(String),
    #[error("code cannot be empty")]
    Empty,
    #[error("code '{0}' contains whitespace")]
    Whitespace(String),
    #[error("code '{code}' is prefixed with {found} but belongs to {expected}")]
    SystemMismatch {
        code: String,
        expected: CodingSystem,
        found: CodingSystem,
    },
    #[error("'{0}' is not a CURIE (expected SYSTEM:code)")]
    NotACurie(String),
}

/// Source terminologies understood by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CodingSystem {
    Icd10,
    Loinc,
    RxNorm,
    Mondo,
    Snomed,
}

impl CodingSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            CodingSystem::Icd10 => "ICD10",
            CodingSystem::Loinc => "LOINC",
            CodingSystem::RxNorm => "RXNORM",
            CodingSystem::Mondo => "MONDO",
            CodingSystem::Snomed => "SNOMED",
        }
    }
}

impl fmt::Display for CodingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodingSystem {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalised.as_str() {
            "icd10" | "icd10cm" => Ok(CodingSystem::Icd10),
            "loinc" => Ok(CodingSystem::Loinc),
            "rxnorm" => Ok(CodingSystem::RxNorm),
            "mondo" => Ok(CodingSystem::Mondo),
            "snomed" | "snomedct" => Ok(CodingSystem::Snomed),
            _ => Err(CodeError::UnknownSystem(s.trim().to_owned())),
        }
    }
}

/// A code from a specific coding system, stored without any CURIE prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceCode {
    system: CodingSystem,
    code: String,
}

impl SourceCode {
    /// Builds a code for `system`, stripping a matching CURIE prefix (case-insensitive).
    ///
    /// ICD-10 codes are upper-cased; other systems keep their original spelling.
    pub fn new(system: CodingSystem, raw: &str) -> Result<Self, CodeError> {
        let raw = raw.trim();
        let code = match raw.split_once(':') {
            Some((prefix, rest)) => {
                let found = prefix.parse::<CodingSystem>()?;
                if found != system {
                    return Err(CodeError::SystemMismatch {
                        code: raw.to_owned(),
                        expected: system,
                        found,
                    });
                }
                rest.trim()
            }
            None => raw,
        };

        if code.is_empty() {
            return Err(CodeError::Empty);
        }
        if code.chars().any(char::is_whitespace) {
            return Err(CodeError::Whitespace(code.to_owned()));
        }

        let code = match system {
            CodingSystem::Icd10 => code.to_ascii_uppercase(),
            _ => code.to_owned(),
        };
        Ok(Self { system, code })
    }

    /// Parses a `SYSTEM:code` CURIE.
    pub fn parse_curie(curie: &str) -> Result<Self, CodeError> {
        let (prefix, _) = curie
            .trim()
            .split_once(':')
            .ok_or_else(|| CodeError::NotACurie(curie.trim().to_owned()))?;
        let system = prefix.parse::<CodingSystem>()?;
        Self::new(system, curie)
    }

    pub fn system(&self) -> CodingSystem {
        self.system
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for SourceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.code)
    }
}

impl serde::Serialize for SourceCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
