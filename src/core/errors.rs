//! ABX-prefixed error types with structured error codes.
//!
//! Gate failures are deliberately absent here: MECE, contender-space and
//! decision-contract outcomes are recorded as [`crate::result::StopReason`]s,
//! never raised.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, AbxError>;

/// Top-level error type for the abductive session engine.
#[derive(Debug, Error)]
pub enum AbxError {
    #[error("[ABX-1001] invalid configuration field {field}: {details}")]
    InvalidConfig { field: String, details: String },

    #[error("[ABX-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[ABX-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[ABX-1101] unknown value {value:?} for policy field {field}")]
    UnknownPolicyValue { field: &'static str, value: String },

    #[error("[ABX-1201] malformed MECE certificate key {key:?}: {details}")]
    MalformedCertificate { key: String, details: String },

    #[error("[ABX-2001] {port} contract violation on field {field}: {details}")]
    PortContract {
        port: &'static str,
        field: String,
        details: String,
    },

    #[error("[ABX-2002] {port} port failure: {details}")]
    PortFailure { port: &'static str, details: String },

    #[error("[ABX-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[ABX-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[ABX-3001] replay diverged at event {seq}: {details}")]
    ReplayDivergence { seq: u64, details: String },

    #[error("[ABX-3002] replay trace incomplete: {details}")]
    ReplayIncomplete { details: String },

    #[error("[ABX-3003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[ABX-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl AbxError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "ABX-1001",
            Self::MissingConfig { .. } => "ABX-1002",
            Self::ConfigParse { .. } => "ABX-1003",
            Self::UnknownPolicyValue { .. } => "ABX-1101",
            Self::MalformedCertificate { .. } => "ABX-1201",
            Self::PortContract { .. } => "ABX-2001",
            Self::PortFailure { .. } => "ABX-2002",
            Self::Serialization { .. } => "ABX-2101",
            Self::Sql { .. } => "ABX-2102",
            Self::ReplayDivergence { .. } => "ABX-3001",
            Self::ReplayIncomplete { .. } => "ABX-3002",
            Self::Io { .. } => "ABX-3003",
            Self::Runtime { .. } => "ABX-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Configuration and contract errors are never retryable; only adapter
    /// and storage failures are.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::PortFailure { .. } | Self::Sql { .. } | Self::Runtime { .. }
        )
    }

    /// Whether the error belongs to the configuration family (raised before
    /// any credit is spent).
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::MissingConfig { .. }
                | Self::ConfigParse { .. }
                | Self::UnknownPolicyValue { .. }
                | Self::MalformedCertificate { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for configuration range errors.
    #[must_use]
    pub fn config(field: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            details: details.into(),
        }
    }

    /// Convenience constructor for port contract violations.
    #[must_use]
    pub fn contract(
        port: &'static str,
        field: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::PortContract {
            port,
            field: field.into(),
            details: details.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for AbxError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for AbxError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for AbxError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AbxError;

    #[test]
    fn codes_are_embedded_in_display() {
        let err = AbxError::config("tau", "must be in (0, 1]");
        assert_eq!(err.code(), "ABX-1001");
        assert!(err.to_string().starts_with("[ABX-1001]"));
        assert!(err.to_string().contains("tau"));
    }

    #[test]
    fn contract_errors_name_port_and_field() {
        let err = AbxError::contract("evaluator", "p", "1.5 outside [0, 1]");
        let text = err.to_string();
        assert!(text.contains("evaluator"));
        assert!(text.contains("field p"));
        assert!(!err.is_retryable());
        assert!(!err.is_configuration());
    }

    #[test]
    fn configuration_family_is_not_retryable() {
        let err = AbxError::UnknownPolicyValue {
            field: "profile",
            value: "astrology".to_string(),
        };
        assert!(err.is_configuration());
        assert!(!err.is_retryable());
    }

    #[test]
    fn port_failures_are_retryable() {
        let err = AbxError::PortFailure {
            port: "searcher",
            details: "timeout".to_string(),
        };
        assert!(err.is_retryable());
    }
}
