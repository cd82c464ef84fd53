//! Error types for starload.
//!
//! Library crates use [`StarloadError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::StageName;

/// Top-level error type for all starload operations.
#[derive(Debug, thiserror::Error)]
pub enum StarloadError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to the artifact store.
    #[error("network error: {0}")]
    Network(String),

    /// A declared source file is missing or its parts are out of sequence.
    #[error("extraction error: {message}")]
    Extraction { message: String },

    /// Malformed row, schema mismatch, or forbidden source path during bulk load.
    #[error("load error in {file}{}: {message}", line_suffix(.line))]
    Load {
        file: String,
        line: Option<u64>,
        message: String,
    },

    /// A fact row references a dimension row that does not exist.
    #[error("referential integrity error: {message}")]
    Integrity { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad manifest, invalid view name, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pipeline stage failed; wraps the underlying cause.
    #[error("stage `{stage}` failed: {source}")]
    Stage {
        stage: StageName,
        #[source]
        source: Box<StarloadError>,
    },
}

fn line_suffix(line: &Option<u64>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StarloadError>;

impl StarloadError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an extraction error from any displayable message.
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction {
            message: msg.into(),
        }
    }

    /// Create a load error tied to a source file and optional line.
    pub fn load(file: impl Into<String>, line: Option<u64>, msg: impl Into<String>) -> Self {
        Self::Load {
            file: file.into(),
            line,
            message: msg.into(),
        }
    }

    /// Create a referential-integrity error from any displayable message.
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attribute this error to a pipeline stage.
    pub fn in_stage(self, stage: StageName) -> Self {
        match self {
            already @ Self::Stage { .. } => already,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was attributed to, if any.
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = StarloadError::config("bulk load disabled");
        assert_eq!(err.to_string(), "config error: bulk load disabled");

        let err = StarloadError::validation("unknown view 'vw_nope'");
        assert!(err.to_string().contains("vw_nope"));
    }

    #[test]
    fn load_error_reports_file_and_line() {
        let err = StarloadError::load("olist_orders_dataset.csv", Some(42), "expected 8 fields, found 7");
        assert_eq!(
            err.to_string(),
            "load error in olist_orders_dataset.csv at line 42: expected 8 fields, found 7"
        );

        let err = StarloadError::load("olist_orders_dataset.csv", None, "outside data dir");
        assert_eq!(
            err.to_string(),
            "load error in olist_orders_dataset.csv: outside data dir"
        );
    }

    #[test]
    fn stage_wrapping_is_not_nested() {
        let err = StarloadError::integrity("seller missing")
            .in_stage(StageName::Facts)
            .in_stage(StageName::Views);
        assert_eq!(err.stage(), Some(StageName::Facts));
        assert!(err.to_string().starts_with("stage `facts` failed"));
    }
}
