//! Error taxonomy and the per-table error collector

use crate::value::JoinKey;
use indexmap::IndexMap;
use thiserror::Error;

/// What went wrong, independent of where
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("path not found: {path}")]
    PathNotFound { path: String },

    #[error("type mismatch at {at}: expected {expected}, found {found}")]
    TypeMismatch {
        at: String,
        expected: String,
        found: String,
    },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("merge conflict on field '{field}': declared {first} then {second}")]
    MergeConflict {
        field: String,
        first: String,
        second: String,
    },

    #[error("no '{parent_table}' row with key {parent_key}")]
    UnresolvedRelationship {
        parent_table: String,
        parent_key: JoinKey,
    },

    #[error("relationship cycle between tables: {}", .tables.join(" -> "))]
    RelationshipCycle { tables: Vec<String> },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ErrorKind {
    pub fn configuration(msg: impl Into<String>) -> Self {
        ErrorKind::Configuration(msg.into())
    }

    /// Fatal kinds abort a run regardless of the error policy
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::RelationshipCycle { .. } | ErrorKind::Configuration(_)
        )
    }
}

/// Failure raised while evaluating a transform
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ExtractionError {
    pub message: String,
}

impl ExtractionError {
    pub fn new(message: impl Into<String>) -> Self {
        ExtractionError {
            message: message.into(),
        }
    }
}

impl From<ExtractionError> for ErrorKind {
    fn from(err: ExtractionError) -> Self {
        ErrorKind::Extraction(err.message)
    }
}

/// An error tied to a table and, when known, the row it concerns
#[derive(Debug, Clone, PartialEq, Error)]
#[error("table '{table}'{}: {kind}", .row_key.as_ref().map(|k| format!(" row {}", k)).unwrap_or_default())]
pub struct PipelineError {
    pub table: String,
    pub row_key: Option<JoinKey>,
    /// Label of the transform that failed, if one did
    pub transform: Option<String>,
    #[source]
    pub kind: ErrorKind,
}

impl PipelineError {
    pub fn new(table: impl Into<String>, kind: ErrorKind) -> Self {
        PipelineError {
            table: table.into(),
            row_key: None,
            transform: None,
            kind,
        }
    }

    pub fn with_key(mut self, key: JoinKey) -> Self {
        self.row_key = Some(key);
        self
    }

    pub fn with_transform(mut self, label: impl Into<String>) -> Self {
        self.transform = Some(label.into());
        self
    }

    /// A fatal error not tied to any single table
    pub fn fatal(kind: ErrorKind) -> Self {
        PipelineError::new("", kind)
    }
}

/// How errors are handled as they are recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Accumulate everything and let the run finish
    #[default]
    Collect,
    /// Abort on the first error
    FailFast,
}

/// Errors grouped by table, then by row key, in the order they were seen
pub type ErrorTable = IndexMap<String, IndexMap<JoinKey, Vec<PipelineError>>>;

/// Accumulates per-row failures under a policy
#[derive(Debug, Default)]
pub struct ErrorCollector {
    policy: ErrorPolicy,
    errors: ErrorTable,
}

impl ErrorCollector {
    pub fn new(policy: ErrorPolicy) -> Self {
        ErrorCollector {
            policy,
            errors: IndexMap::new(),
        }
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Record an error under the collector's own policy
    pub fn record(&mut self, error: PipelineError) -> Result<(), PipelineError> {
        self.record_with(error, None)
    }

    /// Record an error, letting a declaration-level policy override the global one
    ///
    /// Returns the error back when the run has to stop.
    pub fn record_with(
        &mut self,
        error: PipelineError,
        override_policy: Option<ErrorPolicy>,
    ) -> Result<(), PipelineError> {
        let policy = override_policy.unwrap_or(self.policy);
        if error.kind.is_fatal() || policy == ErrorPolicy::FailFast {
            return Err(error);
        }

        log::debug!("recorded error: {}", error);
        let key = error.row_key.clone().unwrap_or_else(JoinKey::unknown);
        self.errors
            .entry(error.table.clone())
            .or_default()
            .entry(key)
            .or_default()
            .push(error);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.errors
            .values()
            .flat_map(|rows| rows.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_inner(self) -> ErrorTable {
        self.errors
    }
}
