//! Error taxonomy (spec §7).
//!
//! Kinds are grouped the way the spec groups them: recoverable errors that a
//! batch run survives, non-recoverable errors that abort a run, and warnings
//! that are logged but never returned as a hard failure. Every variant that
//! can be attributed to a specific model carries [`ErrorContext`].

use std::fmt;

pub type EngineResult<T> = Result<T, EngineError>;

/// Structured context carried by every error (spec §7: "All errors carry
/// structured context: operation, model_name?, sql_fragment?,
/// driver_error?, retry_count?").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub operation: String,
    pub model_name: Option<String>,
    pub sql_fragment: Option<String>,
    pub driver_error: Option<String>,
    pub retry_count: Option<u32>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql_fragment = Some(sql.into());
        self
    }

    pub fn with_driver_error(mut self, driver_error: impl Into<String>) -> Self {
        self.driver_error = Some(driver_error.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation={}", self.operation)?;
        if let Some(model) = &self.model_name {
            write!(f, " model={model}")?;
        }
        if let Some(retry) = self.retry_count {
            write!(f, " retry_count={retry}")?;
        }
        if let Some(driver_error) = &self.driver_error {
            write!(f, " driver_error={driver_error}")?;
        }
        Ok(())
    }
}

/// The driver's own classification of a failure (spec §6 driver contract:
/// "must expose a `kind` mapping to `{Transient, ConnectionLost, Permanent}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Transient,
    ConnectionLost,
    Permanent,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EngineError {
    // --- Recoverable: the run continues, the model is marked FAILED ---
    #[error("model execution failed: {context}: {message}")]
    ModelExecutionFailure { message: String, context: ErrorContext },

    #[error("transient driver failure after {context}: {message}")]
    TransientDriverFailure { message: String, context: ErrorContext },

    #[error("query timed out: {context}: {message}")]
    QueryTimeout { message: String, context: ErrorContext },

    // --- Non-recoverable: the run aborts ---
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("dependency cycle detected, involving: {cycle:?}")]
    CycleError { cycle: Vec<String> },

    #[error("model `{0}` not found in registry")]
    ModelNotFound(String),

    #[error("`ref`/`source` target `{0}` is not a known model")]
    MissingModelError(String),

    #[error("required variable `{0}` was not provided")]
    MissingVariableError(String),

    #[error("template error at {line}:{column}: {message}")]
    TemplateError { message: String, line: u32, column: u32 },

    // --- Pool / connection errors ---
    #[error("connection pool exhausted (timed out waiting for a connection)")]
    PoolTimeout,

    #[error("connection pool is closed")]
    PoolClosed,
}

impl EngineError {
    /// Whether this error represents a "Recoverable" kind per spec §7 — the
    /// run should continue to the next batch rather than abort.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ModelExecutionFailure { .. }
                | EngineError::TransientDriverFailure { .. }
                | EngineError::QueryTimeout { .. }
        )
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            EngineError::ModelExecutionFailure { context, .. }
            | EngineError::TransientDriverFailure { context, .. }
            | EngineError::QueryTimeout { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Non-fatal warnings (spec §7): logged, and also surfaced as return values
/// so callers can choose to fail `validate` strictly if they want to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineWarning {
    /// AST parser could not fully analyse a model's SQL (C2).
    ParseWarning { model_name: String, message: String },
    /// Column lineage could not be traced for one or more output columns.
    LineageWarning { model_name: String, message: String },
    /// Dropping a removed model's warehouse object failed.
    DeleteFailure { model_name: String, message: String },
}

impl fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineWarning::ParseWarning { model_name, message } => {
                write!(f, "parse warning in {model_name}: {message}")
            }
            EngineWarning::LineageWarning { model_name, message } => {
                write!(f, "lineage warning in {model_name}: {message}")
            }
            EngineWarning::DeleteFailure { model_name, message } => {
                write!(f, "delete failure for {model_name}: {message}")
            }
        }
    }
}
