//! Shared types used across every sqlforge crate: the error taxonomy (§7),
//! model-level enums from the data model (§3), engine configuration, and
//! content fingerprinting.

pub mod config;
pub mod constants;
pub mod errors;
pub mod execution;
pub mod hashing;
pub mod logging;
pub mod model_types;
pub mod naming;
pub mod substitution;

pub use config::{EngineConfig, RetryPolicy};
pub use errors::{ErrorContext, EngineError, EngineResult};
pub use execution::ExecutionResult;
pub use model_types::{ChangeReason, IncrementalStrategy, MaterializationKind, ModelStatus, OnSchemaChange};
pub use substitution::substitute_variables;
