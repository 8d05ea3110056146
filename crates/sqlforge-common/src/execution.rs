//! [`ExecutionResult`] (spec §3): the outcome of one model's materialisation
//! attempt, produced by C8 and consumed by C9/C5.

use chrono::{DateTime, Utc};

use crate::errors::ErrorContext;
use crate::model_types::ModelStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub model_name: String,
    pub status: ModelStatus,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub rows_affected: Option<u64>,
    pub error_context: Option<ErrorContext>,
    pub materialized_object_identifier: String,
    /// New high-watermark to persist for incremental kinds (spec §3
    /// StateEntry).
    pub new_high_watermark: Option<String>,
}
