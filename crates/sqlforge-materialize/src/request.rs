//! The common `materialise()` contract (spec §4.8, §9 Design Notes: "a
//! tagged variant with a common `materialise` contract; avoid deep class
//! hierarchies").

use std::collections::BTreeMap;

use sqlforge_common::{IncrementalStrategy, OnSchemaChange};

/// Everything a strategy needs to materialise one model, independent of
/// which variant handles it.
#[derive(Debug, Clone)]
pub struct MaterializeRequest<'a> {
    pub model_name: &'a str,
    /// Fully-qualified target identifier (spec §3 naming:
    /// `{environment}.{model_name}`).
    pub physical_identifier: &'a str,
    /// The model's `SELECT` body, already `ref`/`source`-resolved and
    /// `$variable`-substituted.
    pub select_sql: &'a str,
    pub variables: &'a BTreeMap<String, String>,
    pub incremental_strategy: Option<IncrementalStrategy>,
    pub unique_key: Option<&'a str>,
    /// Column used by the `time` incremental sub-strategy's high-watermark
    /// comparison; sourced from model config (`time_column`).
    pub time_column: Option<&'a str>,
    pub on_schema_change: OnSchemaChange,
    /// Declared output columns, when known (schema.yml or prior C2 output),
    /// used to build explicit column lists for MERGE/INSERT statements.
    pub columns: Option<&'a [String]>,
    /// Whether this is the first materialisation of this model in this
    /// environment (spec §4.8: "first run creates the table").
    pub is_first_run: bool,
    /// Stored high-watermark value from the previous successful run (spec
    /// §3 StateEntry `high_watermark`), used by the `append` sub-strategy.
    pub stored_high_watermark: Option<&'a str>,
}
