//! Enums shared by the registry, planner, and materialisation crates
//! (spec §3 data model, §4.8 materialisation strategies).

use serde::{Deserialize, Serialize};

/// The physical form a model's output takes (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationKind {
    View,
    Table,
    /// Session-scoped, used for intermediate steps.
    Temp,
    Incremental,
    /// Change-data-capture retirement pattern (spec §4.8).
    Cdc,
}

impl Default for MaterializationKind {
    fn default() -> Self {
        MaterializationKind::View
    }
}

/// The three incremental sub-strategies (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalStrategy {
    Append,
    Time,
    UniqueKey,
}

impl Default for IncrementalStrategy {
    fn default() -> Self {
        IncrementalStrategy::Append
    }
}

/// How an incremental/CDC materialisation reacts to a target schema drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnSchemaChange {
    #[default]
    Ignore,
    AppendNewColumns,
    Fail,
}

/// Per-model-per-run classification (spec §3 Plan, §4.6 Planner algorithm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeReason {
    New,
    CodeChanged,
    UpstreamChanged,
    Forced,
    Unchanged,
    /// Present in state but absent from the registry (spec §4.6 step 4).
    Delete,
}

impl ChangeReason {
    /// Whether a model with this reason belongs in the executable set
    /// (spec §4.6 step 2: "everything not UNCHANGED").
    pub fn is_executable(&self) -> bool {
        !matches!(self, ChangeReason::Unchanged)
    }
}

/// Outcome of the most recent materialisation attempt (spec §3 StateEntry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    Success,
    Failed,
    Skipped,
}
