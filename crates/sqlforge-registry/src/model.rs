//! Data model types (spec §3): [`Model`], [`ParsedModel`], [`Source`].

use std::collections::{BTreeMap, BTreeSet};

use sqlforge_common::{IncrementalStrategy, MaterializationKind, OnSchemaChange};
use sqlforge_sql::ColumnLineage;

/// A logical transformation, uniquely named by a dotted path (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    pub raw_text: String,
    pub fingerprint: String,
    pub materialization: MaterializationKind,
    pub incremental_strategy: Option<IncrementalStrategy>,
    pub unique_key: Option<String>,
    pub on_schema_change: OnSchemaChange,
    /// `$variable` tokens referenced in the raw SQL (spec §4.9: validated
    /// against the supplied variable map at execution time).
    pub declared_variables: BTreeSet<String>,
    /// Extra dependencies from a leading `-- depends_on:` comment (spec
    /// §4.1), in addition to whatever `ref()` itself implies.
    pub explicit_dependencies: BTreeSet<String>,
    /// Declared output columns, if a `schema.yml` sibling names them
    /// (SPEC_FULL.md §B).
    pub column_schema: Option<Vec<String>>,
    pub config: BTreeMap<String, String>,
}

/// C1+C2 output for a [`Model`] (spec §3). Recomputed whenever the owning
/// Model's fingerprint changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedModel {
    pub name: String,
    /// The fingerprint of the [`Model`] this was computed from, so a
    /// registry can detect a stale `ParsedModel` without recomputing it.
    pub fingerprint: String,
    /// SQL with `ref`/`source` placeholders still unresolved (spec §4.1:
    /// resolved to physical identifiers only immediately before
    /// execution).
    pub expanded_sql: String,
    pub model_dependencies: BTreeSet<String>,
    pub source_references: BTreeSet<(String, String)>,
    pub column_lineage: Vec<ColumnLineage>,
    pub config: BTreeMap<String, String>,
}

/// An external relation registered via the sources catalogue (spec §3,
/// §6 `sources.yml`). Immutable within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub group: String,
    pub table: String,
    pub physical: String,
}
