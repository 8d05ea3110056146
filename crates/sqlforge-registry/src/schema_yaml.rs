//! Sibling `schema.yml` metadata (spec §6: "Optional sibling YAML
//! `schema.yml` adding: description, column tests, extra config";
//! SPEC_FULL.md §B). Reading the file itself is the caller's job — this
//! crate only deserializes already-read text, mirroring how Feather-Flow's
//! `ModelSchema` / dbt-fusion's `SourceProperties` separate parsing from
//! file I/O.

use std::collections::BTreeMap;

use serde::Deserialize;
use sqlforge_common::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchemaMetadata {
    pub description: Option<String>,
    pub columns: BTreeMap<String, ColumnTest>,
    /// Extra config keys, merged behind the model's own `-- config:`
    /// comment per the precedence chain (SPEC_FULL.md §B, §D#1: file
    /// comments win).
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ColumnTest {
    pub description: Option<String>,
    pub not_null: bool,
    pub unique: bool,
    pub accepted_values: Option<Vec<String>>,
    pub relationships: Option<Relationship>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Relationship {
    pub to: String,
    pub field: String,
}

pub fn parse_schema_yaml(yaml: &str) -> EngineResult<SchemaMetadata> {
    serde_yaml::from_str(yaml)
        .map_err(|e| EngineError::ConfigurationError(format!("invalid schema.yml: {e}")))
}
