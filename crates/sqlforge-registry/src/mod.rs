//! Model Registry (C3, spec §4.3): owns every [`Model`] and its derived
//! [`ParsedModel`], and runs the C1 (template) + C2 (SQL AST) compile
//! pipeline on registration.

mod model;
mod schema_yaml;

use std::collections::{BTreeMap, BTreeSet};

use sqlforge_common::errors::{EngineError, EngineResult, EngineWarning};
use sqlforge_common::hashing::fingerprint;
use sqlforge_common::naming::physical_identifier;
use sqlforge_sql::{parse_and_extract, ColumnLineage, RelationKind};
use sqlforge_template::{expand, ExpansionContext, SimpleContext};

pub use model::{Model, ParsedModel, Source};
pub use schema_yaml::{parse_schema_yaml, ColumnTest, SchemaMetadata};

/// A dotted model name, e.g. `silver.cleaned_orders` (spec §3).
pub type ModelName = String;

/// Source-path-derived name for a `models/` tree file (spec §6: "path
/// suffix (minus `.sql`) becomes dotted name").
pub fn name_from_path(relative_path: &str) -> ModelName {
    relative_path
        .trim_end_matches(".sql")
        .trim_start_matches('/')
        .replace(['/', '\\'], ".")
}

#[derive(Debug, Default)]
pub struct Registry {
    environment: String,
    default_materialization: sqlforge_common::MaterializationKind,
    models: BTreeMap<ModelName, Model>,
    parsed: BTreeMap<ModelName, ParsedModel>,
    schemas: BTreeMap<ModelName, SchemaMetadata>,
    sources: BTreeMap<(String, String), Source>,
    warnings: Vec<EngineWarning>,
}

impl Registry {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            default_materialization: sqlforge_common::MaterializationKind::default(),
            ..Default::default()
        }
    }

    pub fn with_default_materialization(
        mut self,
        kind: sqlforge_common::MaterializationKind,
    ) -> Self {
        self.default_materialization = kind;
        self
    }

    /// Register a source group/table pair from the sources catalogue (spec
    /// §6 `sources.yml`). Sources are immutable within a run (spec §3).
    pub fn register_source(&mut self, group: &str, table: &str, physical: impl Into<String>) {
        self.sources.insert(
            (group.to_string(), table.to_string()),
            Source {
                group: group.to_string(),
                table: table.to_string(),
                physical: physical.into(),
            },
        );
    }

    /// Attach a model's `schema.yml` sibling metadata (SPEC_FULL.md §B).
    /// Triggers a recompile since config and lineage may both be affected.
    pub fn attach_schema(&mut self, name: &ModelName, schema: SchemaMetadata) -> EngineResult<()> {
        self.schemas.insert(name.clone(), schema);
        if self.models.contains_key(name) {
            self.recompile(name)?;
        }
        Ok(())
    }

    /// Upsert a Model from a `.sql` file's path and raw text (spec §4.3:
    /// "register(path, text) upserts a Model"). Atomic: on any compile
    /// error the prior Model (if any) is left untouched.
    pub fn register(&mut self, relative_path: &str, raw_text: &str) -> EngineResult<&Model> {
        let name = name_from_path(relative_path);
        let candidate = self.compile_model(&name, raw_text)?;
        self.models.insert(name.clone(), candidate.0);
        self.parsed.insert(name.clone(), candidate.1);
        for warning in candidate.2 {
            tracing::warn!(model = %name, warning = %warning, "compile warning");
            self.warnings.push(warning);
        }
        Ok(self.models.get(&name).expect("just inserted"))
    }

    /// Remove a model (spec §4.3 `remove(name)`; spec §3: "destroyed when
    /// the file disappears on next registration pass").
    pub fn remove(&mut self, name: &ModelName) {
        self.models.remove(name);
        self.parsed.remove(name);
        self.schemas.remove(name);
    }

    pub fn get(&self, name: &ModelName) -> EngineResult<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| EngineError::ModelNotFound(name.clone()))
    }

    pub fn get_parsed(&self, name: &ModelName) -> EngineResult<&ParsedModel> {
        self.parsed
            .get(name)
            .ok_or_else(|| EngineError::ModelNotFound(name.clone()))
    }

    pub fn list(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn names(&self) -> BTreeSet<ModelName> {
        self.models.keys().cloned().collect()
    }

    pub fn warnings(&self) -> &[EngineWarning] {
        &self.warnings
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Look up a registered source's physical identifier (spec §6
    /// `sources.yml`), for resolving `source()` placeholders just before
    /// execution.
    pub fn resolve_source(&self, group: &str, table: &str) -> Option<&Source> {
        self.sources.get(&(group.to_string(), table.to_string()))
    }

    /// Every model dependency a [`ParsedModel`] carries: `ref()` targets,
    /// bare-identifier matches, and `-- depends_on:` entries, unioned (spec
    /// §4.1, §4.2).
    pub fn dependencies_of(&self, name: &ModelName) -> EngineResult<BTreeSet<ModelName>> {
        Ok(self.get_parsed(name)?.model_dependencies.clone())
    }

    /// Re-run the C1+C2 pipeline for a model whose schema metadata changed
    /// but whose raw text did not (e.g. a `schema.yml` edit).
    fn recompile(&mut self, name: &ModelName) -> EngineResult<()> {
        let raw_text = self.models.get(name).map(|m| m.raw_text.clone());
        if let Some(raw_text) = raw_text {
            let (model, parsed, warnings) = self.compile_model(name, &raw_text)?;
            self.models.insert(name.clone(), model);
            self.parsed.insert(name.clone(), parsed);
            for warning in warnings {
                self.warnings.push(warning);
            }
        }
        Ok(())
    }

    /// Runs C1 (expand) then C2 (parse) and assembles the final, merged
    /// config, fingerprint, Model, and ParsedModel. Uses a compile-time
    /// [`ExpansionContext`] with `is_incremental = false`; the Executor
    /// re-runs C1 immediately before execution with the true
    /// previously-materialised flag (spec §4.1: "resolved to physical
    /// identifiers only immediately before execution").
    fn compile_model(
        &self,
        name: &ModelName,
        raw_text: &str,
    ) -> EngineResult<(Model, ParsedModel, Vec<EngineWarning>)> {
        let compile_ctx = SimpleContext {
            this_identifier: physical_identifier(&self.environment, name),
            is_incremental: false,
        };
        let expanded = expand(raw_text, &compile_ctx)?;

        let mut config = BTreeMap::new();
        config.insert(
            "materialized".to_string(),
            materialization_key(self.default_materialization),
        );
        if let Some(schema) = self.schemas.get(name) {
            for (k, v) in &schema.config {
                config.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &expanded.config {
            config.insert(k.clone(), v.clone());
        }

        let known_models = self.names();
        let upstream_schemas = self.upstream_schema_hints();
        let parsed_sql = parse_and_extract(&expanded.sql, &known_models, &upstream_schemas);

        let mut warnings = Vec::new();
        for diagnostic in &parsed_sql.diagnostics {
            warnings.push(match diagnostic {
                sqlforge_sql::Diagnostic::ParseWarning(message) => EngineWarning::ParseWarning {
                    model_name: name.clone(),
                    message: message.clone(),
                },
                sqlforge_sql::Diagnostic::LineageWarning(message) => {
                    EngineWarning::LineageWarning {
                        model_name: name.clone(),
                        message: message.clone(),
                    }
                }
            });
        }

        let mut model_dependencies: BTreeSet<ModelName> = expanded.refs.clone();
        model_dependencies.extend(expanded.depends_on.iter().cloned());
        for relation in &parsed_sql.relations {
            if let RelationKind::Model(dep_name) = &relation.kind {
                model_dependencies.insert(dep_name.clone());
            }
        }

        let fp = fingerprint(raw_text, &config);

        let model = Model {
            name: name.clone(),
            raw_text: raw_text.to_string(),
            fingerprint: fp.clone(),
            materialization: materialization_from_config(&config, self.default_materialization),
            incremental_strategy: incremental_strategy_from_config(&config),
            unique_key: config.get("unique_key").cloned(),
            on_schema_change: on_schema_change_from_config(&config),
            declared_variables: extract_variable_tokens(raw_text),
            explicit_dependencies: expanded.depends_on.clone(),
            column_schema: self
                .schemas
                .get(name)
                .map(|s| s.columns.keys().cloned().collect()),
            config: config.clone(),
        };

        let parsed_model = ParsedModel {
            name: name.clone(),
            fingerprint: fp,
            expanded_sql: expanded.sql,
            model_dependencies,
            source_references: expanded.sources,
            column_lineage: parsed_sql.column_lineage,
            config,
        };

        Ok((model, parsed_model, warnings))
    }

    /// Output-column hints for `SELECT *` wildcard expansion (spec §4.2):
    /// prefer a declared `schema.yml` column list, else fall back to an
    /// already-parsed upstream model's own output column names.
    fn upstream_schema_hints(&self) -> BTreeMap<String, Vec<String>> {
        let mut hints = BTreeMap::new();
        for (name, schema) in &self.schemas {
            if !schema.columns.is_empty() {
                hints.insert(name.clone(), schema.columns.keys().cloned().collect());
            }
        }
        for (name, parsed) in &self.parsed {
            if hints.contains_key(name) {
                continue;
            }
            let columns: Vec<String> = parsed
                .column_lineage
                .iter()
                .filter(|c| !c.opaque)
                .map(|c| c.output_column.clone())
                .collect();
            if !columns.is_empty() {
                hints.insert(name.clone(), columns);
            }
        }
        hints
    }
}

fn materialization_key(kind: sqlforge_common::MaterializationKind) -> String {
    use sqlforge_common::MaterializationKind::*;
    match kind {
        View => "view",
        Table => "table",
        Temp => "temp",
        Incremental => "incremental",
        Cdc => "cdc",
    }
    .to_string()
}

fn materialization_from_config(
    config: &BTreeMap<String, String>,
    default: sqlforge_common::MaterializationKind,
) -> sqlforge_common::MaterializationKind {
    use sqlforge_common::MaterializationKind::*;
    match config.get("materialized").map(String::as_str) {
        Some("view") => View,
        Some("table") => Table,
        Some("temp") => Temp,
        Some("incremental") => Incremental,
        Some("cdc") => Cdc,
        _ => default,
    }
}

fn incremental_strategy_from_config(
    config: &BTreeMap<String, String>,
) -> Option<sqlforge_common::IncrementalStrategy> {
    use sqlforge_common::IncrementalStrategy::*;
    match config.get("incremental_strategy").map(String::as_str) {
        Some("append") => Some(Append),
        Some("time") => Some(Time),
        Some("unique_key") => Some(UniqueKey),
        _ => None,
    }
}

fn on_schema_change_from_config(config: &BTreeMap<String, String>) -> sqlforge_common::OnSchemaChange {
    use sqlforge_common::OnSchemaChange::*;
    match config.get("on_schema_change").map(String::as_str) {
        Some("append_new_columns") => AppendNewColumns,
        Some("fail") => Fail,
        _ => Ignore,
    }
}

/// Scan for `$variable` tokens outside string literals at a coarse level
/// (spec §4.1/§4.9 "declared variables" / O(n) single regex pass, spec
/// §4.7). A leading `$` followed by an identifier, not itself inside a
/// quoted string, counts as declared.
fn extract_variable_tokens(raw_text: &str) -> BTreeSet<String> {
    static VAR_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = VAR_RE.get_or_init(|| regex::Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());
    let mut names = BTreeSet::new();
    let mut in_string = false;
    let mut cursor = 0usize;
    for quote_match in raw_text.match_indices('\'') {
        let (pos, _) = quote_match;
        if !in_string {
            for caps in re.captures_iter(&raw_text[cursor..pos]) {
                names.insert(caps[1].to_string());
            }
        }
        in_string = !in_string;
        cursor = pos + 1;
    }
    if !in_string {
        for caps in re.captures_iter(&raw_text[cursor..]) {
            names.insert(caps[1].to_string());
        }
    }
    names
}

/// Re-expose C2's lineage type so downstream crates only depend on
/// `sqlforge-registry` for the full compiled picture.
pub type Lineage = ColumnLineage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_computes_fingerprint_and_materialization() {
        let mut reg = Registry::new("dev");
        reg.register("silver/a.sql", "-- config: materialized=table\nselect 1 as x")
            .unwrap();
        let model = reg.get(&"silver.a".to_string()).unwrap();
        assert_eq!(model.materialization, sqlforge_common::MaterializationKind::Table);
        assert!(!model.fingerprint.is_empty());
    }

    #[test]
    fn reregistering_identical_text_gives_identical_fingerprint() {
        let mut reg = Registry::new("dev");
        reg.register("silver/a.sql", "select 1 as x").unwrap();
        let fp1 = reg.get(&"silver.a".to_string()).unwrap().fingerprint.clone();
        reg.register("silver/a.sql", "select 1 as x").unwrap();
        let fp2 = reg.get(&"silver.a".to_string()).unwrap().fingerprint.clone();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn ref_becomes_a_model_dependency() {
        let mut reg = Registry::new("dev");
        reg.register("silver/a.sql", "select 1 as x").unwrap();
        reg.register(
            "silver/b.sql",
            "select x from {{ ref('silver.a') }}",
        )
        .unwrap();
        let deps = reg.dependencies_of(&"silver.b".to_string()).unwrap();
        assert!(deps.contains("silver.a"));
    }

    #[test]
    fn depends_on_comment_is_captured_as_a_dependency() {
        let mut reg = Registry::new("dev");
        reg.register("silver/a.sql", "select 1").unwrap();
        reg.register(
            "silver/b.sql",
            "-- depends_on: silver.a\nselect 1",
        )
        .unwrap();
        let deps = reg.dependencies_of(&"silver.b".to_string()).unwrap();
        assert!(deps.contains("silver.a"));
    }

    #[test]
    fn remove_drops_model_and_parsed_form() {
        let mut reg = Registry::new("dev");
        reg.register("silver/a.sql", "select 1").unwrap();
        reg.remove(&"silver.a".to_string());
        assert!(matches!(
            reg.get(&"silver.a".to_string()),
            Err(EngineError::ModelNotFound(_))
        ));
    }

    #[test]
    fn name_from_path_uses_dots_for_nested_directories() {
        assert_eq!(name_from_path("silver/cleaned_orders.sql"), "silver.cleaned_orders");
    }

    #[test]
    fn variable_tokens_inside_string_literals_are_ignored() {
        let vars = extract_variable_tokens("select '$not_a_var' as c, $run_date as d");
        assert!(vars.contains("run_date"));
        assert!(!vars.contains("not_a_var"));
    }
}
