//! Late binding, immediately before execution (spec §4.1: "`{{ this }}` /
//! `is_incremental()` / `ref`/`source` placeholders are resolved to
//! physical identifiers only immediately before execution").
//!
//! The registry already ran C1 once at compile time (with `is_incremental =
//! false`) to extract dependencies and lineage; here we re-run it with the
//! model's true incremental state, since a different `{% if is_incremental()
//! %}` branch can select entirely different SQL.

use sqlforge_common::errors::{EngineError, EngineResult};
use sqlforge_common::naming::physical_identifier;
use sqlforge_common::substitute_variables;
use sqlforge_registry::{Model, Registry};
use sqlforge_template::{expand, ref_placeholder, source_placeholder, SimpleContext};
use std::collections::BTreeMap;

/// Substitute `$variable`s, re-expand the template with the model's true
/// `is_incremental` state, and resolve every `ref()`/`source()` placeholder
/// to a physical identifier. Returns the final, executable `SELECT` body.
pub fn build_execution_sql(
    registry: &Registry,
    model: &Model,
    variables: &BTreeMap<String, String>,
    is_incremental: bool,
) -> EngineResult<String> {
    let substituted = substitute_variables(&model.raw_text, variables)?;

    let ctx = SimpleContext {
        this_identifier: physical_identifier(registry.environment(), &model.name),
        is_incremental,
    };
    let expanded = expand(&substituted, &ctx)?;

    let mut sql = expanded.sql;
    for dep in &expanded.refs {
        let placeholder = ref_placeholder(dep);
        let physical = physical_identifier(registry.environment(), dep);
        sql = sql.replace(&placeholder, &physical);
    }
    for (group, table) in &expanded.sources {
        let placeholder = source_placeholder(group, table);
        let source = registry.resolve_source(group, table).ok_or_else(|| {
            EngineError::MissingModelError(format!("{group}.{table}"))
        })?;
        sql = sql.replace(&placeholder, &source.physical);
    }

    Ok(sql)
}

/// Fail fast, before any model in the run starts executing, if a required
/// `$variable` is missing for any model that would run (spec §4.9).
pub fn validate_variables<'a>(
    registry: &Registry,
    model_names: impl Iterator<Item = &'a String>,
    variables: &BTreeMap<String, String>,
) -> EngineResult<()> {
    for name in model_names {
        let model = registry.get(name)?;
        for var in &model.declared_variables {
            if !variables.contains_key(var) {
                return Err(EngineError::MissingVariableError(var.clone()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(name_path: &str, text: &str) -> Registry {
        let mut reg = Registry::new("dev");
        reg.register(name_path, text).unwrap();
        reg
    }

    #[test]
    fn ref_placeholder_is_resolved_to_a_physical_identifier() {
        let mut reg = registry_with("silver/a.sql", "select 1 as x");
        reg.register("silver/b.sql", "select x from {{ ref('silver.a') }}").unwrap();
        let model = reg.get(&"silver.b".to_string()).unwrap().clone();
        let sql = build_execution_sql(&reg, &model, &BTreeMap::new(), false).unwrap();
        assert_eq!(sql, "select x from dev.silver.a");
    }

    #[test]
    fn source_placeholder_resolves_via_the_sources_catalogue() {
        let mut reg = registry_with("silver/a.sql", "select * from {{ source('raw', 'orders') }}");
        reg.register_source("raw", "orders", "prod_raw.orders_tbl");
        let model = reg.get(&"silver.a".to_string()).unwrap().clone();
        let sql = build_execution_sql(&reg, &model, &BTreeMap::new(), false).unwrap();
        assert_eq!(sql, "select * from prod_raw.orders_tbl");
    }

    #[test]
    fn is_incremental_branch_reflects_the_execution_time_flag() {
        let reg = registry_with(
            "silver/a.sql",
            "select 1 {% if is_incremental() %}where x > 1{% endif %}",
        );
        let model = reg.get(&"silver.a".to_string()).unwrap().clone();
        let first_run_sql = build_execution_sql(&reg, &model, &BTreeMap::new(), false).unwrap();
        let incremental_sql = build_execution_sql(&reg, &model, &BTreeMap::new(), true).unwrap();
        assert_eq!(first_run_sql, "select 1 ");
        assert_eq!(incremental_sql, "select 1 where x > 1");
    }

    #[test]
    fn missing_variable_is_reported_before_any_execution() {
        let reg = registry_with("silver/a.sql", "select * from t where d = $run_date");
        let err = validate_variables(&reg, reg.names().iter(), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::MissingVariableError(_)));
    }
}
