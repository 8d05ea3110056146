//! Human-facing renderings the CLI's `deps`/`lineage` verbs hand back to
//! the terminal (SPEC_FULL.md §B). Pure text formatting over already
//! compiled registry state — no I/O, no warehouse access.

use sqlforge_common::errors::EngineResult;
use sqlforge_registry::Registry;

/// `lineage <model>` (SPEC_FULL.md §B): one line per output column, listing
/// the upstream (relation, column) pairs C2 traced it to.
pub fn render_lineage(registry: &Registry, model_name: &str) -> EngineResult<String> {
    let parsed = registry.get_parsed(&model_name.to_string())?;
    if parsed.column_lineage.is_empty() {
        return Ok(format!("{model_name}: no column lineage recorded\n"));
    }

    let mut out = String::new();
    for column in &parsed.column_lineage {
        if column.opaque {
            out.push_str(&format!("{model_name}.{} <- (opaque)\n", column.output_column));
            continue;
        }
        let upstream: Vec<String> = column
            .upstream
            .iter()
            .map(|u| format!("{}.{}", u.relation, u.column))
            .collect();
        out.push_str(&format!(
            "{model_name}.{} <- {}\n",
            column.output_column,
            upstream.join(", ")
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_reported_as_an_error() {
        let registry = Registry::new("dev");
        let err = render_lineage(&registry, "silver.nope").unwrap_err();
        assert!(matches!(
            err,
            sqlforge_common::errors::EngineError::ModelNotFound(_)
        ));
    }

    #[test]
    fn a_model_with_no_traced_lineage_says_so() {
        let mut registry = Registry::new("dev");
        registry.register("silver/a.sql", "select 1 as x").unwrap();
        let report = render_lineage(&registry, "silver.a").unwrap();
        assert!(report.contains("no column lineage recorded") || report.contains("<-"));
    }
}
