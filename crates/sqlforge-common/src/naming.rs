//! The one naming convention this engine fixes on its own behalf: mapping a
//! logical dotted model name to the physical warehouse identifier
//! substituted for `{{ this }}` (spec §4.1). Snowflake-specific transport
//! and authentication are out of scope (spec.md §1); this is just string
//! shaping, not a driver concern.

/// `environment = "prod"`, `model_name = "silver.cleaned_orders"` →
/// `"prod.silver.cleaned_orders"`, read as `database.schema.table`.
pub fn physical_identifier(environment: &str, model_name: &str) -> String {
    format!("{environment}.{model_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_environment_and_model_name() {
        assert_eq!(
            physical_identifier("dev", "silver.cleaned_orders"),
            "dev.silver.cleaned_orders"
        );
    }
}
