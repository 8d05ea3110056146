//! `$variable` substitution (spec §4.7: "single-pass regex substitution
//! for `$var` tokens, O(n) in SQL length, never per-variable string
//! replace"; spec §4.9 and §8 testable property). Shared between the
//! driver pool's raw-SQL execution path and the Executor's pre-model
//! substitution step.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{EngineError, EngineResult};

fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

/// Substitute every `$var` token in `sql` with its value from `variables`
/// in one regex pass. Spec §8: "substituting V is equivalent to the regex
/// `\$([A-Za-z_][A-Za-z0-9_]*) -> V[match]`; undefined variables raise
/// `MissingVariableError`."
pub fn substitute_variables(
    sql: &str,
    variables: &BTreeMap<String, String>,
) -> EngineResult<String> {
    let mut missing: Option<String> = None;
    let result = variable_re().replace_all(sql, |caps: &regex::Captures| {
        let name = &caps[1];
        match variables.get(name) {
            Some(value) => value.clone(),
            None => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(EngineError::MissingVariableError(name));
    }
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_every_occurrence_in_one_pass() {
        let mut vars = BTreeMap::new();
        vars.insert("run_date".to_string(), "2024-01-01".to_string());
        let out = substitute_variables("select * from t where d = $run_date or e = $run_date", &vars)
            .unwrap();
        assert_eq!(
            out,
            "select * from t where d = 2024-01-01 or e = 2024-01-01"
        );
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let err = substitute_variables("select $missing", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::MissingVariableError(name) if name == "missing"));
    }
}
