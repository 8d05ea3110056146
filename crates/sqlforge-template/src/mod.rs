//! C1 Template Expander (spec §4.1).
//!
//! Deliberately a tiny, non-Turing-complete dialect: a hand-written scanner
//! recognising exactly the constructs spec §4.1 names, rather than pulling
//! in a general templating engine. This mirrors the teacher's posture that
//! "a hand-written expander suffices and avoids a generic templating
//! dependency" (spec §9 Design Notes) even though the teacher itself
//! embeds a full Jinja dialect (`minijinja`) for its own, much larger,
//! surface area.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use sqlforge_common::errors::{EngineError, EngineResult};

/// What the expander needs to know about the model being expanded and the
/// target environment, supplied by the caller (the registry/planner own
/// this knowledge; the expander itself does no I/O).
pub trait ExpansionContext {
    /// Fully qualified physical identifier substituted for `{{ this }}`.
    fn this_identifier(&self) -> &str;
    /// Whether the model has been previously materialised (drives
    /// `{{ is_incremental() }}`).
    fn is_incremental(&self) -> bool;
}

/// A simple owned implementation of [`ExpansionContext`] for tests and for
/// callers that already have the two values in hand.
#[derive(Debug, Clone)]
pub struct SimpleContext {
    pub this_identifier: String,
    pub is_incremental: bool,
}

impl ExpansionContext for SimpleContext {
    fn this_identifier(&self) -> &str {
        &self.this_identifier
    }

    fn is_incremental(&self) -> bool {
        self.is_incremental
    }
}

/// C1's output: expanded SQL plus the two extracted relation sets and the
/// config/dependency metadata pulled from leading comments (spec §4.1's
/// last two table rows).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandedTemplate {
    pub sql: String,
    pub refs: BTreeSet<String>,
    pub sources: BTreeSet<(String, String)>,
    pub config: BTreeMap<String, String>,
    pub depends_on: BTreeSet<String>,
}

/// Placeholder prefix for a `ref()` target; resolved to a physical
/// identifier only immediately before execution (spec §4.1).
pub fn ref_placeholder(name: &str) -> String {
    format!("__REF__{name}__")
}

/// Placeholder prefix for a `source()` target.
pub fn source_placeholder(group: &str, table: &str) -> String {
    format!("__SRC__{group}__{table}__")
}

struct Scanner {
    ref_re: Regex,
    source_re: Regex,
    this_re: Regex,
    is_incremental_re: Regex,
    if_block_re: Regex,
    mustache_re: Regex,
    config_line_re: Regex,
    depends_on_line_re: Regex,
}

impl Scanner {
    fn new() -> Self {
        Self {
            ref_re: Regex::new(r#"\{\{\s*ref\(\s*'([^']+)'\s*\)\s*\}\}"#).unwrap(),
            source_re: Regex::new(
                r#"\{\{\s*source\(\s*'([^']+)'\s*,\s*'([^']+)'\s*\)\s*\}\}"#,
            )
            .unwrap(),
            this_re: Regex::new(r#"\{\{\s*this\s*\}\}"#).unwrap(),
            is_incremental_re: Regex::new(r#"is_incremental\(\s*\)"#).unwrap(),
            if_block_re: Regex::new(
                r#"(?s)\{%\s*if\s+(?P<expr>[^%]+?)\s*%\}(?P<then>.*?)(?:\{%\s*else\s*%\}(?P<otherwise>.*?))?\{%\s*endif\s*%\}"#,
            )
            .unwrap(),
            mustache_re: Regex::new(r#"\{\{.*?\}\}"#).unwrap(),
            config_line_re: Regex::new(r#"^\s*--\s*config:\s*(.*)$"#).unwrap(),
            depends_on_line_re: Regex::new(r#"^\s*--\s*depends_on:\s*(.*)$"#).unwrap(),
        }
    }
}

/// Expand `raw_sql` against `ctx`. Pure: no I/O, deterministic for a given
/// input pair.
pub fn expand(raw_sql: &str, ctx: &dyn ExpansionContext) -> EngineResult<ExpandedTemplate> {
    let scanner = Scanner::new();
    let mut out = ExpandedTemplate::default();

    let body = strip_leading_comments(raw_sql, &scanner, &mut out);
    let body = expand_if_blocks(&body, &scanner, ctx)?;
    let body = expand_refs_and_sources(&body, &scanner, &mut out);
    let body = replace_this(&body, &scanner, ctx);

    reject_unknown_constructs(&body, &scanner)?;

    out.sql = body;
    Ok(out)
}

/// Consume leading `-- config: ...` / `-- depends_on: ...` comment lines,
/// stopping at the first line that is neither (spec §4.1: "leading
/// comment").
fn strip_leading_comments(raw_sql: &str, scanner: &Scanner, out: &mut ExpandedTemplate) -> String {
    let mut remaining_lines: Vec<&str> = Vec::new();
    let mut lines = raw_sql.lines();
    let mut still_leading = true;

    for line in lines.by_ref() {
        if still_leading {
            if let Some(caps) = scanner.config_line_re.captures(line) {
                for entry in caps[1].split(',') {
                    if let Some((k, v)) = entry.split_once('=') {
                        out.config.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
                continue;
            }
            if let Some(caps) = scanner.depends_on_line_re.captures(line) {
                for dep in caps[1].split(',') {
                    let dep = dep.trim();
                    if !dep.is_empty() {
                        out.depends_on.insert(dep.to_string());
                    }
                }
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            still_leading = false;
        }
        remaining_lines.push(line);
    }
    remaining_lines.join("\n")
}

/// Evaluate `{% if <expr> %}...{% else %}...{% endif %}` blocks. Spec §4.1:
/// "Expression may only be `is_incremental()` or boolean literal."
fn expand_if_blocks(
    body: &str,
    scanner: &Scanner,
    ctx: &dyn ExpansionContext,
) -> EngineResult<String> {
    // Iteratively replace non-overlapping top-level blocks; blocks are not
    // nested per spec, so one linear pass over non-overlapping matches
    // suffices.
    let mut result = String::with_capacity(body.len());
    let mut last_end = 0;
    for caps in scanner.if_block_re.captures_iter(body) {
        let whole = caps.get(0).unwrap();
        result.push_str(&body[last_end..whole.start()]);

        let expr = caps.name("expr").unwrap().as_str().trim();
        let condition = evaluate_condition(expr, scanner, ctx, whole.start(), body)?;

        let then_branch = caps.name("then").map(|m| m.as_str()).unwrap_or("");
        let else_branch = caps.name("otherwise").map(|m| m.as_str()).unwrap_or("");

        result.push_str(if condition { then_branch } else { else_branch });
        last_end = whole.end();
    }
    result.push_str(&body[last_end..]);
    Ok(result)
}

fn evaluate_condition(
    expr: &str,
    scanner: &Scanner,
    ctx: &dyn ExpansionContext,
    byte_offset: usize,
    full_text: &str,
) -> EngineResult<bool> {
    if scanner.is_incremental_re.is_match(expr) {
        Ok(ctx.is_incremental())
    } else if expr == "true" {
        Ok(true)
    } else if expr == "false" {
        Ok(false)
    } else {
        let (line, column) = line_col_at(full_text, byte_offset);
        Err(EngineError::TemplateError {
            message: format!(
                "unsupported `{{% if %}}` expression `{expr}` (only is_incremental() or a boolean literal are allowed)"
            ),
            line,
            column,
        })
    }
}

/// Also resolves a bare `{{ is_incremental() }}` occurring outside an `if`
/// block by substituting the literal boolean directly, since §4.1 treats
/// it as a boolean expression usable wherever one is valid.
fn expand_refs_and_sources(
    body: &str,
    scanner: &Scanner,
    out: &mut ExpandedTemplate,
) -> String {
    let body = scanner.ref_re.replace_all(body, |caps: &regex::Captures| {
        let name = &caps[1];
        out.refs.insert(name.to_string());
        ref_placeholder(name)
    });
    let body = scanner
        .source_re
        .replace_all(&body, |caps: &regex::Captures| {
            let group = &caps[1];
            let table = &caps[2];
            out.sources.insert((group.to_string(), table.to_string()));
            source_placeholder(group, table)
        });
    body.into_owned()
}

fn replace_this(body: &str, scanner: &Scanner, ctx: &dyn ExpansionContext) -> String {
    scanner
        .this_re
        .replace_all(body, ctx.this_identifier())
        .into_owned()
}

fn reject_unknown_constructs(body: &str, scanner: &Scanner) -> EngineResult<()> {
    if let Some(m) = scanner.mustache_re.find(body) {
        let (line, column) = line_col_at(body, m.start());
        return Err(EngineError::TemplateError {
            message: format!("unrecognised template construct `{}`", m.as_str()),
            line,
            column,
        });
    }
    // A bare `is_incremental()` call left outside an `{% if %}` is not a
    // recognised top-level construct per the table in spec §4.1.
    if let Some(m) = scanner.is_incremental_re.find(body) {
        let (line, column) = line_col_at(body, m.start());
        return Err(EngineError::TemplateError {
            message: "is_incremental() may only appear inside {% if %}...{% endif %}".to_string(),
            line,
            column,
        });
    }
    Ok(())
}

fn line_col_at(text: &str, byte_offset: usize) -> (u32, u32) {
    let mut line = 1u32;
    let mut col = 1u32;
    for ch in text[..byte_offset.min(text.len())].chars() {
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(incremental: bool) -> SimpleContext {
        SimpleContext {
            this_identifier: "db.schema.my_model".to_string(),
            is_incremental: incremental,
        }
    }

    #[test]
    fn expands_ref_and_tracks_dependency() {
        let out = expand("select * from {{ ref('upstream') }}", &ctx(false)).unwrap();
        assert_eq!(out.sql, "select * from __REF__upstream__");
        assert!(out.refs.contains("upstream"));
    }

    #[test]
    fn expands_source() {
        let out = expand("select * from {{ source('raw', 'orders') }}", &ctx(false)).unwrap();
        assert_eq!(out.sql, "select * from __SRC__raw__orders__");
        assert!(out.sources.contains(&("raw".to_string(), "orders".to_string())));
    }

    #[test]
    fn expands_this() {
        let out = expand("create view {{ this }} as select 1", &ctx(false)).unwrap();
        assert_eq!(out.sql, "create view db.schema.my_model as select 1");
    }

    #[test]
    fn is_incremental_if_block_selects_branch() {
        let sql = "select 1 {% if is_incremental() %}where x > 1{% else %}{% endif %}";
        assert_eq!(
            expand(sql, &ctx(true)).unwrap().sql,
            "select 1 where x > 1"
        );
        assert_eq!(expand(sql, &ctx(false)).unwrap().sql, "select 1 ");
    }

    #[test]
    fn leading_config_and_depends_on_comments_are_extracted_not_emitted() {
        let sql = "-- config: materialized=table, unique_key=id\n-- depends_on: a, b\nselect 1";
        let out = expand(sql, &ctx(false)).unwrap();
        assert_eq!(out.sql, "select 1");
        assert_eq!(out.config.get("materialized").unwrap(), "table");
        assert_eq!(out.config.get("unique_key").unwrap(), "id");
        assert!(out.depends_on.contains("a"));
        assert!(out.depends_on.contains("b"));
    }

    #[test]
    fn dollar_variables_are_left_untouched() {
        let out = expand("select * from t where d = $run_date", &ctx(false)).unwrap();
        assert_eq!(out.sql, "select * from t where d = $run_date");
    }

    #[test]
    fn unknown_construct_is_a_template_error() {
        let err = expand("select {{ made_up_fn() }}", &ctx(false)).unwrap_err();
        match err {
            EngineError::TemplateError { line, .. } => assert_eq!(line, 1),
            other => panic!("expected TemplateError, got {other:?}"),
        }
    }

    #[test]
    fn bare_is_incremental_outside_if_is_rejected() {
        let err = expand("select {{ is_incremental() }}", &ctx(false)).unwrap_err();
        assert!(matches!(err, EngineError::TemplateError { .. }));
    }

    #[test]
    fn if_expression_must_be_is_incremental_or_boolean_literal() {
        let err = expand("{% if 1 == 1 %}a{% endif %}", &ctx(false)).unwrap_err();
        assert!(matches!(err, EngineError::TemplateError { .. }));
    }
}
