//! C2 SQL AST Parser (spec §4.2).
//!
//! Parses the expanded SQL (Snowflake dialect) with `sqlparser`, and walks
//! the resulting AST to recover (a) every referenced relation and (b)
//! per-output-column lineage. Parsing and lineage tracing degrade
//! gracefully: a model that `sqlparser` cannot parse, or a projection whose
//! provenance cannot be traced precisely, never blocks compilation — it
//! only produces a [`ParseWarning`](Diagnostic::ParseWarning) /
//! [`LineageWarning`](Diagnostic::LineageWarning) and an empty or
//! best-effort result, per spec §4.2: "SQL always runs."

use std::collections::{BTreeMap, BTreeSet};

use sqlparser::ast::{
    Expr, Ident, ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};
use sqlparser::dialect::SnowflakeDialect;
use sqlparser::parser::Parser;

/// Where a relation resolves to, recovered from either the C1 placeholder
/// tokens or a bare schema-qualified identifier (spec §4.2: "backward
/// compatible shortcut").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelationKind {
    Model(String),
    Source(String, String),
    /// An identifier sqlforge could not resolve to a known model or source;
    /// kept for display/debugging but not added as a dependency edge.
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RelationRef {
    pub label: String,
    pub kind: RelationKind,
}

/// One upstream (model/source, column) pair a projected column was traced
/// to (spec §3 ParsedModel: "per-output-column lineage").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamColumn {
    pub relation: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLineage {
    pub output_column: String,
    pub upstream: Vec<UpstreamColumn>,
    /// True when provenance could not be traced precisely (e.g. `SELECT *`
    /// with an unknown upstream schema, or an expression too complex to
    /// resolve) — spec §4.2: "opaque 'wildcard from X' lineage edge."
    pub opaque: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    ParseWarning(String),
    LineageWarning(String),
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSql {
    pub relations: BTreeSet<RelationRef>,
    pub column_lineage: Vec<ColumnLineage>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse `sql` and extract relations + column lineage. `known_models` is
/// used to resolve the "direct bare reference" shortcut (spec §4.2).
/// `upstream_schemas` maps a relation label to its known output columns,
/// used to expand `SELECT *` precisely when possible.
pub fn parse_and_extract(
    sql: &str,
    known_models: &BTreeSet<String>,
    upstream_schemas: &BTreeMap<String, Vec<String>>,
) -> ParsedSql {
    let dialect = SnowflakeDialect {};
    let statements = match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => statements,
        Err(e) => {
            return ParsedSql {
                relations: BTreeSet::new(),
                column_lineage: Vec::new(),
                diagnostics: vec![Diagnostic::ParseWarning(format!(
                    "could not parse SQL, proceeding with empty lineage: {e}"
                ))],
            };
        }
    };

    let mut out = ParsedSql::default();
    for stmt in &statements {
        if let Statement::Query(query) = stmt {
            walk_query(query, known_models, upstream_schemas, &mut out);
        }
    }
    out
}

fn walk_query(
    query: &Query,
    known_models: &BTreeSet<String>,
    upstream_schemas: &BTreeMap<String, Vec<String>>,
    out: &mut ParsedSql,
) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            walk_query(&cte.query, known_models, upstream_schemas, out);
        }
    }
    walk_set_expr(&query.body, known_models, upstream_schemas, out, true);
}

fn walk_set_expr(
    set_expr: &SetExpr,
    known_models: &BTreeSet<String>,
    upstream_schemas: &BTreeMap<String, Vec<String>>,
    out: &mut ParsedSql,
    is_top_level: bool,
) {
    match set_expr {
        SetExpr::Select(select) => {
            let alias_map = collect_relations(&select.from, known_models, out);
            if is_top_level {
                trace_column_lineage(select, &alias_map, upstream_schemas, out);
            }
        }
        SetExpr::Query(query) => walk_query(query, known_models, upstream_schemas, out),
        SetExpr::SetOperation { left, right, .. } => {
            // UNION/INTERSECT/EXCEPT: relations from both sides count as
            // dependencies; lineage is only traced for simple top-level
            // SELECTs, so composed set operations get opaque lineage.
            walk_set_expr(left, known_models, upstream_schemas, out, false);
            walk_set_expr(right, known_models, upstream_schemas, out, false);
            if is_top_level {
                out.diagnostics.push(Diagnostic::LineageWarning(
                    "set operation (UNION/INTERSECT/EXCEPT) at top level: lineage not traced"
                        .to_string(),
                ));
            }
        }
        SetExpr::Values(_) | SetExpr::Table(_) | SetExpr::Insert(_) | SetExpr::Update(_) => {}
    }
}

/// Label -> RelationKind + alias -> label map built from a FROM clause.
fn collect_relations(
    from: &[TableWithJoins],
    known_models: &BTreeSet<String>,
    out: &mut ParsedSql,
) -> BTreeMap<String, String> {
    let mut alias_map = BTreeMap::new();
    for twj in from {
        register_table_factor(&twj.relation, known_models, out, &mut alias_map);
        for join in &twj.joins {
            register_table_factor(&join.relation, known_models, out, &mut alias_map);
        }
    }
    alias_map
}

fn register_table_factor(
    factor: &TableFactor,
    known_models: &BTreeSet<String>,
    out: &mut ParsedSql,
    alias_map: &mut BTreeMap<String, String>,
) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let raw = object_name_to_string(name);
            let rel = resolve_relation(&raw, known_models);
            let alias_key = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| last_segment(&raw));
            alias_map.insert(alias_key, rel.label.clone());
            out.relations.insert(rel);
        }
        TableFactor::Derived { alias, .. } => {
            if let Some(alias) = alias {
                alias_map.insert(alias.name.value.clone(), alias.name.value.clone());
            }
            // Subquery relations/lineage are not descended into further;
            // this is the coarse-degradation path spec §4.2 allows.
        }
        _ => {}
    }
}

fn object_name_to_string(name: &ObjectName) -> String {
    name.to_string()
}

fn last_segment(raw: &str) -> String {
    raw.rsplit('.').next().unwrap_or(raw).to_string()
}

/// Map a raw relation identifier back to a C1 placeholder, or treat it as a
/// bare schema-qualified reference (spec §4.2 backward-compatible
/// shortcut): if it matches a known model name, it becomes a dependency.
fn resolve_relation(raw: &str, known_models: &BTreeSet<String>) -> RelationRef {
    if let Some(rest) = raw.strip_prefix("__REF__") {
        let name = rest.trim_end_matches("__").to_string();
        return RelationRef {
            label: name.clone(),
            kind: RelationKind::Model(name),
        };
    }
    if let Some(rest) = raw.strip_prefix("__SRC__") {
        let rest = rest.trim_end_matches("__");
        if let Some((group, table)) = rest.split_once("__") {
            return RelationRef {
                label: format!("{group}.{table}"),
                kind: RelationKind::Source(group.to_string(), table.to_string()),
            };
        }
    }
    let dotted = raw.trim_matches('"').to_string();
    if known_models.contains(&dotted) {
        return RelationRef {
            label: dotted.clone(),
            kind: RelationKind::Model(dotted),
        };
    }
    RelationRef {
        label: dotted.clone(),
        kind: RelationKind::Unresolved(dotted),
    }
}

fn trace_column_lineage(
    select: &Select,
    alias_map: &BTreeMap<String, String>,
    upstream_schemas: &BTreeMap<String, Vec<String>>,
    out: &mut ParsedSql,
) {
    let single_relation = if alias_map.len() == 1 {
        alias_map.values().next().cloned()
    } else {
        None
    };

    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => {
                let name = display_column_name(expr);
                out.column_lineage
                    .push(lineage_for_expr(&name, expr, &single_relation, alias_map));
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                out.column_lineage.push(lineage_for_expr(
                    &alias.value,
                    expr,
                    &single_relation,
                    alias_map,
                ));
            }
            SelectItem::Wildcard(_) => {
                let extra = wildcard_lineage(alias_map, upstream_schemas, out);
                out.column_lineage.extend(extra);
            }
            SelectItem::QualifiedWildcard(kind, _) => {
                let qualifier = kind.to_string();
                let relation = alias_map.get(&qualifier).cloned().unwrap_or(qualifier);
                let lineage = wildcard_lineage_for_relation(&relation, upstream_schemas, out);
                out.column_lineage.push(lineage);
            }
        }
    }
}

fn wildcard_lineage(
    alias_map: &BTreeMap<String, String>,
    upstream_schemas: &BTreeMap<String, Vec<String>>,
    out: &mut ParsedSql,
) -> Vec<ColumnLineage> {
    alias_map
        .values()
        .map(|relation| wildcard_lineage_for_relation(relation, upstream_schemas, out))
        .collect()
}

fn wildcard_lineage_for_relation(
    relation: &str,
    upstream_schemas: &BTreeMap<String, Vec<String>>,
    out: &mut ParsedSql,
) -> ColumnLineage {
    match upstream_schemas.get(relation) {
        Some(columns) => ColumnLineage {
            output_column: format!("*({relation})"),
            upstream: columns
                .iter()
                .map(|c| UpstreamColumn {
                    relation: relation.to_string(),
                    column: c.clone(),
                })
                .collect(),
            opaque: false,
        },
        None => {
            out.diagnostics.push(Diagnostic::LineageWarning(format!(
                "SELECT * from {relation}: upstream schema unknown, recording opaque lineage"
            )));
            ColumnLineage {
                output_column: format!("wildcard from {relation}"),
                upstream: vec![],
                opaque: true,
            }
        }
    }
}

fn lineage_for_expr(
    output_column: &str,
    expr: &Expr,
    single_relation: &Option<String>,
    alias_map: &BTreeMap<String, String>,
) -> ColumnLineage {
    match expr {
        Expr::Identifier(Ident { value, .. }) => {
            if let Some(relation) = single_relation {
                ColumnLineage {
                    output_column: output_column.to_string(),
                    upstream: vec![UpstreamColumn {
                        relation: relation.clone(),
                        column: value.clone(),
                    }],
                    opaque: false,
                }
            } else {
                ColumnLineage {
                    output_column: output_column.to_string(),
                    upstream: vec![],
                    opaque: true,
                }
            }
        }
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let qualifier = parts[parts.len() - 2].value.clone();
            let column = parts[parts.len() - 1].value.clone();
            match alias_map.get(&qualifier) {
                Some(relation) => ColumnLineage {
                    output_column: output_column.to_string(),
                    upstream: vec![UpstreamColumn {
                        relation: relation.clone(),
                        column,
                    }],
                    opaque: false,
                },
                None => ColumnLineage {
                    output_column: output_column.to_string(),
                    upstream: vec![],
                    opaque: true,
                },
            }
        }
        other => {
            // Complex expression (function call, arithmetic, CASE, ...):
            // fall back to coarse text-based identifier scanning rather
            // than exhaustively matching every `Expr` variant. This is the
            // graceful-degradation path spec §4.2 mandates for anything
            // the AST walk doesn't special-case.
            let upstream = coarse_identifiers(&other.to_string(), alias_map, single_relation);
            ColumnLineage {
                output_column: output_column.to_string(),
                opaque: upstream.is_empty(),
                upstream,
            }
        }
    }
}

fn display_column_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => {
            parts.last().map(|i| i.value.clone()).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

const SQL_KEYWORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "as", "on", "case", "when", "then", "else",
    "end", "cast", "null", "true", "false", "sum", "count", "avg", "min", "max", "coalesce",
    "distinct", "over", "partition", "by", "order", "group",
];

/// Best-effort identifier scan over an expression's rendered SQL text, used
/// only for lineage edges on expressions too complex for the typed walk
/// above (spec §4.2 graceful degradation).
fn coarse_identifiers(
    rendered: &str,
    alias_map: &BTreeMap<String, String>,
    single_relation: &Option<String>,
) -> Vec<UpstreamColumn> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut token = String::new();
    let mut chars = rendered.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' || c == '.' {
            token.push(c);
        } else {
            flush_token(&mut token, alias_map, single_relation, &mut seen, &mut out);
        }
    }
    flush_token(&mut token, alias_map, single_relation, &mut seen, &mut out);
    out
}

fn flush_token(
    token: &mut String,
    alias_map: &BTreeMap<String, String>,
    single_relation: &Option<String>,
    seen: &mut BTreeSet<String>,
    out: &mut Vec<UpstreamColumn>,
) {
    if token.is_empty() {
        return;
    }
    let lower = token.to_lowercase();
    if SQL_KEYWORDS.contains(&lower.as_str()) || token.chars().next().unwrap().is_ascii_digit() {
        token.clear();
        return;
    }
    let resolved = if let Some((qualifier, column)) = token.split_once('.') {
        alias_map.get(qualifier).map(|r| (r.clone(), column.to_string()))
    } else {
        single_relation.clone().map(|r| (r, token.clone()))
    };
    if let Some((relation, column)) = resolved {
        if seen.insert(format!("{relation}.{column}")) {
            out.push(UpstreamColumn { relation, column });
        }
    }
    token.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(models: &[&str]) -> BTreeSet<String> {
        models.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_ref_placeholder_as_model_dependency() {
        let parsed = parse_and_extract(
            "select id from __REF__upstream__",
            &known(&[]),
            &BTreeMap::new(),
        );
        assert!(parsed
            .relations
            .iter()
            .any(|r| r.kind == RelationKind::Model("upstream".to_string())));
    }

    #[test]
    fn extracts_source_placeholder() {
        let parsed = parse_and_extract(
            "select id from __SRC__raw__orders__",
            &known(&[]),
            &BTreeMap::new(),
        );
        assert!(parsed.relations.iter().any(|r| r.kind
            == RelationKind::Source("raw".to_string(), "orders".to_string())));
    }

    #[test]
    fn bare_reference_resolves_against_known_models() {
        let parsed = parse_and_extract(
            "select id from silver.cleaned_orders",
            &known(&["silver.cleaned_orders"]),
            &BTreeMap::new(),
        );
        assert!(parsed
            .relations
            .iter()
            .any(|r| r.kind == RelationKind::Model("silver.cleaned_orders".to_string())));
    }

    #[test]
    fn traces_simple_column_lineage_with_single_source() {
        let parsed = parse_and_extract(
            "select id, name from __REF__upstream__",
            &known(&[]),
            &BTreeMap::new(),
        );
        let id_lineage = parsed
            .column_lineage
            .iter()
            .find(|c| c.output_column == "id")
            .unwrap();
        assert_eq!(id_lineage.upstream[0].relation, "upstream");
        assert_eq!(id_lineage.upstream[0].column, "id");
    }

    #[test]
    fn wildcard_without_known_schema_is_opaque() {
        let parsed = parse_and_extract(
            "select * from __REF__upstream__",
            &known(&[]),
            &BTreeMap::new(),
        );
        assert!(parsed.column_lineage.iter().any(|c| c.opaque));
        assert!(parsed
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::LineageWarning(_))));
    }

    #[test]
    fn wildcard_with_known_schema_expands_precisely() {
        let mut schemas = BTreeMap::new();
        schemas.insert("upstream".to_string(), vec!["id".to_string(), "name".to_string()]);
        let parsed = parse_and_extract(
            "select * from __REF__upstream__",
            &known(&[]),
            &schemas,
        );
        assert_eq!(parsed.column_lineage.len(), 1);
        assert!(!parsed.column_lineage[0].opaque);
        assert_eq!(parsed.column_lineage[0].upstream.len(), 2);
    }

    #[test]
    fn unparsable_sql_degrades_to_empty_lineage_with_warning() {
        let parsed = parse_and_extract("select select select", &known(&[]), &BTreeMap::new());
        assert!(parsed.column_lineage.is_empty());
        assert!(parsed
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::ParseWarning(_))));
    }
}
