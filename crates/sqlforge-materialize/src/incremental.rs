//! Incremental strategies (spec §4.8): `append`, `time`, `unique_key`.
//!
//! All three share one invariant: the very first run for a model always
//! behaves like Table (`CREATE OR REPLACE TABLE ... AS SELECT`), since
//! there is nothing yet to insert into or merge against.

use sqlforge_common::errors::{EngineError, EngineResult};
use sqlforge_common::IncrementalStrategy;
use sqlforge_driver::{Connection, Value};

use crate::request::MaterializeRequest;
use crate::schema_change::ensure_schema_compat;
use crate::sql_exec::run;
use crate::StrategyOutcome;

pub fn materialise_incremental(
    conn: &mut dyn Connection,
    req: &MaterializeRequest<'_>,
) -> StrategyOutcome {
    if req.is_first_run {
        return create_as_select(conn, req);
    }
    ensure_schema_compat(conn, req)?;
    match req.incremental_strategy.unwrap_or_default() {
        IncrementalStrategy::Append => append(conn, req),
        IncrementalStrategy::Time => time_guarded_insert(conn, req),
        IncrementalStrategy::UniqueKey => merge_by_unique_key(conn, req),
    }
}

fn create_as_select(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> StrategyOutcome {
    let sql = format!(
        "CREATE OR REPLACE TABLE {} AS {}",
        req.physical_identifier, req.select_sql
    );
    let result = run(conn, req.model_name, "incremental_create_as_select", &sql)?;
    let watermark = compute_high_watermark(conn, req)?;
    Ok((Some(result.rows_affected), watermark))
}

/// `append`: the materialiser itself guards the insert with a
/// `WHERE time_column > stored_high_watermark` clause (spec §4.8: "subsequent
/// runs insert rows where the time column exceeds the stored high-watermark").
fn append(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> StrategyOutcome {
    let time_column = req.time_column.ok_or_else(|| {
        EngineError::ConfigurationError(format!(
            "model `{}` uses the append incremental strategy but declares no time_column",
            req.model_name
        ))
    })?;
    let sql = match req.stored_high_watermark {
        Some(watermark) => format!(
            "INSERT INTO {target} SELECT * FROM ({select}) AS src WHERE src.{col} > '{watermark}'",
            target = req.physical_identifier,
            select = req.select_sql,
            col = time_column,
            watermark = watermark,
        ),
        None => format!("INSERT INTO {} {}", req.physical_identifier, req.select_sql),
    };
    let result = run(conn, req.model_name, "incremental_append", &sql)?;
    let watermark = compute_high_watermark(conn, req)?;
    Ok((Some(result.rows_affected), watermark))
}

/// `time`: the filtering guard lives in the model's own SQL, injected via
/// `is_incremental()` template expansion (spec §4.1) — the materialiser just
/// inserts what C1/C9 already produced.
fn time_guarded_insert(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> StrategyOutcome {
    let sql = format!("INSERT INTO {} {}", req.physical_identifier, req.select_sql);
    let result = run(conn, req.model_name, "incremental_time", &sql)?;
    let watermark = compute_high_watermark(conn, req)?;
    Ok((Some(result.rows_affected), watermark))
}

/// `unique_key`: upsert via `MERGE`, matching on the unique key.
fn merge_by_unique_key(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> StrategyOutcome {
    let unique_key = req.unique_key.ok_or_else(|| {
        EngineError::ConfigurationError(format!(
            "model `{}` uses the unique_key incremental strategy but declares no unique_key",
            req.model_name
        ))
    })?;

    let sql = match req.columns {
        Some(columns) if !columns.is_empty() => {
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| c.as_str() != unique_key)
                .map(|c| format!("target.{c} = source.{c}"))
                .collect();
            let insert_cols = columns.join(", ");
            let insert_vals: Vec<String> = columns.iter().map(|c| format!("source.{c}")).collect();
            format!(
                "MERGE INTO {target} AS target USING ({select}) AS source \
                 ON target.{key} = source.{key} \
                 WHEN MATCHED THEN UPDATE SET {updates} \
                 WHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals})",
                target = req.physical_identifier,
                select = req.select_sql,
                key = unique_key,
                updates = updates.join(", "),
                insert_cols = insert_cols,
                insert_vals = insert_vals.join(", "),
            )
        }
        _ => {
            tracing::warn!(
                model = req.model_name,
                "unique_key merge without a known column list; falling back to a delete+insert upsert"
            );
            format!(
                "DELETE FROM {target} WHERE {key} IN (SELECT {key} FROM ({select}) AS source); \
                 INSERT INTO {target} {select}",
                target = req.physical_identifier,
                key = unique_key,
                select = req.select_sql,
            )
        }
    };

    let result = run(conn, req.model_name, "incremental_merge", &sql)?;
    let watermark = compute_high_watermark(conn, req)?;
    Ok((Some(result.rows_affected), watermark))
}

fn compute_high_watermark(
    conn: &mut dyn Connection,
    req: &MaterializeRequest<'_>,
) -> EngineResult<Option<String>> {
    let Some(time_column) = req.time_column else {
        return Ok(None);
    };
    let sql = format!("SELECT MAX({time_column}) FROM {}", req.physical_identifier);
    let result = run(conn, req.model_name, "compute_high_watermark", &sql)?;
    Ok(result
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(value_to_watermark_string))
}

fn value_to_watermark_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Int(n) => Some(n.to_string()),
        Value::Float(n) => Some(n.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
    }
}
