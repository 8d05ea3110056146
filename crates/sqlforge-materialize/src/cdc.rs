//! CDC retirement pattern (spec §4.8): every incoming change becomes a new
//! physical row; `U`/`D`/`E` additionally retire whichever row is currently
//! active for that key by stamping its `obsolete_date`.
//!
//! `plan_cdc` is a pure function so the batching/dedup invariants (spec §8
//! CDC round-trip property) can be tested without a driver. Applying the
//! plan is a separate step.

use std::collections::{BTreeMap, BTreeSet};

use sqlforge_common::constants::{CDC_BATCH_SIZE, CDC_CHUNKED_THRESHOLD};
use sqlforge_common::errors::{EngineError, EngineResult};
use sqlforge_driver::{Connection, Value};

use crate::request::MaterializeRequest;
use crate::sql_exec::run;

pub const OBSOLETE_DATE_COLUMN: &str = "obsolete_date";
pub const CDC_OPERATION_COLUMN: &str = "__CDC_OPERATION";
pub const CDC_TIMESTAMP_COLUMN: &str = "__CDC_TIMESTAMP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdcOp {
    Insert,
    Update,
    Delete,
    Expire,
}

impl CdcOp {
    fn from_code(code: &str) -> EngineResult<Self> {
        match code {
            "I" => Ok(CdcOp::Insert),
            "U" => Ok(CdcOp::Update),
            "D" => Ok(CdcOp::Delete),
            "E" => Ok(CdcOp::Expire),
            other => Err(EngineError::ConfigurationError(format!(
                "unrecognised {CDC_OPERATION_COLUMN} code `{other}` (expected one of I/U/D/E)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CdcChange {
    pub key: Value,
    pub operation: CdcOp,
    pub timestamp: i64,
    pub columns: BTreeMap<String, Value>,
}

/// A row to be physically inserted. `obsolete_at` is already fully resolved
/// at plan time: `None` if the row starts (and, for this pass, stays)
/// active; `Some(ts)` if it is retired immediately, stamped with `ts` —
/// either its own timestamp (a `D`/`E` tombstone) or a later same-pass
/// event's timestamp (an `I`/`U` row a later event in this same change set
/// superseded before it ever reached the table).
#[derive(Debug, Clone, PartialEq)]
pub struct CdcRow {
    pub key: Value,
    pub columns: BTreeMap<String, Value>,
    pub obsolete_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CdcPlan {
    /// Genuine retirements against rows that predate this pass: one entry
    /// per `(timestamp, keys)` batch. Only emitted for a key's first `U`/
    /// `D`/`E` touch in the pass that has no earlier same-pass row to
    /// supersede instead.
    pub retire_batches: Vec<(i64, Vec<Value>)>,
    pub insert_batches: Vec<Vec<CdcRow>>,
    /// Whether the change set exceeded [`CDC_CHUNKED_THRESHOLD`] rows (spec
    /// §4.8: "switches to the chunked/parallel path").
    pub chunked: bool,
}

/// Dedup true duplicates (an identical `(key, timestamp)` pair delivered
/// more than once within one change set), then — for every remaining event,
/// in timestamp order — decide what to retire and what to insert.
///
/// Every event produces exactly one inserted row; `U`/`D`/`E` additionally
/// retire whichever row is currently active for that key, stamped with
/// that event's own timestamp. When the row being retired was itself
/// inserted earlier in this same pass, the supersession is resolved
/// in-memory (the earlier `CdcRow`'s `obsolete_at` is backfilled) rather
/// than via a second round-trip to the warehouse; a genuine `UPDATE` is
/// only ever issued for a key's first `U`/`D`/`E` touch in the pass, to
/// retire whatever row predates this pass. This keeps the round-trip
/// invariant (spec §8): total row count for a key equals its total event
/// count, and exactly one row is active iff the last event was `I` or `U`.
pub fn plan_cdc(changes: Vec<CdcChange>) -> CdcPlan {
    let mut seen = BTreeSet::new();
    let mut deduped: Vec<CdcChange> = Vec::with_capacity(changes.len());
    for change in changes {
        let dedup_key = (format!("{:?}", change.key), change.timestamp);
        if seen.insert(dedup_key) {
            deduped.push(change);
        }
    }
    deduped.sort_by_key(|c| c.timestamp);

    let chunked = deduped.len() > CDC_CHUNKED_THRESHOLD;

    // Index into `insert_rows` of the row currently active for a key,
    // within this pass only.
    let mut active_in_pass: BTreeMap<String, usize> = BTreeMap::new();
    // Keys whose pre-pass active row has already been addressed by a
    // retire batch, so a later event for the same key never repeats it.
    let mut physically_retired: BTreeSet<String> = BTreeSet::new();
    let mut retire_by_ts: BTreeMap<i64, Vec<Value>> = BTreeMap::new();
    let mut insert_rows: Vec<CdcRow> = Vec::new();

    for change in deduped {
        let key_repr = format!("{:?}", change.key);
        let retires_prior = !matches!(change.operation, CdcOp::Insert);
        if retires_prior {
            if let Some(idx) = active_in_pass.remove(&key_repr) {
                insert_rows[idx].obsolete_at = Some(change.timestamp);
            } else if physically_retired.insert(key_repr.clone()) {
                retire_by_ts.entry(change.timestamp).or_default().push(change.key.clone());
            }
        }

        let starts_active = matches!(change.operation, CdcOp::Insert | CdcOp::Update);
        insert_rows.push(CdcRow {
            key: change.key,
            columns: change.columns,
            obsolete_at: if starts_active { None } else { Some(change.timestamp) },
        });
        if starts_active {
            active_in_pass.insert(key_repr, insert_rows.len() - 1);
        }
    }

    let mut retire_batches = Vec::new();
    for (ts, keys) in retire_by_ts {
        for chunk in keys.chunks(CDC_BATCH_SIZE) {
            retire_batches.push((ts, chunk.to_vec()));
        }
    }

    CdcPlan {
        retire_batches,
        insert_batches: insert_rows.chunks(CDC_BATCH_SIZE).map(|c| c.to_vec()).collect(),
        chunked,
    }
}

/// Read the model's change-set rows off `req.select_sql`'s result, assuming
/// the fixed column convention `(unique_key, __CDC_OPERATION,
/// __CDC_TIMESTAMP, ...payload)` a retirement-pattern model is expected to
/// project.
pub fn extract_changes(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> EngineResult<Vec<CdcChange>> {
    let result = run(conn, req.model_name, "cdc_extract_changes", req.select_sql)?;
    let payload_names = req.columns.map(|cols| cols.iter().skip(3).cloned().collect::<Vec<_>>());

    result
        .rows
        .into_iter()
        .map(|row| row_to_change(req.model_name, &payload_names, row))
        .collect()
}

fn row_to_change(
    model_name: &str,
    payload_names: &Option<Vec<String>>,
    row: Vec<Value>,
) -> EngineResult<CdcChange> {
    if row.len() < 3 {
        return Err(EngineError::ModelExecutionFailure {
            message: format!(
                "CDC change row for `{model_name}` has {} columns, expected at least \
                 (unique_key, {CDC_OPERATION_COLUMN}, {CDC_TIMESTAMP_COLUMN})",
                row.len()
            ),
            context: sqlforge_common::errors::ErrorContext::new("cdc_extract_changes").with_model(model_name),
        });
    }
    let mut iter = row.into_iter();
    let key = iter.next().unwrap();
    let op_value = iter.next().unwrap();
    let ts_value = iter.next().unwrap();

    let op_code = match op_value {
        Value::Text(s) => s,
        other => {
            return Err(EngineError::ConfigurationError(format!(
                "{CDC_OPERATION_COLUMN} must be text, got {other:?}"
            )))
        }
    };
    let timestamp = match ts_value {
        Value::Int(n) => n,
        other => {
            return Err(EngineError::ConfigurationError(format!(
                "{CDC_TIMESTAMP_COLUMN} must be an integer epoch, got {other:?}"
            )))
        }
    };

    let mut columns = BTreeMap::new();
    for (idx, value) in iter.enumerate() {
        let name = payload_names
            .as_ref()
            .and_then(|names| names.get(idx))
            .cloned()
            .unwrap_or_else(|| format!("col_{idx}"));
        columns.insert(name, value);
    }

    Ok(CdcChange {
        key,
        operation: CdcOp::from_code(&op_code)?,
        timestamp,
        columns,
    })
}

/// Apply a plan's retire batches then insert batches to `conn`, in order
/// (spec §4.8). Returns the number of rows inserted.
///
/// Retire batches must fully complete before any insert runs: a retire
/// batch targets whatever row predates this pass for its keys, and an
/// insert can create a brand-new active row for one of those same keys
/// (an `I`/`U` arriving later in the pass than a `D`/`E` on the same key).
/// Running them out of order would let a retire clobber that fresh row.
pub fn apply_plan(conn: &mut dyn Connection, req: &MaterializeRequest<'_>, plan: &CdcPlan) -> EngineResult<u64> {
    let unique_key = req.unique_key.ok_or_else(|| {
        EngineError::ConfigurationError(format!(
            "model `{}` uses the CDC strategy but declares no unique_key",
            req.model_name
        ))
    })?;

    for (timestamp, batch) in &plan.retire_batches {
        retire_key_batch(conn, req.model_name, req.physical_identifier, unique_key, batch, *timestamp)?;
    }

    let mut total_inserted = 0u64;
    for batch in &plan.insert_batches {
        total_inserted += insert_row_batch(conn, req.model_name, req.physical_identifier, unique_key, batch)?;
    }
    Ok(total_inserted)
}

fn retire_key_batch(
    conn: &mut dyn Connection,
    model_name: &str,
    physical_identifier: &str,
    unique_key: &str,
    batch: &[Value],
    timestamp: i64,
) -> EngineResult<()> {
    let values = batch.iter().map(value_literal).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "UPDATE {target} SET {obsolete_col} = {timestamp} \
         WHERE {key} IN ({values}) AND {obsolete_col} IS NULL",
        target = physical_identifier,
        obsolete_col = OBSOLETE_DATE_COLUMN,
        key = unique_key,
        timestamp = timestamp,
        values = values,
    );
    run(conn, model_name, "cdc_retire_batch", &sql)?;
    Ok(())
}

fn insert_row_batch(
    conn: &mut dyn Connection,
    model_name: &str,
    physical_identifier: &str,
    unique_key: &str,
    batch: &[CdcRow],
) -> EngineResult<u64> {
    let payload_columns: BTreeSet<String> = batch.iter().flat_map(|row| row.columns.keys().cloned()).collect();

    let mut columns = Vec::with_capacity(payload_columns.len() + 2);
    columns.push(unique_key.to_string());
    columns.extend(payload_columns.iter().cloned());
    columns.push(OBSOLETE_DATE_COLUMN.to_string());

    let rows: Vec<Vec<Value>> = batch
        .iter()
        .map(|row| {
            let mut values = Vec::with_capacity(columns.len());
            values.push(row.key.clone());
            for col in &payload_columns {
                values.push(row.columns.get(col).cloned().unwrap_or(Value::Null));
            }
            values.push(row.obsolete_at.map(Value::Int).unwrap_or(Value::Null));
            values
        })
        .collect();

    conn.bulk_insert(physical_identifier, &columns, rows)
        .map_err(|e| EngineError::ModelExecutionFailure {
            message: e.message,
            context: sqlforge_common::errors::ErrorContext::new("cdc_insert_batch").with_model(model_name),
        })
}

/// Dispatch a plan's batches across up to `max_parallel_chunks` concurrent
/// pooled connections (spec §4.8: "chunked/parallel path... bounded
/// parallelism, default 10"), used once the change set exceeds
/// [`CDC_CHUNKED_THRESHOLD`] rows. Retire batches run to completion — still
/// parallel among themselves — before any insert batch starts, since an
/// insert can create a fresh active row for a key a retire batch also
/// targets (an `I`/`U` arriving later in the pass than a `D`/`E` on the
/// same key); running both phases concurrently would race the two.
pub async fn apply_plan_parallel(
    pool: std::sync::Arc<sqlforge_driver::Pool>,
    model_name: String,
    physical_identifier: String,
    unique_key: String,
    plan: CdcPlan,
    max_parallel_chunks: usize,
    session_variables: BTreeMap<String, String>,
) -> EngineResult<u64> {
    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(max_parallel_chunks.max(1)));
    let mut retire_tasks = tokio::task::JoinSet::new();

    for (timestamp, batch) in plan.retire_batches {
        let pool = pool.clone();
        let model_name = model_name.clone();
        let physical_identifier = physical_identifier.clone();
        let unique_key = unique_key.clone();
        let session_variables = session_variables.clone();
        let semaphore = semaphore.clone();
        retire_tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed early");
            let mut conn = pool
                .acquire(std::time::Duration::from_secs(30), &session_variables)
                .await?;
            retire_key_batch(conn.as_mut(), &model_name, &physical_identifier, &unique_key, &batch, timestamp)?;
            Ok::<(), EngineError>(())
        });
    }
    while let Some(outcome) = retire_tasks.join_next().await {
        outcome.map_err(|e| EngineError::ConfigurationError(format!("CDC chunk task panicked: {e}")))??;
    }

    let mut tasks = tokio::task::JoinSet::new();
    for batch in plan.insert_batches {
        let pool = pool.clone();
        let model_name = model_name.clone();
        let physical_identifier = physical_identifier.clone();
        let unique_key = unique_key.clone();
        let session_variables = session_variables.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed early");
            let mut conn = pool
                .acquire(std::time::Duration::from_secs(30), &session_variables)
                .await?;
            insert_row_batch(conn.as_mut(), &model_name, &physical_identifier, &unique_key, &batch)
        });
    }

    let mut total_inserted = 0u64;
    while let Some(outcome) = tasks.join_next().await {
        let rows = outcome.map_err(|e| EngineError::ConfigurationError(format!("CDC chunk task panicked: {e}")))??;
        total_inserted += rows;
    }
    Ok(total_inserted)
}

fn value_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bool(b) => b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(key: i64, op: CdcOp, ts: i64) -> CdcChange {
        CdcChange {
            key: Value::Int(key),
            operation: op,
            timestamp: ts,
            columns: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trip_insert_update_delete_yields_three_rows_all_retired() {
        let changes = vec![
            change(1, CdcOp::Insert, 1),
            change(1, CdcOp::Update, 2),
            change(1, CdcOp::Delete, 3),
        ];
        let plan = plan_cdc(changes);
        // Every retirement here supersedes a row inserted earlier in this
        // same pass, so it's resolved in-memory — no genuine UPDATE needed.
        assert!(plan.retire_batches.is_empty());

        let obsolete_dates: Vec<Option<i64>> = plan.insert_batches.into_iter().flatten().map(|r| r.obsolete_at).collect();
        assert_eq!(obsolete_dates, vec![Some(2), Some(3), Some(3)]);
    }

    #[test]
    fn a_delete_or_update_with_no_same_pass_predecessor_retires_the_pre_existing_row() {
        let changes = vec![change(7, CdcOp::Update, 10)];
        let plan = plan_cdc(changes);
        assert_eq!(plan.retire_batches, vec![(10, vec![Value::Int(7)])]);
        let rows: Vec<&CdcRow> = plan.insert_batches.iter().flatten().collect();
        assert_eq!(rows[0].obsolete_at, None);
    }

    #[test]
    fn a_second_touch_never_repeats_the_physical_retire() {
        let changes = vec![change(7, CdcOp::Delete, 10), change(7, CdcOp::Delete, 20)];
        let plan = plan_cdc(changes);
        assert_eq!(plan.retire_batches, vec![(10, vec![Value::Int(7)])]);
    }

    #[test]
    fn exact_duplicate_key_and_timestamp_is_collapsed() {
        let changes = vec![change(1, CdcOp::Insert, 5), change(1, CdcOp::Insert, 5)];
        let plan = plan_cdc(changes);
        let total_inserted: usize = plan.insert_batches.iter().map(|b| b.len()).sum();
        assert_eq!(total_inserted, 1);
    }

    #[test]
    fn distinct_timestamps_for_the_same_key_are_not_collapsed() {
        let changes = vec![change(1, CdcOp::Insert, 1), change(1, CdcOp::Update, 2)];
        let plan = plan_cdc(changes);
        let total_inserted: usize = plan.insert_batches.iter().map(|b| b.len()).sum();
        assert_eq!(total_inserted, 2);
    }

    #[test]
    fn batches_are_capped_at_cdc_batch_size() {
        let changes: Vec<CdcChange> = (0..2500).map(|i| change(i, CdcOp::Insert, i)).collect();
        let plan = plan_cdc(changes);
        assert_eq!(plan.insert_batches.len(), 3);
        assert_eq!(plan.insert_batches[0].len(), CDC_BATCH_SIZE);
        assert_eq!(plan.insert_batches[2].len(), 500);
        assert!(!plan.chunked);
    }

    #[test]
    fn delete_without_a_prior_row_still_inserts_a_tombstone() {
        let changes = vec![change(9, CdcOp::Delete, 1)];
        let plan = plan_cdc(changes);
        let rows: Vec<&CdcRow> = plan.insert_batches.iter().flatten().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].obsolete_at, Some(1));
        assert_eq!(plan.retire_batches, vec![(1, vec![Value::Int(9)])]);
    }

    #[test]
    fn row_to_change_maps_the_fixed_column_convention() {
        let row = vec![
            Value::Int(42),
            Value::Text("U".to_string()),
            Value::Int(1_700_000_000),
            Value::Text("alice".to_string()),
        ];
        let payload_names = Some(vec!["name".to_string()]);
        let change = row_to_change("marts.customers", &payload_names, row).unwrap();
        assert_eq!(change.key, Value::Int(42));
        assert_eq!(change.operation, CdcOp::Update);
        assert_eq!(change.timestamp, 1_700_000_000);
        assert_eq!(change.columns.get("name"), Some(&Value::Text("alice".to_string())));
    }

    #[test]
    fn row_to_change_rejects_an_unrecognised_operation_code() {
        let row = vec![Value::Int(1), Value::Text("X".to_string()), Value::Int(1)];
        let err = row_to_change("marts.customers", &None, row).unwrap_err();
        assert!(matches!(err, EngineError::ConfigurationError(_)));
    }
}
