//! Strategy dispatch (spec §9 Design Notes: "model as a tagged variant with
//! a common `materialise` contract; avoid deep class hierarchies").

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlforge_common::errors::ErrorContext;
use sqlforge_common::{ExecutionResult, MaterializationKind, ModelStatus};
use sqlforge_driver::{Pool, PooledConnection};

use crate::cdc;
use crate::incremental::materialise_incremental;
use crate::request::MaterializeRequest;
use crate::view::{materialise_table, materialise_temp, materialise_view};
use crate::StrategyOutcome;

/// Materialise one model and turn the outcome into an [`ExecutionResult`]
/// (spec §3). Never returns `Err` — a strategy failure becomes a `Failed`
/// result so the executor can record state and move on to the next batch
/// (spec §4.9).
#[allow(clippy::too_many_arguments)]
pub async fn materialise(
    pool: &Arc<Pool>,
    conn: &mut PooledConnection,
    req: &MaterializeRequest<'_>,
    materialization: MaterializationKind,
    now: DateTime<Utc>,
    max_parallel_cdc_chunks: usize,
    session_variables: &BTreeMap<String, String>,
) -> ExecutionResult {
    let start_ts = now;
    let outcome = match materialization {
        MaterializationKind::View => materialise_view(conn.as_mut(), req),
        MaterializationKind::Table => materialise_table(conn.as_mut(), req),
        MaterializationKind::Temp => materialise_temp(conn.as_mut(), req),
        MaterializationKind::Incremental => materialise_incremental(conn.as_mut(), req),
        MaterializationKind::Cdc => {
            materialise_cdc(pool, conn, req, max_parallel_cdc_chunks, session_variables).await
        }
    };
    let end_ts = Utc::now();

    match outcome {
        Ok((rows_affected, new_high_watermark)) => ExecutionResult {
            model_name: req.model_name.to_string(),
            status: ModelStatus::Success,
            start_ts,
            end_ts,
            rows_affected,
            error_context: None,
            materialized_object_identifier: req.physical_identifier.to_string(),
            new_high_watermark,
        },
        Err(err) => ExecutionResult {
            model_name: req.model_name.to_string(),
            status: ModelStatus::Failed,
            start_ts,
            end_ts,
            rows_affected: None,
            error_context: Some(
                err.context()
                    .cloned()
                    .unwrap_or_else(|| ErrorContext::new("materialise").with_model(req.model_name)),
            ),
            materialized_object_identifier: req.physical_identifier.to_string(),
            new_high_watermark: None,
        },
    }
}

async fn materialise_cdc(
    pool: &Arc<Pool>,
    conn: &mut PooledConnection,
    req: &MaterializeRequest<'_>,
    max_parallel_cdc_chunks: usize,
    session_variables: &BTreeMap<String, String>,
) -> StrategyOutcome {
    let changes = cdc::extract_changes(conn.as_mut(), req)?;
    let plan = cdc::plan_cdc(changes);
    let unique_key = req
        .unique_key
        .ok_or_else(|| {
            sqlforge_common::errors::EngineError::ConfigurationError(format!(
                "model `{}` uses the CDC strategy but declares no unique_key",
                req.model_name
            ))
        })?
        .to_string();

    let total_inserted = if plan.chunked {
        cdc::apply_plan_parallel(
            pool.clone(),
            req.model_name.to_string(),
            req.physical_identifier.to_string(),
            unique_key,
            plan,
            max_parallel_cdc_chunks,
            session_variables.clone(),
        )
        .await?
    } else {
        cdc::apply_plan(conn.as_mut(), req, &plan)?
    };

    Ok((Some(total_inserted), None))
}
