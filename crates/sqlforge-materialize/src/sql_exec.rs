//! Shared helper: run a statement through the driver contract, wrapping a
//! [`DriverError`] into an [`EngineError`] with model/operation context
//! (spec §7: "all errors carry structured context").

use sqlforge_common::errors::{EngineError, EngineResult, ErrorContext};
use sqlforge_driver::{Connection, QueryResult};

pub(crate) fn run(
    conn: &mut dyn Connection,
    model_name: &str,
    operation: &str,
    sql: &str,
) -> EngineResult<QueryResult> {
    conn.execute(sql).map_err(|e| EngineError::ModelExecutionFailure {
        message: e.message,
        context: ErrorContext::new(operation).with_model(model_name).with_sql(sql),
    })
}
