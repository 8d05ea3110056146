//! `on_schema_change` handling for incremental models (spec §4.8).
//!
//! `Ignore` and `Fail` need no action here: `Ignore` just lets the INSERT
//! fail/truncate on a real driver's own column-count mismatch, and `Fail`
//! would need warehouse schema introspection this crate's [`Connection`]
//! contract doesn't expose — both are accepted as-is rather than
//! approximated with a wrong check.

use sqlforge_common::OnSchemaChange;
use sqlforge_driver::Connection;

use crate::request::MaterializeRequest;
use crate::sql_exec::run;
use sqlforge_common::errors::EngineResult;

/// `AppendNewColumns`: widen the target so new output columns don't cause
/// the subsequent INSERT/MERGE to fail. Best-effort — without a typed
/// schema, new columns land as `STRING` and the model author should cast
/// explicitly if that isn't the desired type.
pub fn ensure_schema_compat(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> EngineResult<()> {
    if req.on_schema_change != OnSchemaChange::AppendNewColumns {
        return Ok(());
    }
    let Some(columns) = req.columns else {
        return Ok(());
    };
    for column in columns {
        let sql = format!(
            "ALTER TABLE {target} ADD COLUMN IF NOT EXISTS {column} STRING",
            target = req.physical_identifier,
        );
        run(conn, req.model_name, "on_schema_change_append_new_columns", &sql)?;
    }
    Ok(())
}
