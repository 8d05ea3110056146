//! View and Table/Temp strategies (spec §4.8): stateless `CREATE OR REPLACE`.

use sqlforge_driver::Connection;

use crate::request::MaterializeRequest;
use crate::sql_exec::run;
use crate::StrategyOutcome;

pub fn materialise_view(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> StrategyOutcome {
    let sql = format!(
        "CREATE OR REPLACE VIEW {} AS {}",
        req.physical_identifier, req.select_sql
    );
    let result = run(conn, req.model_name, "materialise_view", &sql)?;
    Ok((Some(result.rows_affected), None))
}

pub fn materialise_table(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> StrategyOutcome {
    let sql = format!(
        "CREATE OR REPLACE TABLE {} AS {}",
        req.physical_identifier, req.select_sql
    );
    let result = run(conn, req.model_name, "materialise_table", &sql)?;
    Ok((Some(result.rows_affected), None))
}

pub fn materialise_temp(conn: &mut dyn Connection, req: &MaterializeRequest<'_>) -> StrategyOutcome {
    let sql = format!(
        "CREATE OR REPLACE TEMPORARY TABLE {} AS {}",
        req.physical_identifier, req.select_sql
    );
    let result = run(conn, req.model_name, "materialise_temp", &sql)?;
    Ok((Some(result.rows_affected), None))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sqlforge_common::OnSchemaChange;
    use sqlforge_driver::MockConnection;

    use super::*;

    fn base_request<'a>(variables: &'a BTreeMap<String, String>) -> MaterializeRequest<'a> {
        MaterializeRequest {
            model_name: "marts.orders",
            physical_identifier: "dev.marts.orders",
            select_sql: "SELECT id FROM staging.orders",
            variables,
            incremental_strategy: None,
            unique_key: None,
            time_column: None,
            on_schema_change: OnSchemaChange::Ignore,
            columns: None,
            is_first_run: true,
            stored_high_watermark: None,
        }
    }

    #[test]
    fn view_emits_create_or_replace_view() {
        let variables = BTreeMap::new();
        let req = base_request(&variables);
        let mut conn = MockConnection::new();
        materialise_view(&mut conn, &req).unwrap();
        let executed = conn.executed.lock().unwrap();
        assert_eq!(
            executed.as_slice(),
            ["CREATE OR REPLACE VIEW dev.marts.orders AS SELECT id FROM staging.orders"]
        );
    }

    #[test]
    fn table_emits_create_or_replace_table() {
        let variables = BTreeMap::new();
        let req = base_request(&variables);
        let mut conn = MockConnection::new();
        materialise_table(&mut conn, &req).unwrap();
        let executed = conn.executed.lock().unwrap();
        assert_eq!(
            executed.as_slice(),
            ["CREATE OR REPLACE TABLE dev.marts.orders AS SELECT id FROM staging.orders"]
        );
    }

    #[test]
    fn temp_emits_temporary_table() {
        let variables = BTreeMap::new();
        let req = base_request(&variables);
        let mut conn = MockConnection::new();
        materialise_temp(&mut conn, &req).unwrap();
        let executed = conn.executed.lock().unwrap();
        assert_eq!(
            executed.as_slice(),
            ["CREATE OR REPLACE TEMPORARY TABLE dev.marts.orders AS SELECT id FROM staging.orders"]
        );
    }
}
