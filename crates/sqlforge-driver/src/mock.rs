//! An in-memory driver used by tests, `validate`/`plan --dry-run`, and as
//! the CLI's default backend when no real warehouse driver is wired in
//! (spec.md §1: Snowflake transport/auth is an external collaborator).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use sqlforge_common::errors::DriverErrorKind;

use crate::connection::{Connection, Driver, DriverError, DriverResult, QueryResult, Value};

#[derive(Debug)]
pub struct MockConnection {
    /// Every statement seen, in order — lets tests assert on emitted SQL.
    pub executed: Mutex<Vec<String>>,
    /// In-memory relations, keyed by qualified name, holding column names
    /// and rows — enough to materialise CDC/incremental targets for
    /// integration tests.
    pub tables: Mutex<BTreeMap<String, (Vec<String>, Vec<Vec<Value>>)>>,
    fail_remaining: AtomicU32,
    fail_kind: DriverErrorKind,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            tables: Mutex::new(BTreeMap::new()),
            fail_remaining: AtomicU32::new(0),
            fail_kind: DriverErrorKind::Transient,
        }
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connection for MockConnection {
    fn execute(&mut self, sql: &str) -> DriverResult<QueryResult> {
        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(DriverError {
                kind: self.fail_kind,
                message: "injected failure".to_string(),
            });
        }
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(QueryResult::default())
    }

    fn execute_many(&mut self, sqls: &[String]) -> DriverResult<Vec<QueryResult>> {
        sqls.iter().map(|sql| self.execute(sql)).collect()
    }

    fn bulk_insert(
        &mut self,
        qualified_name: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> DriverResult<u64> {
        let mut tables = self.tables.lock().unwrap();
        let entry = tables
            .entry(qualified_name.to_string())
            .or_insert_with(|| (columns.to_vec(), Vec::new()));
        let inserted = rows.len() as u64;
        entry.1.extend(rows);
        Ok(inserted)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct MockDriver {
    fail_n: u32,
    fail_kind: DriverErrorKind,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self {
            fail_n: 0,
            fail_kind: DriverErrorKind::Transient,
        }
    }
}

impl MockDriver {
    pub fn failing_n_times(n: u32, kind: DriverErrorKind) -> Self {
        Self { fail_n: n, fail_kind: kind }
    }
}

impl Driver for MockDriver {
    fn connect(&self) -> DriverResult<Box<dyn Connection>> {
        let conn = MockConnection {
            fail_remaining: AtomicU32::new(self.fail_n),
            fail_kind: self.fail_kind,
            ..Default::default()
        };
        Ok(Box::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_executed_statements() {
        let mut conn = MockConnection::new();
        conn.execute("select 1").unwrap();
        assert_eq!(conn.executed.lock().unwrap().as_slice(), ["select 1"]);
    }

    #[test]
    fn bulk_insert_accumulates_rows() {
        let mut conn = MockConnection::new();
        conn.bulk_insert("db.s.t", &["id".to_string()], vec![vec![Value::Int(1)]])
            .unwrap();
        conn.bulk_insert("db.s.t", &["id".to_string()], vec![vec![Value::Int(2)]])
            .unwrap();
        let tables = conn.tables.lock().unwrap();
        assert_eq!(tables["db.s.t"].1.len(), 2);
    }
}
