//! Driver contract (spec §6): the interface any warehouse backend must
//! satisfy for C7/C8 to operate it. Snowflake-specific transport and auth
//! are out of scope (spec.md §1); this crate only fixes the trait shape.

use std::fmt;

use sqlforge_common::errors::DriverErrorKind;

/// A minimal, warehouse-agnostic cell value, sufficient for the pieces of
/// the engine that inspect query results (high-watermark reads, CDC
/// dedup/merge keys).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows_affected: u64,
    pub rows: Vec<Vec<Value>>,
}

/// A driver-classified failure (spec §6: "must expose a `kind` mapping to
/// `{Transient, ConnectionLost, Permanent}`").
#[derive(Debug, Clone, PartialEq)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DriverError {}

pub type DriverResult<T> = Result<T, DriverError>;

/// A single warehouse connection (spec §6 `Connection`). Deliberately
/// synchronous — the pool wraps calls in `spawn_blocking` rather than
/// requiring every driver implementation to be async, mirroring how the
/// teacher wraps blocking ADBC calls for its own pool.
pub trait Connection: Send {
    /// Streaming single-statement execution.
    fn execute(&mut self, sql: &str) -> DriverResult<QueryResult>;
    /// Batched execution, one round trip (spec §4.7: session-variable
    /// application uses this).
    fn execute_many(&mut self, sqls: &[String]) -> DriverResult<Vec<QueryResult>>;
    /// Bulk load path (spec §9: "implementations should prefer a native
    /// warehouse bulk API... when the change set exceeds ~1M rows").
    fn bulk_insert(
        &mut self,
        qualified_name: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> DriverResult<u64>;
    /// Lightweight health check: inspect cached connection state, never
    /// issue a probe query (spec §4.7).
    fn is_healthy(&self) -> bool;
}

/// A warehouse backend factory (spec §6 `connect(cfg) -> Connection`).
pub trait Driver: Send + Sync {
    fn connect(&self) -> DriverResult<Box<dyn Connection>>;
}
