//! Driver Pool (C7, spec §4.7): the warehouse driver contract plus a
//! bounded connection pool with retry, health, and session-variable
//! policy.

mod connection;
mod mock;
mod pool;

pub use connection::{Connection, Driver, DriverError, DriverResult, QueryResult, Value};
pub use mock::{MockConnection, MockDriver};
pub use pool::{execute_with_retry, Pool, PooledConnection};

pub use sqlforge_common::substitute_variables;
