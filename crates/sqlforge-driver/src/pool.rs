//! Bounded connection pool (C7, spec §4.7, §5). Acquisition blocks (with
//! timeout) when exhausted via a `tokio::sync::Semaphore`; the free list
//! itself sits behind a plain `std::sync::Mutex` so a connection can be
//! returned synchronously from `Drop`, the way the teacher's
//! `dbt-xdbc::MapReduce` wraps blocking connection work in
//! `spawn_blocking` rather than forcing every driver to be async.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use sqlforge_common::errors::{EngineError, EngineResult, ErrorContext};
use sqlforge_common::RetryPolicy;
use tokio::sync::Semaphore;

use crate::connection::{Connection, Driver, DriverError, QueryResult};

type FreeList = Arc<Mutex<VecDeque<Box<dyn Connection>>>>;

pub struct Pool {
    driver: Arc<dyn Driver>,
    semaphore: Arc<Semaphore>,
    free: FreeList,
    closed: Arc<AtomicBool>,
    pub retry_policy: RetryPolicy,
}

impl Pool {
    pub fn new(driver: Arc<dyn Driver>, size: u32, retry_policy: RetryPolicy) -> Self {
        Self {
            driver,
            semaphore: Arc::new(Semaphore::new(size as usize)),
            free: Arc::new(Mutex::new(VecDeque::new())),
            closed: Arc::new(AtomicBool::new(false)),
            retry_policy,
        }
    }

    /// Acquire a connection, waiting up to `timeout` if the pool is
    /// exhausted (spec §4.7: "block (with timeout) when exhausted").
    /// Applies `session_variables` as a single batched statement (spec
    /// §4.7: "one round trip per acquisition").
    pub async fn acquire(
        &self,
        timeout: Duration,
        session_variables: &BTreeMap<String, String>,
    ) -> EngineResult<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::PoolClosed);
        }
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| EngineError::PoolTimeout)?
            .map_err(|_| EngineError::PoolClosed)?;

        let mut conn = self.take_or_create().await?;
        // Invariant: never hand out an unhealthy connection (spec §4.7).
        if !conn.is_healthy() {
            conn = self.create_connection().await?;
        }
        apply_session_variables(conn.as_mut(), session_variables)?;

        Ok(PooledConnection {
            conn: Some(conn),
            free: self.free.clone(),
            _permit: permit,
        })
    }

    async fn take_or_create(&self) -> EngineResult<Box<dyn Connection>> {
        let popped = self.free.lock().expect("pool free-list mutex poisoned").pop_back();
        match popped {
            Some(conn) => Ok(conn),
            None => self.create_connection().await,
        }
    }

    async fn create_connection(&self) -> EngineResult<Box<dyn Connection>> {
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || driver.connect())
            .await
            .map_err(|e| {
                EngineError::ConfigurationError(format!("connection task panicked: {e}"))
            })?
            .map_err(|e| driver_error_to_engine_error(&e, "connect", 0))
    }

    /// Discard all pooled connections and refuse further acquisitions
    /// (spec §4.7 `close_all()`).
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.free.lock().expect("pool free-list mutex poisoned").clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A checked-out connection; returned to the pool's free list (and its
/// semaphore permit released) when dropped.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    free: FreeList,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn as_mut(&mut self) -> &mut dyn Connection {
        self.conn.as_deref_mut().expect("connection taken before drop")
    }

    /// Drop the physical connection instead of returning it to the pool,
    /// used after a connection-level error forces a reconnect.
    fn discard(mut self) {
        self.conn = None;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.free.lock().expect("pool free-list mutex poisoned").push_back(conn);
        }
    }
}

fn apply_session_variables(
    conn: &mut dyn Connection,
    variables: &BTreeMap<String, String>,
) -> EngineResult<()> {
    if variables.is_empty() {
        return Ok(());
    }
    let assignments: Vec<String> = variables
        .iter()
        .map(|(k, v)| format!("{k} = '{v}'"))
        .collect();
    let batched = format!("ALTER SESSION SET {}", assignments.join(", "));
    conn.execute(&batched)
        .map(|_| ())
        .map_err(|e| driver_error_to_engine_error(&e, "apply_session_variables", 0))
}

fn driver_error_to_engine_error(err: &DriverError, operation: &str, retry_count: u32) -> EngineError {
    let context = ErrorContext::new(operation)
        .with_driver_error(err.message.clone())
        .with_retry_count(retry_count);
    EngineError::TransientDriverFailure {
        message: err.message.clone(),
        context,
    }
}

/// Execute `sql` on a checked-out connection, retrying transient failures
/// with exponential backoff and jitter, re-acquiring a fresh connection on
/// connection-level failures (spec §4.7: "on the SAME logical call, the
/// CONNECTION is discarded and re-created on connection-level errors").
/// On success, returns the connection that should keep being used (a
/// fresh one, if a reconnect occurred) alongside the result.
pub async fn execute_with_retry(
    pool: &Pool,
    mut conn: PooledConnection,
    session_variables: &BTreeMap<String, String>,
    sql: &str,
) -> EngineResult<(PooledConnection, QueryResult)> {
    let mut attempt = 0u32;
    loop {
        let outcome = conn.as_mut().execute(sql);
        match outcome {
            Ok(result) => return Ok((conn, result)),
            Err(driver_err) => {
                let context = ErrorContext::new("execute")
                    .with_sql(sql)
                    .with_driver_error(driver_err.message.clone())
                    .with_retry_count(attempt);

                if matches!(driver_err.kind, sqlforge_common::errors::DriverErrorKind::Permanent) {
                    return Err(EngineError::ModelExecutionFailure {
                        message: driver_err.message,
                        context,
                    });
                }
                if attempt >= pool.retry_policy.max_attempts {
                    return Err(EngineError::ModelExecutionFailure {
                        message: format!(
                            "exhausted {} retries: {}",
                            pool.retry_policy.max_attempts, driver_err.message
                        ),
                        context,
                    });
                }

                let backoff = jittered_backoff(&pool.retry_policy, attempt);
                attempt += 1;

                if matches!(
                    driver_err.kind,
                    sqlforge_common::errors::DriverErrorKind::ConnectionLost
                ) {
                    conn.discard();
                    tokio::time::sleep(backoff).await;
                    conn = pool.acquire(Duration::from_secs(30), session_variables).await?;
                } else {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn jittered_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.backoff_for_attempt(attempt).as_secs_f64();
    let jitter_range = base * policy.jitter_fraction;
    let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((base + jitter).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    #[tokio::test]
    async fn acquire_and_release_round_trips_through_the_free_list() {
        let pool = Pool::new(Arc::new(MockDriver::default()), 1, RetryPolicy::default());
        {
            let _conn = pool.acquire(Duration::from_secs(1), &BTreeMap::new()).await.unwrap();
        }
        // Dropped, should be back on the free list and immediately reacquirable.
        let _conn2 = pool
            .acquire(Duration::from_secs(1), &BTreeMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = Pool::new(Arc::new(MockDriver::default()), 1, RetryPolicy::default());
        let _held = pool.acquire(Duration::from_secs(5), &BTreeMap::new()).await.unwrap();
        let err = pool
            .acquire(Duration::from_millis(20), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PoolTimeout));
    }

    #[tokio::test]
    async fn closed_pool_refuses_new_acquisitions() {
        let pool = Pool::new(Arc::new(MockDriver::default()), 2, RetryPolicy::default());
        pool.close_all();
        let err = pool.acquire(Duration::from_secs(1), &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::PoolClosed));
    }

    #[tokio::test]
    async fn transient_failure_retries_on_the_same_connection() {
        let driver = Arc::new(MockDriver::failing_n_times(2, sqlforge_common::errors::DriverErrorKind::Transient));
        let pool = Pool::new(driver, 1, RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            backoff_factor: 1.0,
            jitter_fraction: 0.0,
            max_attempts: 5,
        });
        let conn = pool.acquire(Duration::from_secs(1), &BTreeMap::new()).await.unwrap();
        let result = execute_with_retry(&pool, conn, &BTreeMap::new(), "select 1").await;
        assert!(result.is_ok());
    }
}
