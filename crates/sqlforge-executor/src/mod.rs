//! Executor (C9, spec §4.9): drives a [`Plan`] to completion — late
//! template re-expansion, materialisation dispatch, state writes, and
//! failure propagation.

mod reporting;
mod resolve;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlforge_common::errors::{EngineError, EngineResult, ErrorContext, EngineWarning};
use sqlforge_common::naming::physical_identifier;
use sqlforge_common::{EngineConfig, ExecutionResult, ModelStatus};
use sqlforge_driver::Pool;
use sqlforge_materialize::MaterializeRequest;
use sqlforge_planner::Plan;
use sqlforge_registry::Registry;
use sqlforge_state::{StateEntry, StateStore};
use tokio::sync::Semaphore;

pub use reporting::render_lineage;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a completed `execute_plan` call hands back: per-model
/// outcomes plus any non-fatal warnings (spec §7: drop failures never
/// abort a run, spec §4.9).
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub results: Vec<ExecutionResult>,
    pub warnings: Vec<EngineWarning>,
}

pub struct Executor {
    pool: Arc<Pool>,
    config: EngineConfig,
}

impl Executor {
    pub fn new(pool: Arc<Pool>, config: EngineConfig) -> Self {
        Self { pool, config }
    }

    /// Drive `plan` to completion against `registry`, recording outcomes
    /// into `state` as each batch finishes (spec §4.9).
    pub async fn execute_plan(
        &self,
        registry: &Registry,
        state: &mut StateStore,
        plan: &Plan,
    ) -> EngineResult<ExecutionReport> {
        resolve::validate_variables(registry, plan.executable_names().iter(), &self.config.variables)?;

        let mut report = ExecutionReport::default();
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        'batches: for batch in &plan.batches {
            let semaphore = Arc::new(Semaphore::new(self.config.pool_size.max(1) as usize));
            let mut tasks = tokio::task::JoinSet::new();
            let mut batch_results: Vec<ExecutionResult> = Vec::new();

            for planned in batch {
                let dependencies = registry.dependencies_of(&planned.name)?;
                if dependencies.iter().any(|dep| blocked.contains(dep)) {
                    let now = Utc::now();
                    batch_results.push(ExecutionResult {
                        model_name: planned.name.clone(),
                        status: ModelStatus::Skipped,
                        start_ts: now,
                        end_ts: now,
                        rows_affected: None,
                        error_context: None,
                        materialized_object_identifier: physical_identifier(
                            &self.config.environment,
                            &planned.name,
                        ),
                        new_high_watermark: None,
                    });
                    continue;
                }

                let model = registry.get(&planned.name)?.clone();
                let state_entry = state.get(&planned.name).cloned();
                let has_prior_success = state_entry
                    .as_ref()
                    .map(|e| e.last_successful_fingerprint.is_some())
                    .unwrap_or(false);
                let is_first_run = !has_prior_success;

                let select_sql = resolve::build_execution_sql(
                    registry,
                    &model,
                    &self.config.variables,
                    has_prior_success,
                )?;

                let pool = self.pool.clone();
                let session_variables = self.config.variables.clone();
                let physical_identifier = physical_identifier(&self.config.environment, &model.name);
                let model_name = model.name.clone();
                let incremental_strategy = model.incremental_strategy;
                let unique_key = model.unique_key.clone();
                let time_column = model.config.get("time_column").cloned();
                let on_schema_change = model.on_schema_change;
                let columns = model.column_schema.clone();
                let stored_high_watermark = state_entry.as_ref().and_then(|e| e.high_watermark.clone());
                let materialization = model.materialization;
                let max_parallel_cdc_chunks = self.config.max_parallel_cdc_chunks;
                let semaphore = semaphore.clone();

                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed early");
                    let now = Utc::now();

                    let mut conn = match pool.acquire(ACQUIRE_TIMEOUT, &session_variables).await {
                        Ok(conn) => conn,
                        Err(err) => {
                            return (
                                model_name.clone(),
                                ExecutionResult {
                                    model_name: model_name.clone(),
                                    status: ModelStatus::Failed,
                                    start_ts: now,
                                    end_ts: Utc::now(),
                                    rows_affected: None,
                                    error_context: Some(
                                        err.context().cloned().unwrap_or_else(|| {
                                            ErrorContext::new("acquire_connection")
                                                .with_model(model_name.clone())
                                                .with_driver_error(err.to_string())
                                        }),
                                    ),
                                    materialized_object_identifier: physical_identifier.clone(),
                                    new_high_watermark: None,
                                },
                            );
                        }
                    };

                    let req = MaterializeRequest {
                        model_name: &model_name,
                        physical_identifier: &physical_identifier,
                        select_sql: &select_sql,
                        variables: &session_variables,
                        incremental_strategy,
                        unique_key: unique_key.as_deref(),
                        time_column: time_column.as_deref(),
                        on_schema_change,
                        columns: columns.as_deref(),
                        is_first_run,
                        stored_high_watermark: stored_high_watermark.as_deref(),
                    };

                    let result = sqlforge_materialize::materialise(
                        &pool,
                        &mut conn,
                        &req,
                        materialization,
                        now,
                        max_parallel_cdc_chunks,
                        &session_variables,
                    )
                    .await;

                    (model_name, result)
                });
            }

            while let Some(outcome) = tasks.join_next().await {
                let (_, result) = outcome.map_err(|e| {
                    EngineError::ConfigurationError(format!("model execution task panicked: {e}"))
                })?;
                batch_results.push(result);
            }
            batch_results.sort_by(|a, b| a.model_name.cmp(&b.model_name));

            let mut batch_failed = false;
            for result in &batch_results {
                match result.status {
                    ModelStatus::Failed | ModelStatus::Skipped => {
                        blocked.insert(result.model_name.clone());
                        batch_failed = batch_failed || result.status == ModelStatus::Failed;
                    }
                    ModelStatus::Success => {}
                }

                let model = registry.get(&result.model_name)?;
                let prior = state.get(&result.model_name);
                let last_successful_fingerprint = match result.status {
                    ModelStatus::Success => Some(model.fingerprint.clone()),
                    _ => prior.and_then(|e| e.last_successful_fingerprint.clone()),
                };
                let high_watermark = result
                    .new_high_watermark
                    .clone()
                    .or_else(|| prior.and_then(|e| e.high_watermark.clone()));

                state.put(StateEntry {
                    model_name: result.model_name.clone(),
                    fingerprint: model.fingerprint.clone(),
                    status: result.status,
                    last_successful_fingerprint,
                    last_run_ts: result.end_ts,
                    high_watermark,
                });
            }
            state.flush()?;

            report.results.extend(batch_results);

            if batch_failed && self.config.fail_fast {
                break 'batches;
            }
        }

        for model_name in &plan.deletions {
            let physical = physical_identifier(&self.config.environment, model_name);
            let mut conn = self.pool.acquire(ACQUIRE_TIMEOUT, &self.config.variables).await?;
            let sql = format!("DROP TABLE IF EXISTS {physical}");
            match conn.as_mut().execute(&sql) {
                Ok(_) => state.remove(model_name),
                Err(err) => {
                    let warning = EngineWarning::DeleteFailure {
                        model_name: model_name.clone(),
                        message: err.message,
                    };
                    tracing::warn!(model = %model_name, "{warning}");
                    report.warnings.push(warning);
                }
            }
        }
        state.flush()?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlforge_common::RetryPolicy;
    use sqlforge_driver::MockDriver;
    use sqlforge_graph::DependencyGraph;
    use std::collections::BTreeMap;

    fn build_registry(models: &[(&str, &str)]) -> (Registry, DependencyGraph) {
        let mut registry = Registry::new("dev");
        for (path, text) in models {
            registry.register(path, text).unwrap();
        }
        let mut graph = DependencyGraph::new();
        let names = registry.names();
        let mut deps = BTreeMap::new();
        for name in &names {
            deps.insert(name.clone(), registry.dependencies_of(name).unwrap());
        }
        graph.sync_from_registry(&deps, &names).unwrap();
        (registry, graph)
    }

    fn executor() -> Executor {
        let pool = Arc::new(Pool::new(Arc::new(MockDriver::default()), 4, RetryPolicy::default()));
        Executor::new(pool, EngineConfig::default())
    }

    #[tokio::test]
    async fn a_new_view_model_executes_successfully() {
        let (registry, graph) = build_registry(&[("silver/a.sql", "select 1 as x")]);
        let state = StateStore::new("/nonexistent/state.json");
        let plan = sqlforge_planner::plan(&registry, &graph, &state, None, &Default::default()).unwrap();

        let mut state = state;
        let report = executor().execute_plan(&registry, &mut state, &plan).await.unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, ModelStatus::Success);
        assert!(state.get("silver.a").is_some());
    }

    #[tokio::test]
    async fn a_model_depending_on_a_failed_upstream_is_skipped() {
        let (registry, graph) = build_registry(&[
            ("silver/a.sql", "select 1 as x"),
            ("silver/b.sql", "select x from {{ ref('silver.a') }}"),
        ]);
        let mut state = StateStore::new("/nonexistent/state.json");
        let plan = sqlforge_planner::plan(&registry, &graph, &state, None, &Default::default()).unwrap();

        let pool = Arc::new(Pool::new(
            Arc::new(MockDriver::failing_n_times(99, sqlforge_common::errors::DriverErrorKind::Permanent)),
            4,
            RetryPolicy::default(),
        ));
        let executor = Executor::new(pool, EngineConfig::default());
        let report = executor.execute_plan(&registry, &mut state, &plan).await.unwrap();

        let a = report.results.iter().find(|r| r.model_name == "silver.a").unwrap();
        let b = report.results.iter().find(|r| r.model_name == "silver.b").unwrap();
        assert_eq!(a.status, ModelStatus::Failed);
        assert_eq!(b.status, ModelStatus::Skipped);
    }

    #[tokio::test]
    async fn fail_fast_stops_before_the_next_batch() {
        let (registry, graph) = build_registry(&[
            ("silver/a.sql", "select 1 as x"),
            ("silver/b.sql", "select x from {{ ref('silver.a') }}"),
            ("silver/c.sql", "select 1"),
        ]);
        let mut state = StateStore::new("/nonexistent/state.json");
        let plan = sqlforge_planner::plan(&registry, &graph, &state, None, &Default::default()).unwrap();

        let pool = Arc::new(Pool::new(
            Arc::new(MockDriver::failing_n_times(99, sqlforge_common::errors::DriverErrorKind::Permanent)),
            4,
            RetryPolicy::default(),
        ));
        let mut config = EngineConfig::default();
        config.fail_fast = true;
        let executor = Executor::new(pool, config);
        let report = executor.execute_plan(&registry, &mut state, &plan).await.unwrap();

        // silver.c sits in the same first batch as silver.a (no dependency
        // between them) so it still runs; only silver.b, gated behind the
        // second batch, never gets the chance to.
        assert!(report.results.iter().all(|r| r.model_name != "silver.b"));
    }

    #[tokio::test]
    async fn missing_variable_fails_before_any_model_executes() {
        let (registry, graph) = build_registry(&[("silver/a.sql", "select * from t where d = $run_date")]);
        let mut state = StateStore::new("/nonexistent/state.json");
        let plan = sqlforge_planner::plan(&registry, &graph, &state, None, &Default::default()).unwrap();
        let err = executor().execute_plan(&registry, &mut state, &plan).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingVariableError(_)));
    }

    #[tokio::test]
    async fn a_deleted_model_drops_its_object_and_clears_state() {
        let (registry, _graph) = build_registry(&[("silver/a.sql", "select 1")]);
        let mut state = StateStore::new("/nonexistent/state.json");
        state.put(StateEntry {
            model_name: "silver.gone".to_string(),
            fingerprint: "fp".to_string(),
            status: ModelStatus::Success,
            last_successful_fingerprint: Some("fp".to_string()),
            last_run_ts: Utc::now(),
            high_watermark: None,
        });
        let graph = {
            let mut g = DependencyGraph::new();
            let names = registry.names();
            let mut deps = BTreeMap::new();
            for name in &names {
                deps.insert(name.clone(), registry.dependencies_of(name).unwrap());
            }
            g.sync_from_registry(&deps, &names).unwrap();
            g
        };
        let plan = sqlforge_planner::plan(&registry, &graph, &state, None, &Default::default()).unwrap();
        assert_eq!(plan.deletions, vec!["silver.gone".to_string()]);

        executor().execute_plan(&registry, &mut state, &plan).await.unwrap();
        assert!(state.get("silver.gone").is_none());
    }
}
