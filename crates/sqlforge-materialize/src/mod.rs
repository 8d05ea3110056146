//! Materialisation Strategies (C8, spec §4.8): turns a compiled model's
//! `SELECT` body into the physical warehouse object it's configured to be.
//!
//! Each strategy is a plain function over a [`MaterializeRequest`] rather
//! than a trait object hierarchy (spec §9 Design Notes), dispatched by
//! [`materialise`] on the model's [`MaterializationKind`].

mod cdc;
mod dispatch;
mod incremental;
mod request;
mod schema_change;
mod sql_exec;
mod view;

use sqlforge_common::errors::EngineResult;

pub use cdc::{apply_plan, apply_plan_parallel, extract_changes, plan_cdc, CdcChange, CdcOp, CdcPlan, CdcRow};
pub use dispatch::materialise;
pub use request::MaterializeRequest;

/// `(rows_affected, new_high_watermark)` — the raw result a strategy
/// function hands back to [`dispatch::materialise`], which turns it into an
/// [`sqlforge_common::ExecutionResult`].
pub(crate) type StrategyOutcome = EngineResult<(Option<u64>, Option<String>)>;
