//! Small fixed constants referenced by more than one crate.

/// Tracing target used for per-query execution logs (mirrors the teacher's
/// `EXECUTING` log target in `dbt-common::constants`).
pub const EXECUTING: &str = "sqlforge::executing";

/// Directory suffix (under a model's tree) where `.sql` files live.
pub const MODELS_DIR_NAME: &str = "models";

/// Sibling YAML catalogue of external sources (spec §6).
pub const SOURCES_YML: &str = "sources.yml";

/// Default name for a model's 1:1 schema/test sibling file.
pub const SCHEMA_YML_SUFFIX: &str = "yml";

/// Batch size used by the CDC strategy for UPDATE/INSERT chunking (spec
/// §4.8: "batches of 1000").
pub const CDC_BATCH_SIZE: usize = 1000;

/// Row-count threshold above which the CDC strategy switches to the
/// chunked/parallel path (spec §4.8: "exceeds 1,000,000 rows").
pub const CDC_CHUNKED_THRESHOLD: usize = 1_000_000;

/// Target chunk size once the chunked CDC path is active (spec §4.8:
/// "chunks of ~10M rows").
pub const CDC_CHUNK_SIZE: usize = 10_000_000;
