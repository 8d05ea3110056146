//! Tracing setup (SPEC_FULL.md §A "Logging"). The actual sink (file vs
//! stdout, JSON vs pretty) is an external collaborator's concern per
//! spec.md §1; this just builds a sensible default subscriber so the
//! engine's spans are visible when run directly, mirroring the teacher's
//! `FsTraceConfig` default-construction pattern.

use tracing_subscriber::EnvFilter;

/// Installs a process-global `tracing` subscriber reading `RUST_LOG`
/// (defaulting to `info`). Safe to call more than once; subsequent calls
/// are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
