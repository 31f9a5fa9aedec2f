//! gridsched: a batch/workflow scheduler and its paired resource manager.
//!
//! Jobs composed of dependent tasks are submitted, queued, matched to
//! available nodes, executed (in-process or in a forked child), and tracked
//! through a durable lifecycle that survives scheduler restarts.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod rm;
pub mod scheduler;

use tracing_subscriber::EnvFilter;

/// Installs the default tracing subscriber, honoring `RUST_LOG`.
///
/// For embedders and tests; calling it more than once is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
