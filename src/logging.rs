//! Console logging for binaries embedding the scheduler.
//!
//! The library itself only emits `tracing` events; this module installs a
//! subscriber for callers that do not bring their own. The filter comes from
//! `RUST_LOG` and defaults to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a global `fmt` subscriber. Returns `false` if another subscriber
/// was already installed, in which case nothing changes.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .is_ok()
}
