//! Logger bootstrap.
//!
//! The crate logs through the `log` facade with a fixed set of targets: `dap`, `session`,
//! `hook`, `resource`, `reaper` and `engine`. `RUST_LOG=session=debug,dap=trace` style
//! filters select subsystems.

use std::sync::atomic::{AtomicBool, Ordering};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install `env_logger` as a global logger.
///
/// `RUST_LOG` takes precedence, `default_filter` is used when it is not set.
/// Calling this more than once (or after another logger was installed) is a no-op.
pub fn init(default_filter: &str) {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let env = env_logger::Env::default().default_filter_or(default_filter);
    // another logger may already be installed by the embedding application
    _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
