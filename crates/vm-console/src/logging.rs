//! Subscriber setup for binaries and test harnesses embedding vm-console.
//!
//! Library code only emits `tracing` events inside per-transport spans; it
//! never installs a subscriber itself.

use tracing_subscriber::EnvFilter;

use vm_console_core::LoggingSettings;

/// Install a global fmt subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `level` (e.g. `"info"` or
/// `"vm_console_transport=debug"`) is used. Returns `false` when a global
/// subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// [`init`] from the `logging` section of a configuration.
pub fn init_from(settings: &LoggingSettings) -> bool {
    init(&settings.level)
}
